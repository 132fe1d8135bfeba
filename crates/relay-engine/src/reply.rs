use serde_json::Value;

use crate::error::{RelayError, RelayResult};
use crate::image_prep::ImagePayload;

/// Decoded proxy reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyReply {
    Text {
        text: String,
    },
    Image {
        image: ImagePayload,
        caption: Option<String>,
    },
}

impl ProxyReply {
    /// Classifies `choices[0].message` into a text or image reply.
    ///
    /// Image sources, in order: `message.images[]`, then content parts of
    /// type `image_url` or carrying `inline_data`. Only `data:` URIs are
    /// accepted. Content that yields neither text nor an image is an
    /// unrecognized shape.
    pub fn classify(value: &Value) -> RelayResult<Self> {
        let Some(message) = value.pointer("/choices/0/message") else {
            return Err(unrecognized(value, "response has no choices[0].message"));
        };

        let mut images = Vec::new();
        if let Some(items) = message.get("images").and_then(Value::as_array) {
            for item in items {
                if let Some(url) = image_url(item) {
                    images.push(payload_from_url(url)?);
                }
            }
        }

        let mut text_parts: Vec<String> = Vec::new();
        let mut has_text = false;
        match message.get("content") {
            Some(Value::String(text)) => {
                has_text = true;
                text_parts.push(text.clone());
            }
            Some(Value::Array(parts)) => {
                for part in parts {
                    if let Some(text) = part.as_str() {
                        has_text = true;
                        text_parts.push(text.to_string());
                        continue;
                    }
                    if let Some(inline) = part.get("inline_data").or_else(|| part.get("inlineData")) {
                        images.push(payload_from_inline(inline)?);
                        continue;
                    }
                    if let Some(url) = image_url(part) {
                        images.push(payload_from_url(url)?);
                        continue;
                    }
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        has_text = true;
                        text_parts.push(text.to_string());
                    }
                }
            }
            _ => {}
        }

        let text = text_parts.concat();
        if let Some(image) = images.into_iter().next() {
            let caption = Some(text.trim().to_string()).filter(|value| !value.is_empty());
            return Ok(ProxyReply::Image { image, caption });
        }
        if has_text {
            return Ok(ProxyReply::Text { text });
        }
        Err(unrecognized(value, "message has neither text nor image content"))
    }

    /// Reply text, or the caption for image replies.
    pub fn text(&self) -> Option<&str> {
        match self {
            ProxyReply::Text { text } => Some(text),
            ProxyReply::Image { caption, .. } => caption.as_deref(),
        }
    }

    pub fn image(&self) -> Option<&ImagePayload> {
        match self {
            ProxyReply::Text { .. } => None,
            ProxyReply::Image { image, .. } => Some(image),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProxyReply::Text { .. } => "text",
            ProxyReply::Image { .. } => "image",
        }
    }
}

fn image_url(item: &Value) -> Option<&str> {
    let nested = item.get("image_url")?;
    nested
        .get("url")
        .and_then(Value::as_str)
        .or_else(|| nested.as_str())
}

fn payload_from_url(url: &str) -> RelayResult<ImagePayload> {
    if !url.trim_start().starts_with("data:") {
        return Err(RelayError::UnrecognizedResponseShape(
            "image reference is not a data URI".to_string(),
        ));
    }
    ImagePayload::from_data_uri(url).map_err(|err| match err {
        RelayError::InvalidInput(reason) => RelayError::UnrecognizedResponseShape(reason),
        other => other,
    })
}

fn payload_from_inline(inline: &Value) -> RelayResult<ImagePayload> {
    let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
    let mime = inline
        .get("mime_type")
        .or_else(|| inline.get("mimeType"))
        .and_then(Value::as_str)
        .unwrap_or("image/png");
    payload_from_url(&format!("data:{mime};base64,{data}"))
}

fn unrecognized(value: &Value, reason: &str) -> RelayError {
    let keys = value
        .as_object()
        .map(|obj| obj.keys().cloned().collect::<Vec<_>>().join(","))
        .unwrap_or_else(|| "non-object".to_string());
    RelayError::UnrecognizedResponseShape(format!("{reason} (top-level keys: {keys})"))
}
