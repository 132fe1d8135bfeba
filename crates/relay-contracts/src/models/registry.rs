use indexmap::IndexMap;
use serde::Serialize;

pub const CAP_CHAT: &str = "chat";
pub const CAP_VISION: &str = "vision";
pub const CAP_IMAGE: &str = "image";
pub const CAP_EDIT: &str = "edit";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSpec {
    pub id: String,
    pub name: String,
    pub description: String,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Read-only id → model table used for display and for validating ids
/// before they are forwarded to the proxy.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ModelSpec> {
        self.models.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, id: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(id)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }

    pub fn validate(&self, id: &str) -> Result<&ModelSpec, String> {
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err("Model id is empty.".to_string());
        }
        self.get(trimmed)
            .ok_or_else(|| format!("Unknown model '{trimmed}'."))
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |id: &str, name: &str, description: &str, capabilities: &[&str]| {
        map.insert(
            id.to_string(),
            ModelSpec {
                id: id.to_string(),
                name: name.to_string(),
                description: description.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
            },
        );
    };

    insert(
        "google/gemini-2.5-flash-image-preview",
        "Gemini 2.5 Flash Image",
        "Fast multimodal model that can generate and edit images from a prompt.",
        &[CAP_CHAT, CAP_VISION, CAP_IMAGE, CAP_EDIT],
    );
    insert(
        "openai/gpt-4o-mini",
        "GPT-4o mini",
        "Small, low-latency chat model with image understanding.",
        &[CAP_CHAT, CAP_VISION],
    );
    insert(
        "openai/gpt-4o",
        "GPT-4o",
        "General-purpose chat model with strong image understanding.",
        &[CAP_CHAT, CAP_VISION],
    );
    insert(
        "anthropic/claude-sonnet-4",
        "Claude Sonnet 4",
        "Balanced chat model for long-form reasoning and writing.",
        &[CAP_CHAT, CAP_VISION],
    );
    insert(
        "meta-llama/llama-3.3-70b-instruct",
        "Llama 3.3 70B Instruct",
        "Open-weights text-only chat model.",
        &[CAP_CHAT],
    );
    insert(
        "openai/gpt-image-1",
        "GPT Image 1",
        "Image generation and editing model.",
        &[CAP_IMAGE, CAP_EDIT],
    );
    insert(
        "black-forest-labs/flux-kontext-pro",
        "FLUX.1 Kontext Pro",
        "Prompt-guided image editing that keeps the subject consistent.",
        &[CAP_IMAGE, CAP_EDIT],
    );

    map
}
