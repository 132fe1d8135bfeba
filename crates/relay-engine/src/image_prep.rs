//! Size-bounded image preparation for uploads.
//!
//! A payload already under the ceiling is passed through untouched. Anything
//! larger is flattened onto white and re-encoded as JPEG, walking a fixed
//! quality × dimension schedule until the data URI fits or the floor is hit.

use std::fs;
use std::path::Path;
use std::thread::{self, JoinHandle};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use tracing::{debug, info};

use crate::error::{RelayError, RelayResult};

const JPEG_MIME: &str = "image/jpeg";

/// Binary image plus its declared MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    bytes: Vec<u8>,
    mime_type: String,
}

impl ImagePayload {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    /// Parses `data:<mime>;base64,<data>`.
    pub fn from_data_uri(uri: &str) -> RelayResult<Self> {
        let trimmed = uri.trim();
        let rest = trimmed
            .strip_prefix("data:")
            .ok_or_else(|| RelayError::InvalidInput("image is not a data URI".to_string()))?;
        let (header, data) = rest.split_once(',').ok_or_else(|| {
            RelayError::InvalidInput("image data URI has no payload".to_string())
        })?;
        let Some(mime_type) = header.strip_suffix(";base64") else {
            return Err(RelayError::InvalidInput(
                "image data URI must be base64 encoded".to_string(),
            ));
        };
        if !mime_type.starts_with("image/") {
            return Err(RelayError::InvalidInput(format!(
                "unsupported image type '{mime_type}'"
            )));
        }
        let bytes = BASE64
            .decode(data.trim())
            .map_err(|err| RelayError::InvalidInput(format!("image data URI is corrupt: {err}")))?;
        if bytes.is_empty() {
            return Err(RelayError::InvalidInput("image is empty".to_string()));
        }
        Ok(Self::new(bytes, mime_type))
    }

    /// Reads an image file, sniffing the MIME type from its content and
    /// falling back to the extension.
    pub fn from_path(path: &Path) -> RelayResult<Self> {
        let bytes = fs::read(path).map_err(|err| {
            RelayError::InvalidInput(format!("failed reading {}: {err}", path.display()))
        })?;
        if bytes.is_empty() {
            return Err(RelayError::InvalidInput(format!(
                "{} is empty",
                path.display()
            )));
        }
        let mime = image::guess_format(&bytes)
            .map(|format| format.to_mime_type())
            .unwrap_or_else(|_| guess_image_mime(path));
        Ok(Self::new(bytes, mime))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, BASE64.encode(&self.bytes))
    }

    /// Length in bytes of [`Self::to_data_uri`], computed without encoding.
    pub fn encoded_size(&self) -> usize {
        "data:".len() + self.mime_type.len() + ";base64,".len() + 4 * self.bytes.len().div_ceil(3)
    }

    /// File extension matching the MIME type, for writing results to disk.
    pub fn extension(&self) -> &'static str {
        let lowered = self.mime_type.to_ascii_lowercase();
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return "jpg";
        }
        if lowered.contains("webp") {
            return "webp";
        }
        if lowered.contains("gif") {
            return "gif";
        }
        "png"
    }
}

/// Step schedule for re-encoding. Fixed input + fixed schedule gives a fixed
/// iteration count and output.
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareSchedule {
    /// JPEG qualities tried at each dimension level, highest first.
    pub qualities: Vec<u8>,
    /// Factor applied to the long side between dimension levels.
    pub scale_step: f32,
    /// The long side never drops below this.
    pub min_dimension: u32,
    /// Images are capped to this long side before the first attempt.
    pub max_dimension: u32,
}

impl Default for PrepareSchedule {
    fn default() -> Self {
        Self {
            qualities: vec![85, 75, 65, 50, 40],
            scale_step: 0.75,
            min_dimension: 256,
            max_dimension: 2048,
        }
    }
}

impl PrepareSchedule {
    fn sanitized(mut self) -> Self {
        self.qualities.retain(|quality| (1..=100).contains(quality));
        self.qualities.sort_unstable_by(|a, b| b.cmp(a));
        self.qualities.dedup();
        if self.qualities.is_empty() {
            self.qualities = Self::default().qualities;
        }
        if !(self.scale_step > 0.0 && self.scale_step < 1.0) {
            self.scale_step = Self::default().scale_step;
        }
        self.min_dimension = self.min_dimension.max(1);
        self.max_dimension = self.max_dimension.max(self.min_dimension);
        self
    }
}

#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub payload: ImagePayload,
    pub width: u32,
    pub height: u32,
    /// JPEG quality of the accepted encoding; `None` when passed through.
    pub quality: Option<u8>,
    /// Encodings attempted.
    pub iterations: usize,
    pub reencoded: bool,
    pub original_size: usize,
}

/// A payload whose bytes are known to decode.
#[derive(Debug, Clone)]
pub struct DecodedImage<'a> {
    payload: &'a ImagePayload,
    image: DynamicImage,
}

impl<'a> DecodedImage<'a> {
    pub fn decode(payload: &'a ImagePayload) -> RelayResult<Self> {
        let image = image::load_from_memory(payload.bytes()).map_err(|err| {
            RelayError::InvalidInput(format!("image could not be decoded: {err}"))
        })?;
        Ok(Self { payload, image })
    }

    pub fn payload(&self) -> &ImagePayload {
        self.payload
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImagePreparer {
    schedule: PrepareSchedule,
}

impl ImagePreparer {
    pub fn new(schedule: PrepareSchedule) -> Self {
        Self {
            schedule: schedule.sanitized(),
        }
    }

    pub fn schedule(&self) -> &PrepareSchedule {
        &self.schedule
    }

    pub fn prepare(&self, payload: &ImagePayload, max_bytes: usize) -> RelayResult<PreparedImage> {
        self.fit(DecodedImage::decode(payload)?, max_bytes)
    }

    /// Budget step of [`Self::prepare`] for an already decoded payload.
    pub fn fit(&self, decoded: DecodedImage<'_>, max_bytes: usize) -> RelayResult<PreparedImage> {
        let DecodedImage {
            payload,
            image: decoded,
        } = decoded;
        let (width, height) = decoded.dimensions();
        let original_size = payload.encoded_size();

        if original_size <= max_bytes {
            debug!(size = original_size, max_bytes, "image within budget, passing through");
            return Ok(PreparedImage {
                payload: payload.clone(),
                width,
                height,
                quality: None,
                iterations: 0,
                reencoded: false,
                original_size,
            });
        }

        let flattened = DynamicImage::ImageRgb8(flatten_onto_white(&decoded));
        let full_side = width.max(height);
        let mut long_side = full_side.min(self.schedule.max_dimension);
        let mut iterations = 0usize;
        let mut smallest = usize::MAX;

        loop {
            let level = if long_side >= full_side {
                flattened.to_rgb8()
            } else {
                flattened
                    .resize(long_side, long_side, FilterType::Triangle)
                    .to_rgb8()
            };

            for &quality in &self.schedule.qualities {
                iterations += 1;
                let bytes = encode_jpeg(&level, quality)?;
                let candidate = ImagePayload::new(bytes, JPEG_MIME);
                let size = candidate.encoded_size();
                smallest = smallest.min(size);
                if size <= max_bytes {
                    info!(
                        original_size,
                        size,
                        width = level.width(),
                        height = level.height(),
                        quality,
                        iterations,
                        "image re-encoded under budget"
                    );
                    return Ok(PreparedImage {
                        payload: candidate,
                        width: level.width(),
                        height: level.height(),
                        quality: Some(quality),
                        iterations,
                        reencoded: true,
                        original_size,
                    });
                }
            }

            let next = (long_side as f32 * self.schedule.scale_step).floor() as u32;
            if next < self.schedule.min_dimension || next >= long_side {
                debug!(smallest, max_bytes, iterations, "image preparation hit the floor");
                return Err(RelayError::ImageTooLarge {
                    limit: max_bytes,
                    smallest,
                });
            }
            long_side = next;
        }
    }

    /// Runs [`Self::prepare`] on a worker thread.
    pub fn prepare_in_background(&self, payload: ImagePayload, max_bytes: usize) -> PreparationTask {
        let preparer = self.clone();
        PreparationTask {
            handle: thread::spawn(move || preparer.prepare(&payload, max_bytes)),
        }
    }
}

/// Handle to an off-thread preparation.
#[derive(Debug)]
pub struct PreparationTask {
    handle: JoinHandle<RelayResult<PreparedImage>>,
}

impl PreparationTask {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Blocks until the worker is done. A panic in the worker is re-raised.
    pub fn wait(self) -> RelayResult<PreparedImage> {
        match self.handle.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flattened
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> RelayResult<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
    encoder
        .encode_image(image)
        .map_err(|err| RelayError::InvalidInput(format!("image could not be re-encoded: {err}")))?;
    Ok(bytes)
}

fn guess_image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/png",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};

    use super::{DecodedImage, ImagePayload, ImagePreparer, PrepareSchedule};
    use crate::error::RelayError;

    /// Deterministic noise so JPEG output stays large and reproducible.
    pub(crate) fn noisy_png(width: u32, height: u32) -> ImagePayload {
        let mut state: u32 = 0x2545_f491;
        let mut image = RgbImage::new(width, height);
        for pixel in image.pixels_mut() {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let [r, g, b, _] = state.to_be_bytes();
            *pixel = Rgb([r, g, b]);
        }
        encode_png(DynamicImage::ImageRgb8(image))
    }

    fn encode_png(image: DynamicImage) -> ImagePayload {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap_or_else(|err| panic!("png encode failed: {err}"));
        ImagePayload::new(bytes, "image/png")
    }

    fn schedule() -> PrepareSchedule {
        PrepareSchedule {
            qualities: vec![80, 60, 40],
            scale_step: 0.5,
            min_dimension: 32,
            max_dimension: 2048,
        }
    }

    #[test]
    fn under_budget_payload_is_returned_byte_identical() {
        let payload = noisy_png(8, 8);
        let prepared = ImagePreparer::new(schedule())
            .prepare(&payload, 1_000_000)
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(prepared.payload, payload);
        assert!(!prepared.reencoded);
        assert_eq!(prepared.iterations, 0);
        assert_eq!(prepared.quality, None);
        assert_eq!((prepared.width, prepared.height), (8, 8));
    }

    #[test]
    fn oversized_payload_converges_under_budget_and_keeps_aspect_ratio() {
        let payload = noisy_png(600, 400);
        let max_bytes = 60_000;
        assert!(payload.encoded_size() > max_bytes);

        let prepared = ImagePreparer::new(schedule())
            .prepare(&payload, max_bytes)
            .unwrap_or_else(|err| panic!("{err}"));
        assert!(prepared.reencoded);
        assert!(prepared.payload.encoded_size() <= max_bytes);
        assert_eq!(prepared.payload.mime_type(), "image/jpeg");
        assert!(prepared.width <= 600);
        let ratio = prepared.width as f32 / prepared.height as f32;
        assert!((ratio - 1.5).abs() < 0.05, "ratio drifted to {ratio}");

        let decoded = image::load_from_memory(prepared.payload.bytes())
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(decoded.dimensions(), (prepared.width, prepared.height));
    }

    #[test]
    fn preparation_is_deterministic() {
        let payload = noisy_png(320, 240);
        let preparer = ImagePreparer::new(schedule());
        let first = preparer
            .prepare(&payload, 20_000)
            .unwrap_or_else(|err| panic!("{err}"));
        let second = preparer
            .prepare(&payload, 20_000)
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(first.iterations, second.iterations);
        assert_eq!(first.payload, second.payload);
        assert_eq!(first.quality, second.quality);
    }

    #[test]
    fn unreachable_budget_fails_with_image_too_large() {
        let payload = noisy_png(200, 200);
        let err = ImagePreparer::new(schedule())
            .prepare(&payload, 200)
            .err();
        match err {
            Some(RelayError::ImageTooLarge { limit, smallest }) => {
                assert_eq!(limit, 200);
                assert!(smallest > 200);
            }
            other => panic!("expected ImageTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn undecodable_bytes_are_invalid_input() {
        let payload = ImagePayload::new(b"definitely not an image".to_vec(), "image/png");
        let err = ImagePreparer::default().prepare(&payload, 10).err();
        assert!(matches!(err, Some(RelayError::InvalidInput(_))));
        assert!(matches!(
            DecodedImage::decode(&payload).err(),
            Some(RelayError::InvalidInput(_))
        ));
    }

    #[test]
    fn decoded_image_fits_like_prepare() {
        let payload = noisy_png(40, 30);
        let decoded = DecodedImage::decode(&payload).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(decoded.dimensions(), (40, 30));
        assert_eq!(decoded.payload(), &payload);

        let prepared = ImagePreparer::default()
            .fit(decoded, usize::MAX)
            .unwrap_or_else(|err| panic!("{err}"));
        assert!(!prepared.reencoded);
        assert_eq!(prepared.payload.bytes(), payload.bytes());
    }

    #[test]
    fn transparent_pixels_flatten_to_white() {
        let mut image = RgbaImage::new(64, 64);
        for pixel in image.pixels_mut() {
            *pixel = Rgba([0, 0, 0, 0]);
        }
        let payload = encode_png(DynamicImage::ImageRgba8(image));
        let prepared = ImagePreparer::new(schedule())
            .prepare(&payload, payload.encoded_size() - 1)
            .unwrap_or_else(|err| panic!("{err}"));
        let decoded = image::load_from_memory(prepared.payload.bytes())
            .unwrap_or_else(|err| panic!("{err}"))
            .to_rgb8();
        let center = decoded.get_pixel(32, 32);
        assert!(center.0.iter().all(|channel| *channel > 240), "{center:?}");
    }

    #[test]
    fn background_preparation_matches_foreground() {
        let payload = noisy_png(300, 200);
        let preparer = ImagePreparer::new(schedule());
        let foreground = preparer
            .prepare(&payload, 30_000)
            .unwrap_or_else(|err| panic!("{err}"));
        let background = preparer
            .prepare_in_background(payload, 30_000)
            .wait()
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(foreground.payload, background.payload);
        assert_eq!(foreground.iterations, background.iterations);
    }

    #[test]
    fn data_uri_round_trip_and_encoded_size() {
        let payload = ImagePayload::new(vec![1, 2, 3, 4, 5], "image/png");
        let uri = payload.to_data_uri();
        assert_eq!(uri.len(), payload.encoded_size());
        assert_eq!(ImagePayload::from_data_uri(&uri), Ok(payload));
    }

    #[test]
    fn malformed_data_uris_are_rejected() {
        for uri in [
            "https://example.com/a.png",
            "data:image/png;base64",
            "data:image/png,AAAA",
            "data:text/plain;base64,AAAA",
            "data:image/png;base64,@@@",
        ] {
            assert!(
                matches!(
                    ImagePayload::from_data_uri(uri),
                    Err(RelayError::InvalidInput(_))
                ),
                "{uri} should be rejected"
            );
        }
    }

    #[test]
    fn schedule_is_sanitized() {
        let preparer = ImagePreparer::new(PrepareSchedule {
            qualities: vec![40, 0, 90, 40, 120],
            scale_step: 1.5,
            min_dimension: 0,
            max_dimension: 0,
        });
        assert_eq!(preparer.schedule().qualities, vec![90, 40]);
        assert_eq!(preparer.schedule().scale_step, 0.75);
        assert_eq!(preparer.schedule().min_dimension, 1);
        assert_eq!(preparer.schedule().max_dimension, 1);
    }
}
