mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, CAP_CHAT, CAP_EDIT, CAP_IMAGE, CAP_VISION};
pub use selectors::{Fallback, ModelSelection, ModelSelector};
