use std::fmt;

use super::registry::{ModelRegistry, ModelSpec};

/// Why the selected model differs from what was asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    /// Nothing was requested.
    Unspecified,
    /// The requested id is unknown or lacks the capability.
    Unavailable { requested: String },
}

impl fmt::Display for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fallback::Unspecified => f.write_str("no model specified, using the default"),
            Fallback::Unavailable { requested } => {
                write!(f, "model '{requested}' is unavailable, using the default")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub fallback: Option<Fallback>,
}

/// Resolves a requested model id against one capability.
#[derive(Debug, Clone, Copy)]
pub struct ModelSelector<'a> {
    registry: &'a ModelRegistry,
}

impl<'a> ModelSelector<'a> {
    pub fn new(registry: &'a ModelRegistry) -> Self {
        Self { registry }
    }

    /// The requested model when it supports `capability`, otherwise the
    /// first registered model that does.
    pub fn select(&self, requested: Option<&str>, capability: &str) -> Result<ModelSelection, String> {
        let requested = requested.map(str::trim).filter(|id| !id.is_empty());
        if let Some(model) = requested.and_then(|id| self.registry.ensure(id, capability)) {
            return Ok(ModelSelection {
                model,
                fallback: None,
            });
        }

        let model = self
            .registry
            .list()
            .find(|model| model.supports(capability))
            .cloned()
            .ok_or_else(|| format!("No models available for capability '{capability}'."))?;
        let fallback = match requested {
            Some(id) => Fallback::Unavailable {
                requested: id.to_string(),
            },
            None => Fallback::Unspecified,
        };
        Ok(ModelSelection {
            model,
            fallback: Some(fallback),
        })
    }
}
