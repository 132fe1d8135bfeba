use std::env;
use std::time::Duration;

use tracing::warn;

use crate::image_prep::PrepareSchedule;

pub const DEFAULT_PROXY_BASE: &str = "http://127.0.0.1:3000";
pub const DEFAULT_RATE_MAX_CALLS: usize = 10;
pub const DEFAULT_RATE_WINDOW_MS: u64 = 60_000;
/// Upload ceiling for a data-URI image inside the request body.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 4 * 1024 * 1024;

/// Settings fixed when a session is built. Nothing here is reconfigurable
/// afterwards; build a new session instead.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub proxy_base: String,
    pub chat_model: Option<String>,
    pub image_model: Option<String>,
    pub rate_max_calls: usize,
    pub rate_window: Duration,
    pub max_upload_bytes: usize,
    pub prepare: PrepareSchedule,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            proxy_base: DEFAULT_PROXY_BASE.to_string(),
            chat_model: None,
            image_model: None,
            rate_max_calls: DEFAULT_RATE_MAX_CALLS,
            rate_window: Duration::from_millis(DEFAULT_RATE_WINDOW_MS),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            prepare: PrepareSchedule::default(),
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `RELAY_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(non_empty_env)
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(base) = lookup("RELAY_PROXY_BASE") {
            config.proxy_base = normalize_base(&base);
        }
        config.chat_model = lookup("RELAY_MODEL");
        config.image_model = lookup("RELAY_IMAGE_MODEL");
        config.rate_max_calls = parse_or_default(
            "RELAY_RATE_MAX_CALLS",
            lookup("RELAY_RATE_MAX_CALLS"),
            DEFAULT_RATE_MAX_CALLS,
        )
        .max(1);
        config.rate_window = Duration::from_millis(
            parse_or_default(
                "RELAY_RATE_WINDOW_MS",
                lookup("RELAY_RATE_WINDOW_MS"),
                DEFAULT_RATE_WINDOW_MS,
            )
            .max(1),
        );
        config.max_upload_bytes = parse_or_default(
            "RELAY_MAX_UPLOAD_BYTES",
            lookup("RELAY_MAX_UPLOAD_BYTES"),
            DEFAULT_MAX_UPLOAD_BYTES,
        );
        config
    }

    pub fn with_proxy_base(mut self, base: &str) -> Self {
        self.proxy_base = normalize_base(base);
        self
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn normalize_base(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_PROXY_BASE.to_string();
    }
    trimmed.to_string()
}

fn parse_or_default<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Display,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, fallback = %default, "ignoring invalid setting");
            default
        }
    }
}
