use std::time::Duration;

use relay_contracts::stream::StreamError;
use thiserror::Error;

/// Every failure an orchestrated request can end in.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The sliding window is full; `wait` is the time until the next slot.
    #[error("rate limit exceeded, next slot in {}s", wait_seconds(.wait))]
    RateLimitExceeded { wait: Duration },

    /// No encoding within the schedule's floor fits the upload ceiling.
    #[error("image still {smallest} bytes at the smallest allowed encoding (limit {limit})")]
    ImageTooLarge { limit: usize, smallest: usize },

    /// Empty prompt, unknown model, undecodable image payload.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The upstream signalled an error inside the stream.
    #[error("upstream stream error: {0}")]
    StreamUpstreamError(String),

    /// Transport failed without a structured response.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// Non-2xx response from the proxy.
    #[error("upstream returned HTTP {status}: {message}")]
    UpstreamHttpError { status: u16, message: String },

    /// The response body did not match any known reply shape.
    #[error("unrecognized response shape: {0}")]
    UnrecognizedResponseShape(String),

    /// The collaborator aborted the request before it completed.
    #[error("request cancelled")]
    Cancelled,
}

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayErrorCode {
    RateLimitExceeded,
    ImageTooLarge,
    InvalidInput,
    StreamUpstreamError,
    NetworkFailure,
    UpstreamHttpError,
    UnrecognizedResponseShape,
    Cancelled,
}

impl RelayErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            RelayErrorCode::ImageTooLarge => "IMAGE_TOO_LARGE",
            RelayErrorCode::InvalidInput => "INVALID_INPUT",
            RelayErrorCode::StreamUpstreamError => "STREAM_UPSTREAM_ERROR",
            RelayErrorCode::NetworkFailure => "NETWORK_FAILURE",
            RelayErrorCode::UpstreamHttpError => "UPSTREAM_HTTP_ERROR",
            RelayErrorCode::UnrecognizedResponseShape => "UNRECOGNIZED_RESPONSE_SHAPE",
            RelayErrorCode::Cancelled => "CANCELLED",
        }
    }
}

impl RelayError {
    pub fn code(&self) -> RelayErrorCode {
        match self {
            RelayError::RateLimitExceeded { .. } => RelayErrorCode::RateLimitExceeded,
            RelayError::ImageTooLarge { .. } => RelayErrorCode::ImageTooLarge,
            RelayError::InvalidInput(_) => RelayErrorCode::InvalidInput,
            RelayError::StreamUpstreamError(_) => RelayErrorCode::StreamUpstreamError,
            RelayError::NetworkFailure(_) => RelayErrorCode::NetworkFailure,
            RelayError::UpstreamHttpError { .. } => RelayErrorCode::UpstreamHttpError,
            RelayError::UnrecognizedResponseShape(_) => RelayErrorCode::UnrecognizedResponseShape,
            RelayError::Cancelled => RelayErrorCode::Cancelled,
        }
    }

    /// Raised before any network call; such errors never touch the
    /// conversation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidInput(_) | RelayError::RateLimitExceeded { .. }
        )
    }

    /// Message safe to show an end user. Transport and parse diagnostics are
    /// left to the logs.
    pub fn user_message(&self) -> String {
        match self {
            RelayError::RateLimitExceeded { wait } => format!(
                "Too many requests. Please wait {} seconds and try again.",
                wait_seconds(wait)
            ),
            RelayError::ImageTooLarge { limit, .. } => format!(
                "This image is too large to upload even after compression (limit {} KB). Try a smaller image.",
                limit / 1024
            ),
            RelayError::InvalidInput(reason) => reason.clone(),
            RelayError::StreamUpstreamError(_) => {
                "The AI service reported an error while responding. Please try again.".to_string()
            }
            RelayError::NetworkFailure(_) => {
                "Could not reach the AI service. Check your connection and try again.".to_string()
            }
            RelayError::UpstreamHttpError { status, message } => match status {
                400 | 422 => format!("The request was rejected: {message}"),
                401 | 403 => "The AI service refused the request.".to_string(),
                413 => "The upload was too large for the AI service.".to_string(),
                429 => "The AI service is busy. Please wait a moment and try again.".to_string(),
                _ => format!("The AI service returned an error (HTTP {status})."),
            },
            RelayError::UnrecognizedResponseShape(_) => {
                "The AI service returned a response that could not be read.".to_string()
            }
            RelayError::Cancelled => "The request was cancelled.".to_string(),
        }
    }
}

impl From<StreamError> for RelayError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Upstream(message) => RelayError::StreamUpstreamError(message),
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::NetworkFailure(err.to_string())
    }
}

impl From<RelayError> for String {
    fn from(err: RelayError) -> Self {
        err.user_message()
    }
}

/// Whole seconds, rounded up so a user never retries too early.
pub(crate) fn wait_seconds(wait: &Duration) -> u64 {
    wait.as_millis().div_ceil(1000) as u64
}
