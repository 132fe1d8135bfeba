//! Client-side orchestration of chat and image requests sent through the
//! relay proxy.

pub mod config;
pub mod error;
pub mod image_prep;
pub mod reply;
pub mod session;
pub mod streaming;
pub mod transport;

pub use config::RelayConfig;
pub use error::{RelayError, RelayErrorCode, RelayResult};
pub use image_prep::{
    DecodedImage, ImagePayload, ImagePreparer, PreparationTask, PrepareSchedule, PreparedImage,
};
pub use reply::ProxyReply;
pub use session::{
    new_session_id, Clock, ManualClock, MonotonicClock, RelaySession, DEFAULT_ENHANCE_PROMPT,
};
pub use streaming::{CancelToken, DeltaStream};
pub use transport::{Endpoint, HttpTransport, ProxyRequest, ProxyTransport};
