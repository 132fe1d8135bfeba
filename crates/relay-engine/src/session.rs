use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_contracts::conversation::Conversation;
use relay_contracts::events::{ExchangeEvent, ExchangeJournal};
use relay_contracts::limits::{RateStatus, RateWindow};
use relay_contracts::models::{Fallback, ModelRegistry, ModelSelector, ModelSpec, CAP_CHAT, CAP_IMAGE};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::image_prep::{DecodedImage, ImagePayload, ImagePreparer, PreparedImage};
use crate::reply::ProxyReply;
use crate::streaming::{CancelToken, DeltaStream};
use crate::transport::{Endpoint, ProxyRequest, ProxyTransport};

pub const DEFAULT_ENHANCE_PROMPT: &str =
    "Enhance this image: improve clarity, lighting and detail while keeping the composition unchanged.";

/// Millisecond source for the rate window.
pub trait Clock: Send {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Hand-driven clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now_ms.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Per-user context threaded through every request.
///
/// Owns the rate window, the conversation, the model registry and the
/// current model choices. Each operation runs validate → rate gate →
/// image preparation → proxy call; chat turns are wrapped in
/// [`Conversation::transact`] so a failed exchange leaves no trace.
pub struct RelaySession {
    config: RelayConfig,
    transport: Box<dyn ProxyTransport>,
    clock: Box<dyn Clock>,
    limiter: RateWindow,
    conversation: Conversation,
    registry: ModelRegistry,
    preparer: ImagePreparer,
    chat_model: String,
    image_model: String,
    journal: Option<ExchangeJournal>,
}

impl RelaySession {
    pub fn new(
        config: RelayConfig,
        transport: Box<dyn ProxyTransport>,
        clock: Box<dyn Clock>,
    ) -> RelayResult<Self> {
        Self::with_registry(config, ModelRegistry::default(), transport, clock)
    }

    pub fn with_registry(
        config: RelayConfig,
        registry: ModelRegistry,
        transport: Box<dyn ProxyTransport>,
        clock: Box<dyn Clock>,
    ) -> RelayResult<Self> {
        let selector = ModelSelector::new(&registry);
        let chat_model = select_model(&selector, config.chat_model.as_deref(), CAP_CHAT)?;
        let image_model = select_model(&selector, config.image_model.as_deref(), CAP_IMAGE)?;
        Ok(Self {
            limiter: RateWindow::new(config.rate_max_calls, config.rate_window),
            preparer: ImagePreparer::new(config.prepare.clone()),
            conversation: Conversation::new(),
            config,
            transport,
            clock,
            registry,
            chat_model,
            image_model,
            journal: None,
        })
    }

    pub fn with_journal(mut self, journal: ExchangeJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn journal(&self) -> Option<&ExchangeJournal> {
        self.journal.as_ref()
    }

    pub fn chat_model(&self) -> &str {
        &self.chat_model
    }

    pub fn image_model(&self) -> &str {
        &self.image_model
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn reset_conversation(&mut self) {
        debug!(turns = self.conversation.len(), "conversation reset");
        self.conversation.reset();
    }

    pub fn rate_status(&self) -> RateStatus {
        self.limiter.status(self.clock.now_ms())
    }

    pub fn set_model(&mut self, id: &str) -> RelayResult<&ModelSpec> {
        let id = self.validate_model(id, CAP_CHAT)?;
        self.chat_model = id;
        self.model_spec(&self.chat_model)
    }

    pub fn set_image_model(&mut self, id: &str) -> RelayResult<&ModelSpec> {
        let id = self.validate_model(id, CAP_IMAGE)?;
        self.image_model = id;
        self.model_spec(&self.image_model)
    }

    /// One non-streaming chat turn.
    pub fn chat(&mut self, prompt: &str) -> RelayResult<String> {
        let prompt = require_prompt(prompt)?;
        self.admit(Endpoint::Chat)?;
        let model = self.chat_model.clone();
        let started = self.exchange_started(Endpoint::Chat, &model);

        let transport = &*self.transport;
        let result = self.conversation.transact(prompt.clone(), |turns| -> RelayResult<_> {
            let body = ProxyRequest::new(prompt)
                .with_model(Some(model.clone()))
                .with_messages(turns)
                .to_value()?;
            let value = transport.post_json(Endpoint::Chat, &body)?;
            let text = chat_text(ProxyReply::classify(&value)?)?;
            Ok((text.clone(), text))
        });

        self.exchange_finished(Endpoint::Chat, &model, started, &result, |text| {
            ReplySummary::text(text, false)
        });
        result
    }

    /// One streaming chat turn. `sink` sees every increment as it arrives;
    /// the full text is returned once the stream completes.
    pub fn chat_streaming<F>(
        &mut self,
        prompt: &str,
        cancel: &CancelToken,
        sink: &mut F,
    ) -> RelayResult<String>
    where
        F: FnMut(&str),
    {
        let prompt = require_prompt(prompt)?;
        self.admit(Endpoint::Chat)?;
        let model = self.chat_model.clone();
        let started = self.exchange_started(Endpoint::Chat, &model);

        let transport = &*self.transport;
        let result = self.conversation.transact(prompt.clone(), |turns| -> RelayResult<_> {
            let body = ProxyRequest::new(prompt)
                .with_model(Some(model.clone()))
                .with_messages(turns)
                .streaming()
                .to_value()?;
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            let reader = transport.post_stream(Endpoint::Chat, &body)?;
            let text = DeltaStream::new(reader, cancel.clone()).drain_into(sink)?;
            Ok((text.clone(), text))
        });

        self.exchange_finished(Endpoint::Chat, &model, started, &result, |text| {
            ReplySummary::text(text, true)
        });
        result
    }

    pub fn edit_image(&mut self, prompt: &str, image: &ImagePayload) -> RelayResult<ProxyReply> {
        let prompt = require_prompt(prompt)?;
        self.image_exchange(Endpoint::Edit, prompt, Some(image))
    }

    /// Enhances `image`, with a stock instruction when no prompt is given.
    pub fn enhance_image(
        &mut self,
        image: &ImagePayload,
        prompt: Option<&str>,
    ) -> RelayResult<ProxyReply> {
        let prompt = prompt
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_ENHANCE_PROMPT)
            .to_string();
        self.image_exchange(Endpoint::Enhance, prompt, Some(image))
    }

    pub fn generate_image(&mut self, prompt: &str) -> RelayResult<ProxyReply> {
        let prompt = require_prompt(prompt)?;
        self.image_exchange(Endpoint::Generate, prompt, None)
    }

    fn image_exchange(
        &mut self,
        endpoint: Endpoint,
        prompt: String,
        image: Option<&ImagePayload>,
    ) -> RelayResult<ProxyReply> {
        let decoded = image.map(DecodedImage::decode).transpose()?;
        self.admit(endpoint)?;
        let model = self.image_model.clone();
        let started = self.exchange_started(endpoint, &model);

        let result = self.run_image_exchange(endpoint, &model, prompt, decoded);

        self.exchange_finished(endpoint, &model, started, &result, |reply| ReplySummary {
            kind: reply.kind(),
            chars: reply.text().map(|text| text.chars().count()),
            streamed: false,
        });
        result
    }

    fn run_image_exchange(
        &self,
        endpoint: Endpoint,
        model: &str,
        prompt: String,
        image: Option<DecodedImage<'_>>,
    ) -> RelayResult<ProxyReply> {
        let mut request = ProxyRequest::new(prompt).with_model(Some(model.to_string()));
        if let Some(image) = image {
            let prepared = self.prepare_upload(image)?;
            request = request.with_image(prepared.payload.to_data_uri());
        }
        let value = self.transport.post_json(endpoint, &request.to_value()?)?;
        ProxyReply::classify(&value)
    }

    fn prepare_upload(&self, image: DecodedImage<'_>) -> RelayResult<PreparedImage> {
        let prepared = self.preparer.fit(image, self.config.max_upload_bytes)?;
        self.record_event(ExchangeEvent::ImagePrepared {
            original_size: prepared.original_size,
            size: prepared.payload.encoded_size(),
            width: prepared.width,
            height: prepared.height,
            iterations: prepared.iterations,
            reencoded: prepared.reencoded,
        });
        Ok(prepared)
    }

    fn admit(&mut self, endpoint: Endpoint) -> RelayResult<()> {
        let now = self.clock.now_ms();
        if !self.limiter.can_admit(now) {
            let wait = self.limiter.time_until_next_slot(now);
            let wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
            warn!(endpoint = endpoint.as_str(), wait_ms, "rate limit exceeded");
            self.record_event(ExchangeEvent::RateLimited {
                endpoint: endpoint.as_str().to_string(),
                wait_ms,
            });
            return Err(RelayError::RateLimitExceeded { wait });
        }
        self.limiter.record_admission(now);
        Ok(())
    }

    fn validate_model(&self, id: &str, capability: &str) -> RelayResult<String> {
        let spec = self.registry.validate(id).map_err(RelayError::InvalidInput)?;
        if !spec.supports(capability) {
            return Err(RelayError::InvalidInput(format!(
                "Model '{}' does not support {capability}.",
                spec.id
            )));
        }
        Ok(spec.id.clone())
    }

    fn model_spec(&self, id: &str) -> RelayResult<&ModelSpec> {
        self.registry
            .validate(id)
            .map_err(RelayError::InvalidInput)
    }

    fn exchange_started(&self, endpoint: Endpoint, model: &str) -> u64 {
        info!(endpoint = endpoint.as_str(), model, "exchange started");
        self.record_event(ExchangeEvent::ExchangeStarted {
            endpoint: endpoint.as_str().to_string(),
            model: model.to_string(),
        });
        self.clock.now_ms()
    }

    fn exchange_finished<T, F>(
        &self,
        endpoint: Endpoint,
        model: &str,
        started_ms: u64,
        result: &RelayResult<T>,
        describe: F,
    ) where
        F: FnOnce(&T) -> ReplySummary,
    {
        let elapsed_ms = self.clock.now_ms().saturating_sub(started_ms);
        match result {
            Ok(value) => {
                info!(endpoint = endpoint.as_str(), model, elapsed_ms, "exchange completed");
                let summary = describe(value);
                self.record_event(ExchangeEvent::ExchangeCompleted {
                    endpoint: endpoint.as_str().to_string(),
                    model: model.to_string(),
                    elapsed_ms,
                    reply_kind: summary.kind.to_string(),
                    chars: summary.chars,
                    streamed: summary.streamed,
                });
            }
            Err(err) => {
                warn!(
                    endpoint = endpoint.as_str(),
                    model,
                    elapsed_ms,
                    code = err.code().as_str(),
                    error = %err,
                    "exchange failed"
                );
                self.record_event(ExchangeEvent::ExchangeFailed {
                    endpoint: endpoint.as_str().to_string(),
                    model: model.to_string(),
                    elapsed_ms,
                    code: err.code().as_str().to_string(),
                    message: err.to_string(),
                });
            }
        }
    }

    /// Journal failures are logged and never fail the exchange.
    fn record_event(&self, event: ExchangeEvent) {
        let Some(journal) = &self.journal else {
            return;
        };
        let kind = event.kind();
        if let Err(err) = journal.record(event) {
            warn!(event = kind, error = %err, "failed to write exchange journal");
        }
    }
}

struct ReplySummary {
    kind: &'static str,
    chars: Option<usize>,
    streamed: bool,
}

impl ReplySummary {
    fn text(text: &str, streamed: bool) -> Self {
        Self {
            kind: "text",
            chars: Some(text.chars().count()),
            streamed,
        }
    }
}

/// Fresh id tagging every journal line written by one session.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

fn select_model(
    selector: &ModelSelector<'_>,
    requested: Option<&str>,
    capability: &str,
) -> RelayResult<String> {
    let selection = selector
        .select(requested, capability)
        .map_err(RelayError::InvalidInput)?;
    if let Some(fallback @ Fallback::Unavailable { .. }) = &selection.fallback {
        warn!(selected = %selection.model.id, "{fallback}");
    }
    Ok(selection.model.id)
}

fn require_prompt(prompt: &str) -> RelayResult<String> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Err(RelayError::InvalidInput("Prompt cannot be empty.".to_string()));
    }
    Ok(trimmed.to_string())
}

fn chat_text(reply: ProxyReply) -> RelayResult<String> {
    match reply {
        ProxyReply::Text { text } => Ok(text),
        ProxyReply::Image {
            caption: Some(caption),
            ..
        } => Ok(caption),
        ProxyReply::Image { caption: None, .. } => Err(RelayError::UnrecognizedResponseShape(
            "chat reply carried an image without text".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::Read;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use relay_contracts::conversation::ConversationTurn;
    use relay_contracts::events::{read_journal, ExchangeEvent, ExchangeJournal};
    use serde_json::{json, Value};

    use super::{ManualClock, RelaySession, DEFAULT_ENHANCE_PROMPT};
    use crate::config::RelayConfig;
    use crate::error::{RelayError, RelayResult};
    use crate::image_prep::tests::noisy_png;
    use crate::image_prep::{ImagePayload, PrepareSchedule};
    use crate::reply::ProxyReply;
    use crate::streaming::tests::ChunkedReader;
    use crate::streaming::CancelToken;
    use crate::transport::{Endpoint, ProxyTransport};

    const PIXEL_URI: &str = "data:image/png;base64,iVBORw0KGgo=";

    #[derive(Default)]
    struct Script {
        json: VecDeque<RelayResult<Value>>,
        streams: VecDeque<Vec<String>>,
        requests: Vec<(Endpoint, Value)>,
    }

    /// Scripted proxy; clones share one script so tests can inspect what
    /// was sent after handing a clone to the session.
    #[derive(Clone, Default)]
    struct FakeTransport {
        script: Arc<Mutex<Script>>,
    }

    impl FakeTransport {
        fn reply(self, value: RelayResult<Value>) -> Self {
            self.with_script(|script| script.json.push_back(value));
            self
        }

        fn stream(self, chunks: &[&str]) -> Self {
            let chunks = chunks.iter().map(|chunk| chunk.to_string()).collect();
            self.with_script(|script| script.streams.push_back(chunks));
            self
        }

        fn requests(&self) -> Vec<(Endpoint, Value)> {
            self.with_script(|script| script.requests.clone())
        }

        fn with_script<T>(&self, op: impl FnOnce(&mut Script) -> T) -> T {
            let mut guard = self
                .script
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            op(&mut guard)
        }
    }

    impl ProxyTransport for FakeTransport {
        fn post_json(&self, endpoint: Endpoint, body: &Value) -> RelayResult<Value> {
            self.with_script(|script| {
                script.requests.push((endpoint, body.clone()));
                script.json.pop_front().unwrap_or_else(|| {
                    Err(RelayError::NetworkFailure("no scripted reply".to_string()))
                })
            })
        }

        fn post_stream(
            &self,
            endpoint: Endpoint,
            body: &Value,
        ) -> RelayResult<Box<dyn Read + Send>> {
            self.with_script(|script| -> RelayResult<Box<dyn Read + Send>> {
                script.requests.push((endpoint, body.clone()));
                let chunks = script.streams.pop_front().ok_or_else(|| {
                    RelayError::NetworkFailure("no scripted stream".to_string())
                })?;
                Ok(Box::new(ChunkedReader::new(chunks)) as Box<dyn Read + Send>)
            })
        }
    }

    fn text_reply(text: &str) -> RelayResult<Value> {
        Ok(json!({"choices": [{"message": {"role": "assistant", "content": text}}]}))
    }

    fn image_reply() -> RelayResult<Value> {
        Ok(json!({"choices": [{"message": {
            "content": "done",
            "images": [{"image_url": {"url": PIXEL_URI}}]
        }}]}))
    }

    fn frame(text: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{text}\"}}}}]}}\n\n")
    }

    fn session(config: RelayConfig, transport: &FakeTransport, clock: &ManualClock) -> RelaySession {
        RelaySession::new(config, Box::new(transport.clone()), Box::new(clock.clone()))
            .unwrap_or_else(|err| panic!("{err}"))
    }

    #[test]
    fn chat_appends_both_turns_and_sends_history() {
        let transport = FakeTransport::default().reply(text_reply("Hello!"));
        let clock = ManualClock::default();
        let mut session = session(RelayConfig::default(), &transport, &clock);

        let reply = session.chat("  hi  ");
        assert_eq!(reply, Ok("Hello!".to_string()));
        assert_eq!(
            session.conversation().turns(),
            &[ConversationTurn::user("hi"), ConversationTurn::assistant("Hello!")]
        );

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        let (endpoint, body) = &requests[0];
        assert_eq!(*endpoint, Endpoint::Chat);
        assert_eq!(body["prompt"], "hi");
        assert_eq!(body["model"], session.chat_model());
        assert_eq!(body["messages"], json!([{"role": "user", "content": "hi"}]));
    }

    #[test]
    fn failed_chat_rolls_back_exactly() {
        let transport = FakeTransport::default()
            .reply(text_reply("first"))
            .reply(Err(RelayError::NetworkFailure("reset by peer".to_string())));
        let clock = ManualClock::default();
        let mut session = session(RelayConfig::default(), &transport, &clock);

        assert!(session.chat("one").is_ok());
        let before = session.conversation().clone();

        let err = session.chat("two").err();
        assert!(matches!(err, Some(RelayError::NetworkFailure(_))));
        assert_eq!(session.conversation(), &before);
    }

    #[test]
    fn empty_prompt_fails_before_network_and_keeps_quota() {
        let transport = FakeTransport::default();
        let clock = ManualClock::default();
        let mut session = session(RelayConfig::default(), &transport, &clock);
        let quota = session.rate_status().remaining;

        let err = session.chat("   ").err();
        assert!(matches!(err, Some(RelayError::InvalidInput(_))));
        assert!(transport.requests().is_empty());
        assert!(session.conversation().is_empty());
        assert_eq!(session.rate_status().remaining, quota);
    }

    #[test]
    fn rate_limit_rejects_extra_call_until_window_passes() {
        let transport = FakeTransport::default()
            .reply(text_reply("a"))
            .reply(text_reply("b"))
            .reply(text_reply("c"));
        let clock = ManualClock::default();
        let config = RelayConfig {
            rate_max_calls: 2,
            rate_window: Duration::from_millis(1_000),
            ..RelayConfig::default()
        };
        let mut session = session(config, &transport, &clock);

        assert!(session.chat("one").is_ok());
        clock.advance(Duration::from_millis(100));
        assert!(session.chat("two").is_ok());
        let before = session.conversation().clone();

        let err = session.chat("three").err();
        assert_eq!(
            err,
            Some(RelayError::RateLimitExceeded {
                wait: Duration::from_millis(900)
            })
        );
        assert_eq!(session.conversation(), &before);
        assert_eq!(transport.requests().len(), 2);
        let status = session.rate_status();
        assert_eq!(status.remaining, 0);
        assert_eq!(status.wait_seconds, 1);

        clock.advance(Duration::from_millis(900));
        assert_eq!(session.chat("three"), Ok("c".to_string()));
    }

    #[test]
    fn model_changes_are_validated() {
        let transport = FakeTransport::default();
        let clock = ManualClock::default();
        let mut session = session(RelayConfig::default(), &transport, &clock);
        let original = session.chat_model().to_string();

        assert!(matches!(
            session.set_model("nobody/unknown"),
            Err(RelayError::InvalidInput(_))
        ));
        assert!(matches!(
            session.set_model("openai/gpt-image-1"),
            Err(RelayError::InvalidInput(_))
        ));
        assert_eq!(session.chat_model(), original);

        let spec = session
            .set_model("openai/gpt-4o")
            .map(|spec| spec.id.clone());
        assert_eq!(spec.as_deref(), Ok("openai/gpt-4o"));
        assert_eq!(session.chat_model(), "openai/gpt-4o");

        assert!(session.set_image_model("openai/gpt-4o-mini").is_err());
        assert!(session.set_image_model("openai/gpt-image-1").is_ok());
        assert_eq!(session.image_model(), "openai/gpt-image-1");
    }

    #[test]
    fn unknown_configured_model_falls_back_to_default() {
        let transport = FakeTransport::default();
        let clock = ManualClock::default();
        let config = RelayConfig {
            chat_model: Some("nobody/unknown".to_string()),
            ..RelayConfig::default()
        };
        let session = session(config, &transport, &clock);
        assert!(session.registry().get(session.chat_model()).is_some());
    }

    #[test]
    fn streaming_chat_emits_increments_and_commits() {
        let body = format!("{}{}data: [DONE]\n\n", frame("Hel"), frame("lo"));
        let (first, second) = body.split_at(20);
        let transport = FakeTransport::default().stream(&[first, second]);
        let clock = ManualClock::default();
        let mut session = session(RelayConfig::default(), &transport, &clock);

        let mut seen = Vec::new();
        let text = session.chat_streaming("hi", &CancelToken::new(), &mut |delta: &str| {
            seen.push(delta.to_string())
        });
        assert_eq!(text, Ok("Hello".to_string()));
        assert_eq!(seen, vec!["Hel".to_string(), "lo".to_string()]);
        assert_eq!(
            session.conversation().last(),
            Some(&ConversationTurn::assistant("Hello"))
        );
        assert_eq!(transport.requests()[0].1["stream"], true);
    }

    #[test]
    fn upstream_stream_error_rolls_back_user_turn() {
        let body = format!(
            "{}data: {{\"error\":{{\"message\":\"overloaded\"}}}}\n\n",
            frame("par")
        );
        let transport = FakeTransport::default().stream(&[body.as_str()]);
        let clock = ManualClock::default();
        let mut session = session(RelayConfig::default(), &transport, &clock);

        let mut seen = Vec::new();
        let err = session
            .chat_streaming("hi", &CancelToken::new(), &mut |delta: &str| {
                seen.push(delta.to_string())
            })
            .err();
        assert_eq!(
            err,
            Some(RelayError::StreamUpstreamError("overloaded".to_string()))
        );
        assert_eq!(seen, vec!["par".to_string()]);
        assert!(session.conversation().is_empty());
    }

    #[test]
    fn cancelled_stream_never_succeeds() {
        let body = format!("{}{}data: [DONE]\n\n", frame("one"), frame("two"));
        let transport = FakeTransport::default().stream(&[body.as_str()]);
        let clock = ManualClock::default();
        let mut session = session(RelayConfig::default(), &transport, &clock);

        let cancel = CancelToken::new();
        let watchdog = cancel.clone();
        let result = session.chat_streaming("hi", &cancel, &mut |_: &str| watchdog.cancel());
        assert_eq!(result, Err(RelayError::Cancelled));
        assert!(session.conversation().is_empty());

        let pre_cancelled = session.chat_streaming("again", &cancel, &mut |_: &str| {});
        assert_eq!(pre_cancelled, Err(RelayError::Cancelled));
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn edit_prepares_oversized_image_before_upload() {
        let transport = FakeTransport::default().reply(image_reply());
        let clock = ManualClock::default();
        let config = RelayConfig {
            max_upload_bytes: 60_000,
            prepare: PrepareSchedule {
                qualities: vec![80, 60, 40],
                scale_step: 0.5,
                min_dimension: 32,
                max_dimension: 2048,
            },
            ..RelayConfig::default()
        };
        let mut session = session(config, &transport, &clock);

        let reply = session
            .edit_image("make it blue", &noisy_png(600, 400))
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(reply.kind(), "image");
        assert_eq!(reply.text(), Some("done"));

        let requests = transport.requests();
        let (endpoint, body) = &requests[0];
        assert_eq!(*endpoint, Endpoint::Edit);
        assert_eq!(body["model"], session.image_model());
        let image = body["image"].as_str().unwrap_or_default();
        assert!(image.starts_with("data:image/jpeg;base64,"));
        assert!(image.len() <= 60_000);
        assert!(session.conversation().is_empty());
    }

    #[test]
    fn undecodable_image_fails_before_rate_gate() {
        let transport = FakeTransport::default().reply(text_reply("hello"));
        let clock = ManualClock::default();
        let config = RelayConfig {
            rate_max_calls: 1,
            ..RelayConfig::default()
        };
        let mut session = session(config, &transport, &clock);
        let corrupt = ImagePayload::new(b"not an image".to_vec(), "image/png");

        let err = session.edit_image("fix", &corrupt).err();
        assert!(matches!(err, Some(RelayError::InvalidInput(_))));
        assert_eq!(session.rate_status().remaining, 1);
        assert!(transport.requests().is_empty());
        assert_eq!(session.chat("hi"), Ok("hello".to_string()));
    }

    #[test]
    fn image_too_large_fails_without_upload() {
        let transport = FakeTransport::default().reply(image_reply());
        let clock = ManualClock::default();
        let config = RelayConfig {
            max_upload_bytes: 100,
            ..RelayConfig::default()
        };
        let mut session = session(config, &transport, &clock);

        let err = session.edit_image("shrink", &noisy_png(64, 64)).err();
        assert!(matches!(err, Some(RelayError::ImageTooLarge { .. })));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn enhance_without_prompt_uses_stock_instruction() {
        let transport = FakeTransport::default().reply(image_reply());
        let clock = ManualClock::default();
        let mut session = session(RelayConfig::default(), &transport, &clock);
        let image = ImagePayload::from_data_uri(PIXEL_URI).unwrap_or_else(|err| panic!("{err}"));

        // Tiny payloads pass through, but still have to decode.
        let err = session.enhance_image(&image, None).err();
        assert!(matches!(err, Some(RelayError::InvalidInput(_))));

        let reply = session.enhance_image(&noisy_png(16, 16), Some("  "));
        assert!(matches!(reply, Ok(ProxyReply::Image { .. })));
        let requests = transport.requests();
        assert_eq!(requests[0].0, Endpoint::Enhance);
        assert_eq!(requests[0].1["prompt"], DEFAULT_ENHANCE_PROMPT);
    }

    #[test]
    fn generate_sends_prompt_without_image() {
        let transport = FakeTransport::default().reply(text_reply("I can only describe it."));
        let clock = ManualClock::default();
        let mut session = session(RelayConfig::default(), &transport, &clock);

        let reply = session.generate_image("a lighthouse at dusk");
        assert_eq!(
            reply,
            Ok(ProxyReply::Text {
                text: "I can only describe it.".to_string()
            })
        );
        let requests = transport.requests();
        assert_eq!(requests[0].0, Endpoint::Generate);
        assert!(requests[0].1.get("image").is_none());
    }

    #[test]
    fn journal_records_exchange_lifecycle() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("exchanges.jsonl");
        let transport = FakeTransport::default()
            .reply(text_reply("ok"))
            .reply(Err(RelayError::UpstreamHttpError {
                status: 502,
                message: "bad gateway".to_string(),
            }));
        let clock = ManualClock::default();
        let config = RelayConfig {
            rate_max_calls: 2,
            ..RelayConfig::default()
        };
        let mut session = session(config, &transport, &clock)
            .with_journal(ExchangeJournal::new(&path, "session-1"));

        let _ = session.chat("one");
        let _ = session.chat("two");
        let _ = session.chat("three");

        let entries = read_journal(&path)?;
        let kinds: Vec<&str> = entries.iter().map(|entry| entry.event.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "exchange_started",
                "exchange_completed",
                "exchange_started",
                "exchange_failed",
                "rate_limited",
            ]
        );
        assert!(matches!(
            &entries[1].event,
            ExchangeEvent::ExchangeCompleted { reply_kind, chars: Some(2), streamed: false, .. }
                if reply_kind == "text"
        ));
        assert!(matches!(
            &entries[3].event,
            ExchangeEvent::ExchangeFailed { code, .. } if code == "UPSTREAM_HTTP_ERROR"
        ));
        assert!(entries.iter().all(|entry| entry.session_id == "session-1"));
        Ok(())
    }
}
