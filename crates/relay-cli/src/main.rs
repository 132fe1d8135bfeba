use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use relay_contracts::chat::{parse_intent, Intent, CHAT_HELP_COMMANDS};
use relay_contracts::conversation::Conversation;
use relay_contracts::events::ExchangeJournal;
use relay_contracts::limits::{RateStatus, RateWindow};
use relay_contracts::models::{ModelRegistry, ModelSpec};
use relay_engine::{
    new_session_id, CancelToken, HttpTransport, ImagePayload, ImagePreparer, MonotonicClock,
    ProxyReply, RelayConfig, RelayError, RelaySession,
};
use serde_json::json;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "relay",
    version,
    about = "Chat and image requests through the relay proxy"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat with slash commands.
    Chat(ChatArgs),
    /// Edit an image with a prompt.
    Edit(EditArgs),
    /// Enhance an image.
    Enhance(EnhanceArgs),
    /// Generate an image from a prompt.
    Generate(GenerateArgs),
    /// Shrink an image under the upload ceiling without sending it.
    Prepare(PrepareArgs),
    /// List known models.
    Models(ModelsArgs),
    /// Show the configured request and upload limits.
    Limits(LimitsArgs),
}

#[derive(Debug, Args)]
struct SessionArgs {
    /// Proxy base URL; overrides RELAY_PROXY_BASE.
    #[arg(long)]
    proxy: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    /// Append exchange events to this JSONL file.
    #[arg(long)]
    events: Option<PathBuf>,
    /// Timeout in seconds for non-streaming requests.
    #[arg(long, default_value_t = 120.0)]
    request_timeout: f64,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// Directory for images returned by /generate, /edit and /enhance.
    #[arg(long, default_value = ".")]
    out: PathBuf,
    /// Cancel a streamed reply after this many seconds.
    #[arg(long)]
    stream_timeout: Option<f64>,
    /// Wait for whole replies instead of streaming them.
    #[arg(long)]
    no_stream: bool,
}

#[derive(Debug, Parser)]
struct EditArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = ".")]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct EnhanceArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long, default_value = ".")]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = ".")]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct PrepareArgs {
    #[arg(long)]
    image: PathBuf,
    /// Output file; defaults to `<stem>.prepared.<ext>` next to the input.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Ceiling for the data URI; overrides RELAY_MAX_UPLOAD_BYTES.
    #[arg(long)]
    max_bytes: Option<usize>,
}

#[derive(Debug, Parser)]
struct ModelsArgs {
    /// Only models with this capability (chat, vision, image, edit).
    #[arg(long)]
    capability: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct LimitsArgs {
    #[arg(long)]
    json: bool,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("relay error: {err:#}");
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr so streamed replies on stdout stay clean.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("RELAY_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => run_chat(args),
        Command::Edit(args) => run_edit(args),
        Command::Enhance(args) => run_enhance(args),
        Command::Generate(args) => run_generate(args),
        Command::Prepare(args) => run_prepare(args),
        Command::Models(args) => run_models(args),
        Command::Limits(args) => run_limits(args),
    }
}

fn build_session(args: &SessionArgs) -> Result<RelaySession> {
    let mut config = RelayConfig::from_env();
    if let Some(proxy) = args.proxy.as_deref() {
        config = config.with_proxy_base(proxy);
    }
    let mut transport = HttpTransport::new(config.proxy_base.clone());
    if let Some(timeout) = timeout_from_secs("request-timeout", args.request_timeout)? {
        transport = transport.with_timeout(timeout);
    }
    debug!(proxy = %transport.base(), "building session");

    let mut session = RelaySession::new(
        config,
        Box::new(transport),
        Box::new(MonotonicClock::default()),
    )
    .map_err(user_error)?;
    if let Some(model) = args.model.as_deref() {
        session.set_model(model).map_err(user_error)?;
    }
    if let Some(model) = args.image_model.as_deref() {
        session.set_image_model(model).map_err(user_error)?;
    }
    if let Some(path) = args.events.as_ref() {
        session = session.with_journal(ExchangeJournal::new(path, new_session_id()));
    }
    Ok(session)
}

fn run_chat(args: ChatArgs) -> Result<i32> {
    let mut session = build_session(&args.session)?;
    let stream_timeout = match args.stream_timeout {
        Some(secs) => timeout_from_secs("stream-timeout", secs)?,
        None => None,
    };

    println!(
        "Relay chat started with {}. Type /help for commands.",
        session.chat_model()
    );

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        match parse_intent(input) {
            Intent::Noop => continue,
            Intent::Quit => break,
            Intent::Help => print!("{}", help_text()),
            Intent::Usage { usage } => println!("Usage: {usage}"),
            Intent::Unknown { command, .. } => {
                println!("Unknown command /{command}. Type /help for commands.");
            }
            Intent::SetModel { model } => match session.set_model(&model) {
                Ok(spec) => println!("Chat model set to {} ({})", spec.id, spec.name),
                Err(err) => report(&err),
            },
            Intent::SetImageModel { model } => match session.set_image_model(&model) {
                Ok(spec) => println!("Image model set to {} ({})", spec.id, spec.name),
                Err(err) => report(&err),
            },
            Intent::Reset => {
                session.reset_conversation();
                println!("Conversation cleared.");
            }
            Intent::History => print!("{}", history_text(session.conversation())),
            Intent::Limits => {
                let config = session.config();
                println!(
                    "{}",
                    limits_text(
                        &session.rate_status(),
                        config.rate_max_calls,
                        config.rate_window,
                        config.max_upload_bytes,
                    )
                );
            }
            Intent::Models => print!("{}", models_text(session.registry().list())),
            Intent::Chat { prompt } => {
                if args.no_stream {
                    match session.chat(&prompt) {
                        Ok(text) => println!("{text}"),
                        Err(err) => report(&err),
                    }
                } else {
                    stream_chat_turn(&mut session, &prompt, stream_timeout)?;
                }
            }
            Intent::Generate { prompt } => {
                let reply = session.generate_image(&prompt);
                show_reply(reply, &args.out, "generated")?;
            }
            Intent::Edit { path, prompt } => {
                let reply = load_image(Path::new(&path))
                    .and_then(|image| session.edit_image(&prompt, &image));
                show_reply(reply, &args.out, "edited")?;
            }
            Intent::Enhance { path, prompt } => {
                let reply = load_image(Path::new(&path))
                    .and_then(|image| session.enhance_image(&image, prompt.as_deref()));
                show_reply(reply, &args.out, "enhanced")?;
            }
        }
    }

    Ok(0)
}

fn stream_chat_turn(
    session: &mut RelaySession,
    prompt: &str,
    timeout: Option<Duration>,
) -> Result<()> {
    let cancel = CancelToken::new();
    let watchdog = timeout.map(|limit| Watchdog::arm(cancel.clone(), limit));

    let mut stdout = io::stdout();
    let mut write_failed = false;
    let result = session.chat_streaming(prompt, &cancel, &mut |delta: &str| {
        if write_failed {
            return;
        }
        if stdout
            .write_all(delta.as_bytes())
            .and_then(|_| stdout.flush())
            .is_err()
        {
            write_failed = true;
        }
    });
    drop(watchdog);

    println!();
    if let Err(err) = result {
        report(&err);
    }
    Ok(())
}

/// Cancels a token once `limit` has passed, unless dropped first.
struct Watchdog {
    _disarm: mpsc::Sender<()>,
}

impl Watchdog {
    fn arm(cancel: CancelToken, limit: Duration) -> Self {
        let (disarm, disarmed) = mpsc::channel::<()>();
        thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = disarmed.recv_timeout(limit) {
                debug!(limit_ms = limit.as_millis() as u64, "stream timeout reached");
                cancel.cancel();
            }
        });
        Self { _disarm: disarm }
    }
}

fn run_edit(args: EditArgs) -> Result<i32> {
    let mut session = build_session(&args.session)?;
    let image = load_image(&args.image).map_err(user_error)?;
    let reply = session
        .edit_image(&args.prompt, &image)
        .map_err(user_error)?;
    print_reply(&reply, &args.out, "edited")?;
    Ok(0)
}

fn run_enhance(args: EnhanceArgs) -> Result<i32> {
    let mut session = build_session(&args.session)?;
    let image = load_image(&args.image).map_err(user_error)?;
    let reply = session
        .enhance_image(&image, args.prompt.as_deref())
        .map_err(user_error)?;
    print_reply(&reply, &args.out, "enhanced")?;
    Ok(0)
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let mut session = build_session(&args.session)?;
    let reply = session.generate_image(&args.prompt).map_err(user_error)?;
    print_reply(&reply, &args.out, "generated")?;
    Ok(0)
}

fn run_prepare(args: PrepareArgs) -> Result<i32> {
    let config = RelayConfig::from_env();
    let max_bytes = args.max_bytes.unwrap_or(config.max_upload_bytes);
    let payload = load_image(&args.image).map_err(user_error)?;

    let prepared = ImagePreparer::new(config.prepare)
        .prepare_in_background(payload, max_bytes)
        .wait()
        .map_err(user_error)?;

    let out = args
        .out
        .unwrap_or_else(|| prepared_output_path(&args.image, prepared.payload.extension()));
    fs::write(&out, prepared.payload.bytes())
        .with_context(|| format!("failed to write {}", out.display()))?;

    let summary = json!({
        "path": out.to_string_lossy(),
        "mime_type": prepared.payload.mime_type(),
        "original_size": prepared.original_size,
        "size": prepared.payload.encoded_size(),
        "max_bytes": max_bytes,
        "width": prepared.width,
        "height": prepared.height,
        "quality": prepared.quality,
        "iterations": prepared.iterations,
        "reencoded": prepared.reencoded,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(0)
}

fn run_models(args: ModelsArgs) -> Result<i32> {
    let registry = ModelRegistry::default();
    let models: Vec<ModelSpec> = match args.capability.as_deref() {
        Some(capability) => registry.by_capability(capability.trim()),
        None => registry.list().cloned().collect(),
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&models)?);
    } else {
        print!("{}", models_text(models.iter()));
    }
    Ok(0)
}

fn run_limits(args: LimitsArgs) -> Result<i32> {
    let config = RelayConfig::from_env();
    let status = RateWindow::new(config.rate_max_calls, config.rate_window).status(0);
    if args.json {
        let value = json!({
            "remaining": status.remaining,
            "waitSeconds": status.wait_seconds,
            "maxCalls": config.rate_max_calls,
            "windowSeconds": config.rate_window.as_secs(),
            "maxUploadBytes": config.max_upload_bytes,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!(
            "{}",
            limits_text(
                &status,
                config.rate_max_calls,
                config.rate_window,
                config.max_upload_bytes,
            )
        );
    }
    Ok(0)
}

fn load_image(path: &Path) -> Result<ImagePayload, RelayError> {
    ImagePayload::from_path(path)
}

/// In the REPL a failed request is reported and the loop goes on; only local
/// I/O errors end the session.
fn show_reply(
    reply: Result<ProxyReply, RelayError>,
    out_dir: &Path,
    stem: &str,
) -> Result<()> {
    match reply {
        Ok(reply) => print_reply(&reply, out_dir, stem),
        Err(err) => {
            report(&err);
            Ok(())
        }
    }
}

fn print_reply(reply: &ProxyReply, out_dir: &Path, stem: &str) -> Result<()> {
    match reply {
        ProxyReply::Text { text } => println!("{text}"),
        ProxyReply::Image { image, caption } => {
            let path = save_image(out_dir, stem, image)?;
            println!("Saved image to {}", path.display());
            if let Some(caption) = caption {
                println!("{caption}");
            }
        }
    }
    Ok(())
}

fn save_image(out_dir: &Path, stem: &str, image: &ImagePayload) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let path = out_dir.join(format!(
        "{stem}-{}.{}",
        unix_epoch_millis(),
        image.extension()
    ));
    fs::write(&path, image.bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

fn report(err: &RelayError) {
    debug!(code = err.code().as_str(), error = %err, "request failed");
    eprintln!("Error: {}", err.user_message());
}

fn user_error(err: RelayError) -> anyhow::Error {
    debug!(code = err.code().as_str(), error = %err, "request failed");
    anyhow::anyhow!(err.user_message())
}

fn help_text() -> String {
    let width = CHAT_HELP_COMMANDS
        .iter()
        .map(|(usage, _)| usage.len())
        .max()
        .unwrap_or(0);
    let mut out = String::from("Commands:\n");
    for (usage, summary) in CHAT_HELP_COMMANDS {
        out.push_str(&format!("  {usage:<width$}  {summary}\n"));
    }
    out.push_str("Anything else is sent as a chat message.\n");
    out
}

fn history_text(conversation: &Conversation) -> String {
    if conversation.is_empty() {
        return "(no messages yet)\n".to_string();
    }
    conversation
        .turns()
        .iter()
        .map(|turn| format!("{}: {}\n", turn.role.as_str(), turn.content))
        .collect()
}

fn models_text<'a>(models: impl Iterator<Item = &'a ModelSpec>) -> String {
    models
        .map(|model| {
            format!(
                "{:<40} {} [{}]\n    {}\n",
                model.id,
                model.name,
                model.capabilities.join(", "),
                model.description
            )
        })
        .collect()
}

fn limits_text(
    status: &RateStatus,
    max_calls: usize,
    window: Duration,
    max_upload_bytes: usize,
) -> String {
    let mut text = format!(
        "{} of {} requests left in a {}s window; uploads up to {} KB.",
        status.remaining,
        max_calls,
        window.as_secs(),
        max_upload_bytes / 1024
    );
    if status.wait_seconds > 0 {
        text.push_str(&format!(" Next slot in {}s.", status.wait_seconds));
    }
    text
}

fn prepared_output_path(input: &Path, extension: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|value| value.to_str())
        .filter(|value| !value.is_empty())
        .unwrap_or("image");
    input.with_file_name(format!("{stem}.prepared.{extension}"))
}

/// Non-positive values disable the timeout.
fn timeout_from_secs(flag: &str, secs: f64) -> Result<Option<Duration>> {
    if secs.is_nan() || secs <= 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|_| anyhow!("--{flag} must be a finite number of seconds, got {secs}"))
}

fn unix_epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis())
        .unwrap_or(0)
}
