use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tgupload_core::config::{UploaderSettings, load_settings, to_toml};
use tgupload_core::mtp::MTP_PART_TABLE;
use tgupload_core::web::WEB_PART_TABLE;
use tgupload_core::{
    APP_NAME, FileKind, FullMsgId, InMemoryRegistry, MediaDescriptor, ReqwestTransport,
    SessionContext, UploadEvent, Uploader, WebEndpoints, WebStrategy, spawn_uploader,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "tgupload")]
#[command(about = "Chunked media upload pipeline", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the part plan each protocol would use for a file of this size,
    /// with the configured MTP limits applied.
    Plan {
        #[arg(long)]
        size: u64,
    },
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    /// Upload one file through the HTTP endpoint and stream events as NDJSON.
    WebUpload {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = KindArg::File)]
        kind: KindArg,
        #[arg(long, default_value_t = 0)]
        peer: i64,
        #[arg(long, default_value_t = 1)]
        msg: i32,
        #[arg(long)]
        user_id: Option<i64>,
        #[arg(long)]
        token: Option<String>,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Photo,
    File,
    Audio,
    Wallpaper,
    Secure,
}

impl From<KindArg> for FileKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Photo => FileKind::Photo,
            KindArg::File => FileKind::File,
            KindArg::Audio => FileKind::Audio,
            KindArg::Wallpaper => FileKind::WallPaper,
            KindArg::Secure => FileKind::Secure,
        }
    }
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: true,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tgupload_core::logging::init_logging(cli.json);
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var("TGUPLOAD_CONFIG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);

    match cli.cmd {
        Command::Plan { size } => {
            let limits = load_settings(&config_dir).map_err(map_core_error)?.mtp.limits();
            let plan = |table: &tgupload_core::file::PartTable| match table.plan(size) {
                Ok(p) => serde_json::json!(p),
                Err(e) => serde_json::json!({ "error": e.to_string() }),
            };
            let out = serde_json::json!({
                "size": size,
                "mtp": {
                    "plan": plan(&MTP_PART_TABLE),
                    "big": limits.is_big(size),
                    "sessions": limits.sessions,
                    "max_in_flight_bytes": limits.max_in_flight(),
                },
                "web": plan(&WEB_PART_TABLE),
            });
            if cli.json {
                println!("{out}");
            } else {
                let text = serde_json::to_string_pretty(&out)
                    .map_err(|e| CliError::new("json", e.to_string()))?;
                println!("{text}");
            }
            Ok(())
        }
        Command::Settings {
            cmd: SettingsCmd::Get,
        } => {
            let settings = load_settings(&config_dir).map_err(map_core_error)?;
            if cli.json {
                println!("{}", serde_json::json!({ "settings": settings }));
            } else {
                print!("{}", to_toml(&settings).map_err(map_core_error)?);
            }
            Ok(())
        }
        Command::WebUpload {
            file,
            kind,
            peer,
            msg,
            user_id,
            token,
        } => {
            let settings = load_settings(&config_dir).map_err(map_core_error)?;
            let session = SessionContext::new(
                user_id.unwrap_or(settings.web.user_id),
                token.unwrap_or_else(|| settings.web.auth_token.clone()),
            );
            let msg_id = FullMsgId::new(peer, msg);
            web_upload(&settings, session, file, kind.into(), msg_id).await
        }
    }
}

async fn web_upload(
    settings: &UploaderSettings,
    session: SessionContext,
    path: PathBuf,
    kind: FileKind,
    msg_id: FullMsgId,
) -> Result<(), CliError> {
    let size = std::fs::metadata(&path)
        .map_err(|e| CliError::new("source.unreadable", format!("{}: {e}", path.display())))?
        .len();

    let (transport, completions) =
        ReqwestTransport::new(WebEndpoints::from_base(&settings.web.base_url));
    let registry = std::sync::Arc::new(InMemoryRegistry::new());
    let uploader = Uploader::new(
        WebStrategy::new(transport, session),
        registry.clone(),
        registry,
    )
    .with_idle_timeout(settings.timers.idle_teardown());

    let shutdown = CancellationToken::new();
    let (handle, task) = spawn_uploader(
        uploader,
        completions,
        settings.timers.send_interval(),
        shutdown.clone(),
    );
    let mut events = handle.subscribe().await.map_err(map_core_error)?;

    tracing::info!(
        event = "cli.web_upload",
        app = APP_NAME,
        path = %path.display(),
        size,
        "cli.web_upload"
    );
    handle
        .upload_media(msg_id, MediaDescriptor::from_path(kind, 1, path, size))
        .map_err(map_core_error)?;

    let mut failure = None;
    while let Some(event) = events.recv().await {
        let line =
            serde_json::to_string(&event).map_err(|e| CliError::new("json", e.to_string()))?;
        println!("{line}");
        if event.is_terminal() {
            failure = match event {
                UploadEvent::PhotoFailed { error, .. }
                | UploadEvent::DocumentFailed { error, .. }
                | UploadEvent::SecureFailed { error, .. } => Some(error),
                _ => None,
            };
            break;
        }
    }

    shutdown.cancel();
    let _ = task.await;

    match failure {
        Some(error) => Err(CliError::retryable("upload.failed", error)),
        None => Ok(()),
    }
}

fn default_config_dir() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".config").join(APP_NAME),
        Err(_) => PathBuf::from("."),
    }
}

fn map_core_error(e: tgupload_core::Error) -> CliError {
    match e {
        tgupload_core::Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        tgupload_core::Error::PartSize { .. } => CliError::new("file.too_large", e.to_string()),
        tgupload_core::Error::Http { message } => CliError::retryable("http.failed", message),
        tgupload_core::Error::Cancelled => CliError::new("upload.cancelled", "cancelled"),
        tgupload_core::Error::Stopped => CliError::new("uploader.stopped", e.to_string()),
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"retryable\":false}".to_string()
    });
    let _ = writeln!(std::io::stderr(), "{json}");
}
