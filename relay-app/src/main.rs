//! Feishu relay binary.

mod config;
mod context;
mod dedup;
mod delivery;
mod dispatcher;
mod gateway;
mod kv;
mod routes;
mod server;

use clap::{Parser, Subcommand, ValueEnum};
use config::Environment;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(
    name = "feishu-relay",
    version,
    about = "Feishu chat relay backed by DeepSeek"
)]
struct Cli {
    /// TOML config file. Falls back to RELAY_CONFIG, then environment only.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Defaults to json in production and compact otherwise.
    #[arg(long, global = true, env = "RELAY_LOG_FORMAT", value_enum, ignore_case = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the callback server (default).
    Serve,
    /// Validate config and check Redis connectivity.
    Doctor,
    /// Print the DeepSeek account balance.
    Balance,
    /// One-shot send of a text message to a user open id.
    Send { open_id: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    fn default_for(environment: Environment) -> Self {
        if environment.is_production() {
            Self::Json
        } else {
            Self::Compact
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loaded before tracing so ENVIRONMENT from .env picks the defaults.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let environment = std::env::var("ENVIRONMENT")
        .ok()
        .and_then(|raw| Environment::parse(&raw))
        .unwrap_or_default();
    let log_format = cli
        .log_format
        .unwrap_or_else(|| LogFormat::default_for(environment));
    init_tracing(environment, log_format)?;
    install_panic_hook();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(cli.config).await,
        Command::Doctor => server::doctor(cli.config).await,
        Command::Balance => server::balance(cli.config).await,
        Command::Send { open_id, message } => {
            server::send_one_shot(cli.config, &open_id, &message).await
        }
    }
}

/// Relay crates log at debug outside production.
fn default_filter(environment: Environment) -> &'static str {
    if environment.is_production() {
        "info,tower_http=info"
    } else {
        "info,feishu_relay=debug,relay_app=debug,relay_channels=debug,relay_llm=debug,tower_http=debug"
    }
}

fn init_tracing(environment: Environment, log_format: LogFormat) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(environment)));
    // Source locations only help while developing.
    let verbose = !environment.is_production();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_file(verbose)
        .with_line_number(verbose);

    let initialized = match log_format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    initialized.map_err(|e| anyhow::anyhow!("init tracing: {e}"))?;

    tracing::info!(
        environment = environment.as_str(),
        ?log_format,
        rust_log = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
