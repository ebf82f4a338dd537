use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sitelink::config::AppConfig;
use sitelink::events::SessionEvent;
use sitelink::identity::Role;
use sitelink::media::DeviceAcquirer;
use sitelink::payload::Payload;
use sitelink::transport::WsRendezvous;
use sitelink::SessionManager;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Sitelink command line arguments
#[derive(Parser, Debug)]
#[command(name = "sitelink")]
#[command(version, about = "Two-party video call with a shared overlay link", long_about = None)]
struct CliArgs {
    /// Which side of the session this process is
    #[arg(short = 'r', long, value_name = "ROLE")]
    role: Role,

    /// Session code shared by both parties
    #[arg(short = 'c', long, value_name = "CODE")]
    code: String,

    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Rendezvous service URL (overrides config)
    #[arg(short = 's', long, value_name = "URL")]
    server: Option<String>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting Sitelink v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load_or_default(args.config.as_deref()).await?;
    if let Some(server) = args.server {
        config.rendezvous.server_url = server;
    }

    let rendezvous = Arc::new(WsRendezvous::new(&config));
    let acquirer = Arc::new(DeviceAcquirer::new(config.capture.clone()));
    let manager = SessionManager::start(args.role, &args.code, config, rendezvous, acquirer)?;

    let printer = tokio::spawn(print_events(manager.subscribe()));
    println!("{}", manager.status());
    println!("Commands: mute, flip, share, clear, image <file>, end");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !run_command(&manager, line.trim()).await {
                    break;
                }
            }
        }
    }

    manager.end_session().await;
    printer.abort();
    tracing::info!("Session closed");
    Ok(())
}

/// Run one console command; returns false when the session should end
async fn run_command(manager: &SessionManager, line: &str) -> bool {
    let (command, arg) = match line.split_once(' ') {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "mute" => {
            let muted = manager.toggle_mute().await;
            println!("{}", if muted { "Muted" } else { "Unmuted" });
        }
        "flip" => {
            let facing = manager.toggle_camera_facing().await;
            println!("Camera: {}", facing);
        }
        "share" => {
            let result = manager.start_screen_share().await;
            if let Some(error) = result.error {
                println!("{}", error);
            }
        }
        "clear" => {
            manager.send_payload(Payload::Clear).await;
        }
        "image" => match send_image(manager, arg).await {
            Ok(true) => println!("Image sent"),
            Ok(false) => println!("Data link is not open"),
            Err(e) => println!("Failed to send image: {}", e),
        },
        "end" | "quit" => return false,
        other => println!("Unknown command: {}", other),
    }
    true
}

async fn send_image(manager: &SessionManager, path: &str) -> anyhow::Result<bool> {
    let mime = match PathBuf::from(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => anyhow::bail!("unsupported image type: {}", path),
    };
    let bytes = tokio::fs::read(path).await?;
    Ok(manager.send_payload(Payload::image(mime, &bytes)).await)
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::StatusChanged { status, .. }) => println!("{}", status),
            Ok(SessionEvent::PayloadReceived { payload, .. }) => {
                println!("Received {} from peer", payload.tag())
            }
            Ok(SessionEvent::ScreenShareEnded) => println!("Screen sharing stopped"),
            Ok(SessionEvent::SessionEnded) => break,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "sitelink=error,webrtc=error",
        LogLevel::Warn => "sitelink=warn,webrtc=warn",
        LogLevel::Info => "sitelink=info,webrtc=warn",
        LogLevel::Verbose => "sitelink=debug,webrtc=warn",
        LogLevel::Debug => "sitelink=debug,webrtc=info",
        LogLevel::Trace => "sitelink=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
