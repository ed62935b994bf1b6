//! CLI binary for encore.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use encore::channel::{ChannelEvent, ConnectionState};
use encore::control::{Room, StartLiveRequest};
use encore::playback::{AudioSink, CpalSink, SilentSink, SymphoniaDecoder, list_output_devices};
use encore::{ControlClient, LiveConfig, LiveSession, LoggingAvatarDriver};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Encore: follow and perform an AI live stream locally.
#[derive(Parser)]
#[command(name = "encore", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend base URL (overrides `server.base_url`).
    #[arg(long)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the step stream and perform it until Ctrl+C.
    Watch {
        /// Keep exact timing but produce no sound.
        #[arg(long)]
        silent: bool,
    },

    /// Create a room and start a performance in it.
    Start {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        persona: String,
        /// Character name (defaults to `avatar.character_name`).
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "")]
        background: String,
        /// Script language: en, zh or ja. Detected by the backend when omitted.
        #[arg(long)]
        language: Option<String>,
        /// Watch the performance after starting it.
        #[arg(long)]
        watch: bool,
    },

    /// Show the status of a room.
    Status {
        #[arg(long)]
        room: String,
    },

    /// Send an audience message to a room.
    Say {
        #[arg(long)]
        room: String,
        text: String,
        #[arg(long)]
        user: Option<String>,
    },

    /// List available audio output devices.
    Devices,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("encore=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    if let Some(base_url) = cli.base_url {
        config.server.base_url = base_url;
    }

    match cli.command {
        Command::Watch { silent } => watch(config, silent).await,
        Command::Start {
            topic,
            persona,
            name,
            background,
            language,
            watch: then_watch,
        } => {
            let request = StartLiveRequest {
                character_name: name.unwrap_or_else(|| config.avatar.character_name.clone()),
                persona,
                background,
                topic,
                language,
                ..StartLiveRequest::default()
            };
            let room = start(&config, &request).await?;
            if then_watch {
                config.avatar.character_name = request.character_name;
                println!("Watching room {}...", room.room_id);
                watch(config, false).await?;
            }
            Ok(())
        }
        Command::Status { room } => status(&config, &room).await,
        Command::Say { room, text, user } => {
            let client = ControlClient::from_config(&config)?;
            client.send_danmaku(&room, &text, user.as_deref()).await?;
            Ok(())
        }
        Command::Devices => list_devices(),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<LiveConfig> {
    if let Some(path) = path {
        return Ok(LiveConfig::from_file(path)?);
    }
    let default_path = LiveConfig::default_config_path();
    if default_path.is_file() {
        info!("loading config from {}", default_path.display());
        return Ok(LiveConfig::from_file(&default_path)?);
    }
    Ok(LiveConfig::default())
}

async fn watch(config: LiveConfig, silent: bool) -> anyhow::Result<()> {
    println!("Encore v{}", env!("CARGO_PKG_VERSION"));

    let decoder = Arc::new(SymphoniaDecoder::new(config.playback.sample_rate));
    let sink: Box<dyn AudioSink> = if silent {
        Box::new(SilentSink::new())
    } else {
        Box::new(CpalSink::new(&config.playback)?)
    };
    let session = LiveSession::start(&config, decoder, sink, Arc::new(LoggingAvatarDriver))?;
    let mut events = session.channel().subscribe();

    println!("Connecting to {}. Press Ctrl+C to stop.\n", session.channel().url());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down...");
                break;
            }
            event = events.recv() => match event {
                Ok(ChannelEvent::State(ConnectionState::Connected)) => println!("[connected]"),
                Ok(ChannelEvent::State(ConnectionState::Disconnected)) => {
                    println!("[disconnected]");
                }
                Ok(ChannelEvent::Phase(phase)) => println!("[phase: {phase:?}]"),
                Ok(ChannelEvent::Info(text)) => println!("[info] {text}"),
                Ok(ChannelEvent::Chat(msg)) if !msg.is_ai => {
                    println!("<{}> {}", msg.user, msg.text);
                }
                Ok(ChannelEvent::BackendError(text)) => println!("[error] {text}"),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("{n} channel events skipped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.shutdown().await;
    Ok(())
}

async fn start(config: &LiveConfig, request: &StartLiveRequest) -> anyhow::Result<Room> {
    let client = ControlClient::from_config(config)?;
    if !client.health().await {
        anyhow::bail!("backend at {} is not reachable", client.base_url());
    }
    let room = client.create_room().await?;
    client.start_live(request, &room).await?;
    println!("Room:        {}", room.room_id);
    println!("Owner token: {}", room.owner_token);
    Ok(room)
}

async fn status(config: &LiveConfig, room: &str) -> anyhow::Result<()> {
    let client = ControlClient::from_config(config)?;
    let status = client.status(room).await?;
    let online = client.online_count(room).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    println!("Online: {online}");
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    println!("Output devices:");
    for name in list_output_devices()? {
        println!("  - {name}");
    }
    Ok(())
}
