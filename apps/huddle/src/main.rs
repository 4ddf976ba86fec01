use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use huddle_core::media::MediaKind;
use huddle_core::signaling::relay::LocalRelay;
use huddle_core::signaling::websocket::{self, WebSocketReconnect};
use huddle_core::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use huddle_core::transport::TransportState;
use huddle_core::transport::mock::MockTransportFactory;
use huddle_core::transport::webrtc::WebRtcTransportFactory;
use huddle_core::{HuddleConfig, LocalMedia, Session, SessionEvent};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("huddle: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("initialise logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut config = HuddleConfig::load(cli.config.as_deref()).context("load configuration")?;
    if let Some(url) = cli.signaling_url {
        config.signaling_url = url;
    }
    if let Some(name) = cli.display_name.filter(|name| !name.trim().is_empty()) {
        config.display_identity = Some(name);
    }

    match cli.command {
        Command::Join(args) => handle_join(&config, args).await,
        Command::Demo(args) => handle_demo(&config, args).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "huddle",
    about = "Full-mesh audio/video calls over a room signaling relay",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = "HUDDLE_CONFIG",
        help = "TOML file with relay, ICE server and timing settings"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        help = "Relay URL (http, https, ws or wss); overrides the config file"
    )]
    signaling_url: Option<String>,

    #[arg(long, global = true, help = "Name shown to other participants")]
    display_name: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "HUDDLE_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "HUDDLE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a room through the configured relay
    Join(JoinArgs),
    /// Run several participants against an in-process relay
    Demo(DemoArgs),
}

#[derive(Args, Debug)]
struct JoinArgs {
    room: String,

    #[arg(long, help = "Join with the microphone track disabled")]
    muted: bool,

    #[arg(long, help = "Join with the camera track disabled")]
    camera_off: bool,
}

#[derive(Args, Debug)]
struct DemoArgs {
    #[arg(long, default_value = "demo")]
    room: String,

    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(2..=8))]
    participants: u8,

    #[arg(long, default_value_t = 15, help = "Seconds to wait for every link to connect")]
    settle_secs: u64,
}

async fn handle_join(config: &HuddleConfig, args: JoinArgs) -> Result<()> {
    let signaling = websocket::connect(&config.signaling_url)
        .await
        .with_context(|| format!("connect to relay {}", config.signaling_url))?;
    let factory = WebRtcTransportFactory::new(&config.ice_servers).context("build WebRTC API")?;
    let media = LocalMedia::audio_video(format!("huddle-{}", signaling.local_id));
    if args.muted {
        media.set_enabled(MediaKind::Audio, false);
    }
    if args.camera_off {
        media.set_enabled(MediaKind::Video, false);
    }

    let (session, mut events) = Session::start_with_reconnect(
        config,
        signaling,
        Arc::new(factory),
        Some(Arc::new(media)),
        Arc::new(WebSocketReconnect::new(config.signaling_url.clone())),
    );
    info!(local_id = %session.local_id(), room = %args.room, "joining");
    let joined = session
        .join(&args.room)
        .await
        .with_context(|| format!("join room {}", args.room))?;
    println!(
        "joined {} as {} ({} other participant(s))",
        joined.room,
        session.local_id(),
        joined.peers.len()
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::SignalingLost) => {
                    println!("{}", SessionEvent::SignalingLost.describe());
                    break;
                }
                Some(event) => println!("{}", event.describe()),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; leaving");
                break;
            }
        }
    }

    session.leave().await?;
    session.shutdown().await?;
    Ok(())
}

struct DemoParticipant {
    session: Session,
    events: UnboundedReceiver<SessionEvent>,
}

async fn handle_demo(config: &HuddleConfig, args: DemoArgs) -> Result<()> {
    let relay = LocalRelay::new();
    let mut participants = Vec::new();
    for index in 0..args.participants {
        let channel = relay.connect();
        let factory = MockTransportFactory::new(channel.local_id.clone());
        let media = LocalMedia::detached(
            format!("demo-{index}"),
            &[MediaKind::Audio, MediaKind::Video],
        );
        let (session, events) =
            Session::start(config, channel, Arc::new(factory), Some(Arc::new(media)));
        let joined = session.join(&args.room).await?;
        println!(
            "{} joined {} and sees {} peer(s)",
            session.local_id(),
            joined.room,
            joined.peers.len()
        );
        participants.push(DemoParticipant { session, events });
    }

    let expected = usize::from(args.participants) - 1;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.settle_secs);
    loop {
        let mut settled = 0;
        for participant in &mut participants {
            while let Ok(event) = participant.events.try_recv() {
                debug!(local_id = %participant.session.local_id(), event = %event.describe(), "demo event");
            }
            let snapshot = participant.session.snapshot().await?;
            let connected = snapshot
                .peers
                .iter()
                .filter(|peer| peer.state == TransportState::Connected)
                .count();
            if connected == expected {
                settled += 1;
            }
        }
        if settled == participants.len() {
            println!("mesh settled: every participant connected to {expected} peer(s)");
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(settled, total = participants.len(), "mesh did not settle in time");
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    for participant in &participants {
        let snapshot = participant.session.snapshot().await?;
        for peer in &snapshot.peers {
            println!("{} -> {}: {}", snapshot.local_id, peer.label, peer.state);
        }
    }
    for participant in participants {
        participant.session.leave().await?;
        participant.session.shutdown().await?;
    }
    Ok(())
}
