//! LAN Session CLI
//!
//! Hosts or joins a session from the terminal. Lines typed on stdin are sent
//! as chat; the local avatar walks a slow circle so remote peers have
//! snapshots to smooth.
//!
//! Usage:
//!   lan-session host [--port N] [--capacity N] [--name NAME]
//!   lan-session join <address> [--port N] [--name NAME]

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lan_session::core::Vec3;
use lan_session::network::client::{ClientHandle, DisconnectCallback, SessionClient};
use lan_session::network::dispatch::{Dispatcher, GameplaySink};
use lan_session::network::host::{HostHandle, SessionHost};
use lan_session::network::protocol::{PeerId, StateSnapshot};
use lan_session::network::proxy::HeadlessFactory;
use lan_session::network::replicator::{SharedAvatar, StateReplicator};
use lan_session::network::session::{DisconnectReason, SendError, SessionConfig, SessionEvents};
use lan_session::VERSION;

/// Visual frame period for the demo loop.
const FRAME: Duration = Duration::from_millis(16);

enum Mode {
    Host,
    Join(String),
}

struct Args {
    mode: Mode,
    name: String,
    config: SessionConfig,
}

/// Either side of a session, as far as the CLI cares.
enum Session {
    Host(HostHandle),
    Client(ClientHandle),
}

impl Session {
    fn send_chat(&self, text: String) -> Result<(), SendError> {
        match self {
            Session::Host(host) => host.send_chat(text),
            Session::Client(client) => client.send_chat(text),
        }
    }

    fn is_running(&self) -> bool {
        match self {
            Session::Host(host) => host.is_running(),
            Session::Client(client) => client.is_running(),
        }
    }

    fn close(&self) {
        match self {
            Session::Host(host) => host.shutdown(),
            Session::Client(client) => client.disconnect(),
        }
    }
}

/// Prints what arrives.
struct ConsoleSink;

impl GameplaySink for ConsoleSink {
    fn on_joined(&mut self, local_id: PeerId) {
        info!("You are {}", local_id.short());
    }

    fn on_peer_joined(&mut self, peer: PeerId) {
        info!("{} joined", peer.short());
    }

    fn on_peer_left(&mut self, peer: PeerId) {
        info!("{} left", peer.short());
    }

    fn on_chat(&mut self, peer: PeerId, text: &str, _timestamp: i64) {
        println!("[{}] {}", peer.short(), text);
    }

    fn on_action(&mut self, peer: PeerId, data: &str, _timestamp: i64) {
        info!("{} did {}", peer.short(), data);
    }

    fn on_disconnected(&mut self, reason: &DisconnectReason) {
        info!("Disconnected: {}", reason);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let args = parse_args()?;
    info!("LAN Session v{}", VERSION);

    let avatar = SharedAvatar::new(StateSnapshot::new(Vec3::ZERO, Vec3::ZERO, 100));
    let tick = args.config.tick_interval();

    let (session, mut events, replicator) = match &args.mode {
        Mode::Host => {
            let (host, events) = SessionHost::start(args.config.clone()).await?;
            println!("Hosting on {} as {}", host.local_addr(), host.local_id().short());
            let replicator = StateReplicator::spawn(avatar.clone(), host.clone(), tick);
            (Session::Host(host), events, replicator)
        }
        Mode::Join(address) => {
            let on_disconnect: DisconnectCallback = Box::new(|reason| {
                warn!("Session ended: {}", reason);
            });
            let (client, events) =
                SessionClient::connect(address, args.config.port, args.config.clone(), Some(on_disconnect))
                    .await?;
            let replicator = StateReplicator::spawn(avatar.clone(), client.clone(), tick);
            (Session::Client(client), events, replicator)
        }
    };

    let mut dispatcher = Dispatcher::new(HeadlessFactory);
    run(&session, &mut events, &mut dispatcher, &avatar, &args.name).await;

    session.close();
    dispatcher.pump(&mut events, &mut ConsoleSink);
    let sent = replicator.join().await;
    info!("Published {} snapshots", sent);
    Ok(())
}

/// Frame loop: pump events, move the avatar, forward stdin as chat. Returns
/// on Ctrl+C or once the session ends.
async fn run(
    session: &Session,
    events: &mut SessionEvents,
    dispatcher: &mut Dispatcher<HeadlessFactory>,
    avatar: &SharedAvatar,
    name: &str,
) {
    let mut sink = ConsoleSink;
    let mut frame = tokio::time::interval(FRAME);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut angle = 0.0f32;

    loop {
        tokio::select! {
            _ = frame.tick() => {
                dispatcher.pump(events, &mut sink);
                dispatcher.advance(FRAME.as_secs_f32());

                angle = (angle + 30.0 * FRAME.as_secs_f32()) % 360.0;
                let rad = angle.to_radians();
                avatar.set_pose(Vec3::new(rad.cos() * 5.0, 0.0, rad.sin() * 5.0), Vec3::new(0.0, angle, 0.0));

                if !session.is_running() {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(text)) if !text.trim().is_empty() => {
                    if let Err(e) = session.send_chat(format!("{}: {}", name, text.trim())) {
                        warn!("Chat not sent: {}", e);
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }
}

/// Parse `host`/`join` mode and options on top of environment config.
/// Uses plain `std::env::args()` matching.
fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = SessionConfig::from_env();
    let mut name = String::from("player");

    let mode = match args.get(1).map(String::as_str) {
        Some("host") => Mode::Host,
        Some("join") => match args.get(2) {
            Some(address) if !address.starts_with("--") => Mode::Join(address.clone()),
            _ => bail!("join requires an address"),
        },
        Some("--help") | Some("-h") => {
            print_usage();
            std::process::exit(0);
        }
        _ => {
            print_usage();
            bail!("expected `host` or `join`");
        }
    };

    let mut i = if matches!(mode, Mode::Join(_)) { 3 } else { 2 };
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                config.port = args
                    .get(i)
                    .and_then(|s| s.parse().ok())
                    .context("--port requires a valid port number")?;
            }
            "--capacity" => {
                i += 1;
                config.capacity = args
                    .get(i)
                    .and_then(|s| s.parse().ok())
                    .context("--capacity requires a valid number")?;
            }
            "--name" => {
                i += 1;
                name = args.get(i).cloned().context("--name requires a value")?;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                print_usage();
                bail!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    Ok(Args { mode, name, config })
}

fn print_usage() {
    println!("Usage:");
    println!("  lan-session host [--port N] [--capacity N] [--name NAME]");
    println!("  lan-session join <address> [--port N] [--name NAME]");
    println!();
    println!("Options:");
    println!("  --port <PORT>      Session port (default: 7777)");
    println!("  --capacity <N>     Max remote peers when hosting (default: 6)");
    println!("  --name <NAME>      Name shown in chat (default: player)");
    println!("  --help, -h         Show this help");
    println!();
    println!("Environment: LAN_SESSION_* overrides, RUST_LOG for log level.");
}
