//! Session Lifecycle
//!
//! Configuration, the session phase machine, disconnect classification, and
//! the inbound event queue shared by host and client.
//!
//! Network tasks never touch gameplay state. They post [`SessionEvent`]s to
//! an unbounded queue; the gameplay layer drains it at its own cadence.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::network::connection::{QueueError, SendFailure};
use crate::network::framing::FrameError;
use crate::network::protocol::{Message, MessageKind, Payload, PeerId, ProtocolError, StateSnapshot};
use crate::{DEFAULT_CAPACITY, DEFAULT_PORT, REPLICATION_RATE};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Configuration for a host or client session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interface the host binds to.
    pub bind_ip: IpAddr,
    /// Listen port (host) or default remote port (client).
    pub port: u16,
    /// Maximum simultaneously connected remote peers.
    pub capacity: usize,
    /// State replication rate (Hz).
    pub tick_rate_hz: u32,
    /// Time allowed for an outbound TCP connect.
    pub connect_timeout: Duration,
    /// Maximum silence on a connection before it is dropped.
    pub read_timeout: Duration,
    /// Time allowed for a single frame write.
    pub write_timeout: Duration,
    /// Outbound frames buffered per connection before snapshots are shed.
    pub outbound_queue_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            capacity: DEFAULT_CAPACITY,
            tick_rate_hz: REPLICATION_RATE,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            outbound_queue_len: 64,
        }
    }
}

impl SessionConfig {
    /// Create config from environment variables, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_ip: env_parse("LAN_SESSION_BIND").unwrap_or(defaults.bind_ip),
            port: env_parse("LAN_SESSION_PORT").unwrap_or(defaults.port),
            capacity: env_parse("LAN_SESSION_CAPACITY").unwrap_or(defaults.capacity),
            tick_rate_hz: env_parse("LAN_SESSION_TICK_RATE").unwrap_or(defaults.tick_rate_hz),
            connect_timeout: env_millis("LAN_SESSION_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout),
            read_timeout: env_millis("LAN_SESSION_READ_TIMEOUT_MS")
                .unwrap_or(defaults.read_timeout),
            write_timeout: env_millis("LAN_SESSION_WRITE_TIMEOUT_MS")
                .unwrap_or(defaults.write_timeout),
            outbound_queue_len: env_parse("LAN_SESSION_QUEUE_LEN")
                .unwrap_or(defaults.outbound_queue_len),
        }
    }

    /// Interval between replication ticks. A zero rate is treated as 1 Hz.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.tick_rate_hz.max(1)))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

// =============================================================================
// PHASE MACHINE
// =============================================================================

/// Session phase.
///
/// `Idle → Hosting | Connecting → Active → ShuttingDown → Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No session.
    Idle,
    /// Listener bound, accept loop starting.
    Hosting,
    /// Socket open, waiting for the host to assign our id.
    Connecting,
    /// Session running.
    Active,
    /// Teardown in progress.
    ShuttingDown,
}

impl SessionPhase {
    /// Whether `self → to` is a legal transition.
    pub fn can_transition_to(self, to: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, to),
            (Idle, Hosting)
                | (Idle, Connecting)
                | (Hosting, Active)
                | (Connecting, Active)
                | (Hosting, ShuttingDown)
                | (Connecting, ShuttingDown)
                | (Active, ShuttingDown)
                | (ShuttingDown, Idle)
        )
    }

    /// True while the session is starting or running.
    pub fn is_running(self) -> bool {
        matches!(self, SessionPhase::Hosting | SessionPhase::Connecting | SessionPhase::Active)
    }
}

/// Rejected phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct PhaseError {
    /// Phase at the time of the attempt.
    pub from: SessionPhase,
    /// Requested phase.
    pub to: SessionPhase,
}

/// Shared, observable session phase.
///
/// Transitions are validated and applied atomically, so exactly one caller
/// wins a race to `ShuttingDown`.
#[derive(Debug)]
pub struct SessionStatus {
    phase: watch::Sender<SessionPhase>,
}

impl SessionStatus {
    /// New status in `Idle`.
    pub fn new() -> Self {
        let (phase, _) = watch::channel(SessionPhase::Idle);
        Self { phase }
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// True while starting or running.
    pub fn is_running(&self) -> bool {
        self.phase().is_running()
    }

    /// Apply a transition if legal from the current phase.
    pub fn transition(&self, to: SessionPhase) -> Result<(), PhaseError> {
        let mut result = Ok(());
        self.phase.send_if_modified(|phase| {
            if phase.can_transition_to(to) {
                *phase = to;
                true
            } else {
                result = Err(PhaseError { from: *phase, to });
                false
            }
        });
        result
    }

    /// Watch phase changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// DISCONNECTS
// =============================================================================

/// Why a connection or session ended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisconnectReason {
    /// Remote closed the stream.
    #[error("connection closed by remote")]
    Closed,

    /// Socket read failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// Socket write failed or timed out.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Remote sent a malformed frame or message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Outbound queue overflowed with undroppable messages.
    #[error("peer stalled: outbound queue full")]
    Stalled,

    /// Nothing received within the read timeout.
    #[error("read timed out")]
    TimedOut,

    /// Remote announced a graceful leave.
    #[error("peer left")]
    Left,

    /// The host ended the session.
    #[error("host shut down")]
    HostShutdown,

    /// Local side asked to disconnect.
    #[error("disconnected locally")]
    LocalDisconnect,

    /// Removed by the host.
    #[error("evicted by host")]
    Evicted,
}

impl From<FrameError> for DisconnectReason {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Closed => DisconnectReason::Closed,
            FrameError::Protocol(e) => DisconnectReason::Protocol(e.to_string()),
            FrameError::Io(e) => DisconnectReason::ReadFailed(e.to_string()),
        }
    }
}

/// Failure to originate a message.
#[derive(Debug, Error)]
pub enum SendError {
    /// Client has not been assigned an id yet.
    #[error("not joined yet")]
    NotJoined,

    /// Session is no longer running.
    #[error("session disconnected")]
    Disconnected,

    /// Membership kinds are generated by the session layer itself.
    #[error("{0:?} messages cannot be sent directly")]
    ReservedKind(MessageKind),

    /// Message could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Outbound queue rejected the message.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<SendFailure> for SendError {
    fn from(err: SendFailure) -> Self {
        match err {
            SendFailure::Protocol(e) => SendError::Protocol(e),
            SendFailure::Queue(e) => SendError::Queue(e),
        }
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Something the gameplay layer should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Local peer id is known; the session is active.
    Joined {
        /// Our id.
        local_id: PeerId,
    },
    /// A remote peer joined.
    PeerJoined {
        /// Joining peer.
        peer: PeerId,
    },
    /// A remote peer left.
    PeerLeft {
        /// Departed peer.
        peer: PeerId,
    },
    /// Replicated state from a remote peer.
    Snapshot {
        /// Originating peer.
        peer: PeerId,
        /// Avatar state.
        snapshot: StateSnapshot,
        /// Sender's timestamp (ms).
        timestamp: i64,
    },
    /// Gameplay action from a remote peer.
    Action {
        /// Originating peer.
        peer: PeerId,
        /// Opaque action data.
        data: String,
        /// Sender's timestamp (ms).
        timestamp: i64,
    },
    /// Chat from a remote peer.
    Chat {
        /// Originating peer.
        peer: PeerId,
        /// Chat text.
        text: String,
        /// Sender's timestamp (ms).
        timestamp: i64,
    },
    /// The local session ended.
    Disconnected {
        /// Cause.
        reason: DisconnectReason,
    },
}

impl SessionEvent {
    /// Event for a received gameplay or membership message.
    ///
    /// Welcome messages (`PeerJoined` with an assigned id) are handshake
    /// traffic and produce no event here.
    pub fn from_message(msg: Message) -> Option<Self> {
        let peer = msg.sender_id;
        let timestamp = msg.timestamp;
        match msg.payload {
            Payload::PeerJoined { assigned: Some(_) } => None,
            Payload::PeerJoined { assigned: None } => Some(SessionEvent::PeerJoined { peer }),
            Payload::PeerLeft => Some(SessionEvent::PeerLeft { peer }),
            Payload::StateSnapshot(snapshot) => Some(SessionEvent::Snapshot { peer, snapshot, timestamp }),
            Payload::Action(data) => Some(SessionEvent::Action { peer, data, timestamp }),
            Payload::Chat(text) => Some(SessionEvent::Chat { peer, text, timestamp }),
        }
    }
}

/// Network-side handle for posting events.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSender {
    /// Post an event. Dropped silently if the gameplay side is gone.
    pub fn post(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}

/// Gameplay-side queue of inbound session events.
///
/// The queue is unbounded so network tasks never block on gameplay. It only
/// stays small if the owner drains it every frame (see
/// [`Dispatcher::pump`](crate::network::dispatch::Dispatcher::pump)); a
/// session whose events are never read accumulates every snapshot it
/// receives.
#[derive(Debug)]
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    /// Take everything currently queued without waiting.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait for the next event. `None` once every sender is gone and the
    /// queue is empty.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }
}

/// Create a connected sender/queue pair.
pub fn event_channel() -> (EventSender, SessionEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, SessionEvents { rx })
}
