//! Session Client
//!
//! Connects to a host, waits for the welcome that assigns its peer id, and
//! from then on exchanges messages with the host only. Every message from
//! another peer arrives relayed through the host with its original sender id.
//!
//! The session ends exactly once, whichever of these happens first: the
//! host closes or fails, the host sends `PeerLeft` addressed to us, a write
//! fails, or the local side calls [`ClientHandle::disconnect`]. The optional
//! disconnect callback runs after all internal locks are released, so it may
//! call back into the handle.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::network::connection::{
    read_next, run_writer, Connection, ConnectionState, QueueError, ReadEnd, SendFailure,
};
use crate::network::protocol::{Message, MessageKind, Payload, PeerId, StateSnapshot};
use crate::network::session::{
    event_channel, DisconnectReason, EventSender, SendError, SessionConfig, SessionEvent,
    SessionEvents, SessionPhase, SessionStatus,
};

/// Invoked once when the session ends, with the cause.
pub type DisconnectCallback = Box<dyn FnOnce(DisconnectReason) + Send + 'static>;

/// Connection attempt failed. No session state was created.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Socket error (refused, unreachable, bad address).
    #[error("Failed to connect to {addr}: {source}")]
    Io {
        /// Target as given.
        addr: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// No answer within the connect timeout.
    #[error("Connection to {addr} timed out after {after:?}")]
    Timeout {
        /// Target as given.
        addr: String,
        /// Timeout applied.
        after: Duration,
    },
}

/// Entry point for joining a session.
pub struct SessionClient;

impl SessionClient {
    /// Open a connection to `host:port` and start the session tasks.
    ///
    /// Returns once the socket is open; the assigned id arrives later as a
    /// `Joined` event (see [`ClientHandle::wait_joined`]).
    #[instrument(skip(config, on_disconnect))]
    pub async fn connect(
        host: &str,
        port: u16,
        config: SessionConfig,
        on_disconnect: Option<DisconnectCallback>,
    ) -> Result<(ClientHandle, SessionEvents), ConnectError> {
        let target = format!("{}:{}", host, port);
        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ConnectError::Io { addr: target, source }),
            Err(_) => {
                return Err(ConnectError::Timeout {
                    addr: target,
                    after: config.connect_timeout,
                })
            }
        };
        let remote_addr = stream
            .peer_addr()
            .map_err(|source| ConnectError::Io { addr: target.clone(), source })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }

        let status = SessionStatus::new();
        let _ = status.transition(SessionPhase::Connecting);

        let (events_tx, events) = event_channel();
        let conn = Connection::new(remote_addr, ConnectionState::Connecting, config.outbound_queue_len);
        let shared = Arc::new(ClientShared {
            config,
            status,
            events: events_tx,
            conn,
            local_id: OnceLock::new(),
            host_id: OnceLock::new(),
            on_disconnect: Mutex::new(on_disconnect),
        });

        let (read_half, write_half) = stream.into_split();

        let writer_shared = shared.clone();
        tokio::spawn(async move {
            let conn = writer_shared.conn.clone();
            if let Err(reason) = run_writer(conn, write_half, writer_shared.config.write_timeout).await {
                writer_shared.end(reason);
            }
        });
        tokio::spawn(receive_loop(shared.clone(), read_half));

        info!("Connected to {}", remote_addr);
        Ok((ClientHandle { shared }, events))
    }
}

struct ClientShared {
    config: SessionConfig,
    status: SessionStatus,
    events: EventSender,
    conn: Arc<Connection>,
    local_id: OnceLock<PeerId>,
    host_id: OnceLock<PeerId>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
}

impl ClientShared {
    /// Handle one message from the host. Returns a reason if it ends the
    /// session.
    fn handle_inbound(&self, msg: Message) -> Option<DisconnectReason> {
        match msg.payload {
            Payload::PeerJoined { assigned: Some(id) } => {
                if self.local_id.get().is_some() {
                    warn!("Ignoring repeated welcome");
                    return None;
                }
                let _ = self.local_id.set(id);
                let _ = self.host_id.set(msg.sender_id);
                self.conn.mark_open();
                if let Err(e) = self.status.transition(SessionPhase::Active) {
                    debug!("Welcome after teardown: {}", e);
                    return None;
                }
                info!("Joined session as {}", id.short());
                self.events.post(SessionEvent::Joined { local_id: id });
                None
            }
            Payload::PeerLeft
                if Some(&msg.sender_id) == self.local_id.get()
                    || Some(&msg.sender_id) == self.host_id.get() =>
            {
                Some(DisconnectReason::HostShutdown)
            }
            _ => {
                if let Some(event) = SessionEvent::from_message(msg) {
                    self.events.post(event);
                }
                None
            }
        }
    }

    /// End the session. Only the first call has any effect.
    fn end(&self, reason: DisconnectReason) {
        if self.status.transition(SessionPhase::ShuttingDown).is_err() {
            return;
        }
        self.conn.close();
        info!("Session ended: {}", reason);

        self.events.post(SessionEvent::Disconnected { reason: reason.clone() });
        let callback = lock(&self.on_disconnect).take();
        let _ = self.status.transition(SessionPhase::Idle);

        if let Some(callback) = callback {
            callback(reason);
        }
    }
}

async fn receive_loop(shared: Arc<ClientShared>, read_half: OwnedReadHalf) {
    let mut reader = BufReader::new(read_half);
    let mut closed = shared.conn.closed_signal();
    let read_timeout = shared.config.read_timeout;

    loop {
        match read_next(&shared.conn, &mut reader, &mut closed, read_timeout).await {
            Ok(msg) => {
                if let Some(reason) = shared.handle_inbound(msg) {
                    shared.end(reason);
                    break;
                }
            }
            Err(ReadEnd::Cancelled) => break,
            Err(ReadEnd::Failed(reason)) => {
                shared.end(reason);
                break;
            }
        }
    }

    debug!("Client receive loop ended");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable control surface for a connected client.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<ClientShared>,
}

impl ClientHandle {
    /// Id assigned by the host, once the welcome has arrived.
    pub fn local_id(&self) -> Option<PeerId> {
        self.shared.local_id.get().copied()
    }

    /// The host's own peer id, once the welcome has arrived.
    pub fn host_id(&self) -> Option<PeerId> {
        self.shared.host_id.get().copied()
    }

    /// Host socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.conn.remote_addr()
    }

    /// Current session phase.
    pub fn phase(&self) -> SessionPhase {
        self.shared.status.phase()
    }

    /// True while connecting or joined.
    pub fn is_running(&self) -> bool {
        self.shared.status.is_running()
    }

    /// Watch phase changes.
    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.shared.status.subscribe()
    }

    /// Wait for the welcome. `None` if the session ends first.
    pub async fn wait_joined(&self) -> Option<PeerId> {
        let mut phase = self.subscribe_phase();
        loop {
            if let Some(id) = self.local_id() {
                return Some(id);
            }
            if !phase.borrow_and_update().is_running() {
                return None;
            }
            phase.changed().await.ok()?;
        }
    }

    /// Send a gameplay message to the host, stamped with our id.
    ///
    /// Membership kinds are reserved for the session layer.
    pub fn send(&self, payload: Payload) -> Result<(), SendError> {
        match payload.kind() {
            kind @ (MessageKind::PeerJoined | MessageKind::PeerLeft) => {
                return Err(SendError::ReservedKind(kind));
            }
            _ => {}
        }
        if !self.shared.status.is_running() {
            return Err(SendError::Disconnected);
        }
        let id = self.local_id().ok_or(SendError::NotJoined)?;

        match self.shared.conn.send_message(&Message::new(id, payload)) {
            Ok(_) => Ok(()),
            Err(SendFailure::Queue(QueueError::Closed)) => Err(SendError::Disconnected),
            Err(SendFailure::Queue(e @ QueueError::Overflow { .. })) => {
                self.shared.end(DisconnectReason::Stalled);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send a chat line.
    pub fn send_chat(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.send(Payload::Chat(text.into()))
    }

    /// Send an action.
    pub fn send_action(&self, data: impl Into<String>) -> Result<(), SendError> {
        self.send(Payload::Action(data.into()))
    }

    /// Send our avatar's state.
    pub fn send_snapshot(&self, snapshot: StateSnapshot) -> Result<(), SendError> {
        self.send(Payload::StateSnapshot(snapshot))
    }

    /// Leave the session: tell the host, flush, and close. Safe to call
    /// repeatedly and from inside the disconnect callback.
    pub fn disconnect(&self) {
        if self.shared.status.is_running() {
            if let Some(id) = self.local_id() {
                if let Err(e) = self.shared.conn.send_message(&Message::new(id, Payload::PeerLeft)) {
                    debug!("Could not queue farewell: {}", e);
                }
            }
        }
        self.shared.end(DisconnectReason::LocalDisconnect);
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("local_id", &self.local_id())
            .field("remote_addr", &self.remote_addr())
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use crate::network::host::{HostHandle, SessionHost};

    fn test_config() -> SessionConfig {
        SessionConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            capacity: 4,
            ..Default::default()
        }
    }

    async fn host() -> (HostHandle, SessionEvents) {
        SessionHost::start(test_config()).await.unwrap()
    }

    async fn join(host: &HostHandle, cb: Option<DisconnectCallback>) -> (ClientHandle, SessionEvents) {
        let port = host.local_addr().port();
        let (client, events) = SessionClient::connect("127.0.0.1", port, test_config(), cb)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), client.wait_joined())
            .await
            .unwrap()
            .unwrap();
        (client, events)
    }

    async fn wait_for<F>(events: &mut SessionEvents, mut pred: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = events.next().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_connect_refused_leaves_no_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = SessionClient::connect("127.0.0.1", port, test_config(), None).await;
        assert!(matches!(result, Err(ConnectError::Io { .. })));
    }

    #[tokio::test]
    async fn test_join_assigns_id() {
        let (host, _host_events) = host().await;
        let (client, mut events) = join(&host, None).await;

        let id = client.local_id().unwrap();
        assert_eq!(client.phase(), SessionPhase::Active);
        assert_eq!(client.host_id(), Some(host.local_id()));
        assert_eq!(host.peers(), vec![id]);
        assert_eq!(
            wait_for(&mut events, |_| true).await,
            SessionEvent::Joined { local_id: id }
        );
        host.shutdown();
    }

    #[tokio::test]
    async fn test_send_before_welcome_is_not_joined() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = tokio::spawn(async move { listener.accept().await.unwrap() });

        let (client, _events) = SessionClient::connect("127.0.0.1", port, test_config(), None)
            .await
            .unwrap();
        assert!(matches!(client.send_chat("early"), Err(SendError::NotJoined)));
        assert!(matches!(client.send(Payload::PeerLeft), Err(SendError::ReservedKind(_))));
        client.disconnect();
        drop(silent);
    }

    #[tokio::test]
    async fn test_host_chat_reaches_client() {
        let (host, _host_events) = host().await;
        let (_client, mut events) = join(&host, None).await;

        host.send_chat("welcome aboard").unwrap();
        let event = wait_for(&mut events, |e| matches!(e, SessionEvent::Chat { .. })).await;
        match event {
            SessionEvent::Chat { peer, text, .. } => {
                assert_eq!(peer, host.local_id());
                assert_eq!(text, "welcome aboard");
            }
            _ => unreachable!(),
        }
        host.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_is_graceful_and_once() {
        let (host, mut host_events) = host().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cb: DisconnectCallback = Box::new(move |reason| {
            assert_eq!(reason, DisconnectReason::LocalDisconnect);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (client, mut events) = join(&host, Some(cb)).await;
        let id = client.local_id().unwrap();

        client.disconnect();
        client.disconnect();
        assert_eq!(client.phase(), SessionPhase::Idle);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        wait_for(&mut host_events, |e| *e == SessionEvent::PeerLeft { peer: id }).await;
        assert_eq!(host.peer_count(), 0);

        let ended = wait_for(&mut events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
        assert_eq!(ended, SessionEvent::Disconnected { reason: DisconnectReason::LocalDisconnect });
        assert!(matches!(client.send_chat("gone"), Err(SendError::Disconnected)));
        host.shutdown();
    }

    #[tokio::test]
    async fn test_host_shutdown_ends_client() {
        let (host, _host_events) = host().await;
        let (reason_tx, reason_rx) = tokio::sync::oneshot::channel();
        let cb: DisconnectCallback = Box::new(move |reason| {
            let _ = reason_tx.send(reason);
        });
        let (client, _events) = join(&host, Some(cb)).await;

        host.shutdown();
        let reason = tokio::time::timeout(Duration::from_secs(2), reason_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, DisconnectReason::HostShutdown);
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_callback_may_reenter_disconnect() {
        let (host, _host_events) = host().await;
        let slot: Arc<Mutex<Option<ClientHandle>>> = Arc::new(Mutex::new(None));
        let inner = slot.clone();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let cb: DisconnectCallback = Box::new(move |_| {
            if let Some(client) = inner.lock().unwrap().take() {
                client.disconnect();
            }
            let _ = done_tx.send(());
        });
        let (client, _events) = join(&host, Some(cb)).await;
        *slot.lock().unwrap() = Some(client.clone());

        host.shutdown();
        tokio::time::timeout(Duration::from_secs(2), done_rx).await.unwrap().unwrap();
        assert_eq!(client.phase(), SessionPhase::Idle);
    }
}
