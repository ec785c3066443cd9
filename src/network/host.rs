//! Session Host
//!
//! The host owns the listening socket, assigns peer ids, keeps the
//! connection registry, and relays every gameplay message to everyone except
//! its sender. It is also a participant: it has its own id, originates its
//! own snapshots and chat, and receives the same events a client does.
//!
//! Each accepted peer gets two tasks: a reader that decodes frames and feeds
//! them to [`HostShared::handle_inbound`], and a writer that drains the
//! peer's outbound queue. Whichever side notices a failure first calls
//! [`HostShared::disconnect_peer`]; the registry hands the connection back
//! to exactly one caller, so cleanup and the `PeerLeft` broadcast happen once.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::network::connection::{
    frame_message, read_next, run_writer, Connection, ConnectionState, PushOutcome, QueueError,
    ReadEnd,
};
use crate::network::protocol::{Message, MessageKind, Payload, PeerId, StateSnapshot};
use crate::network::registry::ConnectionRegistry;
use crate::network::session::{
    event_channel, DisconnectReason, EventSender, SendError, SessionConfig, SessionEvent,
    SessionEvents, SessionPhase, SessionStatus,
};

/// Back-off after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The listening socket could not be opened.
#[derive(Debug, Error)]
#[error("Failed to bind {addr}: {source}")]
pub struct BindError {
    /// Requested address.
    pub addr: SocketAddr,
    /// Underlying socket error.
    #[source]
    pub source: io::Error,
}

/// Entry point for hosting a session.
pub struct SessionHost;

impl SessionHost {
    /// Bind the listener and start accepting peers.
    ///
    /// On success the session is `Active`, a `Joined` event carrying the
    /// host's own id is already queued, and the accept loop is running. A
    /// bind failure leaves nothing behind.
    #[instrument(skip(config), fields(port = config.port))]
    pub async fn start(config: SessionConfig) -> Result<(HostHandle, SessionEvents), BindError> {
        let addr = SocketAddr::new(config.bind_ip, config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BindError { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BindError { addr, source })?;

        let status = SessionStatus::new();
        let _ = status.transition(SessionPhase::Hosting);

        let (events_tx, events) = event_channel();
        let shared = Arc::new(HostShared {
            local_id: PeerId::generate(),
            registry: ConnectionRegistry::new(config.capacity),
            config,
            status,
            events: events_tx,
            local_addr,
            membership: RwLock::new(()),
            accept_task: Mutex::new(None),
        });

        let task = tokio::spawn(accept_loop(shared.clone(), listener));
        *lock(&shared.accept_task) = Some(task);

        let _ = shared.status.transition(SessionPhase::Active);
        shared.events.post(SessionEvent::Joined { local_id: shared.local_id });

        info!(
            "Hosting session {} on {} (capacity {})",
            shared.local_id.short(),
            local_addr,
            shared.config.capacity
        );

        Ok((HostHandle { shared }, events))
    }
}

/// State shared by the accept loop, per-peer tasks, and handles.
struct HostShared {
    local_id: PeerId,
    config: SessionConfig,
    registry: ConnectionRegistry,
    status: SessionStatus,
    events: EventSender,
    local_addr: SocketAddr,
    /// Shared while relaying on behalf of a registered peer, exclusive while
    /// removing one, so nothing a peer sent is queued after its `PeerLeft`.
    membership: RwLock<()>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

#[instrument(skip_all, fields(host = %shared.local_id.short()))]
async fn accept_loop(shared: Arc<HostShared>, listener: TcpListener) {
    let mut phase = shared.status.subscribe();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => shared.admit(stream, addr),
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
            changed = phase.changed() => {
                if changed.is_err() || !shared.status.is_running() {
                    break;
                }
            }
        }
    }

    info!("Accept loop stopped");
}

impl HostShared {
    /// Register a freshly accepted socket and start its tasks.
    fn admit(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if !self.status.is_running() {
            debug!("Session closing, dropping {}", addr);
            return;
        }
        if self.registry.len() >= self.config.capacity {
            warn!("Capacity reached ({}), rejecting {}", self.config.capacity, addr);
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }

        let conn = Connection::new(addr, ConnectionState::Accepted, self.config.outbound_queue_len);
        let peer_id = loop {
            let candidate = PeerId::generate();
            if candidate != self.local_id && !self.registry.contains(&candidate) {
                break candidate;
            }
        };

        // Queued before registration so no relay can get ahead of it.
        let welcome = Message::new(self.local_id, Payload::PeerJoined { assigned: Some(peer_id) });
        if let Err(e) = conn.send_message(&welcome) {
            error!("Failed to queue welcome for {}: {}", addr, e);
            return;
        }

        let failed = {
            let _gate = read_gate(&self.membership);
            if let Err(e) = self.registry.add(peer_id, conn.clone()) {
                warn!("Rejecting {}: {}", addr, e);
                return;
            }
            if !self.status.is_running() {
                // Shutdown drained the registry between the checks.
                self.registry.remove(&peer_id);
                conn.close();
                debug!("Session closing, dropping {}", addr);
                return;
            }
            conn.mark_open();

            info!(
                "Peer {} joined from {} ({}/{})",
                peer_id.short(),
                addr,
                self.registry.len(),
                self.config.capacity
            );

            let notice = Message::new(peer_id, Payload::PeerJoined { assigned: None });
            let failed = self.relay(&notice, Some(peer_id));
            self.events.post(SessionEvent::PeerJoined { peer: peer_id });
            failed
        };

        let (read_half, write_half) = stream.into_split();

        let writer_shared = self.clone();
        let writer_conn = conn.clone();
        let write_timeout = self.config.write_timeout;
        tokio::spawn(async move {
            if let Err(reason) = run_writer(writer_conn, write_half, write_timeout).await {
                writer_shared.disconnect_peer(peer_id, reason);
            }
        });

        tokio::spawn(receive_loop(self.clone(), peer_id, conn, read_half));

        self.disconnect_all(failed);
    }

    /// Route one message received from `peer_id`.
    ///
    /// Dropped if the peer has already been removed; its `PeerLeft` is
    /// then the last thing anyone hears from it.
    fn handle_inbound(&self, peer_id: PeerId, mut msg: Message) {
        if msg.sender_id != peer_id {
            warn!(
                "Peer {} sent a message as {}, re-stamping",
                peer_id.short(),
                msg.sender_id.short()
            );
            msg.sender_id = peer_id;
        }

        #[cfg(feature = "debug-tracing")]
        tracing::trace!("Inbound {:?} from {}", msg.kind(), peer_id.short());

        match msg.payload {
            Payload::PeerJoined { .. } => {
                debug!("Ignoring PeerJoined from peer {}", peer_id.short());
            }
            Payload::PeerLeft => self.disconnect_peer(peer_id, DisconnectReason::Left),
            Payload::StateSnapshot(_) | Payload::Action(_) | Payload::Chat(_) => {
                let failed = {
                    let _gate = read_gate(&self.membership);
                    if !self.registry.contains(&peer_id) {
                        debug!("Dropping {:?} from departed peer {}", msg.kind(), peer_id.short());
                        return;
                    }
                    let failed = self.relay(&msg, Some(peer_id));
                    if let Some(event) = SessionEvent::from_message(msg) {
                        self.events.post(event);
                    }
                    failed
                };
                self.disconnect_all(failed);
            }
        }
    }

    /// Queue `msg` for every registered peer except `exclude`. Returns the
    /// peers whose queues rejected it.
    fn relay(&self, msg: &Message, exclude: Option<PeerId>) -> Vec<(PeerId, DisconnectReason)> {
        match frame_message(msg) {
            Ok(frame) => self.fan_out(&frame, msg.payload.is_droppable(), exclude),
            Err(e) => {
                error!("Failed to encode {:?} for broadcast: {}", msg.kind(), e);
                Vec::new()
            }
        }
    }

    fn disconnect_all(&self, failed: Vec<(PeerId, DisconnectReason)>) {
        for (peer, reason) in failed {
            self.disconnect_peer(peer, reason);
        }
    }

    /// Queue one pre-encoded frame for each recipient. Returns the peers
    /// that could not take it.
    fn fan_out(
        &self,
        frame: &Arc<[u8]>,
        droppable: bool,
        exclude: Option<PeerId>,
    ) -> Vec<(PeerId, DisconnectReason)> {
        let mut failed = Vec::new();
        for (peer, conn) in self.registry.snapshot() {
            if Some(peer) == exclude {
                continue;
            }
            match conn.enqueue(frame.clone(), droppable) {
                Ok(PushOutcome::Queued) => {}
                Ok(PushOutcome::ShedOldest) | Ok(PushOutcome::ShedIncoming) => {
                    debug!("Shedding snapshot for slow peer {}", peer.short());
                }
                Err(QueueError::Overflow { .. }) => {
                    warn!("Peer {} stalled, outbound queue full", peer.short());
                    failed.push((peer, DisconnectReason::Stalled));
                }
                Err(QueueError::Closed) => {
                    failed.push((peer, DisconnectReason::WriteFailed("connection closed".into())));
                }
            }
        }
        failed
    }

    /// Remove a peer, close its connection, and tell everyone else.
    ///
    /// Safe to call any number of times from any task: only the caller that
    /// wins the registry removal does anything. Peers that fail while
    /// receiving the `PeerLeft` notice are handled in the same pass.
    fn disconnect_peer(&self, peer_id: PeerId, reason: DisconnectReason) {
        let mut pending = vec![(peer_id, reason)];

        while let Some((peer, reason)) = pending.pop() {
            let removed = {
                let _gate = write_gate(&self.membership);
                self.registry.remove(&peer)
            };
            let Some(conn) = removed else {
                continue;
            };
            conn.close();
            info!(
                "Peer {} left: {} ({} snapshots shed)",
                peer.short(),
                reason,
                conn.shed_count()
            );
            self.events.post(SessionEvent::PeerLeft { peer });

            if !self.status.is_running() {
                continue;
            }
            match frame_message(&Message::new(peer, Payload::PeerLeft)) {
                Ok(frame) => pending.extend(self.fan_out(&frame, false, None)),
                Err(e) => error!("Failed to encode PeerLeft for {}: {}", peer.short(), e),
            }
        }
    }

    fn originate(&self, payload: Payload) -> Result<(), SendError> {
        match payload.kind() {
            kind @ (MessageKind::PeerJoined | MessageKind::PeerLeft) => {
                return Err(SendError::ReservedKind(kind));
            }
            _ => {}
        }
        if !self.status.is_running() {
            return Err(SendError::Disconnected);
        }
        let droppable = payload.is_droppable();
        let frame = frame_message(&Message::new(self.local_id, payload))?;
        self.disconnect_all(self.fan_out(&frame, droppable, None));
        Ok(())
    }

    /// Idempotent teardown. Returns `false` if already shutting down.
    fn shutdown(&self) -> bool {
        if self.status.transition(SessionPhase::ShuttingDown).is_err() {
            return false;
        }

        let peers = {
            let _gate = write_gate(&self.membership);
            self.registry.drain()
        };
        info!("Shutting down session, disconnecting {} peer(s)", peers.len());

        for (peer, conn) in peers {
            let farewell = Message::new(peer, Payload::PeerLeft);
            if let Err(e) = conn.send_message(&farewell) {
                debug!("No farewell for {}: {}", peer.short(), e);
            }
            conn.close();
        }

        self.events.post(SessionEvent::Disconnected {
            reason: DisconnectReason::LocalDisconnect,
        });
        let _ = self.status.transition(SessionPhase::Idle);
        true
    }
}

#[instrument(skip_all, fields(peer = %peer_id.short()))]
async fn receive_loop(
    shared: Arc<HostShared>,
    peer_id: PeerId,
    conn: Arc<Connection>,
    read_half: OwnedReadHalf,
) {
    let mut reader = BufReader::new(read_half);
    let mut closed = conn.closed_signal();
    let read_timeout = shared.config.read_timeout;

    loop {
        match read_next(&conn, &mut reader, &mut closed, read_timeout).await {
            Ok(msg) => shared.handle_inbound(peer_id, msg),
            Err(ReadEnd::Cancelled) => break,
            Err(ReadEnd::Failed(reason)) => {
                shared.disconnect_peer(peer_id, reason);
                break;
            }
        }
    }

    debug!("Receive loop for {} ended", conn.remote_addr());
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_gate(gate: &RwLock<()>) -> RwLockReadGuard<'_, ()> {
    gate.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_gate(gate: &RwLock<()>) -> RwLockWriteGuard<'_, ()> {
    gate.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable control surface for a running host.
#[derive(Clone)]
pub struct HostHandle {
    shared: Arc<HostShared>,
}

impl HostHandle {
    /// The host's own peer id.
    pub fn local_id(&self) -> PeerId {
        self.shared.local_id
    }

    /// Address the listener is bound to (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Connected remote peers.
    pub fn peer_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Ids of connected remote peers, in id order.
    pub fn peers(&self) -> Vec<PeerId> {
        self.shared.registry.snapshot().into_iter().map(|(id, _)| id).collect()
    }

    /// Current session phase.
    pub fn phase(&self) -> SessionPhase {
        self.shared.status.phase()
    }

    /// True while the session is running.
    pub fn is_running(&self) -> bool {
        self.shared.status.is_running()
    }

    /// Watch phase changes.
    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.shared.status.subscribe()
    }

    /// Send a host-originated gameplay message to every peer.
    ///
    /// Membership kinds are reserved for the session layer.
    pub fn broadcast(&self, payload: Payload) -> Result<(), SendError> {
        self.shared.originate(payload)
    }

    /// Broadcast a chat line.
    pub fn send_chat(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.broadcast(Payload::Chat(text.into()))
    }

    /// Broadcast an action.
    pub fn send_action(&self, data: impl Into<String>) -> Result<(), SendError> {
        self.broadcast(Payload::Action(data.into()))
    }

    /// Broadcast the host avatar's state.
    pub fn send_snapshot(&self, snapshot: StateSnapshot) -> Result<(), SendError> {
        self.broadcast(Payload::StateSnapshot(snapshot))
    }

    /// Remove a peer. Returns `false` if it was not connected.
    pub fn kick(&self, peer: PeerId) -> bool {
        if !self.shared.registry.contains(&peer) {
            return false;
        }
        self.shared.disconnect_peer(peer, DisconnectReason::Evicted);
        true
    }

    /// Stop accepting, tell every peer the session is over, and release
    /// all connections. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// Wait until the accept loop has exited and the listening port is
    /// released.
    pub async fn closed(&self) {
        let task = lock(&self.shared.accept_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHandle")
            .field("local_id", &self.shared.local_id)
            .field("local_addr", &self.shared.local_addr)
            .field("phase", &self.shared.status.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use crate::network::framing::{read_frame, write_frame, FrameError};
    use tokio::net::{TcpListener, TcpStream};

    fn test_config(capacity: usize) -> SessionConfig {
        SessionConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            capacity,
            ..Default::default()
        }
    }

    async fn read_msg(stream: &mut TcpStream) -> Message {
        let body = tokio::time::timeout(Duration::from_secs(2), read_frame(stream))
            .await
            .unwrap()
            .unwrap();
        Message::decode(&body).unwrap()
    }

    async fn join_raw(addr: SocketAddr) -> (TcpStream, PeerId) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let welcome = read_msg(&mut stream).await;
        match welcome.payload {
            Payload::PeerJoined { assigned: Some(id) } => (stream, id),
            other => panic!("expected welcome, got {:?}", other),
        }
    }

    async fn assert_silent(stream: &mut TcpStream) {
        let next = tokio::time::timeout(Duration::from_millis(150), read_frame(stream)).await;
        assert!(next.is_err(), "unexpected frame: {:?}", next);
    }

    fn peer_left_count(events: &[SessionEvent], peer: PeerId) -> usize {
        events
            .iter()
            .filter(|e| **e == SessionEvent::PeerLeft { peer })
            .count()
    }

    async fn next_event(events: &mut SessionEvents) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_reports_joined() {
        let (host, mut events) = SessionHost::start(test_config(2)).await.unwrap();
        assert_eq!(host.phase(), SessionPhase::Active);
        assert_ne!(host.local_addr().port(), 0);
        assert_eq!(next_event(&mut events).await, SessionEvent::Joined { local_id: host.local_id() });
        host.shutdown();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let (host, _events) = SessionHost::start(test_config(2)).await.unwrap();
        let config = SessionConfig { port: host.local_addr().port(), ..test_config(2) };
        let err = SessionHost::start(config).await.unwrap_err();
        assert_eq!(err.addr.port(), host.local_addr().port());
        host.shutdown();
    }

    #[tokio::test]
    async fn test_welcome_assigns_fresh_id() {
        let (host, mut events) = SessionHost::start(test_config(2)).await.unwrap();
        let (_stream, id) = join_raw(host.local_addr()).await;

        assert_ne!(id, host.local_id());
        let _ = next_event(&mut events).await;
        assert_eq!(next_event(&mut events).await, SessionEvent::PeerJoined { peer: id });
        assert_eq!(host.peers(), vec![id]);
        host.shutdown();
    }

    #[tokio::test]
    async fn test_spoofed_sender_is_restamped() {
        let (host, _events) = SessionHost::start(test_config(2)).await.unwrap();
        let (mut a, a_id) = join_raw(host.local_addr()).await;
        let (mut b, _b_id) = join_raw(host.local_addr()).await;

        // a hears about b
        let notice = read_msg(&mut a).await;
        assert!(matches!(notice.payload, Payload::PeerJoined { assigned: None }));

        let forged = Message::new(PeerId::generate(), Payload::Chat("not me".into()));
        write_frame(&mut a, &forged.encode().unwrap()).await.unwrap();

        let relayed = read_msg(&mut b).await;
        assert_eq!(relayed.sender_id, a_id);
        assert_eq!(relayed.payload, Payload::Chat("not me".into()));
        host.shutdown();
    }

    #[tokio::test]
    async fn test_host_rejects_reserved_kinds() {
        let (host, _events) = SessionHost::start(test_config(2)).await.unwrap();
        assert!(matches!(
            host.broadcast(Payload::PeerLeft),
            Err(SendError::ReservedKind(MessageKind::PeerLeft))
        ));
        host.shutdown();
        assert!(matches!(host.send_chat("late"), Err(SendError::Disconnected)));
    }

    #[tokio::test]
    async fn test_kick_notifies_others() {
        let (host, _events) = SessionHost::start(test_config(3)).await.unwrap();
        let (mut a, _a_id) = join_raw(host.local_addr()).await;
        let (_b, b_id) = join_raw(host.local_addr()).await;
        let _ = read_msg(&mut a).await;

        assert!(host.kick(b_id));
        assert!(!host.kick(b_id));

        let left = read_msg(&mut a).await;
        assert_eq!(left.sender_id, b_id);
        assert_eq!(left.payload, Payload::PeerLeft);
        assert_eq!(host.peer_count(), 1);
        host.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_sends_farewell_and_releases_port() {
        let (host, mut events) = SessionHost::start(test_config(2)).await.unwrap();
        let (mut a, a_id) = join_raw(host.local_addr()).await;

        host.shutdown();
        host.shutdown();

        let farewell = read_msg(&mut a).await;
        assert_eq!(farewell.sender_id, a_id);
        assert_eq!(farewell.payload, Payload::PeerLeft);
        drop(a);

        host.closed().await;
        assert_eq!(host.phase(), SessionPhase::Idle);
        assert_eq!(host.peer_count(), 0);

        let seen: Vec<_> = events.drain();
        assert_eq!(
            seen.iter()
                .filter(|e| matches!(e, SessionEvent::Disconnected { .. }))
                .count(),
            1
        );

        let rebind = SessionConfig { port: host.local_addr().port(), ..test_config(2) };
        let (again, _) = SessionHost::start(rebind).await.unwrap();
        again.shutdown();
    }

    #[tokio::test]
    async fn test_message_from_departed_peer_is_dropped() {
        let (host, mut events) = SessionHost::start(test_config(3)).await.unwrap();
        let (mut a, a_id) = join_raw(host.local_addr()).await;
        let (mut b, _b_id) = join_raw(host.local_addr()).await;
        let _ = read_msg(&mut a).await;

        // Writer failure wins the race against a frame the reader already decoded.
        host.shared
            .disconnect_peer(a_id, DisconnectReason::WriteFailed("broken pipe".into()));
        let late = Message::new(a_id, Payload::StateSnapshot(StateSnapshot::default()));
        host.shared.handle_inbound(a_id, late);

        let left = read_msg(&mut b).await;
        assert_eq!(left.sender_id, a_id);
        assert_eq!(left.payload, Payload::PeerLeft);
        assert_silent(&mut b).await;

        let seen = events.drain();
        assert!(!seen.iter().any(|e| matches!(e, SessionEvent::Snapshot { .. })));
        assert_eq!(peer_left_count(&seen, a_id), 1);
        host.shutdown();
    }

    #[tokio::test]
    async fn test_admit_after_shutdown_drops_stream() {
        let (host, _events) = SessionHost::start(test_config(2)).await.unwrap();
        host.shutdown();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, addr) = listener.accept().await.unwrap();
        host.shared.admit(stream, addr);

        assert_eq!(host.peer_count(), 0);
        let end = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut client))
            .await
            .unwrap();
        assert!(matches!(end, Err(FrameError::Closed)), "got {:?}", end);
    }

    #[tokio::test]
    async fn test_stalled_peer_is_evicted_once() {
        let config = SessionConfig { outbound_queue_len: 4, ..test_config(3) };
        let (host, mut events) = SessionHost::start(config).await.unwrap();
        let (_stalled, stalled_id) = join_raw(host.local_addr()).await;
        let (mut b, b_id) = join_raw(host.local_addr()).await;

        let reader = tokio::spawn(async move {
            let mut left = Vec::new();
            while let Ok(Ok(body)) =
                tokio::time::timeout(Duration::from_millis(500), read_frame(&mut b)).await
            {
                let msg = Message::decode(&body).unwrap();
                if msg.payload == Payload::PeerLeft {
                    left.push(msg.sender_id);
                }
            }
            left
        });

        // The stalled peer never reads, so its socket buffers fill and its
        // queue overflows with chat that cannot be shed.
        let bulk = "x".repeat(256 * 1024);
        for _ in 0..400 {
            if host.peer_count() < 2 {
                break;
            }
            host.send_chat(bulk.clone()).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(host.peers(), vec![b_id]);
        assert_eq!(reader.await.unwrap(), vec![stalled_id]);

        let seen = events.drain();
        assert_eq!(peer_left_count(&seen, stalled_id), 1);
        assert_eq!(
            seen.iter()
                .filter(|e| matches!(e, SessionEvent::PeerLeft { .. }))
                .count(),
            1
        );
        host.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_and_write_failures_clean_up_once() {
        let (host, mut events) = SessionHost::start(test_config(3)).await.unwrap();
        let (mut a, a_id) = join_raw(host.local_addr()).await;
        let (_b, b_id) = join_raw(host.local_addr()).await;
        let _ = read_msg(&mut a).await;

        let read_side = {
            let shared = host.shared.clone();
            tokio::spawn(async move {
                shared.disconnect_peer(b_id, DisconnectReason::ReadFailed("reset".into()));
            })
        };
        let write_side = {
            let shared = host.shared.clone();
            tokio::spawn(async move {
                shared.disconnect_peer(b_id, DisconnectReason::WriteFailed("reset".into()));
            })
        };
        read_side.await.unwrap();
        write_side.await.unwrap();

        let left = read_msg(&mut a).await;
        assert_eq!(left.sender_id, b_id);
        assert_eq!(left.payload, Payload::PeerLeft);
        assert_silent(&mut a).await;

        assert_eq!(host.peers(), vec![a_id]);
        assert_eq!(peer_left_count(&events.drain(), b_id), 1);
        host.shutdown();
    }
}
