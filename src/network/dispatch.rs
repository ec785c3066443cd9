//! Gameplay Dispatch
//!
//! Bridges the session event queue into the gameplay layer. Network tasks
//! only ever post events; the gameplay loop calls [`Dispatcher::pump`] once
//! per frame to apply them on its own thread and at its own cadence.

use tracing::{debug, info};

use crate::network::protocol::{PeerId, StateSnapshot};
use crate::network::proxy::{ProxyFactory, ProxySet};
use crate::network::session::{DisconnectReason, SessionEvent, SessionEvents};

/// Receives decoded gameplay traffic. Every method has a no-op default.
pub trait GameplaySink {
    /// Local id assigned; session active.
    fn on_joined(&mut self, _local_id: PeerId) {}

    /// Remote peer joined.
    fn on_peer_joined(&mut self, _peer: PeerId) {}

    /// Remote peer left.
    fn on_peer_left(&mut self, _peer: PeerId) {}

    /// Chat line from a peer.
    fn on_chat(&mut self, _peer: PeerId, _text: &str, _timestamp: i64) {}

    /// Action from a peer, verbatim.
    fn on_action(&mut self, _peer: PeerId, _data: &str, _timestamp: i64) {}

    /// Snapshot from a peer, after its proxy has been updated.
    fn on_snapshot(&mut self, _peer: PeerId, _snapshot: &StateSnapshot) {}

    /// Local session ended.
    fn on_disconnected(&mut self, _reason: &DisconnectReason) {}
}

/// Routes session events to proxies and a gameplay sink.
pub struct Dispatcher<F: ProxyFactory> {
    proxies: ProxySet<F>,
    local_id: Option<PeerId>,
}

impl<F: ProxyFactory> Dispatcher<F> {
    /// New dispatcher creating proxies through `factory`.
    pub fn new(factory: F) -> Self {
        Self {
            proxies: ProxySet::new(factory),
            local_id: None,
        }
    }

    /// Apply everything queued. Returns the number of events handled.
    pub fn pump<S: GameplaySink>(&mut self, events: &mut SessionEvents, sink: &mut S) -> usize {
        let batch = events.drain();
        let count = batch.len();
        for event in batch {
            self.dispatch(event, sink);
        }
        count
    }

    /// Apply a single event.
    pub fn dispatch<S: GameplaySink>(&mut self, event: SessionEvent, sink: &mut S) {
        match event {
            SessionEvent::Joined { local_id } => {
                self.local_id = Some(local_id);
                sink.on_joined(local_id);
            }
            SessionEvent::PeerJoined { peer } => sink.on_peer_joined(peer),
            SessionEvent::PeerLeft { peer } => {
                self.proxies.remove(peer);
                sink.on_peer_left(peer);
            }
            SessionEvent::Snapshot { peer, snapshot, timestamp } => {
                if Some(peer) == self.local_id {
                    debug!("Ignoring echoed snapshot");
                    return;
                }
                self.proxies.apply_snapshot(peer, &snapshot, timestamp);
                sink.on_snapshot(peer, &snapshot);
            }
            SessionEvent::Action { peer, data, timestamp } => sink.on_action(peer, &data, timestamp),
            SessionEvent::Chat { peer, text, timestamp } => sink.on_chat(peer, &text, timestamp),
            SessionEvent::Disconnected { reason } => {
                info!("Session over ({}), clearing {} proxies", reason, self.proxies.len());
                self.proxies.clear();
                self.local_id = None;
                sink.on_disconnected(&reason);
            }
        }
    }

    /// Advance proxy smoothing by `dt` seconds.
    pub fn advance(&mut self, dt: f32) {
        self.proxies.advance_all(dt);
    }

    /// Remote proxies.
    pub fn proxies(&self) -> &ProxySet<F> {
        &self.proxies
    }

    /// Local id, once joined.
    pub fn local_id(&self) -> Option<PeerId> {
        self.local_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Vec3;
    use crate::network::proxy::HeadlessFactory;
    use crate::network::session::event_channel;

    #[derive(Default)]
    struct Log {
        chats: Vec<(PeerId, String)>,
        actions: Vec<String>,
        left: Vec<PeerId>,
        disconnected: Option<DisconnectReason>,
    }

    impl GameplaySink for Log {
        fn on_chat(&mut self, peer: PeerId, text: &str, _timestamp: i64) {
            self.chats.push((peer, text.to_string()));
        }

        fn on_action(&mut self, _peer: PeerId, data: &str, _timestamp: i64) {
            self.actions.push(data.to_string());
        }

        fn on_peer_left(&mut self, peer: PeerId) {
            self.left.push(peer);
        }

        fn on_disconnected(&mut self, reason: &DisconnectReason) {
            self.disconnected = Some(reason.clone());
        }
    }

    fn snapshot_event(peer: PeerId, x: f32) -> SessionEvent {
        SessionEvent::Snapshot {
            peer,
            snapshot: StateSnapshot::new(Vec3::new(x, 0.0, 0.0), Vec3::ZERO, 100),
            timestamp: 0,
        }
    }

    #[test]
    fn test_pump_routes_everything() {
        let (tx, mut events) = event_channel();
        let mut dispatcher = Dispatcher::new(HeadlessFactory);
        let mut log = Log::default();
        let me = PeerId::generate();
        let other = PeerId::generate();

        tx.post(SessionEvent::Joined { local_id: me });
        tx.post(snapshot_event(other, 1.0));
        tx.post(snapshot_event(other, 2.0));
        tx.post(SessionEvent::Chat { peer: other, text: "hi".into(), timestamp: 1 });
        tx.post(SessionEvent::Action { peer: other, data: "{\"jump\":true}".into(), timestamp: 2 });

        assert_eq!(dispatcher.pump(&mut events, &mut log), 5);
        assert_eq!(dispatcher.local_id(), Some(me));
        assert_eq!(dispatcher.proxies().len(), 1);
        assert_eq!(log.chats, vec![(other, "hi".to_string())]);
        assert_eq!(log.actions, vec!["{\"jump\":true}".to_string()]);
    }

    #[test]
    fn test_peer_left_destroys_proxy() {
        let (tx, mut events) = event_channel();
        let mut dispatcher = Dispatcher::new(HeadlessFactory);
        let mut log = Log::default();
        let other = PeerId::generate();

        tx.post(snapshot_event(other, 1.0));
        tx.post(SessionEvent::PeerLeft { peer: other });
        dispatcher.pump(&mut events, &mut log);

        assert!(dispatcher.proxies().is_empty());
        assert_eq!(log.left, vec![other]);
    }

    #[test]
    fn test_own_snapshot_creates_no_proxy() {
        let mut dispatcher = Dispatcher::new(HeadlessFactory);
        let mut log = Log::default();
        let me = PeerId::generate();

        dispatcher.dispatch(SessionEvent::Joined { local_id: me }, &mut log);
        dispatcher.dispatch(snapshot_event(me, 1.0), &mut log);
        assert!(dispatcher.proxies().is_empty());
    }

    #[test]
    fn test_disconnect_clears_proxies() {
        let mut dispatcher = Dispatcher::new(HeadlessFactory);
        let mut log = Log::default();
        dispatcher.dispatch(snapshot_event(PeerId::generate(), 1.0), &mut log);
        dispatcher.dispatch(
            SessionEvent::Disconnected { reason: DisconnectReason::HostShutdown },
            &mut log,
        );

        assert!(dispatcher.proxies().is_empty());
        assert_eq!(log.disconnected, Some(DisconnectReason::HostShutdown));
    }
}
