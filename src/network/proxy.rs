//! Remote Peer Proxies
//!
//! Local stand-ins for remote avatars. Each proxy holds the target pose from
//! the latest snapshot and a displayed pose that eases toward it every
//! visual frame. This is cosmetic smoothing only; the session layer never
//! reads the displayed pose back.
//!
//! Invariant: every snapshot resolves to exactly one creation or exactly one
//! update of exactly one proxy.

use std::collections::BTreeMap;

use tracing::debug;

use crate::core::Vec3;
use crate::network::protocol::{PeerId, StateSnapshot};

/// Fraction of the remaining distance covered per second of `advance`.
pub const SMOOTHING: f32 = 10.0;

/// Creates, updates, and destroys the visual representation behind a
/// proxy. Implemented by the rendering side.
pub trait ProxyFactory {
    /// Engine-side handle for one remote avatar.
    type Handle;

    /// Spawn a representation at the first known state.
    fn create(&mut self, peer: PeerId, initial: &StateSnapshot) -> Self::Handle;

    /// Push the displayed pose to the representation.
    fn update(&mut self, handle: &mut Self::Handle, position: Vec3, orientation: Vec3, health: i32);

    /// Tear the representation down.
    fn destroy(&mut self, peer: PeerId, handle: Self::Handle);
}

/// One remote peer's smoothed state.
#[derive(Debug)]
pub struct RemotePeerProxy<H> {
    peer: PeerId,
    target_position: Vec3,
    target_orientation: Vec3,
    position: Vec3,
    orientation: Vec3,
    health: i32,
    last_timestamp: i64,
    handle: H,
}

impl<H> RemotePeerProxy<H> {
    fn new(peer: PeerId, snapshot: &StateSnapshot, timestamp: i64, handle: H) -> Self {
        Self {
            peer,
            target_position: snapshot.position,
            target_orientation: snapshot.orientation,
            position: snapshot.position,
            orientation: snapshot.orientation,
            health: snapshot.health,
            last_timestamp: timestamp,
            handle,
        }
    }

    /// Remote peer id.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Pose currently shown.
    pub fn displayed(&self) -> (Vec3, Vec3) {
        (self.position, self.orientation)
    }

    /// Pose from the latest snapshot.
    pub fn target(&self) -> (Vec3, Vec3) {
        (self.target_position, self.target_orientation)
    }

    /// Latest health.
    pub fn health(&self) -> i32 {
        self.health
    }

    /// Sender timestamp of the latest snapshot.
    pub fn last_timestamp(&self) -> i64 {
        self.last_timestamp
    }

    /// Engine handle.
    pub fn handle(&self) -> &H {
        &self.handle
    }

    fn retarget(&mut self, snapshot: &StateSnapshot, timestamp: i64) {
        self.target_position = snapshot.position;
        self.target_orientation = snapshot.orientation;
        self.health = snapshot.health;
        self.last_timestamp = timestamp;
    }

    /// Ease the displayed pose toward the target. Orientation takes the
    /// shortest way around.
    pub fn advance(&mut self, dt: f32) {
        let fraction = (SMOOTHING * dt.max(0.0)).min(1.0);
        self.position = self.position.lerp(self.target_position, fraction);
        self.orientation = Vec3::lerp_angles(self.orientation, self.target_orientation, fraction);
    }
}

/// What [`ProxySet::apply_snapshot`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyUpdate {
    /// First snapshot from this peer; a proxy was created.
    Created,
    /// Existing proxy retargeted.
    Updated,
}

/// All proxies known to the local session, keyed by peer id.
pub struct ProxySet<F: ProxyFactory> {
    factory: F,
    proxies: BTreeMap<PeerId, RemotePeerProxy<F::Handle>>,
}

impl<F: ProxyFactory> ProxySet<F> {
    /// Empty set using `factory` for representations.
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            proxies: BTreeMap::new(),
        }
    }

    /// Create or update the proxy for `peer`.
    pub fn apply_snapshot(&mut self, peer: PeerId, snapshot: &StateSnapshot, timestamp: i64) -> ProxyUpdate {
        if let Some(proxy) = self.proxies.get_mut(&peer) {
            proxy.retarget(snapshot, timestamp);
            return ProxyUpdate::Updated;
        }

        let handle = self.factory.create(peer, snapshot);
        self.proxies
            .insert(peer, RemotePeerProxy::new(peer, snapshot, timestamp, handle));
        debug!("Created proxy for {}", peer.short());
        ProxyUpdate::Created
    }

    /// Destroy the proxy for `peer`. Returns `false` if none existed.
    pub fn remove(&mut self, peer: PeerId) -> bool {
        match self.proxies.remove(&peer) {
            Some(proxy) => {
                self.factory.destroy(peer, proxy.handle);
                debug!("Destroyed proxy for {}", peer.short());
                true
            }
            None => false,
        }
    }

    /// Destroy every proxy.
    pub fn clear(&mut self) {
        for (peer, proxy) in std::mem::take(&mut self.proxies) {
            self.factory.destroy(peer, proxy.handle);
        }
    }

    /// Advance every proxy by `dt` seconds and push the result to the
    /// factory.
    pub fn advance_all(&mut self, dt: f32) {
        for proxy in self.proxies.values_mut() {
            proxy.advance(dt);
            self.factory
                .update(&mut proxy.handle, proxy.position, proxy.orientation, proxy.health);
        }
    }

    /// Proxy for `peer`.
    pub fn get(&self, peer: &PeerId) -> Option<&RemotePeerProxy<F::Handle>> {
        self.proxies.get(peer)
    }

    /// Number of proxies.
    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    /// True if there are no proxies.
    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Ids with a proxy, in id order.
    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.proxies.keys().copied()
    }

    /// The factory.
    pub fn factory(&self) -> &F {
        &self.factory
    }
}

/// Factory with no visual side; proxies carry no handle.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessFactory;

impl ProxyFactory for HeadlessFactory {
    type Handle = ();

    fn create(&mut self, _peer: PeerId, _initial: &StateSnapshot) {}

    fn update(&mut self, _handle: &mut (), _position: Vec3, _orientation: Vec3, _health: i32) {}

    fn destroy(&mut self, _peer: PeerId, _handle: ()) {}
}
