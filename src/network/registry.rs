//! Connection Registry
//!
//! Host-side map of live peers. Every operation takes the lock for an
//! in-memory update only and never holds it across an `.await` or a socket
//! write. Broadcast works from a cloned snapshot, so a peer leaving
//! mid-broadcast cannot disturb the iteration.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

use crate::network::connection::Connection;
use crate::network::protocol::PeerId;

/// Registry rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Id already registered.
    #[error("peer {0} already registered")]
    DuplicatePeer(PeerId),

    /// Registry at capacity.
    #[error("capacity exceeded ({0} peers)")]
    CapacityExceeded(usize),
}

/// Thread-safe map of peer id to connection, bounded by capacity.
#[derive(Debug)]
pub struct ConnectionRegistry {
    capacity: usize,
    peers: RwLock<BTreeMap<PeerId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            peers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Maximum peers.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a connection. Fails without side effects if the id is taken
    /// or the registry is full.
    pub fn add(&self, id: PeerId, conn: Arc<Connection>) -> Result<(), RegistryError> {
        let mut peers = self.write();
        if peers.contains_key(&id) {
            return Err(RegistryError::DuplicatePeer(id));
        }
        if peers.len() >= self.capacity {
            return Err(RegistryError::CapacityExceeded(self.capacity));
        }
        peers.insert(id, conn);
        Ok(())
    }

    /// Unregister a peer. Returns the connection only to the caller that
    /// actually removed it; removing an absent id is a no-op.
    pub fn remove(&self, id: &PeerId) -> Option<Arc<Connection>> {
        self.write().remove(id)
    }

    /// Look up a peer.
    pub fn get(&self, id: &PeerId) -> Option<Arc<Connection>> {
        self.read().get(id).cloned()
    }

    /// True if `id` is registered.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.read().contains_key(id)
    }

    /// Registered peer count.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// True if no peers are registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Consistent, id-ordered copy of the registry for broadcast.
    pub fn snapshot(&self) -> Vec<(PeerId, Arc<Connection>)> {
        self.read().iter().map(|(id, conn)| (*id, conn.clone())).collect()
    }

    /// Remove and return everything.
    pub fn drain(&self) -> Vec<(PeerId, Arc<Connection>)> {
        std::mem::take(&mut *self.write()).into_iter().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<PeerId, Arc<Connection>>> {
        self.peers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<PeerId, Arc<Connection>>> {
        self.peers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
