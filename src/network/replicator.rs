//! State Replication
//!
//! A fixed-rate timer task, independent of rendering, that samples the local
//! avatar and publishes a snapshot each tick. Liveness is checked on entry
//! to every tick; once the session leaves the running phases the task exits
//! and never publishes again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::Vec3;
use crate::network::client::ClientHandle;
use crate::network::host::HostHandle;
use crate::network::protocol::StateSnapshot;
use crate::network::session::{SendError, SessionPhase};

/// Read access to the local avatar.
pub trait AvatarSource: Send + Sync + 'static {
    /// Current avatar state.
    fn sample(&self) -> StateSnapshot;
}

/// Avatar state shared between the gameplay loop and the replicator.
#[derive(Debug, Clone, Default)]
pub struct SharedAvatar {
    state: Arc<Mutex<StateSnapshot>>,
}

impl SharedAvatar {
    /// Create with an initial state.
    pub fn new(initial: StateSnapshot) -> Self {
        Self {
            state: Arc::new(Mutex::new(initial)),
        }
    }

    /// Replace the whole state.
    pub fn set(&self, snapshot: StateSnapshot) {
        *self.lock() = snapshot;
    }

    /// Move the avatar.
    pub fn set_pose(&self, position: Vec3, orientation: Vec3) {
        let mut state = self.lock();
        state.position = position;
        state.orientation = orientation;
    }

    /// Update health.
    pub fn set_health(&self, health: i32) {
        self.lock().health = health;
    }

    /// Copy of the current state.
    pub fn get(&self) -> StateSnapshot {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateSnapshot> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AvatarSource for SharedAvatar {
    fn sample(&self) -> StateSnapshot {
        self.get()
    }
}

/// Where snapshots go: broadcast on a host, sent upstream on a client.
pub trait SnapshotOutlet: Send + Sync + 'static {
    /// Publish one snapshot.
    fn publish(&self, snapshot: StateSnapshot) -> Result<(), SendError>;

    /// Session phase to follow.
    fn phase_watch(&self) -> watch::Receiver<SessionPhase>;
}

impl SnapshotOutlet for HostHandle {
    fn publish(&self, snapshot: StateSnapshot) -> Result<(), SendError> {
        self.send_snapshot(snapshot)
    }

    fn phase_watch(&self) -> watch::Receiver<SessionPhase> {
        self.subscribe_phase()
    }
}

impl SnapshotOutlet for ClientHandle {
    fn publish(&self, snapshot: StateSnapshot) -> Result<(), SendError> {
        self.send_snapshot(snapshot)
    }

    fn phase_watch(&self) -> watch::Receiver<SessionPhase> {
        self.subscribe_phase()
    }
}

/// Handle to a running replication task.
#[derive(Debug)]
pub struct StateReplicator {
    task: JoinHandle<u64>,
}

impl StateReplicator {
    /// Start ticking every `period` until the outlet's session ends.
    pub fn spawn<S, O>(source: S, outlet: O, period: Duration) -> Self
    where
        S: AvatarSource,
        O: SnapshotOutlet,
    {
        let task = tokio::spawn(run(source, outlet, period));
        Self { task }
    }

    /// Wait for the task to exit on its own. Returns the number of
    /// snapshots published.
    pub async fn join(self) -> u64 {
        self.task.await.unwrap_or(0)
    }
}

async fn run<S, O>(source: S, outlet: O, period: Duration) -> u64
where
    S: AvatarSource,
    O: SnapshotOutlet,
{
    let mut phase = outlet.phase_watch();
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut published = 0u64;

    debug!("Replicator started ({:?} period)", period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = phase.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        if !phase.borrow_and_update().is_running() {
            break;
        }

        let snapshot = source.sample();
        if !snapshot.is_finite() {
            warn!("Skipping non-finite avatar state");
            continue;
        }

        match outlet.publish(snapshot) {
            Ok(()) => published += 1,
            Err(SendError::NotJoined) => {}
            Err(SendError::Disconnected) => break,
            Err(e) => debug!("Snapshot not sent: {}", e),
        }
    }

    info!("Replicator stopped after {} snapshot(s)", published);
    published
}
