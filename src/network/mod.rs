//! Network Layer
//!
//! Host-relayed session over TCP: framing, connections, the host and client
//! session drivers, periodic state replication, and the bridge that hands
//! inbound traffic to gameplay. Gameplay state is never touched from a
//! network task; everything crosses over as a [`SessionEvent`].

pub mod client;
pub mod connection;
pub mod dispatch;
pub mod framing;
pub mod host;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod replicator;
pub mod session;

pub use client::{ClientHandle, ConnectError, DisconnectCallback, SessionClient};
pub use connection::{Connection, ConnectionState, QueueError};
pub use dispatch::{Dispatcher, GameplaySink};
pub use framing::{read_frame, write_frame, FrameError, MAX_FRAME_SIZE};
pub use host::{BindError, HostHandle, SessionHost};
pub use protocol::{Message, MessageKind, Payload, PeerId, ProtocolError, StateSnapshot};
pub use proxy::{HeadlessFactory, ProxyFactory, ProxySet, RemotePeerProxy};
pub use registry::{ConnectionRegistry, RegistryError};
pub use replicator::{AvatarSource, SharedAvatar, SnapshotOutlet, StateReplicator};
pub use session::{
    DisconnectReason, SendError, SessionConfig, SessionEvent, SessionEvents, SessionPhase,
};
