//! # LAN Session
//!
//! Host-relayed multiplayer session layer for small LAN games.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        LAN SESSION                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/              - Engine-agnostic primitives             │
//! │  ├── vec3.rs        - f32 vector, lerp, shortest-arc angles  │
//! │  └── time.rs        - Wall-clock timestamps                  │
//! │                                                              │
//! │  network/           - Sockets and session state              │
//! │  ├── protocol.rs    - Peer ids, messages, envelope codec     │
//! │  ├── framing.rs     - 4-byte length-prefixed frames          │
//! │  ├── connection.rs  - Per-peer socket, outbound queue        │
//! │  ├── registry.rs    - Peer id → connection map               │
//! │  ├── session.rs     - Config, phases, events                 │
//! │  ├── host.rs        - Accept loop and relay                  │
//! │  ├── client.rs      - Single upstream connection             │
//! │  ├── replicator.rs  - Fixed-rate snapshot publisher          │
//! │  ├── proxy.rs       - Smoothed remote avatars                │
//! │  └── dispatch.rs    - Event queue → gameplay                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Topology
//!
//! One peer hosts and every other peer connects to it. Clients only ever
//! talk to the host; the host relays each message to everyone except its
//! sender. The host is a participant too, with its own peer id.
//!
//! Messages from one sender reach each receiver in the order sent. There is
//! no ordering across senders, and timestamps are only for smoothing.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod network;

// Re-export commonly used types
pub use crate::core::vec3::Vec3;
pub use crate::network::client::{ClientHandle, SessionClient};
pub use crate::network::host::{HostHandle, SessionHost};
pub use crate::network::protocol::{Message, Payload, PeerId, StateSnapshot};
pub use crate::network::session::{SessionConfig, SessionEvent, SessionEvents};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default session port
pub const DEFAULT_PORT: u16 = 7777;

/// Default maximum remote peers per host
pub const DEFAULT_CAPACITY: usize = 6;

/// State replication rate (Hz)
pub const REPLICATION_RATE: u32 = 20;
