//! Protocol Messages
//!
//! Wire format shared by host and client. Every message travels as a
//! bincode-encoded envelope `{kind, sender_id, payload, timestamp}` inside a
//! length-prefixed frame (see `framing.rs`). In memory, the kind and payload
//! are a single tagged union so that each dispatch site matches exhaustively.

use std::fmt;
use std::str::FromStr;

use bincode::Options;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{now_millis, Vec3};

// =============================================================================
// PEER ID
// =============================================================================

/// Unique peer identifier (UUID).
///
/// Minted by the host for every accepted connection and for itself. Never
/// nil: the nil UUID and the empty string both mean "unset" on the wire and
/// are rejected on decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Mint a fresh random peer id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID. Returns `None` for the nil UUID.
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        if uuid.is_nil() {
            None
        } else {
            Some(Self(uuid))
        }
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First four bytes as hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0.as_bytes()[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for PeerId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ProtocolError::MissingPeerId);
        }
        let uuid = Uuid::parse_str(s).map_err(|_| ProtocolError::InvalidPeerId(s.to_string()))?;
        Self::from_uuid(uuid).ok_or(ProtocolError::MissingPeerId)
    }
}

// =============================================================================
// STATE SNAPSHOT
// =============================================================================

/// Replicated avatar state of one participant.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// World position.
    pub position: Vec3,
    /// Euler angles in degrees.
    pub orientation: Vec3,
    /// Current health.
    pub health: i32,
}

impl StateSnapshot {
    /// Create a snapshot.
    pub const fn new(position: Vec3, orientation: Vec3, health: i32) -> Self {
        Self { position, orientation, health }
    }

    /// True if position and orientation are finite.
    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.orientation.is_finite()
    }
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Message kind as carried in the envelope's `kind` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// A peer joined (or, host to new peer, your assigned id).
    PeerJoined = 0,
    /// A peer left.
    PeerLeft = 1,
    /// Replicated avatar state.
    StateSnapshot = 2,
    /// Opaque gameplay action.
    Action = 3,
    /// Chat text.
    Chat = 4,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::PeerJoined),
            1 => Ok(Self::PeerLeft),
            2 => Ok(Self::StateSnapshot),
            3 => Ok(Self::Action),
            4 => Ok(Self::Chat),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// Kind-specific message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// `assigned` is set only on the host's welcome to a newly accepted peer;
    /// notifications about other peers carry `None` and name the peer in
    /// `sender_id`.
    PeerJoined {
        /// Id assigned to the receiving peer.
        assigned: Option<PeerId>,
    },
    /// The peer named in `sender_id` left the session.
    PeerLeft,
    /// Avatar state of the sender.
    StateSnapshot(StateSnapshot),
    /// Gameplay-defined action string, forwarded verbatim.
    Action(String),
    /// UTF-8 chat text.
    Chat(String),
}

impl Payload {
    /// Envelope kind for this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::PeerJoined { .. } => MessageKind::PeerJoined,
            Payload::PeerLeft => MessageKind::PeerLeft,
            Payload::StateSnapshot(_) => MessageKind::StateSnapshot,
            Payload::Action(_) => MessageKind::Action,
            Payload::Chat(_) => MessageKind::Chat,
        }
    }

    /// Whether an outbound queue may discard this payload under pressure.
    /// Only snapshots qualify; a newer one always supersedes them.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Payload::StateSnapshot(_))
    }
}

/// A session message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Peer that originated the message. Re-stamped by the host on relay.
    pub sender_id: PeerId,
    /// Milliseconds since the Unix epoch at send time.
    pub timestamp: i64,
    /// Kind-specific body.
    pub payload: Payload,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(sender_id: PeerId, payload: Payload) -> Self {
        Self {
            sender_id,
            timestamp: now_millis(),
            payload,
        }
    }

    /// Envelope kind.
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Encode to envelope bytes (unframed).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Decode from envelope bytes (unframed).
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        decode(data)
    }
}

/// On-the-wire envelope.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    kind: u8,
    sender_id: String,
    payload: String,
    timestamp: i64,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Malformed frame or message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame length prefix exceeds the allowed maximum.
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Declared length.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// Stream ended inside a frame.
    #[error("truncated frame")]
    TruncatedFrame,

    /// Envelope bytes did not deserialize.
    #[error("malformed envelope: {0}")]
    Envelope(#[from] bincode::Error),

    /// Unknown `kind` byte.
    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    /// Empty or nil peer id where one is required.
    #[error("missing peer id")]
    MissingPeerId,

    /// Peer id is not a UUID.
    #[error("invalid peer id {0:?}")]
    InvalidPeerId(String),

    /// Snapshot payload did not parse.
    #[error("malformed snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// Snapshot contains NaN or infinite components.
    #[error("snapshot contains non-finite values")]
    NonFiniteSnapshot,

    /// Payload present on a kind that carries none.
    #[error("unexpected payload on {0:?}")]
    UnexpectedPayload(MessageKind),
}

// =============================================================================
// ENCODE / DECODE
// =============================================================================

/// Envelope codec: fixed-width little-endian integers, and the body must be
/// exactly one envelope.
fn envelope_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode a message to envelope bytes.
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = match &msg.payload {
        Payload::PeerJoined { assigned } => assigned.map(|id| id.to_string()).unwrap_or_default(),
        Payload::PeerLeft => String::new(),
        Payload::StateSnapshot(snapshot) => {
            if !snapshot.is_finite() {
                return Err(ProtocolError::NonFiniteSnapshot);
            }
            serde_json::to_string(snapshot)?
        }
        Payload::Action(data) => data.clone(),
        Payload::Chat(text) => text.clone(),
    };

    let envelope = WireEnvelope {
        kind: msg.kind() as u8,
        sender_id: msg.sender_id.to_string(),
        payload,
        timestamp: msg.timestamp,
    };

    Ok(envelope_options().serialize(&envelope)?)
}

/// Decode envelope bytes to a message.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    let envelope: WireEnvelope = envelope_options().deserialize(data)?;
    let kind = MessageKind::try_from(envelope.kind)?;
    let sender_id: PeerId = envelope.sender_id.parse()?;

    let payload = match kind {
        MessageKind::PeerJoined => {
            let assigned = if envelope.payload.is_empty() {
                None
            } else {
                Some(envelope.payload.parse()?)
            };
            Payload::PeerJoined { assigned }
        }
        MessageKind::PeerLeft => {
            if !envelope.payload.is_empty() {
                return Err(ProtocolError::UnexpectedPayload(kind));
            }
            Payload::PeerLeft
        }
        MessageKind::StateSnapshot => {
            let snapshot: StateSnapshot = serde_json::from_str(&envelope.payload)?;
            if !snapshot.is_finite() {
                return Err(ProtocolError::NonFiniteSnapshot);
            }
            Payload::StateSnapshot(snapshot)
        }
        MessageKind::Action => Payload::Action(envelope.payload),
        MessageKind::Chat => Payload::Chat(envelope.payload),
    };

    Ok(Message {
        sender_id,
        timestamp: envelope.timestamp,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peer(n: u128) -> PeerId {
        PeerId::from_uuid(Uuid::from_u128(n)).unwrap()
    }

    fn raw_envelope(kind: u8, sender_id: &str, payload: &str) -> Vec<u8> {
        bincode::serialize(&WireEnvelope {
            kind,
            sender_id: sender_id.to_string(),
            payload: payload.to_string(),
            timestamp: 0,
        })
        .unwrap()
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let msg = Message::new(
            peer(7),
            Payload::StateSnapshot(StateSnapshot::new(
                Vec3::new(1.5, -2.25, 100.0),
                Vec3::new(0.0, 270.0, 15.5),
                87,
            )),
        );

        let bytes = msg.encode().unwrap();
        let parsed = Message::decode(&bytes).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_peer_joined_assignment_vs_notification() {
        let host = peer(1);
        let newcomer = peer(2);

        let welcome = Message::new(host, Payload::PeerJoined { assigned: Some(newcomer) });
        let parsed = decode(&encode(&welcome).unwrap()).unwrap();
        assert_eq!(parsed.payload, Payload::PeerJoined { assigned: Some(newcomer) });

        let notice = Message::new(newcomer, Payload::PeerJoined { assigned: None });
        let parsed = decode(&encode(&notice).unwrap()).unwrap();
        assert_eq!(parsed.payload, Payload::PeerJoined { assigned: None });
        assert_eq!(parsed.sender_id, newcomer);
    }

    #[test]
    fn test_action_forwarded_verbatim() {
        let data = r#"{"skill":"fireball","target":[1,2]}"#.to_string();
        let msg = Message::new(peer(3), Payload::Action(data.clone()));
        let parsed = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(parsed.payload, Payload::Action(data));
    }

    #[test]
    fn test_kind_bytes() {
        assert_eq!(MessageKind::PeerJoined as u8, 0);
        assert_eq!(MessageKind::PeerLeft as u8, 1);
        assert_eq!(MessageKind::StateSnapshot as u8, 2);
        assert_eq!(MessageKind::Action as u8, 3);
        assert_eq!(MessageKind::Chat as u8, 4);
        assert!(MessageKind::try_from(5).is_err());
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let bytes = raw_envelope(9, &peer(1).to_string(), "");
        assert!(matches!(decode(&bytes), Err(ProtocolError::UnknownKind(9))));
    }

    #[test]
    fn test_rejects_unset_sender() {
        let bytes = raw_envelope(MessageKind::Chat as u8, "", "hi");
        assert!(matches!(decode(&bytes), Err(ProtocolError::MissingPeerId)));

        let nil = Uuid::nil().to_string();
        let bytes = raw_envelope(MessageKind::Chat as u8, &nil, "hi");
        assert!(matches!(decode(&bytes), Err(ProtocolError::MissingPeerId)));
    }

    #[test]
    fn test_rejects_garbage_sender() {
        let bytes = raw_envelope(MessageKind::Chat as u8, "player-one", "hi");
        assert!(matches!(decode(&bytes), Err(ProtocolError::InvalidPeerId(_))));
    }

    #[test]
    fn test_rejects_bad_snapshot() {
        let sender = peer(1).to_string();
        let bytes = raw_envelope(MessageKind::StateSnapshot as u8, &sender, "{not json");
        assert!(matches!(decode(&bytes), Err(ProtocolError::Snapshot(_))));
    }

    #[test]
    fn test_rejects_payload_on_peer_left() {
        let sender = peer(1).to_string();
        let bytes = raw_envelope(MessageKind::PeerLeft as u8, &sender, "bye");
        assert!(matches!(
            decode(&bytes),
            Err(ProtocolError::UnexpectedPayload(MessageKind::PeerLeft))
        ));
    }

    #[test]
    fn test_rejects_truncated_envelope() {
        let msg = Message::new(peer(1), Payload::Chat("hello there".into()));
        let bytes = encode(&msg).unwrap();
        assert!(matches!(
            decode(&bytes[..bytes.len() - 3]),
            Err(ProtocolError::Envelope(_))
        ));
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let msg = Message::new(peer(1), Payload::Chat("hello".into()));
        let mut bytes = encode(&msg).unwrap();
        bytes.extend_from_slice(b"junk");
        assert!(matches!(decode(&bytes), Err(ProtocolError::Envelope(_))));
    }

    #[test]
    fn test_encode_refuses_non_finite_snapshot() {
        let msg = Message::new(
            peer(1),
            Payload::StateSnapshot(StateSnapshot::new(
                Vec3::new(f32::NAN, 0.0, 0.0),
                Vec3::ZERO,
                10,
            )),
        );
        assert!(matches!(encode(&msg), Err(ProtocolError::NonFiniteSnapshot)));
    }

    #[test]
    fn test_peer_id_display_parse() {
        let id = PeerId::generate();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_only_snapshots_droppable() {
        assert!(Payload::StateSnapshot(StateSnapshot::default()).is_droppable());
        assert!(!Payload::Chat("x".into()).is_droppable());
        assert!(!Payload::Action("x".into()).is_droppable());
        assert!(!Payload::PeerLeft.is_droppable());
        assert!(!Payload::PeerJoined { assigned: None }.is_droppable());
    }

    fn arb_peer() -> impl Strategy<Value = PeerId> {
        (1u128..=u128::MAX).prop_map(peer)
    }

    fn arb_vec3() -> impl Strategy<Value = Vec3> {
        (-1.0e6f32..1.0e6f32, -1.0e6f32..1.0e6f32, -1.0e6f32..1.0e6f32)
            .prop_map(|(x, y, z)| Vec3::new(x, y, z))
    }

    fn arb_payload() -> impl Strategy<Value = Payload> {
        prop_oneof![
            proptest::option::of(arb_peer()).prop_map(|assigned| Payload::PeerJoined { assigned }),
            Just(Payload::PeerLeft),
            (arb_vec3(), arb_vec3(), any::<i32>()).prop_map(|(p, o, h)| {
                Payload::StateSnapshot(StateSnapshot::new(p, o, h))
            }),
            any::<String>().prop_map(Payload::Action),
            any::<String>().prop_map(Payload::Chat),
        ]
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            sender_id in arb_peer(),
            timestamp in any::<i64>(),
            payload in arb_payload(),
        ) {
            let msg = Message { sender_id, timestamp, payload };
            let bytes = encode(&msg).unwrap();
            prop_assert_eq!(decode(&bytes).unwrap(), msg);
        }
    }
}
