//! Peer Connection
//!
//! One live stream socket to one remote peer. The socket is split: a reader
//! task owns the read half, a writer task owns the write half, and both
//! share an `Arc<Connection>` holding lifecycle state and a bounded
//! outbound queue.
//!
//! Senders never touch the socket. They push pre-framed bytes onto the
//! queue and wake the writer, so a slow peer only ever stalls its own
//! writer task.
//!
//! Queue policy when full: shed the oldest queued snapshot. If none is
//! queued, an incoming snapshot is itself shed; anything else overflows and
//! the peer is treated as stalled.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::network::framing::{encode_frame, read_frame};
use crate::network::protocol::{Message, ProtocolError};
use crate::network::session::DisconnectReason;

/// Connection lifecycle.
///
/// `Accepted | Connecting → Open → Closing → Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted by the host, not yet announced.
    Accepted,
    /// Client socket open, handshake pending.
    Connecting,
    /// Traffic flowing.
    Open,
    /// Close requested; writer flushing.
    Closing,
    /// Socket released.
    Closed,
}

/// Outbound queue rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Connection is closing or closed.
    #[error("connection closed")]
    Closed,

    /// Queue full of undroppable frames.
    #[error("outbound queue overflow ({capacity} frames)")]
    Overflow {
        /// Queue capacity.
        capacity: usize,
    },
}

/// What happened to a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued with room to spare.
    Queued,
    /// Queued after shedding an older snapshot.
    ShedOldest,
    /// The pushed snapshot itself was shed.
    ShedIncoming,
}

#[derive(Debug)]
struct QueuedFrame {
    bytes: Arc<[u8]>,
    droppable: bool,
}

/// Bounded FIFO of framed bytes awaiting the writer.
#[derive(Debug)]
pub struct OutboundQueue {
    frames: VecDeque<QueuedFrame>,
    capacity: usize,
    shed: u64,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            shed: 0,
        }
    }

    /// Queue a frame, applying the shedding policy when full.
    pub fn push(&mut self, bytes: Arc<[u8]>, droppable: bool) -> Result<PushOutcome, QueueError> {
        let mut outcome = PushOutcome::Queued;
        if self.frames.len() >= self.capacity {
            match self.frames.iter().position(|f| f.droppable) {
                Some(oldest) => {
                    self.frames.remove(oldest);
                    outcome = PushOutcome::ShedOldest;
                }
                None if droppable => {
                    self.shed += 1;
                    return Ok(PushOutcome::ShedIncoming);
                }
                None => return Err(QueueError::Overflow { capacity: self.capacity }),
            }
            self.shed += 1;
        }
        self.frames.push_back(QueuedFrame { bytes, droppable });
        Ok(outcome)
    }

    /// Next frame to write.
    pub fn pop(&mut self) -> Option<Arc<[u8]>> {
        self.frames.pop_front().map(|f| f.bytes)
    }

    /// Frames waiting.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Snapshots shed so far.
    pub fn shed_count(&self) -> u64 {
        self.shed
    }
}

/// Encode and frame a message, ready for [`Connection::enqueue`].
pub fn frame_message(msg: &Message) -> Result<Arc<[u8]>, ProtocolError> {
    let body = msg.encode()?;
    Ok(encode_frame(&body)?.into())
}

/// Shared state of one peer connection.
#[derive(Debug)]
pub struct Connection {
    remote_addr: SocketAddr,
    state: Mutex<ConnectionState>,
    outbound: Mutex<OutboundQueue>,
    wake: Notify,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Create a connection in `initial` state (`Accepted` or `Connecting`).
    pub fn new(remote_addr: SocketAddr, initial: ConnectionState, queue_len: usize) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            remote_addr,
            state: Mutex::new(initial),
            outbound: Mutex::new(OutboundQueue::new(queue_len)),
            wake: Notify::new(),
            closed,
        })
    }

    /// Remote socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Promote `Accepted`/`Connecting` to `Open`. No-op otherwise.
    pub fn mark_open(&self) {
        let mut state = lock(&self.state);
        if matches!(*state, ConnectionState::Accepted | ConnectionState::Connecting) {
            *state = ConnectionState::Open;
        }
    }

    /// True until a close is requested.
    pub fn is_open(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Accepted | ConnectionState::Connecting | ConnectionState::Open
        )
    }

    /// Queue pre-framed bytes for the writer.
    pub fn enqueue(&self, frame: Arc<[u8]>, droppable: bool) -> Result<PushOutcome, QueueError> {
        if !self.is_open() {
            return Err(QueueError::Closed);
        }
        let outcome = lock(&self.outbound).push(frame, droppable)?;
        self.wake.notify_one();
        Ok(outcome)
    }

    /// Frame and queue a single message.
    pub fn send_message(&self, msg: &Message) -> Result<PushOutcome, SendFailure> {
        let frame = frame_message(msg)?;
        Ok(self.enqueue(frame, msg.payload.is_droppable())?)
    }

    /// Request close. The writer flushes what is queued, then releases the
    /// socket; the reader unblocks immediately. Returns `true` only for the
    /// call that actually initiated the close.
    pub fn close(&self) -> bool {
        {
            let mut state = lock(&self.state);
            match *state {
                ConnectionState::Closing | ConnectionState::Closed => return false,
                _ => *state = ConnectionState::Closing,
            }
        }
        self.closed.send_replace(true);
        self.wake.notify_one();
        true
    }

    /// Watch for close requests.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Snapshots shed for this peer so far.
    pub fn shed_count(&self) -> u64 {
        lock(&self.outbound).shed_count()
    }

    fn pop_frame(&self) -> Option<Arc<[u8]>> {
        lock(&self.outbound).pop()
    }

    fn mark_closed(&self) {
        *lock(&self.state) = ConnectionState::Closed;
        self.closed.send_replace(true);
    }
}

/// Error from [`Connection::send_message`].
#[derive(Debug, Error)]
pub enum SendFailure {
    /// Message could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Queue rejected the frame.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Poisoning only happens if a holder panicked mid-update; every critical
/// section here leaves the data consistent, so recover the guard.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// TASK BODIES
// =============================================================================

/// Drain the outbound queue into `writer` until the connection closes.
///
/// After a close request, already-queued frames get at most `write_timeout`
/// in total to flush. Returns the failure if a write fails or times out.
pub async fn run_writer<W>(
    conn: Arc<Connection>,
    mut writer: W,
    write_timeout: Duration,
) -> Result<(), DisconnectReason>
where
    W: AsyncWrite + Unpin,
{
    let mut closed = conn.closed_signal();
    let mut flush_deadline: Option<Instant> = None;

    let result = loop {
        if flush_deadline.is_none() && *closed.borrow_and_update() {
            flush_deadline = Some(Instant::now() + write_timeout);
        }

        if let Some(frame) = conn.pop_frame() {
            let deadline = flush_deadline.unwrap_or_else(|| Instant::now() + write_timeout);
            let write = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            };
            match tokio::time::timeout_at(deadline, write).await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => break Err(DisconnectReason::WriteFailed(e.to_string())),
                Err(_) => break Err(DisconnectReason::WriteFailed("write timed out".into())),
            }
        }

        if flush_deadline.is_some() {
            break Ok(());
        }

        tokio::select! {
            _ = conn.wake.notified() => {}
            _ = closed.changed() => {}
        }
    };

    if let Err(reason) = &result {
        debug!("Writer to {} stopped: {}", conn.remote_addr, reason);
    }
    let _ = tokio::time::timeout(Duration::from_millis(100), writer.shutdown()).await;
    conn.mark_closed();
    result
}

/// Why [`read_next`] returned without a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEnd {
    /// Local close requested.
    Cancelled,
    /// Remote closed, socket failed, timed out, or sent garbage.
    Failed(DisconnectReason),
}

/// Read and decode the next message, or report why the stream ended.
///
/// Returns `ReadEnd::Cancelled` as soon as the connection is closed locally,
/// even while blocked mid-read.
pub async fn read_next<R>(
    conn: &Connection,
    reader: &mut R,
    closed: &mut watch::Receiver<bool>,
    read_timeout: Duration,
) -> Result<Message, ReadEnd>
where
    R: AsyncRead + Unpin,
{
    if *closed.borrow_and_update() {
        return Err(ReadEnd::Cancelled);
    }

    tokio::select! {
        biased;
        _ = closed.changed() => Err(ReadEnd::Cancelled),
        res = tokio::time::timeout(read_timeout, read_frame(reader)) => match res {
            Err(_) => Err(ReadEnd::Failed(DisconnectReason::TimedOut)),
            Ok(Err(e)) => Err(ReadEnd::Failed(e.into())),
            Ok(Ok(body)) => Message::decode(&body).map_err(|e| {
                warn!("Malformed message from {}: {}", conn.remote_addr, e);
                ReadEnd::Failed(DisconnectReason::Protocol(e.to_string()))
            }),
        }
    }
}
