//! Packet channel: the push-one-packet contract every data-plane stage
//! speaks.
//!
//! A channel carries exactly one packet at a time. The sender pushes a
//! packet and then waits for the receiver to acknowledge it; only after the
//! acknowledgement may the next packet be pushed. This gives every stage
//! built on top of it backpressure for free and bounds buffering to one
//! packet per hop.
//!
//! The payload travels as [`Bytes`], so the bytes stay alive and untouched
//! for the whole in-flight interval no matter which side drops its half
//! first. The sender may additionally signal a cooperative cancel hint for
//! the packet currently in flight; receivers are free to ignore it.

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by the sending side of a packet channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// A packet is already in flight. Pushing a second one before the first
    /// is acknowledged is a protocol violation by the caller.
    #[error("channel already has a packet in flight")]
    Busy,

    /// The other endpoint is gone; no more packets will ever be accepted.
    #[error("peer endpoint is gone")]
    Closed,
}

struct Frame {
    payload: Bytes,
    done: oneshot::Sender<()>,
    cancel: CancellationToken,
}

/// Create a packet channel with the given MTU.
///
/// The MTU is fixed for the lifetime of the channel. Senders must not push
/// packets longer than the MTU; doing so is a caller bug (checked with a
/// debug assertion, not a runtime error).
pub fn channel(mtu: usize) -> (PacketSender, PacketReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (PacketSender { mtu, tx }, PacketReceiver { mtu, rx })
}

// ── Sender ───────────────────────────────────────────────────────────────────

/// The producing half of a packet channel.
#[derive(Debug)]
pub struct PacketSender {
    mtu: usize,
    tx: mpsc::Sender<Frame>,
}

impl PacketSender {
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Push a packet without waiting for its acknowledgement.
    ///
    /// Returns a [`SendTicket`] that resolves when the receiver completes
    /// the packet. Components that need to keep servicing other work while a
    /// packet is in flight (the fair queue, the decoder) hold the ticket and
    /// poll it from their select loop; everyone else uses [`send`].
    ///
    /// [`send`]: PacketSender::send
    pub fn begin_send(&mut self, payload: Bytes) -> Result<SendTicket, SendError> {
        debug_assert!(
            payload.len() <= self.mtu,
            "packet of {} bytes exceeds channel MTU {}",
            payload.len(),
            self.mtu
        );

        let (done_tx, done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let frame = Frame {
            payload,
            done: done_tx,
            cancel: cancel.clone(),
        };

        self.tx.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => SendError::Busy,
            TrySendError::Closed(_) => SendError::Closed,
        })?;

        Ok(SendTicket {
            done: done_rx,
            cancel,
        })
    }

    /// Push a packet and wait until the receiver acknowledges it.
    pub async fn send(&mut self, payload: Bytes) -> Result<(), SendError> {
        let mut ticket = self.begin_send(payload)?;
        ticket.delivered().await
    }
}

/// Handle to a packet currently in flight, held by the sender.
#[derive(Debug)]
pub struct SendTicket {
    done: oneshot::Receiver<()>,
    cancel: CancellationToken,
}

impl SendTicket {
    /// Resolves once the receiver has completed the packet.
    ///
    /// Cancel-safe: the ticket can be polled from a select loop and awaited
    /// again later. Returns [`SendError::Closed`] if the receiver went away
    /// without acknowledging.
    pub async fn delivered(&mut self) -> Result<(), SendError> {
        (&mut self.done).await.map_err(|_| SendError::Closed)
    }

    /// Ask the receiver to stop processing the in-flight packet as soon as
    /// possible. A hint only: the receiver may still complete the packet
    /// normally. Idempotent.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }
}

// ── Receiver ─────────────────────────────────────────────────────────────────

/// The consuming half of a packet channel.
#[derive(Debug)]
pub struct PacketReceiver {
    mtu: usize,
    rx: mpsc::Receiver<Frame>,
}

impl PacketReceiver {
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Wait for the next packet. Returns `None` once the sender is gone.
    pub async fn recv(&mut self) -> Option<InFlight> {
        self.rx.recv().await.map(InFlight::from_frame)
    }

    /// Take a packet if one is already waiting. Returns `None` when the
    /// channel is empty or the sender is gone.
    pub fn try_recv(&mut self) -> Option<InFlight> {
        self.rx.try_recv().ok().map(InFlight::from_frame)
    }
}

/// A received packet whose acknowledgement is still owed to the sender.
///
/// Dropping an `InFlight` without calling [`complete`] leaves the sender
/// with [`SendError::Closed`]; do that only when tearing the pipeline down.
///
/// [`complete`]: InFlight::complete
#[derive(Debug)]
pub struct InFlight {
    payload: Bytes,
    done: oneshot::Sender<()>,
    cancel: CancellationToken,
}

impl InFlight {
    fn from_frame(frame: Frame) -> Self {
        InFlight {
            payload: frame.payload,
            done: frame.done,
            cancel: frame.cancel,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether the sender has asked for this packet to be abandoned.
    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when (and if) the sender requests cancellation.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Acknowledge the packet, releasing the sender to push the next one.
    pub fn complete(self) {
        let _ = self.done.send(());
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
