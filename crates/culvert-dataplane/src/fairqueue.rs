//! Virtual-time weighted fair packet scheduler.
//!
//! Many flows push packets toward one downstream packet channel; the queue
//! decides whose packet goes next. Each flow carries a virtual clock that
//! advances by `packet length + packet_weight` per packet, and the queued
//! flow with the smallest clock transmits first. Flows sending small
//! packets therefore transmit proportionally more often, and the weight
//! keeps zero-length packets from freezing the clock.
//!
//! The scheduler is an actor: all clocks, the heap, and the single
//! in-flight slot live on one task, so there is no locking and no public
//! call can observe a half-updated schedule. Producers talk to it through
//! [`Flow`] handles and block only on their own flow's backpressure.
//!
//! Scheduling never happens synchronously inside a delivery edge. After a
//! packet completes, the actor yields once before selecting the next flow,
//! so producers woken by that completion get to re-offer first and a
//! continuously busy flow competes with its next packet instead of
//! disappearing from the schedule between packets.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Notify};

use culvert_core::channel::{PacketSender, SendError, SendTicket};

// ── Configuration ────────────────────────────────────────────────────────────

/// Scheduler tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FairQueueConfig {
    /// Whether cancel requests forward to the output channel.
    /// Enable only when the downstream sink honours cancel hints.
    pub use_cancel: bool,

    /// Extra virtual cost every packet bears on top of its length.
    /// Must be positive so zero-length packets still advance the clock.
    pub packet_weight: u64,

    /// Ceiling for every flow's virtual clock. Clocks are rebased downward
    /// before they would cross it. The default never triggers in practice;
    /// tests lower it to exercise the rebase path.
    pub max_virtual_time: u64,
}

impl Default for FairQueueConfig {
    fn default() -> Self {
        FairQueueConfig {
            use_cancel: false,
            packet_weight: 1,
            max_virtual_time: u64::MAX,
        }
    }
}

// ── Shared flow state ────────────────────────────────────────────────────────

#[derive(Default)]
struct FlowShared {
    busy: AtomicBool,
    idle: Notify,
}

impl FlowShared {
    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
        if !busy {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_busy() {
                return;
            }
            notified.await;
        }
    }
}

// ── Messages ─────────────────────────────────────────────────────────────────

enum FlowMsg {
    Attach {
        id: u64,
        shared: Arc<FlowShared>,
    },
    Offer {
        id: u64,
        payload: Bytes,
        done: oneshot::Sender<()>,
    },
    Cancel {
        id: u64,
    },
    Detach {
        id: u64,
    },
    PrepareFree,
}

// ── Scheduler ────────────────────────────────────────────────────────────────

struct FlowState {
    vt: u64,
    queued: Option<QueuedPacket>,
    shared: Arc<FlowShared>,
}

struct QueuedPacket {
    payload: Bytes,
    done: oneshot::Sender<()>,
}

struct SendingState {
    flow: u64,
    ticket: SendTicket,
    done: oneshot::Sender<()>,
}

/// Heap key: smallest virtual time first, FIFO among equal clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    vt: u64,
    seq: u64,
    flow: u64,
}

/// The scheduler actor. Create with [`FairQueue::new`], then drive it by
/// spawning [`FairQueue::run`].
pub struct FairQueue {
    output: PacketSender,
    ctrl_rx: mpsc::UnboundedReceiver<FlowMsg>,
    flows: HashMap<u64, FlowState>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    sending: Option<SendingState>,
    next_seq: u64,
    packet_weight: u64,
    use_cancel: bool,
    max_virtual_time: u64,
    freeing: bool,
    resched: bool,
}

impl FairQueue {
    /// Build a queue in front of `output`.
    ///
    /// Panics if `packet_weight` is zero or if a maximum-size packet's
    /// virtual cost would not fit under `max_virtual_time`; both are
    /// configuration bugs, not runtime conditions.
    pub fn new(output: PacketSender, config: FairQueueConfig) -> (FairQueue, FairQueueHandle) {
        assert!(
            config.packet_weight > 0,
            "packet_weight must be positive so zero-length packets advance the clock"
        );
        assert!(
            (output.mtu() as u64)
                .checked_add(config.packet_weight)
                .is_some_and(|cost| cost <= config.max_virtual_time),
            "output MTU plus packet_weight must fit under max_virtual_time"
        );

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let handle = FairQueueHandle {
            ctrl: ctrl_tx,
            next_id: Arc::new(AtomicU64::new(0)),
            mtu: output.mtu(),
            use_cancel: config.use_cancel,
        };
        let queue = FairQueue {
            output,
            ctrl_rx,
            flows: HashMap::new(),
            heap: BinaryHeap::new(),
            sending: None,
            next_seq: 0,
            packet_weight: config.packet_weight,
            use_cancel: config.use_cancel,
            max_virtual_time: config.max_virtual_time,
            freeing: false,
            resched: false,
        };
        (queue, handle)
    }

    /// Drive the scheduler until every handle and flow is gone.
    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            if std::mem::take(&mut self.resched) {
                // Fresh scheduler turn between deliveries: producers woken
                // by the previous completion re-offer before the next flow
                // is selected.
                tokio::task::yield_now().await;
            }
            while let Ok(msg) = self.ctrl_rx.try_recv() {
                self.handle_msg(msg);
            }
            self.dispatch_next()?;

            tokio::select! {
                biased;
                msg = self.ctrl_rx.recv() => match msg {
                    Some(msg) => self.handle_msg(msg),
                    None => break,
                },
                delivered = Self::delivery_done(&mut self.sending), if self.sending.is_some() => {
                    match delivered {
                        Ok(()) => self.complete_delivery(),
                        Err(_) => {
                            self.abandon_delivery();
                            anyhow::bail!("output channel closed with a packet in flight");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn delivery_done(sending: &mut Option<SendingState>) -> Result<(), SendError> {
        match sending.as_mut() {
            Some(state) => state.ticket.delivered().await,
            None => std::future::pending().await,
        }
    }

    fn handle_msg(&mut self, msg: FlowMsg) {
        match msg {
            FlowMsg::Attach { id, shared } => {
                debug_assert!(!self.freeing, "flow attached during teardown");
                self.flows.insert(
                    id,
                    FlowState {
                        vt: 0,
                        queued: None,
                        shared,
                    },
                );
            }
            FlowMsg::Offer { id, payload, done } => self.enqueue(id, payload, done),
            FlowMsg::Cancel { id } => {
                if !self.use_cancel || self.freeing {
                    return;
                }
                match &self.sending {
                    Some(sending) if sending.flow == id => sending.ticket.request_cancel(),
                    _ => {
                        tracing::trace!(flow = id, "cancel ignored: flow is not sending");
                    }
                }
            }
            FlowMsg::Detach { id } => {
                let Some(state) = self.flows.remove(&id) else {
                    return;
                };
                let is_sending = self.sending.as_ref().is_some_and(|s| s.flow == id);
                if (state.queued.is_some() || is_sending) && !self.freeing {
                    debug_assert!(false, "flow dropped while busy outside teardown");
                    tracing::error!(flow = id, "flow dropped while busy outside teardown");
                }
                // Stale heap entries for this flow are skipped at dispatch.
            }
            FlowMsg::PrepareFree => self.prepare_free(),
        }
    }

    fn enqueue(&mut self, id: u64, payload: Bytes, done: oneshot::Sender<()>) {
        if self.freeing {
            // Teardown: drop the packet; the producer observes Closed.
            if let Some(state) = self.flows.get(&id) {
                state.shared.set_busy(false);
            }
            drop(done);
            return;
        }
        let Some(state) = self.flows.get(&id) else {
            return;
        };
        debug_assert!(
            state.queued.is_none(),
            "flow offered a second packet while one is queued"
        );

        let cost = payload.len() as u64 + self.packet_weight;
        if state.vt > self.max_virtual_time.saturating_sub(cost) {
            self.rebase();
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let Some(state) = self.flows.get_mut(&id) else {
            return;
        };
        debug_assert!(
            state.vt <= self.max_virtual_time.saturating_sub(cost),
            "virtual clock exhausted even after rebasing"
        );
        state.vt = state.vt.saturating_add(cost);
        state.queued = Some(QueuedPacket { payload, done });
        state.shared.set_busy(true);
        self.heap.push(Reverse(HeapEntry {
            vt: state.vt,
            seq,
            flow: id,
        }));
    }

    /// Shift every clock down by the smallest clock among attached flows.
    /// Relative order is unchanged, so the heap is rebuilt with the same
    /// shift applied to its keys.
    fn rebase(&mut self) {
        let Some(min_vt) = self.flows.values().map(|f| f.vt).min() else {
            return;
        };
        if min_vt == 0 {
            return;
        }
        for state in self.flows.values_mut() {
            state.vt -= min_vt;
        }
        let entries = std::mem::take(&mut self.heap).into_vec();
        self.heap = entries
            .into_iter()
            .map(|Reverse(mut entry)| {
                entry.vt = entry.vt.saturating_sub(min_vt);
                Reverse(entry)
            })
            .collect();
        tracing::debug!(shift = min_vt, "virtual clocks rebased");
    }

    fn dispatch_next(&mut self) -> anyhow::Result<()> {
        if self.freeing || self.sending.is_some() {
            return Ok(());
        }
        while let Some(Reverse(entry)) = self.heap.pop() {
            let Some(state) = self.flows.get_mut(&entry.flow) else {
                continue;
            };
            let Some(packet) = state.queued.take() else {
                continue;
            };
            debug_assert_eq!(state.vt, entry.vt);

            match self.output.begin_send(packet.payload) {
                Ok(ticket) => {
                    tracing::trace!(flow = entry.flow, vt = entry.vt, "flow selected");
                    self.sending = Some(SendingState {
                        flow: entry.flow,
                        ticket,
                        done: packet.done,
                    });
                    return Ok(());
                }
                Err(err) => {
                    if let Some(state) = self.flows.get(&entry.flow) {
                        state.shared.set_busy(false);
                    }
                    anyhow::bail!("output channel rejected a packet: {err}");
                }
            }
        }
        Ok(())
    }

    fn complete_delivery(&mut self) {
        let Some(sending) = self.sending.take() else {
            return;
        };
        if let Some(state) = self.flows.get(&sending.flow) {
            state.shared.set_busy(false);
        }
        let _ = sending.done.send(());
        self.resched = true;
    }

    fn abandon_delivery(&mut self) {
        if let Some(sending) = self.sending.take() {
            if let Some(state) = self.flows.get(&sending.flow) {
                state.shared.set_busy(false);
            }
        }
    }

    fn prepare_free(&mut self) {
        if !self.freeing {
            tracing::debug!("fair queue entering teardown");
        }
        self.freeing = true;
        self.heap.clear();
        // Release every blocked producer; their packets will never be sent.
        // A packet already at the output is left to finish on its own.
        for state in self.flows.values_mut() {
            if state.queued.take().is_some() {
                state.shared.set_busy(false);
            }
        }
    }
}

// ── Handles ──────────────────────────────────────────────────────────────────

/// Cloneable handle for attaching flows and tearing the queue down.
#[derive(Clone)]
pub struct FairQueueHandle {
    ctrl: mpsc::UnboundedSender<FlowMsg>,
    next_id: Arc<AtomicU64>,
    mtu: usize,
    use_cancel: bool,
}

impl FairQueueHandle {
    /// Attach a new flow. Its virtual clock starts at zero.
    pub fn flow(&self) -> Flow {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(FlowShared::default());
        let _ = self.ctrl.send(FlowMsg::Attach {
            id,
            shared: shared.clone(),
        });
        Flow {
            id,
            mtu: self.mtu,
            use_cancel: self.use_cancel,
            ctrl: self.ctrl.clone(),
            shared,
        }
    }

    /// Enter teardown. No further packets reach the output, queued packets
    /// are dropped with their producers released, and flows may be dropped
    /// even while busy. Irreversible.
    pub fn prepare_free(&self) {
        let _ = self.ctrl.send(FlowMsg::PrepareFree);
    }
}

/// One producer's lane into the queue.
///
/// A flow is *busy* from the moment a packet is offered until that packet
/// has fully left the queue through the output. `send` resolves exactly at
/// that edge. Dropping a busy flow outside teardown is a caller bug.
pub struct Flow {
    id: u64,
    mtu: usize,
    use_cancel: bool,
    ctrl: mpsc::UnboundedSender<FlowMsg>,
    shared: Arc<FlowShared>,
}

impl Flow {
    /// Offer one packet and wait until it has been delivered downstream.
    pub async fn send(&mut self, payload: Bytes) -> Result<(), SendError> {
        debug_assert!(
            payload.len() <= self.mtu,
            "packet of {} bytes exceeds the output MTU {}",
            payload.len(),
            self.mtu
        );
        self.shared.set_busy(true);

        let (done_tx, done_rx) = oneshot::channel();
        let offered = self.ctrl.send(FlowMsg::Offer {
            id: self.id,
            payload,
            done: done_tx,
        });
        if offered.is_err() {
            self.shared.set_busy(false);
            return Err(SendError::Closed);
        }
        match done_rx.await {
            Ok(()) => Ok(()),
            Err(_) => {
                self.shared.set_busy(false);
                Err(SendError::Closed)
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.shared.is_busy()
    }

    /// Resolves as soon as the flow is not busy. A waiter that is already
    /// parked when the busy edge falls is always woken.
    pub async fn wait_idle(&self) {
        self.shared.wait_idle().await;
    }

    /// Control handle usable from other tasks while this flow is sending.
    pub fn control(&self) -> FlowControl {
        FlowControl {
            id: self.id,
            use_cancel: self.use_cancel,
            ctrl: self.ctrl.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Ask the output to hurry or abandon this flow's in-flight packet.
    /// See [`FlowControl::request_cancel`].
    pub fn request_cancel(&self) {
        debug_assert!(
            self.use_cancel,
            "cancel requested on a queue without cancel support"
        );
        let _ = self.ctrl.send(FlowMsg::Cancel { id: self.id });
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        let _ = self.ctrl.send(FlowMsg::Detach { id: self.id });
    }
}

/// Busy-state observer and cancel path, detached from the flow's sending
/// half so it can be used while a `send` is outstanding.
#[derive(Clone)]
pub struct FlowControl {
    id: u64,
    use_cancel: bool,
    ctrl: mpsc::UnboundedSender<FlowMsg>,
    shared: Arc<FlowShared>,
}

impl FlowControl {
    pub fn is_busy(&self) -> bool {
        self.shared.is_busy()
    }

    pub async fn wait_idle(&self) {
        self.shared.wait_idle().await;
    }

    /// Ask the output to hurry or abandon this flow's in-flight packet.
    ///
    /// Only meaningful while this flow's packet is the one at the output;
    /// a merely queued packet is untouched. Requires the queue to have been
    /// built with `use_cancel`. Idempotent; the output may still deliver
    /// the packet normally.
    pub fn request_cancel(&self) {
        debug_assert!(
            self.use_cancel,
            "cancel requested on a queue without cancel support"
        );
        let _ = self.ctrl.send(FlowMsg::Cancel { id: self.id });
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
