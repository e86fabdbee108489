//! # NoC messaging
//!
//! Segmented, optionally acknowledged inter-node delivery over the
//! Network-on-Chip (§4.8). This module is the *protocol* layer only:
//! framing, per-sender reassembly, sequence tracking for at-most-once
//! delivery, and the ack/nack state a reliable `sendack` waits on. It
//! knows nothing about tasks, the scheduler, or the concrete NoC
//! hardware — those live in `kernel.rs`, which holds the `Comm`
//! singleton behind a critical section exactly like it holds
//! `Scheduler`, and pairs [`Comm::ingest`]'s outcome with
//! `Scheduler::unblock`/`block_current_until` and a
//! `kernel::LinkDriver` implementation supplied by the platform.
//!
//! ## Addressing
//!
//! A mailbox is a `(task_id, port)` binding, one per task (§4.8: "a port
//! is owned exclusively by the task that created it"); this port
//! maps 1:1 with `MAX_MAILBOXES == MAX_TASKS`, keyed directly by task id.
//! A `Frame` additionally carries the sender's own `(cpu, task, port)` so
//! the receiver can report `recv`'s `(cpu, task)` output and route an ack
//! back without consulting the remote node's task table.
//!
//! ## Reassembly and at-most-once delivery
//!
//! Per §3/§4.8, reassembly state is kept per `(source cpu, source task)`
//! — up to [`crate::config::MAX_REASSEMBLY_CONTEXTS`] concurrent remote
//! senders per mailbox. A context additionally remembers the sequence
//! number of the last message it *acknowledged*, so a retransmitted
//! `sendack` that arrives after the first copy was already consumed and
//! acked (the case where the ack itself was lost, not the data) gets a
//! fresh ack without being redelivered to the task — this is what makes
//! "at most once" hold at the application layer, not just per network
//! attempt.

use crate::config::{MAX_MAILBOXES, MAX_REASSEMBLY_CONTEXTS, NOC_FRAME_SIZE, NOC_REASSEMBLY_SIZE};
use crate::errors::{KernelError, KernelResult};
use crate::queue::Queue;

/// Frames per message, rounded up. A message larger than this many
/// frames' worth of payload cannot be reassembled and is rejected by
/// [`fragment_into`] before anything is transmitted.
pub const MAX_FRAGMENTS: usize = NOC_REASSEMBLY_SIZE.div_ceil(NOC_FRAME_SIZE);

/// Wire-level frame kind. `Ack`/`Nack` carry no payload; they only
/// echo the `(dst_cpu, dst_port, seq)` of the data frame(s) they answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Ack,
    Nack,
}

/// A single NoC link-layer frame. `send`/`sendack` fragment a message
/// into a run of these (`frag_index` 0..`frag_count`); `Ack`/`Nack`
/// frames are always a single frame with `frag_count == 1`.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub kind: FrameKind,
    /// Node that originated this frame (the sender, for `Data`; the
    /// acker, for `Ack`/`Nack`).
    pub src_cpu: u16,
    /// Sending task's id on `src_cpu`. Local to that node's TCB table;
    /// carried along so `recv`/`recvack` can report it without either
    /// side querying the other's task table.
    pub src_task: usize,
    /// Port the sender's own mailbox is bound to, used to route a
    /// reply (`Ack`/`Nack`) back to it.
    pub src_port: u16,
    /// Target node and port this frame is addressed to.
    pub dst_cpu: u16,
    pub dst_port: u16,
    /// Logical channel, scoping FIFO ordering (§5): `(source, port,
    /// channel)` is the only ordering guarantee across nodes.
    pub channel: u8,
    /// Sequence number of the message this frame belongs to (or
    /// answers, for `Ack`/`Nack`). Monotonic per sending mailbox.
    pub seq: u32,
    pub frag_index: u16,
    pub frag_count: u16,
    /// `true` if this data frame was sent via `sendack` (the receiver
    /// should track it for dedup/re-ack even if its `recvack` ack is
    /// lost); meaningless on `Ack`/`Nack` frames.
    pub reliable: bool,
    /// Bytes of `payload` actually in use by this frame.
    pub len: u16,
    pub payload: [u8; NOC_FRAME_SIZE],
}

impl Frame {
    pub const fn empty() -> Self {
        Self {
            kind: FrameKind::Data,
            src_cpu: 0,
            src_task: 0,
            src_port: 0,
            dst_cpu: 0,
            dst_port: 0,
            channel: 0,
            seq: 0,
            frag_index: 0,
            frag_count: 1,
            reliable: false,
            len: 0,
            payload: [0u8; NOC_FRAME_SIZE],
        }
    }

    fn reply_ack(&self, kind: FrameKind, local_cpu: u16) -> Frame {
        Frame {
            kind,
            src_cpu: local_cpu,
            src_task: 0,
            src_port: self.dst_port,
            dst_cpu: self.src_cpu,
            dst_port: self.src_port,
            channel: self.channel,
            seq: self.seq,
            frag_index: 0,
            frag_count: 1,
            reliable: false,
            len: 0,
            payload: [0u8; NOC_FRAME_SIZE],
        }
    }

    /// Build a standalone `Ack` frame for `seq`, addressed back to
    /// `(dst_cpu, dst_port)`. Used by `kernel::recvack`, which acks a
    /// message after the fact (once the caller has taken delivery)
    /// rather than immediately on reassembly — §4.8's "transmits an ACK
    /// frame ... before returning to the caller".
    pub fn ack(local_cpu: u16, own_port: u16, dst_cpu: u16, dst_port: u16, channel: u8, seq: u32) -> Frame {
        Frame {
            kind: FrameKind::Ack,
            src_cpu: local_cpu,
            src_task: 0,
            src_port: own_port,
            dst_cpu,
            dst_port,
            channel,
            seq,
            frag_index: 0,
            frag_count: 1,
            reliable: false,
            len: 0,
            payload: [0u8; NOC_FRAME_SIZE],
        }
    }
}

/// Split `buf` into the frames needed to carry it, writing them into
/// `out` and returning how many were produced. Fails with `BadParam` if
/// `buf` would need more than `MAX_FRAGMENTS` frames.
pub fn fragment_into(
    out: &mut [Frame; MAX_FRAGMENTS],
    buf: &[u8],
    src_cpu: u16,
    src_task: usize,
    src_port: u16,
    dst_cpu: u16,
    dst_port: u16,
    channel: u8,
    seq: u32,
    reliable: bool,
) -> KernelResult<usize> {
    let frag_count = buf.len().div_ceil(NOC_FRAME_SIZE).max(1);
    if frag_count > MAX_FRAGMENTS || buf.len() > NOC_REASSEMBLY_SIZE {
        return Err(KernelError::BadParam);
    }
    for (i, frame) in out.iter_mut().take(frag_count).enumerate() {
        let start = i * NOC_FRAME_SIZE;
        let end = (start + NOC_FRAME_SIZE).min(buf.len());
        let chunk = &buf[start..end];
        *frame = Frame {
            kind: FrameKind::Data,
            src_cpu,
            src_task,
            src_port,
            dst_cpu,
            dst_port,
            channel,
            seq,
            frag_index: i as u16,
            frag_count: frag_count as u16,
            reliable,
            len: chunk.len() as u16,
            payload: [0u8; NOC_FRAME_SIZE],
        };
        frame.payload[..chunk.len()].copy_from_slice(chunk);
    }
    Ok(frag_count)
}

// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct ReassemblyContext {
    in_use: bool,
    src_cpu: u16,
    src_task: usize,
    /// Port the sender's own mailbox is bound to — needed to address an
    /// ack frame back to it from `kernel::recvack`.
    src_port: u16,
    /// Sequence currently being reassembled. Only meaningful while
    /// `complete == false`.
    seq: u32,
    next_frag: u16,
    frag_count: u16,
    len: usize,
    buf: [u8; NOC_REASSEMBLY_SIZE],
    complete: bool,
    /// Sequence number of the last message this context *acknowledged*
    /// (via `recvack`), kept even after the context would otherwise be
    /// considered idle, so a lost-ack retransmit can be re-acked
    /// without being redelivered.
    last_acked_seq: Option<u32>,
}

impl ReassemblyContext {
    const fn empty() -> Self {
        Self {
            in_use: false,
            src_cpu: 0,
            src_task: 0,
            src_port: 0,
            seq: 0,
            next_frag: 0,
            frag_count: 0,
            len: 0,
            buf: [0u8; NOC_REASSEMBLY_SIZE],
            complete: false,
            last_acked_seq: None,
        }
    }

    fn matches(&self, src_cpu: u16, src_task: usize) -> bool {
        self.in_use && self.src_cpu == src_cpu && self.src_task == src_task
    }

    fn start(&mut self, frame: &Frame) {
        self.in_use = true;
        self.src_cpu = frame.src_cpu;
        self.src_task = frame.src_task;
        self.src_port = frame.src_port;
        self.seq = frame.seq;
        self.next_frag = 0;
        self.frag_count = frame.frag_count;
        self.len = 0;
        self.complete = false;
    }
}

// ---------------------------------------------------------------------------
// Pending reliable send
// ---------------------------------------------------------------------------

/// What a mailbox's in-flight `sendack` is waiting on. A task has at
/// most one `sendack` outstanding at a time (it blocks synchronously),
/// so this lives directly on the [`Mailbox`] rather than in a table.
#[derive(Clone, Copy)]
struct PendingAck {
    target_cpu: u16,
    target_port: u16,
    seq: u32,
}

/// Outcome of an ack/nack frame landing on a mailbox's pending send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    Nacked,
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

/// Per-task mailbox state: reassembly contexts for inbound messages,
/// a FIFO of fully-reassembled messages awaiting `recv`/`recvack`, and
/// (at most one) pending reliable send.
pub struct Mailbox {
    port: u16,
    next_seq: u32,
    contexts: [ReassemblyContext; MAX_REASSEMBLY_CONTEXTS],
    /// Indices into `contexts` that hold a complete, undelivered message,
    /// oldest first.
    ready: Queue<usize, MAX_REASSEMBLY_CONTEXTS>,
    pending_ack: Option<PendingAck>,
    ack_outcome: Option<AckOutcome>,
    /// Arrivals dropped for this mailbox: unreliable frames that found
    /// every reassembly context busy with a different sender.
    pub drops: u32,
}

impl Mailbox {
    fn new(port: u16) -> Self {
        let mut ready = Queue::new();
        let _ = ready.create(MAX_REASSEMBLY_CONTEXTS);
        Self {
            port,
            next_seq: 0,
            contexts: [ReassemblyContext::empty(); MAX_REASSEMBLY_CONTEXTS],
            ready,
            pending_ack: None,
            ack_outcome: None,
            drops: 0,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn find_context(&self, src_cpu: u16, src_task: usize) -> Option<usize> {
        self.contexts
            .iter()
            .position(|c| c.matches(src_cpu, src_task))
    }

    /// Find a context to (re)use for a new message from `src_cpu`/`src_task`:
    /// the sender's existing context if it has one, else a free slot, else
    /// the oldest idle (already-delivered) one. `None` means every context
    /// is genuinely busy reassembling a different sender's message.
    fn find_or_evict(&mut self, src_cpu: u16, src_task: usize) -> Option<usize> {
        if let Some(i) = self.find_context(src_cpu, src_task) {
            return Some(i);
        }
        if let Some(i) = self.contexts.iter().position(|c| !c.in_use) {
            return Some(i);
        }
        self.contexts.iter().position(|c| c.complete)
    }
}

// ---------------------------------------------------------------------------
// Comm (process-wide messaging state)
// ---------------------------------------------------------------------------

/// Everything [`kernel::recvack`](crate::kernel::recvack) needs to know
/// about a delivered message beyond its payload: who sent it, on what
/// port, and under what sequence number, so it can address an ack frame
/// back and mark the delivery acked.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryMeta {
    pub src_cpu: u16,
    pub src_task: usize,
    pub src_port: u16,
    pub seq: u32,
    pub len: usize,
}

/// Outcome of feeding an inbound [`Frame`] to [`Comm::ingest`]. Carries
/// everything the caller (which owns the scheduler and the link driver)
/// needs to react: who to wake, and what (if anything) to transmit back.
#[derive(Clone, Copy)]
pub enum IngestOutcome {
    /// A full message landed on `task_id`'s mailbox; it's waiting in
    /// `recv`/`recvack` or will find it there when it calls one.
    MessageReady { task_id: usize },
    /// `task_id`'s pending `sendack` was acknowledged.
    AckMatched { task_id: usize },
    /// `task_id`'s pending `sendack` was nacked (buffer full on the
    /// receiver) — it should retry immediately rather than waiting out
    /// its timeout.
    NackMatched { task_id: usize },
    /// Frame accepted (a fragment of a larger message, or a stale/
    /// mismatched ack/nack) with nothing further to do.
    Accepted,
    /// No mailbox bound to the destination port; the frame is dropped
    /// silently, matching the source kernel's behavior (§9 open
    /// questions — resolved in DESIGN.md).
    Dropped,
    /// A duplicate of an already-acked reliable message arrived (the
    /// original ack was lost, not the data); re-transmit `reply` without
    /// redelivering the payload to the task.
    DuplicateAcked { reply: Frame },
    /// Every reassembly context on the destination mailbox is busy with
    /// other senders; `reply` is a NACK to transmit back (reliable
    /// frames only — unreliable overflow is silently dropped instead).
    BufferFullNack { reply: Frame },
}

/// Process-wide messaging state: every mailbox bound on this node.
/// Exactly one instance per node, held behind `kernel::COMM` the same
/// way `Scheduler` is held behind `kernel::SCHEDULER`.
pub struct Comm {
    mailboxes: [Option<Mailbox>; MAX_MAILBOXES],
    local_cpu: u16,
}

impl Comm {
    pub const fn new(local_cpu: u16) -> Self {
        Self {
            mailboxes: [const { None }; MAX_MAILBOXES],
            local_cpu,
        }
    }

    /// Bind `task_id`'s mailbox to `port`. Fails if the task already has
    /// a mailbox, or if `port` is already bound to a different task
    /// (§4.8: a port is owned exclusively by its creator).
    pub fn create(&mut self, task_id: usize, port: u16) -> KernelResult<()> {
        if task_id >= MAX_MAILBOXES {
            return Err(KernelError::BadParam);
        }
        if self.mailboxes[task_id].is_some() {
            return Err(KernelError::CommDupPort);
        }
        if self
            .mailboxes
            .iter()
            .flatten()
            .any(|m| m.port() == port)
        {
            return Err(KernelError::CommDupPort);
        }
        self.mailboxes[task_id] = Some(Mailbox::new(port));
        Ok(())
    }

    /// Tear down `task_id`'s mailbox (on `kill`, §5: "mailbox state torn
    /// down ... atomically").
    pub fn destroy(&mut self, task_id: usize) {
        if task_id < MAX_MAILBOXES {
            self.mailboxes[task_id] = None;
        }
    }

    fn mailbox(&self, task_id: usize) -> KernelResult<&Mailbox> {
        self.mailboxes
            .get(task_id)
            .and_then(|m| m.as_ref())
            .ok_or(KernelError::CommNoMailbox)
    }

    fn mailbox_mut(&mut self, task_id: usize) -> KernelResult<&mut Mailbox> {
        self.mailboxes
            .get_mut(task_id)
            .and_then(|m| m.as_mut())
            .ok_or(KernelError::CommNoMailbox)
    }

    pub fn port_of(&self, task_id: usize) -> KernelResult<u16> {
        Ok(self.mailbox(task_id)?.port())
    }

    /// Allocate the next outbound sequence number for `task_id`'s
    /// mailbox and record it as the `sendack` this task is now waiting
    /// on (cleared by a matching ack/nack or by the caller on final
    /// timeout).
    pub fn begin_send(
        &mut self,
        task_id: usize,
        target_cpu: u16,
        target_port: u16,
        reliable: bool,
    ) -> KernelResult<u32> {
        let mailbox = self.mailbox_mut(task_id)?;
        let seq = mailbox.next_seq;
        mailbox.next_seq = mailbox.next_seq.wrapping_add(1);
        if reliable {
            mailbox.pending_ack = Some(PendingAck {
                target_cpu,
                target_port,
                seq,
            });
            mailbox.ack_outcome = None;
        }
        Ok(seq)
    }

    /// Consume (and clear) the ack/nack outcome for `task_id`'s pending
    /// `sendack`, if one has arrived since the last check.
    pub fn take_ack_outcome(&mut self, task_id: usize) -> Option<AckOutcome> {
        let mailbox = self.mailboxes.get_mut(task_id)?.as_mut()?;
        mailbox.ack_outcome.take()
    }

    pub fn clear_pending_ack(&mut self, task_id: usize) {
        if let Some(Some(mailbox)) = self.mailboxes.get_mut(task_id) {
            mailbox.pending_ack = None;
            mailbox.ack_outcome = None;
        }
    }

    /// Pop the oldest fully-reassembled message for `task_id` into
    /// `out`, returning `(src_cpu, src_task, len)`. `Ok(None)` means
    /// nothing is ready yet — the caller should block.
    pub fn take_ready(
        &mut self,
        task_id: usize,
        out: &mut [u8],
    ) -> KernelResult<Option<(u16, usize, usize)>> {
        Ok(self
            .take_ready_meta(task_id, out)?
            .map(|m| (m.src_cpu, m.src_task, m.len)))
    }

    /// As [`Comm::take_ready`], but also reports the sender's own port
    /// and the message's sequence number — everything `kernel::recvack`
    /// needs to address an ack frame back to the sender and to call
    /// [`Comm::mark_acked`].
    pub fn take_ready_meta(
        &mut self,
        task_id: usize,
        out: &mut [u8],
    ) -> KernelResult<Option<DeliveryMeta>> {
        let mailbox = self.mailbox_mut(task_id)?;
        let Ok(idx) = mailbox.ready.remhead() else {
            return Ok(None);
        };
        let ctx = &mut mailbox.contexts[idx];
        let n = ctx.len.min(out.len());
        out[..n].copy_from_slice(&ctx.buf[..n]);
        let meta = DeliveryMeta {
            src_cpu: ctx.src_cpu,
            src_task: ctx.src_task,
            src_port: ctx.src_port,
            seq: ctx.seq,
            len: n,
        };
        ctx.complete = true; // stays idle/evictable, but `last_acked_seq` (if set by recvack) persists
        Ok(Some(meta))
    }

    /// Record that `task_id`'s `recvack` has just acknowledged the
    /// message most recently handed out by [`Comm::take_ready`] from
    /// `src_cpu`/`src_task`, so a lost-ack retransmit is recognized as a
    /// duplicate instead of being redelivered.
    pub fn mark_acked(&mut self, task_id: usize, src_cpu: u16, src_task: usize, seq: u32) {
        if let Ok(mailbox) = self.mailbox_mut(task_id) {
            if let Some(idx) = mailbox.find_context(src_cpu, src_task) {
                mailbox.contexts[idx].last_acked_seq = Some(seq);
            }
        }
    }

    pub fn local_cpu(&self) -> u16 {
        self.local_cpu
    }

    /// Feed an inbound frame into the protocol state machine. Pure and
    /// side-effect-free beyond `self` — the caller is responsible for
    /// actually transmitting any reply frame and for touching the
    /// scheduler.
    pub fn ingest(&mut self, frame: Frame) -> IngestOutcome {
        match frame.kind {
            FrameKind::Ack | FrameKind::Nack => self.ingest_ack_or_nack(frame),
            FrameKind::Data => self.ingest_data(frame),
        }
    }

    fn ingest_ack_or_nack(&mut self, frame: Frame) -> IngestOutcome {
        for (task_id, slot) in self.mailboxes.iter_mut().enumerate() {
            let Some(mailbox) = slot else { continue };
            if mailbox.port() != frame.dst_port {
                continue;
            }
            let Some(pending) = mailbox.pending_ack else {
                continue;
            };
            if pending.target_cpu != frame.src_cpu
                || pending.target_port != frame.src_port
                || pending.seq != frame.seq
            {
                continue;
            }
            return match frame.kind {
                FrameKind::Ack => {
                    mailbox.ack_outcome = Some(AckOutcome::Acked);
                    IngestOutcome::AckMatched { task_id }
                }
                FrameKind::Nack => {
                    mailbox.ack_outcome = Some(AckOutcome::Nacked);
                    IngestOutcome::NackMatched { task_id }
                }
                FrameKind::Data => unreachable!(),
            };
        }
        IngestOutcome::Accepted
    }

    fn ingest_data(&mut self, frame: Frame) -> IngestOutcome {
        let Some(task_id) = self
            .mailboxes
            .iter()
            .position(|m| m.as_ref().is_some_and(|m| m.port() == frame.dst_port))
        else {
            return IngestOutcome::Dropped;
        };
        let local_cpu = self.local_cpu;
        let mailbox = self.mailboxes[task_id].as_mut().unwrap();

        if frame.frag_index == 0 {
            if let Some(idx) = mailbox.find_context(frame.src_cpu, frame.src_task) {
                if frame.reliable && mailbox.contexts[idx].last_acked_seq == Some(frame.seq) {
                    return IngestOutcome::DuplicateAcked {
                        reply: frame.reply_ack(FrameKind::Ack, local_cpu),
                    };
                }
            }
            let Some(idx) = mailbox.find_or_evict(frame.src_cpu, frame.src_task) else {
                if frame.reliable {
                    return IngestOutcome::BufferFullNack {
                        reply: frame.reply_ack(FrameKind::Nack, local_cpu),
                    };
                }
                mailbox.drops += 1;
                return IngestOutcome::Dropped;
            };
            mailbox.contexts[idx].start(&frame);
        }

        let Some(idx) = mailbox.find_context(frame.src_cpu, frame.src_task) else {
            mailbox.drops += 1;
            return IngestOutcome::Dropped;
        };
        let ctx = &mut mailbox.contexts[idx];
        if ctx.complete || frame.frag_index != ctx.next_frag || frame.seq != ctx.seq {
            // Out-of-order or stale fragment — §5 guarantees in-order
            // delivery per (source, port, channel), so this indicates a
            // duplicate or a context collision; drop rather than corrupt
            // the in-progress reassembly.
            mailbox.drops += 1;
            return IngestOutcome::Dropped;
        }

        let start = ctx.len;
        let end = start + frame.len as usize;
        if end > NOC_REASSEMBLY_SIZE {
            mailbox.drops += 1;
            ctx.in_use = false;
            return if frame.reliable {
                IngestOutcome::BufferFullNack {
                    reply: frame.reply_ack(FrameKind::Nack, local_cpu),
                }
            } else {
                IngestOutcome::Dropped
            };
        }
        ctx.buf[start..end].copy_from_slice(&frame.payload[..frame.len as usize]);
        ctx.len = end;
        ctx.next_frag += 1;

        if ctx.next_frag < ctx.frag_count {
            return IngestOutcome::Accepted;
        }

        ctx.complete = true;
        if mailbox.ready.addtail(idx).is_err() {
            mailbox.drops += 1;
            return IngestOutcome::Dropped;
        }
        IngestOutcome::MessageReady { task_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_message(
        comm: &mut Comm,
        sender: usize,
        receiver_cpu: u16,
        receiver_port: u16,
        buf: &[u8],
        channel: u8,
        reliable: bool,
    ) -> (u32, [Frame; MAX_FRAGMENTS], usize) {
        let src_port = comm.port_of(sender).unwrap();
        let seq = comm
            .begin_send(sender, receiver_cpu, receiver_port, reliable)
            .unwrap();
        let mut frames = [Frame::empty(); MAX_FRAGMENTS];
        let n = fragment_into(
            &mut frames,
            buf,
            comm.local_cpu(),
            sender,
            src_port,
            receiver_cpu,
            receiver_port,
            channel,
            seq,
            reliable,
        )
        .unwrap();
        (seq, frames, n)
    }

    #[test]
    fn create_rejects_duplicate_task_and_duplicate_port() {
        let mut comm = Comm::new(0);
        comm.create(0, 100).unwrap();
        assert_eq!(comm.create(0, 200), Err(KernelError::CommDupPort));
        assert_eq!(comm.create(1, 100), Err(KernelError::CommDupPort));
        assert!(comm.create(1, 200).is_ok());
    }

    #[test]
    fn single_frame_message_delivers_whole() {
        let mut comm = Comm::new(0);
        comm.create(0, 1000).unwrap();
        comm.create(1, 5000).unwrap();

        let (_, frames, n) = send_message(&mut comm, 0, 0, 5000, b"hello", 0, false);
        assert_eq!(n, 1);

        let outcome = comm.ingest(frames[0]);
        assert!(matches!(outcome, IngestOutcome::MessageReady { task_id: 1 }));

        let mut buf = [0u8; 16];
        let (cpu, task, len) = comm.take_ready(1, &mut buf).unwrap().unwrap();
        assert_eq!((cpu, task, &buf[..len]), (0, 0, &b"hello"[..]));
    }

    #[test]
    fn multi_fragment_message_reassembles_in_order() {
        let mut comm = Comm::new(0);
        comm.create(0, 1).unwrap();
        comm.create(1, 2).unwrap();

        let big = [7u8; NOC_FRAME_SIZE * 2 + 10];
        let (_, frames, n) = send_message(&mut comm, 0, 0, 2, &big, 0, false);
        assert!(n >= 3);

        for f in &frames[..n - 1] {
            assert!(matches!(comm.ingest(*f), IngestOutcome::Accepted));
        }
        let outcome = comm.ingest(frames[n - 1]);
        assert!(matches!(outcome, IngestOutcome::MessageReady { task_id: 1 }));

        let mut out = [0u8; NOC_REASSEMBLY_SIZE];
        let (_, _, len) = comm.take_ready(1, &mut out).unwrap().unwrap();
        assert_eq!(len, big.len());
        assert_eq!(&out[..len], &big[..]);
    }

    #[test]
    fn data_with_no_bound_mailbox_is_dropped_silently() {
        let mut comm = Comm::new(0);
        comm.create(0, 1).unwrap();
        let (_, frames, _) = send_message(&mut comm, 0, 0, 9999, b"x", 0, false);
        assert!(matches!(comm.ingest(frames[0]), IngestOutcome::Dropped));
    }

    #[test]
    fn reliable_roundtrip_with_dropped_first_ack_retransmits_once() {
        // Mirrors §8 scenario 5: the sender retransmits once after its
        // first ack is lost, and the receiver observes exactly one
        // delivery despite seeing the data twice.
        let mut sender_comm = Comm::new(2);
        let mut receiver_comm = Comm::new(3);
        sender_comm.create(0, 1000).unwrap();
        receiver_comm.create(0, 5000).unwrap();

        let payload = [42u8; 1500];
        let (seq, frames, n) = send_message(&mut sender_comm, 0, 3, 5000, &payload, 0, true);
        assert!(n > 1);

        // First attempt: every fragment arrives and completes the message.
        let mut last = IngestOutcome::Accepted;
        for f in &frames[..n] {
            last = receiver_comm.ingest(*f);
        }
        assert!(matches!(last, IngestOutcome::MessageReady { task_id: 0 }));

        let mut buf = [0u8; 1600];
        let (cpu, _task, len) = receiver_comm.take_ready(0, &mut buf).unwrap().unwrap();
        assert_eq!((cpu, len), (2, payload.len()));
        receiver_comm.mark_acked(0, 2, 0, seq);

        // The ack receiver_comm would send here is "lost" — sender times
        // out (simulated by the test driving a retry directly) and
        // retransmits the identical message.
        let mut last = IngestOutcome::Accepted;
        let mut redelivered = false;
        for f in &frames[..n] {
            match receiver_comm.ingest(*f) {
                IngestOutcome::DuplicateAcked { reply } => {
                    last = IngestOutcome::DuplicateAcked { reply };
                }
                IngestOutcome::MessageReady { .. } => redelivered = true,
                other => last = other,
            }
        }
        assert!(!redelivered, "duplicate must not be redelivered to the task");
        let IngestOutcome::DuplicateAcked { reply } = last else {
            panic!("expected a re-acked duplicate, got something else");
        };
        assert_eq!(reply.kind, FrameKind::Ack);
        assert_eq!(reply.seq, seq);

        // Sender applies the (re-sent) ack and is satisfied.
        let outcome = sender_comm.ingest(reply);
        assert!(matches!(outcome, IngestOutcome::AckMatched { task_id: 0 }));
        assert_eq!(sender_comm.take_ack_outcome(0), Some(AckOutcome::Acked));
    }

    #[test]
    fn buffer_full_reliable_frame_is_nacked_not_silently_dropped() {
        let mut comm = Comm::new(0);
        comm.create(0, 1).unwrap();
        comm.create(1, 2).unwrap();

        // Fill every reassembly context with a distinct in-progress
        // (not yet complete) sender so the context table has no free
        // or evictable slot left.
        for sender_task in 100..100 + MAX_REASSEMBLY_CONTEXTS {
            let frame = Frame {
                kind: FrameKind::Data,
                src_cpu: 9,
                src_task: sender_task,
                src_port: 1,
                dst_cpu: 0,
                dst_port: 2,
                channel: 0,
                seq: 1,
                frag_index: 0,
                frag_count: 2, // never completes within this test
                reliable: true,
                len: 4,
                payload: [0u8; NOC_FRAME_SIZE],
            };
            assert!(matches!(comm.ingest(frame), IngestOutcome::Accepted));
        }

        let overflow = Frame {
            kind: FrameKind::Data,
            src_cpu: 9,
            src_task: 999,
            src_port: 1,
            dst_cpu: 0,
            dst_port: 2,
            channel: 0,
            seq: 1,
            frag_index: 0,
            frag_count: 1,
            reliable: true,
            len: 4,
            payload: [0u8; NOC_FRAME_SIZE],
        };
        let outcome = comm.ingest(overflow);
        assert!(matches!(outcome, IngestOutcome::BufferFullNack { .. }));
    }

    #[test]
    fn destroy_frees_the_port_for_reuse() {
        let mut comm = Comm::new(0);
        comm.create(0, 42).unwrap();
        comm.destroy(0);
        assert!(comm.create(1, 42).is_ok());
    }
}
