//! # Kernel
//!
//! Top-level HellfireOS initialization and public API. The kernel owns
//! three process-wide singletons — the [`Scheduler`], the [`Comm`]
//! messaging state, and the [`Heap`] — behind raw pointers and a
//! critical section, exactly the pattern `SCHEDULER_PTR` establishes
//! for ISR access. Every public function here is the thing application
//! tasks actually call; `scheduler.rs`/`noc.rs`/`heap.rs` only know
//! about their own bookkeeping.
//!
//! ## Startup sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel::init()                ← singletons + heap arena
//!         ├─► kernel::spawn(...) ×N          ← application tasks
//!         ├─► kernel::set_link_driver(...)   ← optional NoC hookup
//!         └─► kernel::start(cp)              ← launch scheduler, no return
//!               ├─► spawn the built-in idle task
//!               ├─► configure SysTick, interrupt priorities
//!               └─► arch::start_first_task()
//! ```
//!
//! Boot takes `schedlock(true)` before the idle task is spawned and
//! releases it only once the idle task has actually been dispatched,
//! mirroring the source kernel's "lock until the first task is really
//! running" boot discipline (§10.5) so no tick-driven reschedule can
//! run ahead of a fully populated task table.

use crate::arch::cortex_m4;
use crate::errors::{KernelError, KernelResult};
use crate::heap::Heap;
use crate::noc::{Comm, DeliveryMeta, Frame, IngestOutcome, MAX_FRAGMENTS};
use crate::scheduler::Scheduler;
use crate::sync;
use crate::task::{TaskEntry, TaskState};

/// A function that actually puts a [`Frame`] onto the NoC hardware.
/// Stands in for the physical link layer, which lives outside this
/// crate: this crate only ever hands it a fully formed frame and
/// forgets about it.
pub type LinkDriver = fn(Frame);

// ---------------------------------------------------------------------------
// Global singletons
// ---------------------------------------------------------------------------

static mut SCHEDULER: Scheduler = Scheduler::new();
static mut COMM: Option<Comm> = None;
static mut HEAP: Heap = Heap::new();
static mut LINK_DRIVER: Option<LinkDriver> = None;

/// Raw pointer to the global scheduler, read from `arch::cortex_m4`'s
/// PendSV/SysTick handlers, which cannot hold a Rust reference across
/// an exception boundary.
///
/// # Safety
/// Set once during [`init`]; every access afterward happens either
/// inside a critical section or from ISR context, where priority
/// ordering already serializes it.
#[no_mangle]
pub static mut SCHEDULER_PTR: *mut Scheduler = core::ptr::null_mut();

/// Obtain the scheduler pointer from ISR/arch context. Only ever called
/// from `arch::cortex_m4`'s exception handlers, which already run with
/// interrupts effectively serialized by priority.
///
/// # Safety
/// Must only be called after [`init`].
pub unsafe fn scheduler_from_isr() -> &'static mut Scheduler {
    &mut *SCHEDULER_PTR
}

fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    sync::critical_section(|_cs| unsafe { f(&mut *SCHEDULER_PTR) })
}

#[allow(static_mut_refs)]
fn with_comm<R>(f: impl FnOnce(&mut Comm) -> R) -> R {
    sync::critical_section(|_cs| unsafe { f(COMM.as_mut().expect("kernel::init() not called")) })
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Initialize the kernel: reset the scheduler, bind the NoC messaging
/// state to this node's `hf_cpuid()`, and lay down the kernel heap's
/// initial free block. Must be called exactly once, before any other
/// kernel function, from the main thread.
pub fn init() {
    unsafe {
        SCHEDULER = Scheduler::new();
        SCHEDULER.reset();
        SCHEDULER_PTR = &mut SCHEDULER as *mut Scheduler;
        COMM = Some(Comm::new(crate::config::NODE_CPU_ID));
        HEAP.init();
    }
}

/// Register the function used to actually transmit a [`Frame`] onto
/// the NoC hardware. Without one, [`send`]/[`sendack`] fall back to
/// looping a frame straight back into [`on_frame_received`] — useful
/// for a single-node build or host-side tests, never for a real
/// multi-node system.
pub fn set_link_driver(driver: LinkDriver) {
    unsafe {
        LINK_DRIVER = Some(driver);
    }
}

fn transmit(frame: Frame) {
    let driver = unsafe { LINK_DRIVER };
    match driver {
        Some(f) => f(frame),
        None => on_frame_received(frame),
    }
}

// ---------------------------------------------------------------------------
// Task lifecycle (§4.2)
// ---------------------------------------------------------------------------

/// Spawn a task with an implicit deadline (`deadline == period`).
/// `period == 0` spawns a best-effort task; `period > 0` spawns a
/// real-time task subject to the admission schedulability test.
pub fn spawn(
    entry: TaskEntry,
    period: u32,
    priority: u8,
    capacity: u32,
    name: &str,
) -> KernelResult<usize> {
    with_scheduler(|s| s.spawn(entry, period, priority, capacity, name, crate::config::STACK_SIZE))
}

/// Spawn a real-time task with an explicit deadline distinct from its
/// period.
pub fn spawn_with_deadline(
    entry: TaskEntry,
    period: u32,
    priority: u8,
    capacity: u32,
    deadline: u32,
    name: &str,
) -> KernelResult<usize> {
    with_scheduler(|s| {
        s.spawn_with_deadline(
            entry,
            period,
            priority,
            capacity,
            deadline,
            name,
            crate::config::STACK_SIZE,
        )
    })
}

/// Designate `task_id` (already spawned as a real-time task) as the
/// polling server that services aperiodic arrivals (§4.5).
pub fn make_polling_server(task_id: usize) -> KernelResult<()> {
    with_scheduler(|s| s.make_polling_server(task_id))
}

/// Submit an aperiodic job for the polling server to run on behalf of
/// `task_id` (already spawned best-effort). `deadline_ticks` is
/// relative to the current tick, if given.
pub fn submit_aperiodic(
    task_id: usize,
    capacity: u32,
    deadline_ticks: Option<u32>,
) -> KernelResult<()> {
    with_scheduler(|s| s.submit_aperiodic(task_id, capacity, deadline_ticks))
}

/// Tear down a task: release its TCB slot and its mailbox, if any.
pub fn kill(task_id: usize) -> KernelResult<()> {
    with_scheduler(|s| s.kill(task_id))?;
    with_comm(|c| c.destroy(task_id));
    Ok(())
}

/// This node's identity on the NoC (`hf_cpuid()`, §6.1).
pub fn cpu_id() -> u16 {
    with_comm(|c| c.local_cpu())
}

/// The currently running task's id (`hf_selfid()`, §6.1).
pub fn self_id() -> usize {
    with_scheduler(|s| s.current)
}

/// Called by `arch::cortex_m4`'s return trampoline when a task's entry
/// function returns instead of looping forever: the task is torn down
/// exactly as if it had called `kill(self_id())`, then a reschedule is
/// requested.
pub fn task_entry_returned() {
    let id = self_id();
    let _ = kill(id);
    cortex_m4::trigger_pendsv();
}

// ---------------------------------------------------------------------------
// Voluntary CPU surrender (§4.2, §4.6)
// ---------------------------------------------------------------------------

/// Voluntarily yield the CPU. Moves the current task to the tail of its
/// eligible queue and triggers PendSV; `schedule()` (run there, after
/// this task's context is saved) decides what actually runs next.
pub fn yield_task() {
    with_scheduler(|s| s.yield_current());
    cortex_m4::trigger_pendsv();
}

/// Sleep the current task for `ticks` (§4.6). Returns once the residual
/// delay has elapsed and the task has been rescheduled. `0` is a no-op.
pub fn delay_ms(ticks: u32) {
    if ticks == 0 {
        return;
    }
    with_scheduler(|s| s.delay_current(ticks));
    cortex_m4::trigger_pendsv();
}

/// Engage (`true`) or release (`false`) the scheduler lock (§5):
/// suppresses preemption without masking interrupts. Nests; each
/// `true` must be balanced by a `false`.
pub fn schedlock(engage: bool) {
    with_scheduler(|s| s.schedlock(engage));
}

// ---------------------------------------------------------------------------
// Messaging (§4.8)
// ---------------------------------------------------------------------------

/// Bind the current task's mailbox to `port` (`hf_comm_create`).
pub fn comm_create(port: u16) -> KernelResult<()> {
    let id = self_id();
    with_comm(|c| c.create(id, port))
}

/// Send `buf` to `(dst_cpu, dst_port)` without waiting for
/// acknowledgment (`hf_send`, §4.8). Fragments transparently if `buf`
/// exceeds a single frame's payload.
pub fn send(dst_cpu: u16, dst_port: u16, channel: u8, buf: &[u8]) -> KernelResult<()> {
    send_inner(dst_cpu, dst_port, channel, buf, false).map(|_| ())
}

fn send_inner(
    dst_cpu: u16,
    dst_port: u16,
    channel: u8,
    buf: &[u8],
    reliable: bool,
) -> KernelResult<u32> {
    let task_id = self_id();
    let src_port = with_comm(|c| c.port_of(task_id))?;
    let local_cpu = with_comm(|c| c.local_cpu());
    let seq = with_comm(|c| c.begin_send(task_id, dst_cpu, dst_port, reliable))?;

    let mut frames = [Frame::empty(); MAX_FRAGMENTS];
    let n = crate::noc::fragment_into(
        &mut frames, buf, local_cpu, task_id, src_port, dst_cpu, dst_port, channel, seq, reliable,
    )?;
    for frame in &frames[..n] {
        transmit(*frame);
    }
    Ok(seq)
}

/// Convert a millisecond duration to a tick count at [`crate::config::TICK_HZ`]
/// (§4.6's `delay_ms` conversion, reused here for `sendack`'s per-attempt
/// deadline).
fn ms_to_ticks(ms: u32) -> u64 {
    (u64::from(ms) * u64::from(crate::config::TICK_HZ)) / 1000
}

/// Send `buf` and block until the receiver's `recvack` acknowledges it,
/// retransmitting up to [`crate::config::NOC_RETRY_LIMIT`] times on
/// timeout or NACK (`hf_sendack`, §4.8, §6.1). Each attempt waits up to
/// `timeout_ms` for the ack before retransmitting.
pub fn sendack(
    dst_cpu: u16,
    dst_port: u16,
    channel: u8,
    buf: &[u8],
    timeout_ms: u32,
) -> KernelResult<()> {
    let task_id = self_id();
    let timeout_ticks = ms_to_ticks(timeout_ms);
    for _attempt in 0..=crate::config::NOC_RETRY_LIMIT {
        send_inner(dst_cpu, dst_port, channel, buf, true)?;

        let deadline = with_scheduler(|s| s.pcb.tick_count + timeout_ticks);
        loop {
            if let Some(outcome) = with_comm(|c| c.take_ack_outcome(task_id)) {
                with_comm(|c| c.clear_pending_ack(task_id));
                match outcome {
                    crate::noc::AckOutcome::Acked => return Ok(()),
                    crate::noc::AckOutcome::Nacked => break, // retry below
                }
            }
            if with_scheduler(|s| s.tasks[task_id].timed_out) {
                break;
            }
            with_scheduler(|s| s.block_current_until(Some(deadline)));
            cortex_m4::trigger_pendsv();
        }
    }
    with_comm(|c| c.clear_pending_ack(task_id));
    Err(KernelError::CommTimeout)
}

/// Receive the next message on the current task's mailbox into `out`,
/// blocking until one arrives (`hf_recv`, §4.8). Returns the sender's
/// `(cpu, task)` and how many bytes were written.
pub fn recv(out: &mut [u8]) -> KernelResult<(u16, usize, usize)> {
    recv_inner(out, None).map(|m| (m.src_cpu, m.src_task, m.len))
}

/// As [`recv`], but gives up after `timeout_ticks` with
/// `KernelError::CommTimeout` if nothing arrives.
pub fn recv_timeout(out: &mut [u8], timeout_ticks: u32) -> KernelResult<(u16, usize, usize)> {
    recv_inner(out, Some(timeout_ticks)).map(|m| (m.src_cpu, m.src_task, m.len))
}

fn recv_inner(out: &mut [u8], timeout_ticks: Option<u32>) -> KernelResult<DeliveryMeta> {
    let task_id = self_id();
    loop {
        if let Some(meta) = with_comm(|c| c.take_ready_meta(task_id, out))? {
            return Ok(meta);
        }
        if with_scheduler(|s| s.tasks[task_id].timed_out) {
            return Err(KernelError::CommTimeout);
        }
        let deadline = timeout_ticks.map(|t| with_scheduler(|s| s.pcb.tick_count + u64::from(t)));
        with_scheduler(|s| s.block_current_until(deadline));
        cortex_m4::trigger_pendsv();
    }
}

/// Receive the next message like [`recv`], then transmit an ACK frame
/// back to the sender before returning (`hf_recvack`, §4.8) — the
/// receiver-side half of a reliable `sendack` exchange.
pub fn recvack(out: &mut [u8]) -> KernelResult<(u16, usize, usize)> {
    let task_id = self_id();
    let meta = recv_inner(out, None)?;
    with_comm(|c| c.mark_acked(task_id, meta.src_cpu, meta.src_task, meta.seq));
    let local_cpu = with_comm(|c| c.local_cpu());
    let own_port = with_comm(|c| c.port_of(task_id))?;
    let ack = Frame::ack(local_cpu, own_port, meta.src_cpu, meta.src_port, 0, meta.seq);
    transmit(ack);
    Ok((meta.src_cpu, meta.src_task, meta.len))
}

/// Feed an inbound frame (received from the NoC hardware, or looped
/// back by the default [`transmit`]) into the messaging state machine
/// and react to the outcome: unblock a waiting task, or transmit a
/// reply frame.
pub fn on_frame_received(frame: Frame) {
    let outcome = with_comm(|c| c.ingest(frame));
    match outcome {
        IngestOutcome::MessageReady { task_id }
        | IngestOutcome::AckMatched { task_id }
        | IngestOutcome::NackMatched { task_id } => {
            with_scheduler(|s| {
                let _ = s.unblock(task_id);
            });
            cortex_m4::trigger_pendsv();
        }
        IngestOutcome::DuplicateAcked { reply } | IngestOutcome::BufferFullNack { reply } => {
            transmit(reply);
        }
        IngestOutcome::Accepted | IngestOutcome::Dropped => {}
    }
}

// ---------------------------------------------------------------------------
// Heap (§4.7)
// ---------------------------------------------------------------------------

/// Allocate `n` bytes from the kernel heap (`hf_malloc`).
#[allow(static_mut_refs)]
pub fn malloc(n: usize) -> Option<core::ptr::NonNull<u8>> {
    sync::critical_section(|_cs| unsafe { HEAP.malloc(n) })
}

/// Allocate `count * size` zero-initialized bytes (`hf_calloc`).
#[allow(static_mut_refs)]
pub fn calloc(count: usize, size: usize) -> Option<core::ptr::NonNull<u8>> {
    sync::critical_section(|_cs| unsafe { HEAP.calloc(count, size) })
}

/// Resize a previous allocation (`hf_realloc`).
///
/// # Safety
/// `ptr`, if `Some`, must have been returned by a previous
/// `malloc`/`calloc`/`realloc` call and not already freed.
#[allow(static_mut_refs)]
pub unsafe fn realloc(
    ptr: Option<core::ptr::NonNull<u8>>,
    n: usize,
) -> Option<core::ptr::NonNull<u8>> {
    sync::critical_section(|_cs| unsafe { HEAP.realloc(ptr, n) })
}

/// Free a previous allocation (`hf_free`).
///
/// # Safety
/// `ptr` must have been returned by a previous `malloc`/`calloc`/
/// `realloc` call and not already freed.
#[allow(static_mut_refs)]
pub unsafe fn free(ptr: core::ptr::NonNull<u8>) {
    sync::critical_section(|_cs| unsafe { HEAP.free(ptr) });
}

// ---------------------------------------------------------------------------
// Boot
// ---------------------------------------------------------------------------

extern "C" fn idle_task_entry() {
    loop {
        cortex_m4::cpu_idle();
    }
}

/// Start the kernel. **Does not return.** Spawns the built-in idle
/// task, configures SysTick and interrupt priorities, and launches the
/// first task via `arch::cortex_m4::start_first_task`.
///
/// # Safety
/// [`init`] must have already run, and this must not be called again.
pub fn start(mut core_peripherals: cortex_m::Peripherals) -> ! {
    with_scheduler(|s| {
        s.schedlock(true);
        let id = s
            .spawn(idle_task_entry, 0, 0, 0, "idle", crate::config::STACK_SIZE)
            .unwrap_or_else(|_| crate::errors::panic(crate::errors::PanicCode::AbortedOnInit));
        s.idle_id = id;
        s.current = id;
        s.tasks[id].state = TaskState::Running;
    });

    cortex_m4::configure_systick(&mut core_peripherals.SYST);
    cortex_m4::set_interrupt_priorities();

    with_scheduler(|s| s.schedlock(false));

    let first_sp = with_scheduler(|s| {
        s.tasks[s.current]
            .stack_pointer
            .expect("idle task stack not initialized")
    });

    unsafe {
        cortex_m4::start_first_task(first_sp);
    }
}
