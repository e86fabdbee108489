//! # Task Control Block
//!
//! Defines the task model for HellfireOS. Every schedulable unit — the
//! built-in idle task, real-time periodic tasks, best-effort tasks, and
//! the aperiodic jobs the polling server runs on their behalf — is
//! represented by a [`TaskControlBlock`] living in a fixed-size array
//! inside the [`crate::scheduler::Scheduler`]. There is no heap
//! allocation in this module: each TCB owns its stack inline.

use crate::config::{STACK_SIZE, TASK_NAME_LEN};

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task (§3).
///
/// ```text
///        spawn()                    preempted / time slice expired
///   ┌────────────┐  dispatch   ┌─────────┐ ───────────────────► ┌───────┐
///   │    Ready    │ ──────────►│ Running │                      │ Ready │
///   └────────────┘             └─────────┘ ◄─────────────────── └───────┘
///         ▲                        │  │
///         │ delay elapses          │  │ delay_ms()
///         │                        │  ▼
///   ┌────────────┐            ┌─────────┐
///   │   Delayed  │◄───────────┤ Delayed │
///   └────────────┘            └─────────┘
///         ▲                        │
///         │ unblock()              │ recv*() with no message ready
///         │                        ▼
///   ┌────────────┐            ┌─────────┐
///   │   Blocked  │◄───────────┤ Blocked │
///   └────────────┘            └─────────┘
/// ```
///
/// `Idle` is not a point on that diagram: it marks a TCB slot as free,
/// the state every slot starts and ends in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Slot is unused; `id` in this position may be reassigned by `spawn`.
    Idle,
    /// Eligible to run, waiting in its ready queue (`run_queue` or
    /// `rt_queue` depending on whether the task is real-time).
    Ready,
    /// Currently executing on the CPU. Exactly one TCB has this state
    /// outside the scheduler's critical section.
    Running,
    /// Blocked on a mailbox receive; not present in any ready queue.
    /// Woken by `unblock`.
    Blocked,
    /// Sleeping in `delay_queue` with a positive residual delay.
    Delayed,
}

/// A task's entry point. Unlike the hosting C kernel's `void (*)(void)`
/// convention, this may return: per the design note on task lifetimes,
/// a returning entry transitions its task to `Idle` and triggers a
/// reschedule instead of looping forever or invoking undefined behavior.
pub type TaskEntry = extern "C" fn();

// ---------------------------------------------------------------------------
// Real-time parameters
// ---------------------------------------------------------------------------

/// Real-time scheduling parameters for a periodic task (§3).
///
/// Only meaningful when `period > 0`; best-effort tasks (`period == 0`)
/// carry a zeroed `RtParams` and are scheduled by the best-effort tier
/// instead (§4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct RtParams {
    /// Period in ticks. `0` means "not a real-time task".
    pub period: u32,
    /// CPU ticks budgeted per period.
    pub capacity: u32,
    /// Ticks from period start by which the job must complete.
    pub deadline: u32,
    /// Ticks of `capacity` left in the current job.
    pub capacity_rem: u32,
    /// Ticks left until `deadline` in the current period.
    pub deadline_rem: u32,
    /// Ticks elapsed since the current period started. Wraps to `0`
    /// (and releases a new job) once it reaches `period`.
    pub period_ticks: u32,
}

impl RtParams {
    /// `true` if `capacity <= deadline <= period`, the admission
    /// invariant from §3.
    pub fn well_formed(&self) -> bool {
        self.period > 0 && self.capacity <= self.deadline && self.deadline <= self.period
    }
}

// ---------------------------------------------------------------------------
// Task name
// ---------------------------------------------------------------------------

/// A short immutable task label, stored inline (no heap, no `&'static str`
/// lifetime requirement on the caller).
#[derive(Debug, Clone, Copy)]
pub struct TaskName {
    bytes: [u8; TASK_NAME_LEN],
    len: usize,
}

impl TaskName {
    pub const fn empty() -> Self {
        Self {
            bytes: [0; TASK_NAME_LEN],
            len: 0,
        }
    }

    /// Build a name from a `&str`, silently truncating to `TASK_NAME_LEN`
    /// bytes (matching the source kernel's fixed `char name[...]` field).
    pub fn new(s: &str) -> Self {
        let mut bytes = [0u8; TASK_NAME_LEN];
        let n = s.len().min(TASK_NAME_LEN);
        bytes[..n].copy_from_slice(&s.as_bytes()[..n]);
        Self { bytes, len: n }
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block — the central data structure for each task (§3).
///
/// Stored inline in a static `[TaskControlBlock; MAX_TASKS]` array owned
/// by the scheduler. No TCB is ever heap-allocated; `stack` is a fixed
/// byte region living inside the TCB for the task's entire lifetime.
pub struct TaskControlBlock {
    /// Index of this TCB in the scheduler's task array. Stable for the
    /// life of a given occupant; reused once the slot returns to `Idle`.
    pub id: usize,
    /// Immutable label set at `spawn` time.
    pub name: TaskName,
    /// Current execution state.
    pub state: TaskState,
    /// Task body, invoked once on first dispatch.
    pub entry: Option<TaskEntry>,
    /// Saved process stack pointer. `None` until the task's initial
    /// context has been prepared by `arch::init_task_stack`.
    pub stack_pointer: Option<*mut u32>,
    /// Per-task stack memory, aligned for the AAPCS exception frame.
    pub stack: [u8; STACK_SIZE],
    /// Real-time parameters; zeroed for best-effort tasks.
    pub rt: RtParams,
    /// Static admission priority for best-effort tasks, or the
    /// RMA-derived dynamic priority for real-time tasks (§4.4).
    pub priority: u8,
    /// Dynamic priority used for best-effort aging (§4.4). Starts equal
    /// to `priority` and is temporarily boosted when this task has been
    /// passed over `AGING_THRESHOLD` consecutive scheduling decisions;
    /// reset to `priority` once the task is selected to run.
    pub priority_rem: i32,
    /// Number of real-time jobs completed without a deadline miss.
    pub rtjobs: u32,
    /// Number of best-effort dispatches (times this task was picked by
    /// the best-effort tier).
    pub bgjobs: u32,
    /// Cumulative count of missed deadlines.
    pub deadline_misses: u32,
    /// Ticks remaining until this task is moved back to a ready queue.
    /// `0` means "not delayed".
    pub delay: u32,
    /// Consecutive scheduling decisions in which this (ready) task was
    /// passed over. Drives best-effort aging.
    pub passed_over: u32,
    /// Absolute tick at which a `Blocked` task (waiting in `recv`/`recvack`/
    /// `sendack`) should be force-woken with a timeout, if any. `None`
    /// blocks indefinitely (plain `recv` with no deadline). Unused outside
    /// `TaskState::Blocked`.
    pub wake_deadline: Option<u64>,
    /// Set by the dispatcher when a `wake_deadline` elapses before the
    /// condition the task was waiting on was satisfied. Consulted (and
    /// cleared) by the caller once rescheduled.
    pub timed_out: bool,
}

// Safety: `stack_pointer` always points into this TCB's own `stack`
// array (or is produced by `arch::init_task_stack`, which does the
// same). All access happens inside a critical section or from ISR
// context, where accesses are already serialized.
unsafe impl Send for TaskControlBlock {}
unsafe impl Sync for TaskControlBlock {}

impl TaskControlBlock {
    /// An empty (unallocated) TCB, used to fill the static array at boot.
    pub const fn empty() -> Self {
        Self {
            id: 0,
            name: TaskName::empty(),
            state: TaskState::Idle,
            entry: None,
            stack_pointer: None,
            stack: [0u8; STACK_SIZE],
            rt: RtParams {
                period: 0,
                capacity: 0,
                deadline: 0,
                capacity_rem: 0,
                deadline_rem: 0,
                period_ticks: 0,
            },
            priority: 0,
            priority_rem: 0,
            rtjobs: 0,
            bgjobs: 0,
            deadline_misses: 0,
            delay: 0,
            passed_over: 0,
            wake_deadline: None,
            timed_out: false,
        }
    }

    /// Initialize a free slot for a newly spawned task. Does not prepare
    /// the stack frame — that's `arch::init_task_stack`'s job once the
    /// entry point and stack memory are known.
    pub fn init(
        &mut self,
        id: usize,
        name: TaskName,
        entry: TaskEntry,
        priority: u8,
        rt: RtParams,
    ) {
        self.id = id;
        self.name = name;
        self.state = TaskState::Ready;
        self.entry = Some(entry);
        self.stack_pointer = None;
        self.rt = rt;
        self.priority = priority;
        self.priority_rem = priority as i32;
        self.rtjobs = 0;
        self.bgjobs = 0;
        self.deadline_misses = 0;
        self.delay = 0;
        self.passed_over = 0;
        self.wake_deadline = None;
        self.timed_out = false;
    }

    /// Return this slot to `Idle`, releasing its identity for reuse.
    /// Stack memory is not cleared (cheap, and about to be reinitialized
    /// by the next occupant's `init`).
    pub fn reset(&mut self) {
        self.state = TaskState::Idle;
        self.entry = None;
        self.stack_pointer = None;
        self.rt = RtParams::default();
        self.wake_deadline = None;
        self.timed_out = false;
    }

    /// `true` if this slot holds a real-time (periodic) task.
    #[inline]
    pub fn is_realtime(&self) -> bool {
        self.rt.period > 0
    }

    /// `true` if this slot is occupied (not `Idle`).
    #[inline]
    pub fn is_active(&self) -> bool {
        self.state != TaskState::Idle
    }

    /// Note a passed-over scheduling decision and apply the aging boost
    /// once `threshold` consecutive misses have accumulated.
    pub fn age(&mut self, threshold: u32, boost: i32) {
        self.passed_over += 1;
        if self.passed_over >= threshold {
            self.priority_rem += boost;
        }
    }

    /// Reset aging state on selection: restore the base priority and
    /// clear the passed-over counter.
    pub fn reset_aging(&mut self) {
        self.priority_rem = self.priority as i32;
        self.passed_over = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn dummy() {}

    #[test]
    fn empty_slot_is_idle_and_inactive() {
        let tcb = TaskControlBlock::empty();
        assert_eq!(tcb.state, TaskState::Idle);
        assert!(!tcb.is_active());
    }

    #[test]
    fn init_marks_ready_and_seeds_aging() {
        let mut tcb = TaskControlBlock::empty();
        tcb.init(3, TaskName::new("worker"), dummy, 5, RtParams::default());
        assert_eq!(tcb.state, TaskState::Ready);
        assert!(tcb.is_active());
        assert!(!tcb.is_realtime());
        assert_eq!(tcb.priority_rem, 5);
        assert_eq!(tcb.name.as_str(), "worker");
    }

    #[test]
    fn realtime_params_well_formed() {
        let rt = RtParams {
            period: 10,
            capacity: 3,
            deadline: 10,
            capacity_rem: 3,
            deadline_rem: 10,
            period_ticks: 0,
        };
        assert!(rt.well_formed());

        let bad = RtParams {
            period: 10,
            capacity: 11,
            deadline: 10,
            capacity_rem: 0,
            deadline_rem: 0,
            period_ticks: 0,
        };
        assert!(!bad.well_formed());
    }

    #[test]
    fn aging_boosts_after_threshold_and_resets_on_selection() {
        let mut tcb = TaskControlBlock::empty();
        tcb.init(0, TaskName::new("bg"), dummy, 2, RtParams::default());
        for _ in 0..5 {
            tcb.age(5, 1);
        }
        assert_eq!(tcb.priority_rem, 3);
        tcb.reset_aging();
        assert_eq!(tcb.priority_rem, 2);
        assert_eq!(tcb.passed_over, 0);
    }

    #[test]
    fn name_truncates_to_limit() {
        let long = "a_name_that_is_definitely_too_long_for_the_field";
        let name = TaskName::new(long);
        assert_eq!(name.as_str().len(), TASK_NAME_LEN);
    }

    #[test]
    fn reset_returns_slot_to_idle() {
        let mut tcb = TaskControlBlock::empty();
        tcb.init(1, TaskName::new("x"), dummy, 1, RtParams::default());
        tcb.reset();
        assert_eq!(tcb.state, TaskState::Idle);
        assert!(tcb.entry.is_none());
    }
}
