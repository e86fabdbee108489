//! # Scheduler
//!
//! The two-tier HellfireOS scheduler (§4.4): a rate-monotonic real-time
//! tier sits above a priority + round-robin best-effort tier, with a
//! polling server (§4.5) lending the real-time tier's CPU budget to
//! aperiodic arrivals. This module owns every piece of process-wide
//! mutable state the kernel needs — the TCB table, the PCB, and the
//! four scheduling queues — behind a single [`Scheduler`] struct that
//! `kernel.rs` stores as a critical-section-guarded global singleton.
//!
//! ## Per-tick flow (§4.3)
//!
//! 1. Account for the ticks just spent by the running task.
//! 2. Decrement `delay_queue` residuals; move expired ones to their
//!    ready queue.
//! 3. Advance every real-time task's period clock; release new jobs and
//!    flag deadline misses on period boundaries.
//! 4. Age waiting best-effort tasks to prevent starvation.
//! 5. Flag `needs_reschedule`; leave picking the next task to
//!    [`Scheduler::schedule`], invoked later from PendSV.
//!
//! `tick`, `yield_current`, `delay_current`, and `block_current_until`
//! only ever touch queues and flags, never `current` — `schedule()` is
//! the single place that reads the outgoing task, picks a successor,
//! and advances `current`, and it only ever runs from
//! `arch::cortex_m4`'s `do_context_switch`, strictly after the outgoing
//! context has been saved from the not-yet-advanced `current`. Calling
//! it anywhere else would let a second dispatch run against a TCB the
//! first dispatch already moved on from.
//!
//! The actual register save/restore lives in `arch::cortex_m4` — this
//! module only ever manipulates TCB bookkeeping, never raw stacks.

use crate::config::{AGING_BOOST, AGING_THRESHOLD, MAX_APERIODIC, MAX_TASKS};
use crate::errors::{KernelError, KernelResult};
use crate::queue::{ConstDefault, Queue};
use crate::task::{RtParams, TaskControlBlock, TaskEntry, TaskName, TaskState};

// ---------------------------------------------------------------------------
// Process Control Block
// ---------------------------------------------------------------------------

/// Real-time tier scheduling policy. Rate-monotonic is the only
/// implementation today; the field exists because the PCB models the
/// RT selector as swappable (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtPolicy {
    RateMonotonic,
}

/// Best-effort tier scheduling policy, likewise modeled as swappable
/// even though priority + round-robin is the only implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BePolicy {
    PriorityRoundRobin,
}

/// Process-wide counters and selectors (§3).
pub struct Pcb {
    pub sched_rt: RtPolicy,
    pub sched_be: BePolicy,
    pub tick_count: u64,
    pub coop_cswitch: u64,
    pub preempt_cswitch: u64,
    pub interrupts: u64,
    pub cpu_time: u64,
    /// Scheduler lock depth. `schedlock(1)` increments, `schedlock(0)`
    /// decrements; preemption (but not interrupts) is suppressed while
    /// this is non-zero.
    pub lock_depth: u32,
}

impl Pcb {
    pub const fn new() -> Self {
        Self {
            sched_rt: RtPolicy::RateMonotonic,
            sched_be: BePolicy::PriorityRoundRobin,
            tick_count: 0,
            coop_cswitch: 0,
            preempt_cswitch: 0,
            interrupts: 0,
            cpu_time: 0,
            lock_depth: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Aperiodic job descriptors (§4.5)
// ---------------------------------------------------------------------------

/// An aperiodic arrival waiting on the polling server's `aperiodic_queue`.
///
/// `task_id` names an already-spawned TCB (one-shot, best-effort
/// classed) whose body is the aperiodic work; the server lends it CPU
/// time out of its own real-time budget instead of scheduling it
/// through the ordinary best-effort tier.
#[derive(Debug, Clone, Copy)]
pub struct AperiodicJob {
    pub task_id: usize,
    /// Ticks of work remaining for this job. Decremented (and the job
    /// possibly split) each time the server dispatches it.
    pub capacity_rem: u32,
    /// Absolute tick deadline, if the arrival specified one.
    pub deadline: Option<u64>,
}

impl ConstDefault for AperiodicJob {
    const DEFAULT_VALUE: Self = Self {
        task_id: 0,
        capacity_rem: 0,
        deadline: None,
    };
}

/// Tracks the aperiodic job currently being run under the polling
/// server's budget, spanning however many ticks it takes to either
/// finish or exhaust the server's fuel for this period.
struct ActiveDispatch {
    task_id: usize,
    ticks_left: u32,
    /// `true` if finishing `ticks_left` completes the whole job (and
    /// the task should be torn down); `false` if the job was split and
    /// the remainder was pushed back onto the queue.
    full_completion: bool,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// The kernel's central scheduling state (§3). Exactly one instance
/// exists per node, held behind `kernel::SCHEDULER`.
pub struct Scheduler {
    pub tasks: [TaskControlBlock; MAX_TASKS],
    pub pcb: Pcb,
    /// Id of the task currently occupying the CPU. Always valid once
    /// `init()` has spawned the idle task.
    pub current: usize,
    /// Id of the built-in idle task, set once at boot.
    pub idle_id: usize,
    /// Id of the task acting as the polling server, if one has been
    /// created via [`Scheduler::make_polling_server`].
    pub polling_server: Option<usize>,
    pub server_fuel: u32,
    active_dispatch: Option<ActiveDispatch>,

    pub run_queue: Queue<usize, MAX_TASKS>,
    pub rt_queue: Queue<usize, MAX_TASKS>,
    pub delay_queue: Queue<usize, MAX_TASKS>,
    pub aperiodic_queue: Queue<AperiodicJob, MAX_APERIODIC>,

    /// Aperiodic arrivals dropped because the queue was full or their
    /// deadline had already passed by the time the server reached them.
    pub aperiodic_drops: u32,

    /// Set by [`Scheduler::schedule`] (directly or via `tick`) whenever
    /// the selected task differs from the one that was running; the
    /// arch layer consults this to decide whether to fire PendSV.
    pub needs_reschedule: bool,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            tasks: [TaskControlBlock::empty(); MAX_TASKS],
            pcb: Pcb::new(),
            current: 0,
            idle_id: 0,
            polling_server: None,
            server_fuel: 0,
            active_dispatch: None,
            run_queue: Queue::new(),
            rt_queue: Queue::new(),
            delay_queue: Queue::new(),
            aperiodic_queue: Queue::new(),
            aperiodic_drops: 0,
            needs_reschedule: false,
        }
    }

    /// Reset to a freshly booted state: clear every TCB, re-create the
    /// queues at `MAX_TASKS`/`MAX_APERIODIC` capacity, and reset the PCB.
    /// Mirrors `clear_tcb`/`clear_pcb`/`init_queues` in the source boot
    /// sequence.
    pub fn reset(&mut self) {
        for t in self.tasks.iter_mut() {
            *t = TaskControlBlock::empty();
        }
        self.pcb = Pcb::new();
        self.current = 0;
        self.idle_id = 0;
        self.polling_server = None;
        self.server_fuel = 0;
        self.active_dispatch = None;
        let _ = self.run_queue.create(MAX_TASKS);
        let _ = self.rt_queue.create(MAX_TASKS);
        let _ = self.delay_queue.create(MAX_TASKS);
        let _ = self.aperiodic_queue.create(MAX_APERIODIC);
        self.aperiodic_drops = 0;
        self.needs_reschedule = false;
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.tasks.iter().position(|t| !t.is_active())
    }

    // -----------------------------------------------------------------
    // Task lifecycle (§4.2)
    // -----------------------------------------------------------------

    /// Spawn a task. `period == 0` admits a best-effort task to
    /// `run_queue`; `period > 0` admits a real-time task whose implicit
    /// deadline equals its period (see DESIGN.md for the explicit-
    /// deadline variant) and whose admission is subject to the
    /// schedulability test in [`Scheduler::would_be_schedulable`].
    pub fn spawn(
        &mut self,
        entry: TaskEntry,
        period: u32,
        priority: u8,
        capacity: u32,
        name: &str,
        stack_size: usize,
    ) -> KernelResult<usize> {
        self.spawn_with_deadline(entry, period, priority, capacity, period, name, stack_size)
    }

    /// As [`Scheduler::spawn`], but with an explicit `deadline` instead
    /// of assuming the implicit-deadline convention `deadline == period`.
    pub fn spawn_with_deadline(
        &mut self,
        entry: TaskEntry,
        period: u32,
        priority: u8,
        capacity: u32,
        deadline: u32,
        name: &str,
        _stack_size: usize,
    ) -> KernelResult<usize> {
        let id = self.find_free_slot().ok_or(KernelError::NoSlot)?;

        let rt = if period > 0 {
            let rt = RtParams {
                period,
                capacity,
                deadline,
                capacity_rem: capacity,
                deadline_rem: deadline,
                period_ticks: 0,
            };
            if !rt.well_formed() {
                return Err(KernelError::BadParam);
            }
            if !self.would_be_schedulable(period, capacity, deadline) {
                return Err(KernelError::Unschedulable);
            }
            rt
        } else {
            RtParams::default()
        };

        self.tasks[id].init(id, TaskName::new(name), entry, priority, rt);
        crate::arch::cortex_m4::init_task_stack(&mut self.tasks[id], entry);

        if period > 0 {
            self.rt_queue.addtail(id).map_err(|_| KernelError::NoSlot)?;
            self.recompute_rma();
        } else {
            self.run_queue.addtail(id).map_err(|_| KernelError::NoSlot)?;
        }
        Ok(id)
    }

    /// Designate an already-spawned real-time task as the polling
    /// server. Fails if one already exists or `task_id` is not a
    /// real-time task.
    pub fn make_polling_server(&mut self, task_id: usize) -> KernelResult<()> {
        if self.polling_server.is_some() {
            return Err(KernelError::BadParam);
        }
        if task_id >= MAX_TASKS || !self.tasks[task_id].is_realtime() {
            return Err(KernelError::BadParam);
        }
        self.polling_server = Some(task_id);
        self.server_fuel = self.tasks[task_id].rt.capacity;
        Ok(())
    }

    /// Submit an aperiodic job to be serviced by the polling server.
    /// `task_id` must already be spawned as a best-effort task; this
    /// parks it (state `Blocked`, membership in no ready queue) until
    /// the server dispatches it. Drops the arrival (incrementing
    /// `aperiodic_drops`) if the queue is already full.
    pub fn submit_aperiodic(
        &mut self,
        task_id: usize,
        capacity: u32,
        deadline_ticks: Option<u32>,
    ) -> KernelResult<()> {
        if task_id >= MAX_TASKS || self.tasks[task_id].is_realtime() {
            return Err(KernelError::BadParam);
        }
        let deadline = deadline_ticks.map(|d| self.pcb.tick_count + d as u64);
        let job = AperiodicJob {
            task_id,
            capacity_rem: capacity,
            deadline,
        };
        if self.aperiodic_queue.addtail(job).is_err() {
            self.aperiodic_drops += 1;
            self.tasks[task_id].reset();
            return Err(KernelError::CommBufferFull);
        }
        self.tasks[task_id].state = TaskState::Blocked;
        Ok(())
    }

    /// Tear down a task: remove it from every queue it could be a
    /// member of, release its identity, and — if it was real-time —
    /// recompute RMA priorities for the tasks that remain.
    pub fn kill(&mut self, id: usize) -> KernelResult<()> {
        if id >= MAX_TASKS || !self.tasks[id].is_active() {
            return Err(KernelError::BadParam);
        }
        if self.idle_id == id {
            return Err(KernelError::BadParam);
        }
        let was_rt = self.tasks[id].is_realtime();
        remove_id(&mut self.run_queue, id);
        remove_id(&mut self.rt_queue, id);
        remove_id(&mut self.delay_queue, id);
        if self.polling_server == Some(id) {
            self.polling_server = None;
        }
        self.tasks[id].reset();
        if was_rt {
            self.recompute_rma();
        }
        Ok(())
    }

    /// Voluntary yield (§4.2): the current task moves to the tail of
    /// its eligible queue. Only bookkeeping — does not touch `current`
    /// or pick a successor. The caller (`kernel::yield_task`) triggers
    /// PendSV unconditionally afterward; `schedule()` runs there, once
    /// the outgoing context has been saved.
    pub fn yield_current(&mut self) {
        let id = self.current;
        if self.tasks[id].state != TaskState::Running {
            return;
        }
        self.tasks[id].state = TaskState::Ready;
        self.pcb.coop_cswitch += 1;
        if self.tasks[id].is_realtime() {
            let _ = ensure_queued(&mut self.rt_queue, id);
        } else {
            self.tasks[id].reset_aging();
            let _ = ensure_queued(&mut self.run_queue, id);
        }
        self.needs_reschedule = true;
    }

    /// Block the current task (used by `recv`/`recvack` with nothing
    /// to reassemble yet). Removed from every ready queue; woken only
    /// by [`Scheduler::unblock`] or, if `deadline` is given, by the
    /// dispatcher once `pcb.tick_count` reaches it (§4.8's `sendack`
    /// timeout and a bounded `recv*`).
    ///
    /// `deadline` is an absolute tick count, not a relative one — callers
    /// compute it as `pcb.tick_count + ticks`.
    pub fn block_current_until(&mut self, deadline: Option<u64>) {
        let id = self.current;
        self.tasks[id].state = TaskState::Blocked;
        self.tasks[id].wake_deadline = deadline;
        self.tasks[id].timed_out = false;
        self.needs_reschedule = true;
    }

    /// Wake a blocked task, returning it to its eligible ready queue.
    /// Bookkeeping only — the woken task does not become `current`
    /// until `schedule()` (inside PendSV) next runs.
    pub fn unblock(&mut self, id: usize) -> KernelResult<()> {
        if id >= MAX_TASKS || self.tasks[id].state != TaskState::Blocked {
            return Err(KernelError::BadParam);
        }
        self.tasks[id].state = TaskState::Ready;
        self.tasks[id].wake_deadline = None;
        if self.tasks[id].is_realtime() {
            self.rt_queue.addtail(id).map_err(|_| KernelError::NoSlot)?;
        } else {
            self.tasks[id].reset_aging();
            self.run_queue.addtail(id).map_err(|_| KernelError::NoSlot)?;
        }
        self.needs_reschedule = true;
        Ok(())
    }

    /// Scan every `Blocked` task with an elapsed `wake_deadline` and force
    /// it back to `Ready` with `timed_out` set. Called once per tick,
    /// symmetric to [`Scheduler::tick_delay_queue`] but over blocked
    /// (not delayed) tasks, since a blocked task is not a member of
    /// `delay_queue`.
    fn tick_blocked_timeouts(&mut self) {
        for i in 0..MAX_TASKS {
            if self.tasks[i].state != TaskState::Blocked {
                continue;
            }
            let Some(deadline) = self.tasks[i].wake_deadline else {
                continue;
            };
            if self.pcb.tick_count < deadline {
                continue;
            }
            self.tasks[i].state = TaskState::Ready;
            self.tasks[i].wake_deadline = None;
            self.tasks[i].timed_out = true;
            if self.tasks[i].is_realtime() {
                let _ = ensure_queued(&mut self.rt_queue, i);
            } else {
                self.tasks[i].reset_aging();
                let _ = ensure_queued(&mut self.run_queue, i);
            }
        }
    }

    /// Put the current task to sleep for `ticks` (§4.6). `0` is a no-op.
    pub fn delay_current(&mut self, ticks: u32) {
        if ticks == 0 {
            return;
        }
        let id = self.current;
        self.tasks[id].state = TaskState::Delayed;
        self.tasks[id].delay = ticks;
        let _ = self.delay_queue.addtail(id);
        self.needs_reschedule = true;
    }

    // -----------------------------------------------------------------
    // Scheduler lock (§5)
    // -----------------------------------------------------------------

    /// `schedlock(true)` suppresses preemption (but not interrupts);
    /// `schedlock(false)` releases one level.
    pub fn schedlock(&mut self, engage: bool) {
        if engage {
            self.pcb.lock_depth += 1;
        } else if self.pcb.lock_depth > 0 {
            self.pcb.lock_depth -= 1;
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.pcb.lock_depth > 0
    }

    // -----------------------------------------------------------------
    // Tick-driven accounting and dispatch (§4.3)
    // -----------------------------------------------------------------

    /// Called from the SysTick handler every tick. Performs accounting
    /// and delay/period bookkeeping, then flags a reschedule — unless
    /// the scheduler lock is held, in which case dispatch is deferred
    /// until `schedlock(false)`. Never calls `schedule()` itself: the
    /// actual dispatch happens inside PendSV's `do_context_switch`,
    /// after the outgoing task's context has been saved from the
    /// still-unchanged `current`.
    pub fn tick(&mut self) {
        self.pcb.tick_count += 1;
        self.pcb.interrupts += 1;

        self.account_running_task();
        self.tick_delay_queue();
        self.tick_blocked_timeouts();
        self.tick_rt_periods();

        self.needs_reschedule = !self.is_locked();
    }

    fn account_running_task(&mut self) {
        let cur = self.current;
        if !self.tasks[cur].is_active() {
            return;
        }
        self.pcb.cpu_time += 1;

        if self.tasks[cur].is_realtime() && self.tasks[cur].rt.capacity_rem > 0 {
            self.tasks[cur].rt.capacity_rem -= 1;
        }

        if let Some(disp) = self.active_dispatch.as_mut() {
            if disp.task_id == cur {
                if disp.ticks_left > 0 {
                    disp.ticks_left -= 1;
                }
                if disp.ticks_left == 0 {
                    let full = disp.full_completion;
                    let task_id = disp.task_id;
                    self.active_dispatch = None;
                    if full {
                        self.tasks[task_id].reset();
                    } else {
                        self.tasks[task_id].state = TaskState::Blocked;
                    }
                }
            }
        }
    }

    fn tick_delay_queue(&mut self) {
        let n = self.delay_queue.count();
        for _ in 0..n {
            let Ok(id) = self.delay_queue.remhead() else {
                break;
            };
            if self.tasks[id].delay > 0 {
                self.tasks[id].delay -= 1;
            }
            if self.tasks[id].delay == 0 {
                self.tasks[id].state = TaskState::Ready;
                if self.tasks[id].is_realtime() {
                    let _ = self.rt_queue.addtail(id);
                } else {
                    self.tasks[id].reset_aging();
                    let _ = self.run_queue.addtail(id);
                }
            } else {
                let _ = self.delay_queue.addtail(id);
            }
        }
    }

    fn tick_rt_periods(&mut self) {
        for i in 0..MAX_TASKS {
            if !self.tasks[i].is_active() || !self.tasks[i].is_realtime() {
                continue;
            }
            let is_server = self.polling_server == Some(i);

            self.tasks[i].rt.period_ticks += 1;

            // The polling server's own "deadline" is a scheduling
            // fiction (§4.5): its budget is spent through the aperiodic
            // jobs it lends CPU time to, not by the server task itself
            // ever running, so the generic capacity-rem miss check
            // below does not apply to it.
            if !is_server && self.tasks[i].rt.deadline_rem > 0 {
                self.tasks[i].rt.deadline_rem -= 1;
                if self.tasks[i].rt.deadline_rem == 0 {
                    if self.tasks[i].rt.capacity_rem > 0 {
                        self.tasks[i].deadline_misses += 1;
                    } else {
                        self.tasks[i].rtjobs += 1;
                    }
                }
            }

            if self.tasks[i].rt.period_ticks >= self.tasks[i].rt.period {
                self.tasks[i].rt.period_ticks = 0;
                self.tasks[i].rt.capacity_rem = self.tasks[i].rt.capacity;
                self.tasks[i].rt.deadline_rem = self.tasks[i].rt.deadline;

                if is_server {
                    self.server_fuel = self.tasks[i].rt.capacity;
                }

                let schedulable_state =
                    matches!(self.tasks[i].state, TaskState::Ready | TaskState::Running);
                if schedulable_state {
                    let _ = ensure_queued(&mut self.rt_queue, i);
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // RMA priority assignment (§4.4)
    // -----------------------------------------------------------------

    /// Recompute RMA priorities for every active real-time task: sort
    /// by period ascending (ties by task id) and assign decreasing
    /// priority numbers, so the smallest period gets the highest
    /// priority value.
    pub fn recompute_rma(&mut self) {
        let mut ids = [0usize; MAX_TASKS];
        let mut n = 0;
        for i in 0..MAX_TASKS {
            if self.tasks[i].is_active() && self.tasks[i].is_realtime() {
                ids[n] = i;
                n += 1;
            }
        }
        let slice = &mut ids[..n];
        // Insertion sort: n <= MAX_TASKS, comfortably small.
        for a in 1..n {
            let mut b = a;
            while b > 0
                && (self.tasks[slice[b]].rt.period, slice[b])
                    < (self.tasks[slice[b - 1]].rt.period, slice[b - 1])
            {
                slice.swap(b, b - 1);
                b -= 1;
            }
        }
        for (rank, &id) in slice.iter().enumerate() {
            let priority = (n - rank) as u8;
            self.tasks[id].priority = priority;
            self.tasks[id].priority_rem = priority as i32;
        }
    }

    /// Exact response-time schedulability test (§4.4): would the whole
    /// RT task set, including a hypothetical new task with the given
    /// parameters, still meet every deadline under RMA?
    pub fn would_be_schedulable(&self, period: u32, capacity: u32, deadline: u32) -> bool {
        #[derive(Clone, Copy, Default)]
        struct Job {
            period: u64,
            capacity: u64,
            deadline: u64,
            id: i64,
        }

        let mut jobs = [Job::default(); MAX_TASKS + 1];
        let mut n = 0;
        for i in 0..MAX_TASKS {
            if self.tasks[i].is_active() && self.tasks[i].is_realtime() {
                jobs[n] = Job {
                    period: self.tasks[i].rt.period as u64,
                    capacity: self.tasks[i].rt.capacity as u64,
                    deadline: self.tasks[i].rt.deadline as u64,
                    id: i as i64,
                };
                n += 1;
            }
        }
        jobs[n] = Job {
            period: period as u64,
            capacity: capacity as u64,
            deadline: deadline as u64,
            id: -1,
        };
        n += 1;

        jobs[..n].sort_unstable_by_key(|j| (j.period, j.id));

        for k in 0..n {
            let mut r = jobs[k].capacity;
            loop {
                let mut next_r = jobs[k].capacity;
                for h in 0..k {
                    next_r += r.div_ceil(jobs[h].period) * jobs[h].capacity;
                }
                if next_r == r {
                    break;
                }
                r = next_r;
                if r > jobs[k].deadline {
                    return false;
                }
            }
            if r > jobs[k].deadline {
                return false;
            }
        }
        true
    }

    // -----------------------------------------------------------------
    // Polling server (§4.5)
    // -----------------------------------------------------------------

    /// If the server has work in progress, keep running it. Otherwise
    /// pop the next eligible job (dropping any whose deadline has
    /// already passed), dispatch it for as much of its remaining
    /// capacity as the server's fuel allows, and return its task id.
    /// Returns `None` if there is no fuel left or the queue is empty —
    /// "the server yields immediately" (§4.5).
    fn service_polling_server(&mut self) -> Option<usize> {
        if let Some(disp) = &self.active_dispatch {
            return Some(disp.task_id);
        }
        if self.server_fuel == 0 {
            return None;
        }
        loop {
            let mut job = self.aperiodic_queue.remhead().ok()?;
            if let Some(dl) = job.deadline {
                if self.pcb.tick_count > dl {
                    self.aperiodic_drops += 1;
                    self.tasks[job.task_id].reset();
                    continue;
                }
            }
            let task_id = job.task_id;
            if self.server_fuel >= job.capacity_rem {
                self.server_fuel -= job.capacity_rem;
                self.active_dispatch = Some(ActiveDispatch {
                    task_id,
                    ticks_left: job.capacity_rem,
                    full_completion: true,
                });
            } else {
                let granted = self.server_fuel;
                job.capacity_rem -= granted;
                self.server_fuel = 0;
                let _ = self.aperiodic_queue.addtail(job);
                self.active_dispatch = Some(ActiveDispatch {
                    task_id,
                    ticks_left: granted,
                    full_completion: false,
                });
            }
            self.tasks[task_id].state = TaskState::Running;
            return Some(task_id);
        }
    }

    // -----------------------------------------------------------------
    // Two-tier dispatch (§4.4)
    // -----------------------------------------------------------------

    /// Select (and mark) the next task to run. Real-time tier first,
    /// then best-effort, then the idle task as the final fallback.
    /// Returns the chosen task's id; also updates `self.current`.
    pub fn schedule(&mut self) -> usize {
        let prev = self.current;

        let next = match self.pick_rt_candidate(prev) {
            Some((winner, _)) if Some(winner) == self.polling_server => {
                match self.service_polling_server() {
                    Some(job_task) => job_task,
                    None => self.age_and_pick_be(prev).unwrap_or(self.idle_id),
                }
            }
            Some((winner, idx)) => {
                if let Some(i) = idx {
                    let _ = self.rt_queue.remove_at(i);
                }
                winner
            }
            None => self.age_and_pick_be(prev).unwrap_or(self.idle_id),
        };

        self.transition(prev, next);
        self.current = next;
        next
    }

    /// Peek (without dequeuing) the best real-time candidate: either
    /// the currently running RT task with capacity left, or the
    /// highest-(priority, then earliest deadline_rem, then lowest id)
    /// entry in `rt_queue`.
    fn pick_rt_candidate(&self, prev: usize) -> Option<(usize, Option<usize>)> {
        let mut best: Option<(usize, Option<usize>)> = None;

        if self.tasks[prev].state == TaskState::Running
            && self.tasks[prev].is_realtime()
            && self.tasks[prev].rt.capacity_rem > 0
        {
            best = Some((prev, None));
        }

        for i in 0..self.rt_queue.count() {
            let Ok(id) = self.rt_queue.get(i) else {
                break;
            };
            let better = match best {
                None => true,
                Some((b, _)) => rt_priority_better(&self.tasks[id], &self.tasks[b]),
            };
            if better {
                best = Some((id, Some(i)));
            }
        }
        best
    }

    /// Age every waiting best-effort task, then pick (and dequeue) the
    /// winner: the currently running best-effort task if nothing beats
    /// it, or the highest-`priority_rem` entry in `run_queue` (earliest
    /// arrival wins ties, giving round-robin fairness within a
    /// priority class).
    fn age_and_pick_be(&mut self, prev: usize) -> Option<usize> {
        let prev_running_be =
            self.tasks[prev].state == TaskState::Running && !self.tasks[prev].is_realtime();

        let mut best: Option<usize> = if prev_running_be { Some(prev) } else { None };
        let mut best_idx: Option<usize> = None;

        for i in 0..self.run_queue.count() {
            let Ok(id) = self.run_queue.get(i) else {
                break;
            };
            let better = match best {
                None => true,
                Some(b) if b == prev => self.tasks[id].priority_rem >= self.tasks[b].priority_rem,
                Some(b) => self.tasks[id].priority_rem > self.tasks[b].priority_rem,
            };
            if better {
                best = Some(id);
                best_idx = Some(i);
            }
        }

        for i in 0..self.run_queue.count() {
            let Ok(id) = self.run_queue.get(i) else {
                break;
            };
            if Some(id) != best {
                self.tasks[id].age(AGING_THRESHOLD, AGING_BOOST);
            }
        }

        if let Some(w) = best {
            if w != prev {
                if let Some(idx) = best_idx {
                    let _ = self.run_queue.remove_at(idx);
                }
            }
        }
        best
    }

    /// Apply the state transition implied by switching from `prev` to
    /// `next`: requeue `prev` if it's still eligible, mark `next`
    /// running, and update PCB/task counters.
    fn transition(&mut self, prev: usize, next: usize) {
        if prev == next {
            return;
        }
        if self.tasks[prev].state == TaskState::Running {
            self.tasks[prev].state = TaskState::Ready;
            self.pcb.preempt_cswitch += 1;
            if self.tasks[prev].is_realtime() {
                let _ = ensure_queued(&mut self.rt_queue, prev);
            } else {
                let _ = ensure_queued(&mut self.run_queue, prev);
            }
        }
        self.tasks[next].state = TaskState::Running;
        self.tasks[next].reset_aging();
        if next != self.idle_id && !self.tasks[next].is_realtime() {
            self.tasks[next].bgjobs += 1;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Compare two real-time TCBs for dispatch preference (§4.4): higher
/// `priority` wins; ties broken by earlier `deadline_rem`, then by
/// lower task id.
fn rt_priority_better(a: &TaskControlBlock, b: &TaskControlBlock) -> bool {
    if a.priority != b.priority {
        a.priority > b.priority
    } else if a.rt.deadline_rem != b.rt.deadline_rem {
        a.rt.deadline_rem < b.rt.deadline_rem
    } else {
        a.id < b.id
    }
}

/// Remove `id` from `queue` if present, scanning by logical index.
fn remove_id<const N: usize>(queue: &mut Queue<usize, N>, id: usize) {
    let mut i = 0;
    while i < queue.count() {
        match queue.get(i) {
            Ok(v) if v == id => {
                let _ = queue.remove_at(i);
                return;
            }
            _ => i += 1,
        }
    }
}

/// Add `id` to the tail of `queue` unless it's already a member.
fn ensure_queued<const N: usize>(queue: &mut Queue<usize, N>, id: usize) -> Result<(), ()> {
    for i in 0..queue.count() {
        if queue.get(i) == Ok(id) {
            return Ok(());
        }
    }
    queue.addtail(id).map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn dummy() {}

    fn boot() -> Scheduler {
        let mut s = Scheduler::new();
        s.reset();
        let idle = s.spawn(dummy, 0, 0, 0, "idle", 256).unwrap();
        s.idle_id = idle;
        s.current = idle;
        s.tasks[idle].state = TaskState::Running;
        s
    }

    /// Mirrors the real SysTick → PendSV handoff: `tick()` only flags
    /// `needs_reschedule`, and `schedule()` runs afterward, as it would
    /// inside `do_context_switch` once the outgoing context is saved.
    fn tick_and_dispatch(s: &mut Scheduler) {
        s.tick();
        if s.needs_reschedule {
            s.schedule();
        }
    }

    #[test]
    fn idle_only_system_runs_idle_forever() {
        let mut s = boot();
        for _ in 0..1000 {
            tick_and_dispatch(&mut s);
            assert_eq!(s.current, s.idle_id);
        }
        assert_eq!(s.pcb.tick_count, 1000);
        assert_eq!(s.tasks[s.idle_id].deadline_misses, 0);
    }

    #[test]
    fn single_periodic_task_releases_exactly_on_period() {
        let mut s = boot();
        let t = s.spawn(dummy, 10, 5, 3, "periodic", 256).unwrap();
        for _ in 0..100 {
            tick_and_dispatch(&mut s);
        }
        assert!(s.tasks[t].rt.capacity_rem <= s.tasks[t].rt.capacity);
        assert_eq!(s.tasks[t].deadline_misses, 0);
    }

    #[test]
    fn rma_assigns_higher_priority_to_shorter_period() {
        let mut s = boot();
        let a = s.spawn(dummy, 5, 1, 2, "a", 256).unwrap();
        let b = s.spawn(dummy, 10, 1, 3, "b", 256).unwrap();
        assert!(s.tasks[a].priority > s.tasks[b].priority);
    }

    #[test]
    fn unschedulable_admission_is_rejected() {
        let mut s = boot();
        s.spawn(dummy, 10, 1, 8, "a", 256).unwrap();
        let res = s.spawn(dummy, 10, 1, 8, "b", 256);
        assert_eq!(res, Err(KernelError::Unschedulable));
    }

    #[test]
    fn bad_param_rejected_when_capacity_exceeds_deadline() {
        let mut s = boot();
        let res = s.spawn_with_deadline(dummy, 10, 1, 8, 5, "bad", 256);
        assert_eq!(res, Err(KernelError::BadParam));
    }

    #[test]
    fn kill_frees_the_slot_for_reuse() {
        let mut s = boot();
        let t = s.spawn(dummy, 0, 1, 0, "temp", 256).unwrap();
        s.kill(t).unwrap();
        let t2 = s.spawn(dummy, 0, 1, 0, "temp2", 256).unwrap();
        assert_eq!(t, t2);
    }

    #[test]
    fn delay_then_tick_requeues_after_residual_elapses() {
        let mut s = boot();
        let t = s.spawn(dummy, 0, 1, 0, "sleeper", 256).unwrap();
        s.current = t;
        s.tasks[t].state = TaskState::Running;
        s.delay_current(5);
        assert_eq!(s.tasks[t].state, TaskState::Delayed);
        for _ in 0..4 {
            s.tick_delay_queue();
            assert_eq!(s.tasks[t].state, TaskState::Delayed);
        }
        s.tick_delay_queue();
        assert_eq!(s.tasks[t].state, TaskState::Ready);
    }

    #[test]
    fn delay_ordering_shorter_delay_ready_first() {
        let mut s = boot();
        let long = s.spawn(dummy, 0, 1, 0, "long", 256).unwrap();
        let short = s.spawn(dummy, 0, 1, 0, "short", 256).unwrap();
        s.tasks[long].state = TaskState::Running;
        s.current = long;
        s.delay_current(50);
        s.tasks[short].state = TaskState::Running;
        s.current = short;
        s.delay_current(10);

        for _ in 0..10 {
            s.tick_delay_queue();
        }
        assert_eq!(s.tasks[short].state, TaskState::Ready);
        assert_eq!(s.tasks[long].state, TaskState::Delayed);

        for _ in 0..40 {
            s.tick_delay_queue();
        }
        assert_eq!(s.tasks[long].state, TaskState::Ready);
    }

    #[test]
    fn polling_server_services_aperiodic_arrivals() {
        let mut s = boot();
        let server = s.spawn(dummy, 20, 10, 6, "server", 256).unwrap();
        s.make_polling_server(server).unwrap();

        let mut jobs = [0usize; 3];
        for j in jobs.iter_mut() {
            let id = s.spawn(dummy, 0, 0, 0, "job", 256).unwrap();
            s.submit_aperiodic(id, 2, None).unwrap();
            *j = id;
        }

        for _ in 0..20 {
            tick_and_dispatch(&mut s);
        }

        for &j in &jobs {
            assert!(!s.tasks[j].is_active(), "aperiodic job should have completed");
        }
        assert_eq!(s.server_fuel, 0);
    }

    #[test]
    fn aperiodic_queue_full_increments_drop_counter() {
        let mut s = boot();
        let server = s.spawn(dummy, 20, 10, 1, "server", 256).unwrap();
        s.make_polling_server(server).unwrap();
        let _ = s.aperiodic_queue.create(1);
        let j1 = s.spawn(dummy, 0, 0, 0, "a", 256).unwrap();
        s.submit_aperiodic(j1, 1, None).unwrap();
        let j2 = s.spawn(dummy, 0, 0, 0, "b", 256).unwrap();
        assert!(s.submit_aperiodic(j2, 1, None).is_err());
        assert_eq!(s.aperiodic_drops, 1);
    }

    #[test]
    fn best_effort_aging_boosts_starved_task() {
        let mut s = boot();
        let hog = s.spawn(dummy, 0, 5, 0, "hog", 256).unwrap();
        let starved = s.spawn(dummy, 0, 1, 0, "starved", 256).unwrap();
        s.tasks[hog].state = TaskState::Running;
        s.current = hog;
        for _ in 0..(AGING_THRESHOLD + 1) {
            s.age_and_pick_be(hog);
        }
        assert!(s.tasks[starved].priority_rem > s.tasks[starved].priority as i32);
    }

    #[test]
    fn blocked_task_times_out_and_is_requeued() {
        let mut s = boot();
        let t = s.spawn(dummy, 0, 1, 0, "waiter", 256).unwrap();
        s.current = t;
        s.tasks[t].state = TaskState::Running;
        let deadline = s.pcb.tick_count + 5;
        s.block_current_until(Some(deadline));
        assert_eq!(s.tasks[t].state, TaskState::Blocked);
        for _ in 0..4 {
            s.tick();
            assert_eq!(s.tasks[t].state, TaskState::Blocked);
            assert!(!s.tasks[t].timed_out);
        }
        s.tick();
        assert_eq!(s.tasks[t].state, TaskState::Ready);
        assert!(s.tasks[t].timed_out);
    }

    #[test]
    fn unblock_before_timeout_clears_deadline() {
        let mut s = boot();
        let t = s.spawn(dummy, 0, 1, 0, "waiter", 256).unwrap();
        s.current = t;
        s.tasks[t].state = TaskState::Running;
        s.block_current_until(Some(s.pcb.tick_count + 100));
        s.unblock(t).unwrap();
        assert_eq!(s.tasks[t].state, TaskState::Ready);
        assert!(s.tasks[t].wake_deadline.is_none());
        assert!(!s.tasks[t].timed_out);
    }

    #[test]
    fn schedulability_liu_layland_style_case_admits() {
        let mut s = boot();
        assert!(s.spawn(dummy, 5, 1, 2, "a", 256).is_ok());
        assert!(s.spawn(dummy, 10, 1, 3, "b", 256).is_ok());
    }
}
