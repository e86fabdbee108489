//! # HellfireOS Configuration
//!
//! Compile-time constants governing the scheduler, messaging layer, and
//! heap size. All limits are fixed at compile time — no dynamic allocation
//! is used for kernel-internal bookkeeping (the heap in `heap.rs` is a
//! separate, explicitly-managed region offered to tasks).

/// Maximum number of tasks the system can manage simultaneously.
/// This bounds the static TCB array. Increase with care — each task
/// consumes `STACK_SIZE` bytes of RAM.
pub const MAX_TASKS: usize = 16;

/// SysTick frequency in Hz. Determines scheduler tick granularity.
/// Higher values give finer scheduling precision at the cost of
/// increased interrupt overhead.
pub const TICK_HZ: u32 = 1000;

/// Time slice in ticks for best-effort tasks that do not specify their
/// own. `0` disables preemptive slicing entirely (tasks only give up
/// the CPU by yielding, blocking, or being preempted by a higher-priority
/// real-time job).
pub const TIME_SLICE: u32 = 10;

/// Per-task stack size in bytes. Must be large enough for the
/// deepest call chain plus the hardware exception frame (32 bytes)
/// and the software-saved context (32 bytes for R4–R11).
pub const STACK_SIZE: usize = 1024;

/// Number of processor cores per node. HellfireOS nodes are single-core;
/// parallelism across the system comes from multiple nodes on the NoC,
/// not from SMP within one node (see non-goals).
pub const MAX_CORES: usize = 1;

/// Number of ticks a best-effort task can be passed over before its
/// dynamic `priority_rem` is temporarily boosted to prevent starvation
/// under sustained real-time load. See DESIGN.md for the open-question
/// resolution on aging reset semantics.
pub const AGING_THRESHOLD: u32 = 50;

/// Per-aging-window priority boost applied to a starved best-effort task.
pub const AGING_BOOST: i32 = 1;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Size in bytes of the statically reserved kernel heap (`krnl_heap`)
/// managed by the first-fit allocator in `heap.rs`.
pub const HEAP_SIZE: usize = 16 * 1024;

/// Minimum allocation granularity in the kernel heap; requested sizes
/// are rounded up to a multiple of this so block headers stay aligned.
pub const HEAP_ALIGN: usize = 8;

/// Payload size in bytes of a single NoC link-layer frame. Messages
/// larger than this are fragmented into multiple frames by `noc::send`.
pub const NOC_FRAME_SIZE: usize = 256;

/// Maximum reassembled message size per mailbox, in bytes. Frames that
/// would grow a reassembly beyond this are dropped (unreliable) or
/// NACKed (reliable) — see `noc::mailbox`.
pub const NOC_REASSEMBLY_SIZE: usize = 1536;

/// Maximum number of mailboxes (distinct `(task_id, port)` bindings)
/// live at once on a node.
pub const MAX_MAILBOXES: usize = MAX_TASKS;

/// Maximum number of in-flight reassembly contexts tracked concurrently
/// per mailbox (distinct remote `(cpu, task)` senders).
pub const MAX_REASSEMBLY_CONTEXTS: usize = 4;

/// Number of retransmissions attempted by `sendack` before giving up
/// and returning `CommTimeout`.
pub const NOC_RETRY_LIMIT: u8 = 3;

/// Maximum length, in bytes, of a task's immutable name label.
pub const TASK_NAME_LEN: usize = 16;

/// Maximum number of aperiodic job descriptors the `aperiodic_queue`
/// can hold awaiting service by the polling server.
pub const MAX_APERIODIC: usize = MAX_TASKS;

/// This node's identity on the NoC (`hf_cpuid()`). Distinct nodes in a
/// multi-node build set this to their own slot; a single-node build (or
/// the host test harness) leaves the default.
pub const NODE_CPU_ID: u16 = 0;
