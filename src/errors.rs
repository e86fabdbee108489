//! # Error and panic taxonomies
//!
//! The kernel never uses a bare integer error code internally; every
//! fallible operation returns a [`KernelError`] through [`KernelResult`].
//! Fatal conditions (§5, §7) go through [`panic`] with a [`PanicCode`]
//! instead of unwinding — HellfireOS has no unwinder and no recovery
//! path for a corrupted kernel.

#[cfg(feature = "defmt-log")]
use defmt::Format;

/// Taxonomy of recoverable kernel errors (§7).
///
/// `OK` from the source taxonomy is simply `Result::Ok` in this port;
/// there is no corresponding variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(Format))]
pub enum KernelError {
    /// No free TCB slot (`MAX_TASKS` reached).
    NoSlot,
    /// Heap exhausted for a kernel-internal allocation.
    Oom,
    /// A parameter violated an invariant (e.g. `capacity > deadline`).
    BadParam,
    /// Admission-time schedulability test failed for the requested
    /// real-time parameters.
    Unschedulable,
    /// `comm_create` was called for a `(task, port)` pair that already
    /// has a mailbox bound to a different task.
    CommDupPort,
    /// A send targeted a `(cpu, port)` with no bound mailbox.
    CommNoMailbox,
    /// A reliable send exhausted its retry budget without an ACK.
    CommTimeout,
    /// A reliable send received a NACK from the peer (reassembly buffer
    /// full on the receiver).
    CommNack,
    /// The local reassembly buffer for the sender's `(cpu, task)` is
    /// already full; the frame was dropped.
    CommBufferFull,
}

/// Crate-wide result alias; every fallible kernel entry point returns this.
pub type KernelResult<T> = Result<T, KernelError>;

/// Fatal conditions that halt the node (§6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(Format))]
#[repr(u8)]
pub enum PanicCode {
    /// A bring-up allocation (boot-time queue/TCB setup) found the heap
    /// exhausted.
    OutOfMemory = 1,
    /// General protection fault — an architecture trap with no defined
    /// recovery (bad memory access, illegal instruction).
    GeneralProtectionFault = 2,
    /// `app_main` returned instead of running forever.
    AbortedOnInit = 3,
    /// A scheduler invariant (§3) was found violated at a checkpoint.
    SchedulerInvariantViolation = 4,
    /// Anything else fatal that doesn't fit the above.
    Unknown = 0xff,
}

/// Halt the node with a diagnostic code. Never returns.
///
/// Mirrors the original `panic(code)` call sites in `main.c`: print
/// the code via the diagnostic channel (best-effort), then loop with
/// interrupts masked so no further kernel code executes.
#[cfg_attr(feature = "defmt-log", allow(unused_variables))]
pub fn panic(code: PanicCode) -> ! {
    #[cfg(feature = "defmt-log")]
    defmt::error!("KERNEL PANIC: {}", code);

    loop {
        cortex_m::interrupt::disable();
        cortex_m::asm::wfi();
    }
}
