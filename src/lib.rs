//! # HellfireOS
//!
//! A preemptive real-time kernel for NoC-connected Cortex-M4 nodes.
//!
//! ## Overview
//!
//! HellfireOS schedules a fixed set of periodic real-time tasks
//! alongside best-effort background work, lends spare real-time
//! capacity to aperiodic arrivals through a polling server, and
//! carries messages between nodes over a Network-on-Chip with
//! optional reliable (acknowledged) delivery.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                    │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                  │
//! │   init() · spawn() · start() · send()/recv() · malloc() │
//! ├──────────────┬────────────────────┬───────────────────┤
//! │  Scheduler   │   NoC Messaging    │  Kernel Heap      │
//! │  scheduler.rs│   noc.rs           │  heap.rs          │
//! │  ─ tick()    │   ─ ingest()       │  ─ malloc/free    │
//! │  ─ schedule()│   ─ fragment_into()│  ─ first-fit       │
//! ├──────────────┴────────────────────┴───────────────────┤
//! │              Task Model (task.rs)                       │
//! │    TCB · RtParams · TaskState · TaskName                │
//! ├────────────────────────────────────────────────────────┤
//! │            Arch Port (arch/cortex_m4.rs)                │
//! │    PendSV · SysTick · Context Switch · Stack Init      │
//! ├────────────────────────────────────────────────────────┤
//! │         ARM Cortex-M4 Hardware (Thumb-2)                │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling Model
//!
//! Two tiers (§4.4): rate-monotonic real-time tasks always preempt
//! best-effort ones; within the best-effort tier, priority plus aging
//! prevents starvation under sustained real-time load. A task
//! designated as the polling server lends its own real-time budget to
//! aperiodic jobs (§4.5) instead of running application code itself.
//!
//! ## Memory Model
//!
//! - **No allocation for kernel bookkeeping**: the TCB table and every
//!   scheduling queue are fixed-size arrays.
//! - **A separate, explicit kernel heap** (`heap.rs`) is offered to
//!   tasks via `kernel::malloc`/`free`, distinct from that bookkeeping.
//! - **Per-task stack**: `[u8; STACK_SIZE]` inline in the TCB.
//! - **Critical sections**: `cortex_m::interrupt::free()` guards every
//!   access to the scheduler, messaging, and heap singletons.

#![no_std]

pub mod arch;
pub mod config;
pub mod errors;
pub mod heap;
pub mod kernel;
pub mod noc;
pub mod queue;
pub mod scheduler;
pub mod sync;
pub mod task;
