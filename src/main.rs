//! # HellfireOS Example Firmware
//!
//! Demonstrates the two-tier scheduler with a mix of task kinds:
//!
//! | Task | Kind | Period | Priority (derived) | Behavior |
//! |------|------|--------|---------------------|----------|
//! | `sensor_task` | Periodic RT | 50 ticks | RMA | Samples, then yields |
//! | `control_task` | Periodic RT | 100 ticks | RMA | Consumes sensor data |
//! | `logger_task` | Best-effort | — | 1 | Drains a mailbox, yields |
//! | `housekeeping_task` | Best-effort | — | 0 | Background, low priority |
//! | `server_task` | Periodic RT | 20 ticks | RMA | Polling server |
//! | `event_generator` | Best-effort, one-shot | — | — | Submits aperiodic jobs |
//!
//! `server_task` lends its own real-time budget to aperiodic arrivals
//! (§4.5) instead of ever running application code; `event_generator`
//! periodically submits a job for it to service.

#![no_std]
#![no_main]

use cortex_m_rt::entry;

#[cfg(feature = "defmt-log")]
use panic_probe as _;
#[cfg(feature = "halt-on-panic")]
use panic_halt as _;

use hellfireos::kernel;

// ---------------------------------------------------------------------------
// Task entry points
// ---------------------------------------------------------------------------

/// Periodic real-time task: samples a sensor and publishes the reading
/// on its mailbox for `control_task` to pick up.
extern "C" fn sensor_task() {
    let _ = kernel::comm_create(100);
    loop {
        let reading: u32 = 0;
        let _ = kernel::send(kernel::cpu_id(), 200, 0, &reading.to_le_bytes());
        kernel::yield_task();
    }
}

/// Periodic real-time task: consumes `sensor_task`'s readings.
extern "C" fn control_task() {
    let _ = kernel::comm_create(200);
    loop {
        let mut buf = [0u8; 4];
        if kernel::recv_timeout(&mut buf, 50).is_ok() {
            let _reading = u32::from_le_bytes(buf);
        }
        kernel::yield_task();
    }
}

/// Best-effort task: drains whatever arrives on its own mailbox and
/// yields between checks. Never blocks the real-time tasks above it.
extern "C" fn logger_task() {
    let _ = kernel::comm_create(300);
    loop {
        let mut buf = [0u8; 64];
        let _ = kernel::recv_timeout(&mut buf, 10);
        kernel::yield_task();
    }
}

/// Low-priority best-effort background task. Under sustained real-time
/// load this is the task the aging mechanism protects from starvation.
extern "C" fn housekeeping_task() {
    loop {
        kernel::yield_task();
    }
}

/// The polling server (§4.5). Its body never actually runs — the
/// scheduler dispatches aperiodic jobs out of its budget instead — but
/// it still needs a real entry point to satisfy `spawn`.
extern "C" fn server_task() {
    loop {
        kernel::yield_task();
    }
}

/// One-shot aperiodic job body, submitted by `event_generator`.
extern "C" fn handle_event() {}

/// Best-effort task that periodically submits aperiodic work for
/// `server_task` to service.
extern "C" fn event_generator() {
    loop {
        if let Ok(job) = kernel::spawn(handle_event, 0, 0, 0, "event") {
            let _ = kernel::submit_aperiodic(job, 2, Some(20));
        }
        kernel::delay_ms(100);
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Firmware entry point. Initializes the kernel, spawns the
/// application tasks, and starts the scheduler. Does not return.
#[entry]
fn main() -> ! {
    let cp = cortex_m::Peripherals::take().unwrap();

    kernel::init();

    kernel::spawn(sensor_task, 50, 0, 5, "sensor")
        .expect("failed to spawn sensor_task");
    kernel::spawn(control_task, 100, 0, 10, "control")
        .expect("failed to spawn control_task");
    kernel::spawn(logger_task, 0, 1, 0, "logger")
        .expect("failed to spawn logger_task");
    kernel::spawn(housekeeping_task, 0, 0, 0, "housekeeping")
        .expect("failed to spawn housekeeping_task");

    let server = kernel::spawn(server_task, 20, 0, 8, "server")
        .expect("failed to spawn server_task");
    kernel::make_polling_server(server).expect("failed to install polling server");

    kernel::spawn(event_generator, 0, 1, 0, "event_gen")
        .expect("failed to spawn event_generator");

    kernel::start(cp)
}
