//! One-second housekeeping tick: periodic memory report and the standby clock.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::protocol::DeviceState;
use crate::work_queue::available_memory;

use super::Orchestrator;

const TICK: Duration = Duration::from_secs(1);
const MEMORY_REPORT_TICKS: u32 = 10;

/// Runs one tick. Returns true when the standby clock was refreshed.
pub fn tick(orchestrator: &Orchestrator) -> bool {
    let ticks = orchestrator.cell.tick();
    if ticks % MEMORY_REPORT_TICKS != 0 {
        return false;
    }

    match available_memory() {
        Some(bytes) => tracing::info!(free_kb = bytes / 1024, ticks, "memory"),
        None => tracing::debug!(ticks, "memory report unavailable"),
    }

    if !orchestrator.ota.has_server_time() || orchestrator.device_state() != DeviceState::Idle {
        return false;
    }
    let now = chrono::Local::now().format("%H:%M  ").to_string();
    orchestrator.scheduler.schedule(move |control| {
        if control.state() == DeviceState::Idle {
            control.parts.display.set_status(&now);
        }
    })
}

pub fn spawn(orchestrator: Orchestrator) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name("clock".to_string()).spawn(move || {
        let shutdown = orchestrator.shutdown_signal();
        while !*shutdown.borrow() {
            thread::sleep(TICK);
            tick(&orchestrator);
        }
        tracing::debug!("clock stopped");
    })
}
