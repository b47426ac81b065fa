use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::queue::{Overflow, SignalQueue};

type Job = Box<dyn FnOnce() + Send + 'static>;

const IN_FLIGHT_WARN_THRESHOLD: usize = 30;
const LOW_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

/// Single-worker FIFO used to keep codec work off the control loop.
///
/// `in_flight` counts every unit from `submit` until it has finished running,
/// so the completion barrier cannot release while the last unit is still
/// executing or while a running unit has just queued a follow-up.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    jobs: SignalQueue<Job>,
    in_flight: Mutex<usize>,
    drained: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn finish(&self, units: usize) {
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(units);
        if *in_flight == 0 {
            self.drained.notify_all();
        }
    }
}

impl WorkQueue {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            name: name.to_string(),
            jobs: SignalQueue::unbounded(),
            in_flight: Mutex::new(0),
            drained: Condvar::new(),
            worker: Mutex::new(None),
        });

        let worker_shared = shared.clone();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(worker_shared))?;
        *shared.worker.lock() = Some(join);
        tracing::info!(queue = name, "work queue started");
        Ok(Self { shared })
    }

    pub fn submit<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.shared;
        {
            let mut in_flight = shared.in_flight.lock();
            if *in_flight >= IN_FLIGHT_WARN_THRESHOLD {
                if let Some(available) = available_memory().filter(|a| *a < LOW_MEMORY_BYTES) {
                    tracing::warn!(
                        queue = %shared.name,
                        in_flight = *in_flight,
                        available,
                        "work queue backlog under low memory"
                    );
                }
            }
            *in_flight += 1;
        }
        if !shared.jobs.push(Box::new(work), Overflow::Block) {
            tracing::warn!(queue = %shared.name, "work queue stopped; dropping unit");
            shared.finish(1);
        }
    }

    /// Blocks until every unit submitted so far, including units submitted by
    /// running units, has finished. Must not be called from inside a unit.
    pub fn wait_for_completion(&self) {
        let mut in_flight = self.shared.in_flight.lock();
        while *in_flight > 0 {
            self.shared.drained.wait(&mut in_flight);
        }
    }

    pub fn in_flight(&self) -> usize {
        *self.shared.in_flight.lock()
    }

    /// Discards queued units, lets the running unit finish and joins the worker.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.jobs.is_closed() {
            return;
        }
        shared.jobs.close();
        let discarded = shared.jobs.take_all().len();
        if discarded > 0 {
            tracing::info!(queue = %shared.name, discarded, "discarded pending work");
            shared.finish(discarded);
        }

        let join = shared.worker.lock().take();
        if let Some(join) = join {
            if join.thread().id() == thread::current().id() {
                return;
            }
            if join.join().is_err() {
                tracing::error!(queue = %shared.name, "work queue worker panicked");
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    while let Some(batch) = shared.jobs.wait_take_all() {
        for job in batch {
            if !shared.jobs.is_closed() {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    tracing::error!(
                        queue = %shared.name,
                        "work unit panicked: {}",
                        panic_message(panic.as_ref())
                    );
                }
            }
            shared.finish(1);
        }
    }
    tracing::info!(queue = %shared.name, "work queue stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic>".to_string()
    }
}

/// Available memory in bytes, where the platform exposes it.
pub fn available_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
        Some(kib * 1024)
    })
}
