use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::queue::{Overflow, SignalQueue};

pub type Task<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

/// Single-consumer control loop. Any thread may `schedule`; only the thread
/// inside `run` ever sees `&mut C`.
///
/// `run` swaps out the whole pending list and executes it in submission
/// order before looking again, so tasks scheduled while a batch runs land in
/// the next batch.
pub struct Scheduler<C> {
    queue: Arc<SignalQueue<Task<C>>>,
    loop_thread: Arc<Mutex<Option<ThreadId>>>,
}

impl<C> Clone for Scheduler<C> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            loop_thread: self.loop_thread.clone(),
        }
    }
}

impl<C: 'static> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> Scheduler<C> {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(SignalQueue::unbounded()),
            loop_thread: Arc::new(Mutex::new(None)),
        }
    }

    pub fn schedule<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        let accepted = self.queue.push(Box::new(task), Overflow::Block);
        if !accepted {
            tracing::debug!("scheduler closed; task dropped");
        }
        accepted
    }

    /// Schedules `task` and blocks until the control loop has run it.
    /// Returns `None` if the loop shut down first or if called from the loop itself.
    pub fn call<R, F>(&self, task: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut C) -> R + Send + 'static,
    {
        if self.on_loop_thread() {
            tracing::error!("scheduler call issued from the control loop; refusing to deadlock");
            return None;
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        let accepted = self.schedule(move |ctx| {
            let _ = tx.send(task(ctx));
        });
        if !accepted {
            return None;
        }
        rx.recv().ok()
    }

    pub fn run(&self, ctx: &mut C) {
        *self.loop_thread.lock() = Some(thread::current().id());
        while let Some(batch) = self.queue.wait_take_all() {
            for task in batch {
                run_task(task, ctx);
            }
        }
        *self.loop_thread.lock() = None;
        tracing::info!("control loop exited");
    }

    /// Runs the batch queued right now without blocking; returns how many tasks ran.
    pub fn run_pending(&self, ctx: &mut C) -> usize {
        let batch = self.queue.take_all();
        let count = batch.len();
        for task in batch {
            run_task(task, ctx);
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn shutdown(&self) {
        self.queue.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.queue.is_closed()
    }

    fn on_loop_thread(&self) -> bool {
        *self.loop_thread.lock() == Some(thread::current().id())
    }
}

fn run_task<C>(task: Task<C>, ctx: &mut C) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| task(ctx))) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic>".to_string());
        tracing::error!("control task panicked: {}", message);
    }
}
