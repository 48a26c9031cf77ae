// src/net/task.rs - Deferred tasks and their completion signals
//
// A task is a one-shot closure taking the loop's current time in ms. Its
// completion signal is fulfilled exactly once, after the closure returns -
// including during the post-exit drain, so waiters never hang on a stopped
// loop.

use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct Task {
    func: Box<dyn FnOnce(u64) + Send + 'static>,
    fired: Arc<AtomicBool>,
    done: Sender<()>,
}

impl Task {
    pub fn run(self, now_ms: u64) {
        (self.func)(now_ms);
        // Flag first: a waiter woken by the channel must observe it set
        self.fired.store(true, Ordering::Release);
        // Waiter may already have gone away
        let _ = self.done.send(());
    }
}

/// Join handle for a dispatched task.
///
/// Single-fulfilment: `wait` blocks until the task has run (or returns
/// immediately if it already has), and `is_done` keeps reporting `true`
/// afterwards.
pub struct Completion {
    fired: Arc<AtomicBool>,
    rx: Receiver<()>,
}

impl Completion {
    /// Block until the task has executed.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    /// Block up to `timeout`; returns whether the task had executed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok() || self.is_done()
    }

    /// Non-blocking probe. Stays `true` once the task has run, no matter
    /// how often the completion was waited on before.
    pub fn is_done(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

pub(crate) fn task_pair(func: impl FnOnce(u64) + Send + 'static) -> (Task, Completion) {
    let (done, rx) = crossbeam_channel::bounded(1);
    let fired = Arc::new(AtomicBool::new(false));
    (
        Task {
            func: Box::new(func),
            fired: fired.clone(),
            done,
        },
        Completion { fired, rx },
    )
}
