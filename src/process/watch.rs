//! Cooperative child-exit notification.
//!
//! Asynchronously launched processes are registered with a [`MainLoop`]
//! together with a callback. Callbacks only run on the thread that pumps the
//! loop, when it processes the exit event. Dropping the loop (or never
//! pumping it) drops the pending callbacks unrun, so any cleanup they carry
//! is best-effort.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::{Duration, Instant};

use super::{AsyncChild, ProcessResult};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

type ChildWatchFn = Box<dyn FnOnce(u32, ProcessResult)>;

struct ChildWatch {
    pid: u32,
    exit_rx: Receiver<ProcessResult>,
    callback: ChildWatchFn,
}

/// Dispatches child-exit callbacks on the caller's thread.
#[derive(Default)]
pub struct MainLoop {
    watches: Vec<ChildWatch>,
}

impl MainLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `callback(pid, result)` once `child` has exited.
    pub fn child_watch_add<F>(&mut self, child: AsyncChild, callback: F)
    where
        F: FnOnce(u32, ProcessResult) + 'static,
    {
        let (pid, exit_rx) = child.into_parts();
        self.watches.push(ChildWatch {
            pid,
            exit_rx,
            callback: Box::new(callback),
        });
    }

    /// Number of children still being watched.
    pub fn pending(&self) -> usize {
        self.watches.len()
    }

    /// Dispatch every exit that is ready, waiting up to `timeout` for at
    /// least one. Returns how many callbacks ran.
    pub fn iteration(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let dispatched = self.dispatch_ready();
            let now = Instant::now();
            if dispatched > 0 || self.watches.is_empty() || now >= deadline {
                return dispatched;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Pump until no children are left.
    pub fn run(&mut self) {
        while !self.watches.is_empty() {
            self.iteration(POLL_INTERVAL);
        }
    }

    /// Pump until no children are left or `timeout` elapses.
    ///
    /// Returns true when every watch was dispatched. Children still running
    /// at the deadline stay registered.
    pub fn run_for(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.watches.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.iteration(deadline - now);
        }
        true
    }

    fn dispatch_ready(&mut self) -> usize {
        let mut ready = Vec::new();
        let mut i = 0;
        while i < self.watches.len() {
            match self.watches[i].exit_rx.try_recv() {
                Ok(result) => ready.push((self.watches.swap_remove(i), result)),
                Err(TryRecvError::Disconnected) => {
                    ready.push((self.watches.swap_remove(i), ProcessResult::lost()))
                }
                Err(TryRecvError::Empty) => i += 1,
            }
        }

        let count = ready.len();
        for (watch, result) in ready {
            (watch.callback)(watch.pid, result);
        }
        count
    }
}
