//! Worker pool executing background verification tasks.
//!
//! A handful of named OS threads block on a bounded channel of
//! [`VerificationTask`] structs:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                     VerifierPool                       │
//! │                                                        │
//! │  submit() ──► bounded channel ──┬─► verify-worker-0    │
//! │                                 └─► verify-worker-1    │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Tasks are consumed exactly once and their completion is their only
//! effect, so the pool carries no result channel. A pending counter pairs
//! every submit with a finish, letting `wait_idle` block until the queue
//! has drained and the workers have gone quiet. Shutdown closes the
//! channel, discards tasks that never started, and joins the workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use super::VerificationTask;

/// Queue depth before `submit` starts shedding tasks.
const TASK_QUEUE_DEPTH: usize = 64;

/// Tasks currently queued or running.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

pub(crate) struct VerifierPool {
    sender: Sender<VerificationTask>,
    workers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    pending: Arc<Pending>,
}

impl VerifierPool {
    /// Spawn a pool with `threads` workers (at least one).
    pub(crate) fn new(threads: usize) -> VerifierPool {
        let threads = threads.max(1);
        let (sender, receiver) = bounded::<VerificationTask>(TASK_QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(Pending::default());

        let workers: Vec<_> = (0..threads)
            .map(|id| {
                let receiver = receiver.clone();
                let stop = Arc::clone(&stop);
                let pending = Arc::clone(&pending);
                thread::Builder::new()
                    .name(format!("verify-worker-{}", id))
                    .spawn(move || worker_loop(id, receiver, stop, pending))
                    .expect("failed to spawn verification worker thread")
            })
            .collect();

        VerifierPool {
            sender,
            workers,
            stop,
            pending,
        }
    }

    /// Queue `task` without blocking. A full queue sheds the task; the
    /// module set simply gets re-verified on a later load.
    pub(crate) fn submit(&self, task: VerificationTask) -> bool {
        self.pending.begin();
        match self.sender.try_send(task) {
            Ok(()) => true,
            Err(_rejected) => {
                self.pending.finish();
                warn!("Verification queue is full, dropping task");
                false
            }
        }
    }

    /// Block until every queued task has finished.
    pub(crate) fn wait_idle(&self) {
        self.pending.wait_idle();
    }

    /// Stop the pool: discard tasks that have not started, let running
    /// ones finish, and join the workers.
    pub(crate) fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        drop(self.sender);
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

fn worker_loop(
    id: usize,
    receiver: Receiver<VerificationTask>,
    stop: Arc<AtomicBool>,
    pending: Arc<Pending>,
) {
    trace!(worker = id, "Verification worker started");
    while let Ok(task) = receiver.recv() {
        if stop.load(Ordering::SeqCst) {
            // Shutdown has begun: drain the queue without running anything.
            drop(task);
            pending.finish();
            continue;
        }
        task.run();
        pending.finish();
    }
    trace!(worker = id, "Verification worker exiting");
}
