//! Serial completion executor
//!
//! I/O completions are queued here and run one at a time, in queue order,
//! on a dedicated worker thread. Callers therefore never observe two
//! completions concurrently, which is what lets the session map treat a
//! completion as re-entry into its serialized context.

use parking_lot::Mutex;
use std::sync::mpsc;
use std::thread;
use tracing::trace;

/// A queued unit of completion work
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

/// Serial executor delivering I/O completions on its own thread
pub struct Finisher {
    tx: Mutex<Option<mpsc::Sender<Completion>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Finisher {
    /// Create a finisher and start its worker thread
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Completion>();
        let worker = thread::spawn(move || {
            while let Ok(completion) = rx.recv() {
                completion();
            }
            trace!("finisher worker exiting");
        });
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a completion; it runs after everything queued before it.
    ///
    /// Completions queued after shutdown are dropped.
    pub fn queue(&self, completion: Completion) {
        if let Some(tx) = self.tx.lock().as_ref() {
            // Send fails only once the worker is gone; dropping the
            // completion is then the correct behavior.
            let _ = tx.send(completion);
        }
    }

    /// Stop accepting work and wait for queued completions to drain
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Default for Finisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Finisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
