use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::TubeError;

/// Set once to ask the worker to exit; the thread is unparked so it does
/// not sleep out the rest of its cadence.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A named thread calling `tick(elapsed)` every `cadence` until stopped.
///
/// `elapsed` is measured from the spawn instant. The tick runs outside any
/// lock held by the worker itself; a slow tick simply delays the next one.
pub struct Worker {
    name: String,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: &str, cadence: Duration, mut tick: F) -> Result<Self, TubeError>
    where
        F: FnMut(Duration) + Send + 'static,
    {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let start = Instant::now();
                debug!(worker = %thread_name, ?cadence, "worker started");
                while !token.is_cancelled() {
                    tick(start.elapsed());
                    let deadline = Instant::now() + cadence;
                    // Parks can wake spuriously; sleep out the cadence.
                    loop {
                        if token.is_cancelled() {
                            break;
                        }
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        thread::park_timeout(deadline - now);
                    }
                }
                debug!(worker = %thread_name, "worker exiting");
            })
            .map_err(|e| TubeError::Thread(e.to_string()))?;

        info!(worker = name, ?cadence, "background worker spawned");
        Ok(Self {
            name: name.to_string(),
            cancel,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel and join. Idempotent.
    pub fn stop(&mut self) -> Result<(), TubeError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.cancel.cancel();
        handle.thread().unpark();
        handle
            .join()
            .map_err(|_| TubeError::Thread(format!("{} panicked", self.name)))?;
        info!(worker = %self.name, "background worker stopped");
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "worker did not shut down cleanly");
        }
    }
}
