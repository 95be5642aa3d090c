use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ringbuf::traits::{Consumer, Observer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::error;

use crate::state::lock;
use crate::TubeError;

/// A source of mono audio, driven block by block from the audio thread.
///
/// Implementations must not allocate or block for long once warmed up.
pub trait AudioRender: Send {
    fn render(&mut self, out: &mut [f32]) -> Result<(), TubeError>;
}

impl<R: AudioRender + ?Sized> AudioRender for Box<R> {
    fn render(&mut self, out: &mut [f32]) -> Result<(), TubeError> {
        (**self).render(out)
    }
}

/// Shared count of failed render blocks.
#[derive(Debug, Clone, Default)]
pub struct ErrorCounter(Arc<AtomicU64>);

impl ErrorCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the new total.
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Log the 1st, 2nd, 4th, 8th, ... occurrence only.
pub fn should_log(count: u64) -> bool {
    count.is_power_of_two()
}

/// Hands values the audio thread is finished with back to a control thread,
/// so their memory is freed there.
///
/// Each renderer gets its own SPSC ring from [`RetireQueue::producer`];
/// [`RetireQueue::collect`] drops whatever has been returned and forgets
/// rings whose renderer is gone.
pub struct RetireQueue<T> {
    rings: Mutex<Vec<HeapCons<T>>>,
}

impl<T> Default for RetireQueue<T> {
    fn default() -> Self {
        Self {
            rings: Mutex::new(Vec::new()),
        }
    }
}

impl<T> RetireQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn producer(&self, capacity: usize) -> HeapProd<T> {
        let (prod, cons) = HeapRb::new(capacity.max(1)).split();
        lock(&self.rings).push(cons);
        prod
    }

    /// Drop everything returned so far; returns how many values were freed.
    pub fn collect(&self) -> usize {
        let mut rings = lock(&self.rings);
        let mut freed = 0;
        for ring in rings.iter_mut() {
            while ring.try_pop().is_some() {
                freed += 1;
            }
        }
        rings.retain(|ring| ring.write_is_held());
        freed
    }

    pub fn rings(&self) -> usize {
        lock(&self.rings).len()
    }
}

/// Wraps a renderer so that errors and panics never leave the callback.
///
/// A failed block is zero-filled and counted; the stream keeps running.
pub struct GuardedRender<R> {
    name: &'static str,
    inner: R,
    errors: ErrorCounter,
}

impl<R: AudioRender> GuardedRender<R> {
    pub fn new(name: &'static str, inner: R) -> Self {
        Self::with_counter(name, inner, ErrorCounter::new())
    }

    pub fn with_counter(name: &'static str, inner: R, errors: ErrorCounter) -> Self {
        Self {
            name,
            inner,
            errors,
        }
    }

    pub fn errors(&self) -> ErrorCounter {
        self.errors.clone()
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Render one block. Never fails and never panics.
    pub fn process(&mut self, out: &mut [f32]) {
        let result = catch_unwind(AssertUnwindSafe(|| self.inner.render(out)));
        let failure = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string()),
        };

        out.fill(0.0);
        let count = self.errors.bump();
        if should_log(count) {
            error!(source = self.name, count, error = %failure, "audio render failed");
        }
    }
}

impl<R: AudioRender> AudioRender for GuardedRender<R> {
    fn render(&mut self, out: &mut [f32]) -> Result<(), TubeError> {
        self.process(out);
        Ok(())
    }
}
