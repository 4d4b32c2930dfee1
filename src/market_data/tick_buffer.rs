// =============================================================================
// Tick Buffer — batching between the live feed and the store
// =============================================================================

use parking_lot::Mutex;
use tracing::warn;

use crate::types::Tick;

/// Pending ticks awaiting a batched write to the store.
///
/// Filled from the hot path and drained by the flusher; each tick is handed
/// out in exactly one batch. A failed write gives the batch back through
/// [`TickBuffer::requeue`] so nothing is lost on transient store errors.
pub struct TickBuffer {
    pending: Mutex<Vec<Tick>>,
    batch_size: usize,
    max_buffered: usize,
}

impl TickBuffer {
    pub fn new(batch_size: usize, max_buffered: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            pending: Mutex::new(Vec::with_capacity(batch_size)),
            batch_size,
            max_buffered: max_buffered.max(batch_size),
        }
    }

    /// Append a tick. Returns a full batch once the threshold is reached,
    /// leaving the buffer empty.
    pub fn push(&self, tick: Tick) -> Option<Vec<Tick>> {
        let mut pending = self.pending.lock();
        pending.push(tick);
        if pending.len() >= self.batch_size {
            Some(std::mem::replace(
                &mut *pending,
                Vec::with_capacity(self.batch_size),
            ))
        } else {
            None
        }
    }

    /// Take everything that is pending, regardless of threshold.
    pub fn drain(&self) -> Vec<Tick> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Put a batch back at the head of the buffer after a failed write.
    ///
    /// Order is preserved. If the store stays unavailable the buffer is
    /// capped and the oldest ticks are dropped; those are recoverable later
    /// through a historical sync.
    pub fn requeue(&self, batch: Vec<Tick>) {
        if batch.is_empty() {
            return;
        }
        let mut pending = self.pending.lock();
        let newer = std::mem::replace(&mut *pending, batch);
        pending.extend(newer);

        if pending.len() > self.max_buffered {
            let overflow = pending.len() - self.max_buffered;
            pending.drain(..overflow);
            warn!(
                dropped = overflow,
                retained = pending.len(),
                "tick buffer over capacity; oldest ticks dropped"
            );
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}
