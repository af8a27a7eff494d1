//! Pending queue of enriched records.
//!
//! Producers append under a single mutex; a flush swaps the whole queue for
//! an empty one while holding the same lock, so a record submitted during a
//! drain lands in the fresh queue and is neither lost nor sent twice.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::EnrichedRecord;

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The queue reached the batch size
    Size,
    /// The background timer fired
    Time,
    /// `flush()` was called
    Manual,
    /// Final flush during shutdown
    Shutdown,
}

/// Result of appending a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue reached the batch size and should be flushed
    BatchReady,
    /// The buffer was closed and the record was discarded
    Closed,
}

/// A batch of records flushed together.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Local id used in diagnostics
    pub id: Uuid,

    /// Correlation id sent to the service with the batch
    pub pack_id: Option<String>,

    pub records: Vec<EnrichedRecord>,

    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(records: Vec<EnrichedRecord>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pack_id: None,
            records,
            created_at: Utc::now(),
        }
    }

    pub fn with_pack_id(mut self, pack_id: impl Into<String>) -> Self {
        self.pack_id = Some(pack_id.into());
        self
    }

    /// Get the number of records in the batch.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Statistics about buffer operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Total number of records received
    pub received: u64,

    /// Total number of records dropped due to buffer overflow
    pub dropped: u64,

    /// Number of flushes triggered by the size threshold
    pub size_flushes: u64,

    /// Number of flushes triggered by the timer
    pub time_flushes: u64,

    /// Number of manual and shutdown flushes
    pub manual_flushes: u64,
}

#[derive(Debug, Default)]
struct BufferState {
    records: Vec<EnrichedRecord>,
    stats: BufferStats,
    closed: bool,
}

/// Bounded, mutex-guarded pending queue.
#[derive(Debug)]
pub struct LogBuffer {
    state: Mutex<BufferState>,
    batch_size: usize,
    max_capacity: usize,
}

impl LogBuffer {
    pub fn new(batch_size: usize, max_capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufferState {
                records: Vec::with_capacity(batch_size),
                stats: BufferStats::default(),
                closed: false,
            }),
            batch_size,
            max_capacity: max_capacity.max(batch_size),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a record.
    ///
    /// When the queue is at capacity the oldest 10% are dropped first.
    pub fn push(&self, record: EnrichedRecord) -> PushOutcome {
        let mut state = self.lock();
        if state.closed {
            return PushOutcome::Closed;
        }
        state.stats.received += 1;

        if state.records.len() >= self.max_capacity {
            let drop_count = (state.records.len() / 10).max(1);
            warn!(
                buffer_size = state.records.len(),
                drop_count = drop_count,
                max_capacity = self.max_capacity,
                "Buffer overflow: dropping oldest logs"
            );
            state.records.drain(0..drop_count);
            state.stats.dropped += drop_count as u64;
        }

        state.records.push(record);
        if state.records.len() >= self.batch_size {
            PushOutcome::BatchReady
        } else {
            PushOutcome::Queued
        }
    }

    /// Swap the queue for an empty one and return what it held.
    ///
    /// A size-triggered drain takes exactly the oldest `batch_size` records
    /// and leaves the rest queued; it returns `None` if another submitter's
    /// drain already brought the queue below the threshold.
    pub fn drain(&self, trigger: FlushTrigger) -> Option<Vec<EnrichedRecord>> {
        let mut state = self.lock();
        if state.records.is_empty() {
            return None;
        }

        let records = if trigger == FlushTrigger::Size {
            if state.records.len() < self.batch_size {
                return None;
            }
            let rest = state.records.split_off(self.batch_size);
            std::mem::replace(&mut state.records, rest)
        } else {
            std::mem::replace(&mut state.records, Vec::with_capacity(self.batch_size))
        };
        match trigger {
            FlushTrigger::Size => state.stats.size_flushes += 1,
            FlushTrigger::Time => state.stats.time_flushes += 1,
            FlushTrigger::Manual | FlushTrigger::Shutdown => state.stats.manual_flushes += 1,
        }
        debug!(batch_size = records.len(), trigger = ?trigger, "Draining buffer");
        Some(records)
    }

    /// Stop accepting records and drain what is left.
    pub fn close(&self) -> Option<Vec<EnrichedRecord>> {
        self.lock().closed = true;
        self.drain(FlushTrigger::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Get the current number of records in the buffer.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Get current buffer statistics.
    pub fn stats(&self) -> BufferStats {
        self.lock().stats.clone()
    }
}
