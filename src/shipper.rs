//! The shipper: enrichment, batching and the flush schedule.
//!
//! [`LogShipper`] is a cheap `Clone` handle. Submissions append to the
//! pending queue and return at once; deliveries run as background tasks.
//! A batch is flushed when either:
//! - the queue reaches `batch_size` (size-based flush)
//! - the flush interval elapses with records queued (time-based flush)
//!
//! The library installs no signal handlers. Call [`LogShipper::shutdown`]
//! from the application's own termination handling to flush what is left.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::buffer::{Batch, BufferStats, FlushTrigger, LogBuffer, PushOutcome};
use crate::client::{DeliveryClient, DeliveryOutcome};
use crate::config::{ConfigError, ShipperConfig};
use crate::enrich::{Enricher, HostInfo};
use crate::event::{Fields, LogEvent, LogLevel};
use crate::pack_id::PackIdGenerator;
use crate::stats::{StatsSnapshot, TransportStats};
use crate::trace::{TraceContext, TraceContextHolder};

/// Errors raised while constructing a shipper.
#[derive(Debug, Error)]
pub enum ShipperError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("LogShipper must be created inside a Tokio runtime")]
    NoRuntime,
}

struct Inner {
    buffer: LogBuffer,
    enricher: Enricher,
    client: DeliveryClient,
    pack_ids: Option<PackIdGenerator>,
    stats: Arc<TransportStats>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    shut_down: AtomicBool,
    runtime: Handle,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    /// Drain the queue into a batch tagged with the next PackID.
    fn take_batch(&self, trigger: FlushTrigger) -> Option<Batch> {
        let records = match trigger {
            FlushTrigger::Shutdown => self.buffer.close(),
            _ => self.buffer.drain(trigger),
        }?;
        let batch = Batch::new(records);
        Some(match &self.pack_ids {
            Some(ids) => batch.with_pack_id(ids.generate_next()),
            None => batch,
        })
    }

    /// Drain and deliver in the background.
    fn spawn_flush(&self, trigger: FlushTrigger) {
        if let Some(batch) = self.take_batch(trigger) {
            debug!(
                batch_id = %batch.id,
                records = batch.len(),
                trigger = ?trigger,
                "Flushing buffer"
            );
            let client = self.client.clone();
            self.tasks.spawn_on(
                async move {
                    client.deliver(batch).await;
                },
                &self.runtime,
            );
        }
    }
}

/// Batched, signed log shipper.
///
/// # Example
///
/// ```no_run
/// use sls_log_shipper::{Fields, LogLevel, LogShipper, ShipperConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let config = ShipperConfig::from_env().expect("Failed to load config");
///     let shipper = LogShipper::new(config).expect("Failed to create shipper");
///
///     shipper.ship(LogLevel::Info, "user signed in", Fields::new().with("user", "bob"));
///
///     shipper.shutdown().await;
/// }
/// ```
#[derive(Clone)]
pub struct LogShipper {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LogShipper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogShipper")
            .field("pending", &self.inner.buffer.len())
            .field("shut_down", &self.inner.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl LogShipper {
    /// Validate the configuration and start the flush timer.
    ///
    /// # Errors
    ///
    /// Returns `ShipperError::Config` for an invalid configuration and
    /// `ShipperError::NoRuntime` when called outside a Tokio runtime.
    pub fn new(config: ShipperConfig) -> Result<Self, ShipperError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| ShipperError::NoRuntime)?;

        let stats = Arc::new(TransportStats::new());
        let client = DeliveryClient::new(&config, stats.clone())?;
        let host = HostInfo::detect(config.enrichment.include_host_ip);
        let enricher = Enricher::new(
            host,
            config.enrichment.clone(),
            Arc::new(TraceContextHolder::new()),
        );
        let pack_ids = config.enrichment.enable_pack_id.then(PackIdGenerator::new);

        let inner = Arc::new(Inner {
            buffer: LogBuffer::new(config.batch_size, config.max_buffer_size),
            enricher,
            client,
            pack_ids,
            stats,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
            runtime,
        });

        inner.runtime.spawn(run_timer(
            Arc::downgrade(&inner),
            inner.cancel.clone(),
            config.flush_interval,
        ));

        info!(
            url = %inner.client.url(),
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            max_retries = config.max_retries,
            "Log shipper started"
        );

        Ok(Self { inner })
    }

    /// Ship a message with structured fields.
    pub fn ship(&self, level: LogLevel, message: impl Into<String>, fields: Fields) {
        self.submit(LogEvent::new(level, message).with_fields(fields));
    }

    /// Enqueue an event. Never blocks and never reports delivery errors.
    pub fn submit(&self, event: LogEvent) {
        self.enqueue(event, None);
    }

    /// Enqueue an event correlated with an explicit trace context.
    pub fn submit_with_trace(&self, event: LogEvent, trace: &TraceContext) {
        self.enqueue(event, Some(trace));
    }

    fn enqueue(&self, event: LogEvent, trace: Option<&TraceContext>) {
        let record = self.inner.enricher.enrich(event, trace);
        match self.inner.buffer.push(record) {
            PushOutcome::Queued => {}
            PushOutcome::BatchReady => {
                debug!(
                    batch_size = self.inner.buffer.batch_size(),
                    "Batch size threshold reached"
                );
                self.inner.spawn_flush(FlushTrigger::Size);
            }
            PushOutcome::Closed => debug!("Shipper is shut down, dropping log event"),
        }
    }

    /// Drain the queue and wait for the batch to be delivered or dropped.
    ///
    /// Returns `None` if nothing was queued.
    pub async fn flush(&self) -> Option<DeliveryOutcome> {
        let batch = self.inner.take_batch(FlushTrigger::Manual)?;
        Some(self.inner.client.deliver(batch).await)
    }

    /// Stop the timer, deliver what is queued and wait for in-flight batches.
    ///
    /// Only the first call does any work; later calls return `None`.
    pub async fn shutdown(&self) -> Option<DeliveryOutcome> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return None;
        }
        info!(pending = self.inner.buffer.len(), "Shutting down log shipper");

        self.inner.cancel.cancel();
        let outcome = match self.inner.take_batch(FlushTrigger::Shutdown) {
            Some(batch) => Some(self.inner.client.deliver(batch).await),
            None => None,
        };

        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        let stats = self.inner.stats.snapshot();
        info!(
            total_sent = stats.total_sent,
            batches = stats.batch_count,
            failures = stats.failure_count,
            retries = stats.retry_count,
            "Log shipper stopped"
        );
        outcome
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Number of records waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.inner.buffer.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.inner.buffer.stats()
    }

    /// The shipper's current-trace holder, used when no context is passed.
    pub fn traces(&self) -> &Arc<TraceContextHolder> {
        self.inner.enricher.traces()
    }

    /// PackID prefix, if PackIDs are enabled.
    pub fn pack_id_prefix(&self) -> Option<&str> {
        self.inner.pack_ids.as_ref().map(|ids| ids.prefix())
    }
}

/// Periodic flush loop.
///
/// Holds only a weak reference so it never keeps the shipper alive; it exits
/// when cancelled or when the last handle is gone.
async fn run_timer(inner: Weak<Inner>, cancel: CancellationToken, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(shipper) = inner.upgrade() else { break };
                shipper.spawn_flush(FlushTrigger::Time);
            }
        }
    }
    debug!("Flush timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ShipperConfig {
        // Nothing listens here; these tests never wait on delivery.
        ShipperConfig::new("http://127.0.0.1:9", "ak", "sk", "proj", "store")
            .with_batch_size(10)
            .with_max_retries(0)
            .with_request_timeout(Duration::from_millis(200))
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let err = LogShipper::new(config()).unwrap_err();
        assert!(matches!(err, ShipperError::NoRuntime));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let err = LogShipper::new(config().with_batch_size(0)).unwrap_err();
        match err {
            ShipperError::Config(e) => assert_eq!(e.field, "batchSize"),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_queues_without_flushing() {
        let shipper = LogShipper::new(config()).unwrap();
        for i in 0..5 {
            shipper.ship(LogLevel::Info, format!("msg {}", i), Fields::new());
        }
        assert_eq!(shipper.pending(), 5);
        assert_eq!(shipper.buffer_stats().received, 5);
        assert_eq!(shipper.stats().batch_count, 0);
    }

    #[tokio::test]
    async fn test_flush_on_empty_queue_is_none() {
        let shipper = LogShipper::new(config()).unwrap();
        assert!(shipper.flush().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_rejects_new_events() {
        let shipper = LogShipper::new(config()).unwrap();
        assert!(shipper.shutdown().await.is_none());
        assert!(shipper.is_shut_down());
        assert!(shipper.shutdown().await.is_none());

        shipper.ship(LogLevel::Info, "late", Fields::new());
        assert_eq!(shipper.pending(), 0);
        assert_eq!(shipper.buffer_stats().received, 0);
    }

    #[tokio::test]
    async fn test_pack_id_prefix_toggle() {
        let shipper = LogShipper::new(config()).unwrap();
        assert_eq!(shipper.pack_id_prefix().map(str::len), Some(16));

        let mut cfg = config();
        cfg.enrichment.enable_pack_id = false;
        let shipper = LogShipper::new(cfg).unwrap();
        assert!(shipper.pack_id_prefix().is_none());
    }

    #[tokio::test]
    async fn test_dropping_last_handle_stops_timer() {
        let shipper = LogShipper::new(config()).unwrap();
        let weak = Arc::downgrade(&shipper.inner);
        drop(shipper);
        assert!(weak.upgrade().is_none());
    }
}
