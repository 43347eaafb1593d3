//! Batched ingestion from the monitor queue into the cache sink.
//!
//! The drain task collects ticks until either the batch size threshold or
//! the flush interval fires, whichever comes first, then performs one
//! bulk write. A failed batch is kept and retried on the next cycle;
//! write failures are logged and never crash the monitor. At most
//! `max_pending_batches` failed batches are kept, beyond which the oldest
//! is dropped with a warning.

use crate::cache::CacheSink;
use crate::config::BatchConfig;
use crate::types::Tick;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct BatchStats {
    pub batches_written: AtomicU64,
    pub ticks_written: AtomicU64,
    pub write_failures: AtomicU64,
    pub batches_dropped: AtomicU64,
}

impl BatchStats {
    pub fn snapshot(&self) -> BatchStatsSnapshot {
        BatchStatsSnapshot {
            batches_written: self.batches_written.load(Ordering::Relaxed),
            ticks_written: self.ticks_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchStatsSnapshot {
    pub batches_written: u64,
    pub ticks_written: u64,
    pub write_failures: u64,
    pub batches_dropped: u64,
}

/// Drains the monitor queue into the cache sink.
pub struct BatchWriter {
    config: BatchConfig,
    sink: Arc<dyn CacheSink>,
    stats: Arc<BatchStats>,
}

impl BatchWriter {
    pub fn new(config: BatchConfig, sink: Arc<dyn CacheSink>) -> Self {
        Self {
            config,
            sink,
            stats: Arc::new(BatchStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<BatchStats> {
        self.stats.clone()
    }

    /// Run until shutdown flips or the queue closes. Flushes whatever is
    /// buffered before returning.
    pub async fn run(&self, mut queue: mpsc::Receiver<Tick>, mut shutdown: watch::Receiver<bool>) {
        let mut buffer: Vec<Tick> = Vec::with_capacity(self.config.batch_size);
        let mut pending: VecDeque<Vec<Tick>> = VecDeque::new();
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            batch_size = self.config.batch_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            sink = self.sink.name(),
            "batch writer started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = queue.recv() => match received {
                    Some(tick) => {
                        buffer.push(tick);
                        if buffer.len() >= self.config.batch_size {
                            self.flush(&mut buffer, &mut pending).await;
                        }
                    }
                    // Queue closed: the monitor is gone
                    None => break,
                },
                _ = ticker.tick() => {
                    if !buffer.is_empty() || !pending.is_empty() {
                        self.flush(&mut buffer, &mut pending).await;
                    }
                }
            }
        }

        // Drain whatever is still queued, then flush once more
        while let Ok(tick) = queue.try_recv() {
            buffer.push(tick);
        }
        if !buffer.is_empty() || !pending.is_empty() {
            self.flush(&mut buffer, &mut pending).await;
        }
        info!("batch writer stopped");
    }

    /// Write retries first, then the fresh buffer. Failures park the
    /// batch for the next cycle.
    async fn flush(&self, buffer: &mut Vec<Tick>, pending: &mut VecDeque<Vec<Tick>>) {
        // Retry previously failed batches in arrival order
        while let Some(batch) = pending.front() {
            match self.sink.put_many(batch).await {
                Ok(()) => {
                    self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .ticks_written
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    pending.pop_front();
                }
                Err(e) => {
                    self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(sink = self.sink.name(), "cache retry failed, keeping batch: {}", e);
                    break;
                }
            }
        }

        if buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(buffer);
        match self.sink.put_many(&batch).await {
            Ok(()) => {
                self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .ticks_written
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                debug!(count = batch.len(), "batch flushed");
            }
            Err(e) => {
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!(sink = self.sink.name(), "cache write failed, batch queued for retry: {}", e);
                pending.push_back(batch);
                while pending.len() > self.config.max_pending_batches {
                    pending.pop_front();
                    self.stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("pending batch limit reached, oldest batch dropped");
                }
            }
        }
    }
}
