//! Batching forwarder between stream workers and the telemetry sink.
//!
//! Workers hand records over a bounded channel; a full channel blocks the
//! sender, which is the backpressure signal. The forwarder buffers into a
//! pending queue capped by a hard ceiling (overflow drops oldest records,
//! counted), cuts batches by size or time window, and retries each batch a
//! bounded number of times before dropping it. A sink outage therefore
//! costs records at worst, never the engine.
//!
//! Records from one container arrive over a single queue and batches are
//! sent (or dropped) strictly in order, so per-container ordering survives
//! end to end.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::config::Settings;
use crate::enrich::LogRecord;
use crate::policy::BackoffPolicy;
use crate::sink::LogSink;

/// Delivery and loss counters, shared with the handle for diagnostics.
#[derive(Debug, Default)]
pub struct ForwardMetrics {
    delivered: AtomicU64,
    dropped: AtomicU64,
    batches_dropped: AtomicU64,
}

impl ForwardMetrics {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn batches_dropped(&self) -> u64 {
        self.batches_dropped.load(Ordering::Relaxed)
    }
}

/// Producer side handed to every stream worker.
#[derive(Clone)]
pub struct ForwarderHandle {
    tx: mpsc::Sender<LogRecord>,
    metrics: Arc<ForwardMetrics>,
}

impl ForwarderHandle {
    /// Queues one record, waiting while the queue is at the high-water
    /// mark. Returns `false` once the forwarder has shut down.
    pub async fn send(&self, record: LogRecord) -> bool {
        self.tx.send(record).await.is_ok()
    }

    pub fn metrics(&self) -> Arc<ForwardMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Bare handle wired to a plain receiver, for worker tests.
    #[cfg(test)]
    pub(crate) fn test_pair(capacity: usize) -> (Self, mpsc::Receiver<LogRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                metrics: Arc::new(ForwardMetrics::default()),
            },
            rx,
        )
    }
}

pub struct Forwarder {
    rx: mpsc::Receiver<LogRecord>,
    sink: Arc<dyn LogSink>,
    pending: VecDeque<LogRecord>,
    batch_max_records: usize,
    batch_max_delay: std::time::Duration,
    pending_hard_limit: usize,
    retry_attempts: u32,
    backoff: BackoffPolicy,
    metrics: Arc<ForwardMetrics>,
}

impl Forwarder {
    pub fn new(sink: Arc<dyn LogSink>, settings: &Settings) -> (Self, ForwarderHandle) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity);
        let metrics = Arc::new(ForwardMetrics::default());
        let forwarder = Self {
            rx,
            sink,
            pending: VecDeque::new(),
            batch_max_records: settings.batch_max_records,
            batch_max_delay: settings.batch_max_delay,
            pending_hard_limit: settings.pending_hard_limit,
            retry_attempts: settings.sink_retry_attempts.max(1),
            backoff: BackoffPolicy::default(),
            metrics: Arc::clone(&metrics),
        };
        (forwarder, ForwarderHandle { tx, metrics })
    }

    /// Runs until every producer handle is dropped, then performs a final
    /// flush of everything still buffered.
    pub async fn run(mut self) {
        // The first tick of a plain interval completes immediately; start
        // one full window out so the timer only ever flushes records that
        // actually waited that long.
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.batch_max_delay,
            self.batch_max_delay,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(record) => {
                        self.buffer(record);
                        if self.pending.len() >= self.batch_max_records {
                            while self.pending.len() >= self.batch_max_records {
                                self.flush_one_batch().await;
                            }
                            ticker.reset();
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        self.flush_one_batch().await;
                    }
                }
            }
        }

        // Producers are gone; drain whatever is left in the channel and
        // flush the tail.
        while let Ok(record) = self.rx.try_recv() {
            self.buffer(record);
        }
        while !self.pending.is_empty() {
            self.flush_one_batch().await;
        }
        log::debug!(
            "forwarder finished: delivered={} dropped={}",
            self.metrics.delivered(),
            self.metrics.dropped()
        );
    }

    /// Buffers one record, enforcing the hard ceiling by dropping the
    /// oldest pending record first.
    fn buffer(&mut self, record: LogRecord) {
        if self.pending.len() >= self.pending_hard_limit {
            self.pending.pop_front();
            let total = self.metrics.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total.is_power_of_two() {
                log::warn!(
                    "pending buffer at hard ceiling ({}), dropped {} records so far",
                    self.pending_hard_limit,
                    total
                );
            }
        }
        self.pending.push_back(record);
    }

    /// Cuts one batch off the front of the queue and sends it, retrying
    /// with backoff before giving the batch up.
    async fn flush_one_batch(&mut self) {
        let take = self.pending.len().min(self.batch_max_records);
        let batch: Vec<LogRecord> = self.pending.drain(..take).collect();

        for attempt in 0..self.retry_attempts {
            match self.sink.send_batch(&batch).await {
                Ok(()) => {
                    self.metrics
                        .delivered
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    return;
                }
                Err(err) => {
                    log::warn!(
                        "sink refused batch of {} records (attempt {}/{}): {}",
                        batch.len(),
                        attempt + 1,
                        self.retry_attempts,
                        err
                    );
                    if attempt + 1 < self.retry_attempts {
                        tokio::time::sleep(self.backoff.delay(attempt)).await;
                    }
                }
            }
        }

        self.metrics
            .dropped
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.metrics.batches_dropped.fetch_add(1, Ordering::Relaxed);
        log::error!(
            "dropping batch of {} records after {} failed attempts",
            batch.len(),
            self.retry_attempts
        );
    }
}
