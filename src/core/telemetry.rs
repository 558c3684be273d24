//! Best-effort transmission telemetry.
//!
//! Request handlers push [`TelemetryRecord`]s through a cloneable
//! [`TelemetryHandle`] into a bounded queue. A single consumer task owns the
//! buffer and hands full batches to a small pool of flush workers. Delivery is
//! at-most-once: a full queue, a saturated worker pool or a failed bulk call
//! never reaches the request path.
use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::{Mutex, Semaphore, mpsc},
    task::{JoinHandle, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{config::models::ElasticSearchConfig, ports::telemetry::BulkWriter};

/// Outcome of one proxied request. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryRecord {
    #[serde(rename = "ServiceName")]
    pub service_name: String,
    #[serde(rename = "TransmitTime")]
    pub dispatch_timestamp: i64,
    #[serde(rename = "ResultTime")]
    pub completion_timestamp: i64,
    #[serde(rename = "Host")]
    pub upstream_host: String,
    #[serde(rename = "StatusCode")]
    pub status_code: u16,
}

impl TelemetryRecord {
    /// Record completed now.
    pub fn completed(
        service_name: impl Into<String>,
        dispatch_timestamp: i64,
        upstream_host: impl Into<String>,
        status_code: u16,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            dispatch_timestamp,
            completion_timestamp: chrono::Utc::now().timestamp(),
            upstream_host: upstream_host.into(),
            status_code,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    pub bulk_max_count: usize,
    pub flush_interval: Duration,
    pub queue_capacity: usize,
    pub max_flush_workers: usize,
    pub stop_timeout: Duration,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            bulk_max_count: 20,
            flush_interval: Duration::from_secs(5),
            queue_capacity: 200,
            max_flush_workers: 100,
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl TelemetryOptions {
    pub fn from_config(es: &ElasticSearchConfig, stop_timeout: Duration) -> Self {
        Self {
            bulk_max_count: es.bulk_max_count.max(1),
            flush_interval: Duration::from_secs(es.flush_interval.max(1)),
            queue_capacity: es.queue_capacity.max(1),
            max_flush_workers: es.max_flush_workers.max(1),
            stop_timeout,
        }
    }
}

/// Producer side of the sink. Cheap to clone; never blocks.
#[derive(Clone, Default)]
pub struct TelemetryHandle {
    tx: Option<mpsc::Sender<TelemetryRecord>>,
}

impl TelemetryHandle {
    /// A handle whose emits are no-ops, used when collection is switched off.
    pub fn inactive() -> Self {
        Self { tx: None }
    }

    pub fn is_active(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn emit(&self, record: TelemetryRecord) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                tracing::debug!(service = %record.service_name, "Telemetry queue full, dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

pub struct TelemetrySink {
    handle: TelemetryHandle,
    cancel: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
}

impl TelemetrySink {
    /// Start the consumer task on the current runtime.
    pub fn spawn(writer: Arc<dyn BulkWriter>, options: TelemetryOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.queue_capacity);
        let cancel = CancellationToken::new();
        let stop_timeout = options.stop_timeout;

        tracing::info!(
            bulk_max_count = options.bulk_max_count,
            flush_interval = ?options.flush_interval,
            queue_capacity = options.queue_capacity,
            "Telemetry sink started"
        );

        let consumer = Consumer {
            writer,
            rx,
            buffer: Vec::with_capacity(options.bulk_max_count),
            workers: Arc::new(Semaphore::new(options.max_flush_workers)),
            inflight: JoinSet::new(),
            options,
        };
        let task = tokio::spawn(consumer.run(cancel.clone()));

        Self {
            handle: TelemetryHandle { tx: Some(tx) },
            cancel,
            consumer: Mutex::new(Some(task)),
            stop_timeout,
        }
    }

    pub fn handle(&self) -> TelemetryHandle {
        self.handle.clone()
    }

    /// Signal shutdown and wait, bounded, for the final flush.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let Some(task) = self.consumer.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(self.stop_timeout, task).await {
            Ok(Ok(())) => tracing::info!("Telemetry sink stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "Telemetry consumer task failed"),
            Err(_) => tracing::error!(timeout = ?self.stop_timeout, "Telemetry sink stop timeout"),
        }
    }
}

struct Consumer {
    writer: Arc<dyn BulkWriter>,
    rx: mpsc::Receiver<TelemetryRecord>,
    buffer: Vec<TelemetryRecord>,
    workers: Arc<Semaphore>,
    inflight: JoinSet<()>,
    options: TelemetryOptions,
}

impl Consumer {
    async fn run(mut self, cancel: CancellationToken) {
        let period = self.options.flush_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.rx.recv() => match received {
                    Some(record) => self.push(record),
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        let batch = std::mem::take(&mut self.buffer);
                        flush(self.writer.as_ref(), &batch).await;
                    }
                }
                Some(joined) = self.inflight.join_next(), if !self.inflight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Telemetry flush worker failed");
                    }
                }
            }
        }

        self.shutdown().await;
    }

    fn push(&mut self, record: TelemetryRecord) {
        self.buffer.push(record);
        if self.buffer.len() < self.options.bulk_max_count {
            return;
        }

        let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
            tracing::error!(
                buffered = self.buffer.len(),
                "Telemetry flush workers exhausted, deferring bulk flush"
            );
            return;
        };
        let batch: Vec<_> = self.buffer.drain(..self.options.bulk_max_count).collect();
        let writer = Arc::clone(&self.writer);
        self.inflight.spawn(async move {
            let _permit = permit;
            flush(writer.as_ref(), &batch).await;
        });
    }

    async fn shutdown(mut self) {
        self.rx.close();
        while let Ok(record) = self.rx.try_recv() {
            self.buffer.push(record);
        }

        for batch in self.buffer.chunks(self.options.bulk_max_count) {
            flush(self.writer.as_ref(), batch).await;
        }
        while let Some(joined) = self.inflight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Telemetry flush worker failed");
            }
        }
        tracing::info!("Telemetry consumer exited");
    }
}

async fn flush(writer: &dyn BulkWriter, batch: &[TelemetryRecord]) {
    if batch.is_empty() {
        return;
    }
    match writer.bulk_index(batch).await {
        Ok(()) => tracing::debug!(records = batch.len(), "Telemetry batch flushed"),
        Err(e) => tracing::error!(records = batch.len(), error = %e, "Telemetry bulk flush failed"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::ports::telemetry::TelemetryError;

    #[derive(Default)]
    struct RecordingWriter {
        batches: StdMutex<Vec<Vec<TelemetryRecord>>>,
        gate: Option<Semaphore>,
    }

    impl RecordingWriter {
        fn gated() -> Self {
            Self {
                batches: StdMutex::default(),
                gate: Some(Semaphore::new(0)),
            }
        }

        fn batches(&self) -> Vec<Vec<TelemetryRecord>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BulkWriter for RecordingWriter {
        async fn bulk_index(&self, records: &[TelemetryRecord]) -> Result<(), TelemetryError> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            self.batches.lock().unwrap().push(records.to_vec());
            Ok(())
        }
    }

    fn record(n: u16) -> TelemetryRecord {
        TelemetryRecord {
            service_name: "svc".to_string(),
            dispatch_timestamp: 1,
            completion_timestamp: 2,
            upstream_host: "10.0.0.1".to_string(),
            status_code: n,
        }
    }

    fn options(bulk_max_count: usize, max_flush_workers: usize) -> TelemetryOptions {
        TelemetryOptions {
            bulk_max_count,
            flush_interval: Duration::from_secs(5),
            queue_capacity: 64,
            max_flush_workers,
            stop_timeout: Duration::from_secs(1),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_once_in_order() {
        let writer = Arc::new(RecordingWriter::default());
        let sink = TelemetrySink::spawn(writer.clone(), options(3, 4));
        let handle = sink.handle();

        for n in 0..3 {
            handle.emit(record(n));
        }
        settle().await;

        assert_eq!(writer.batches(), vec![vec![record(0), record(1), record(2)]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_flushes_partial_buffer() {
        let writer = Arc::new(RecordingWriter::default());
        let sink = TelemetrySink::spawn(writer.clone(), options(3, 4));
        let handle = sink.handle();

        handle.emit(record(0));
        handle.emit(record(1));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(writer.batches().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(writer.batches(), vec![vec![record(0), record(1)]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_remaining_records() {
        let writer = Arc::new(RecordingWriter::default());
        let sink = TelemetrySink::spawn(writer.clone(), options(10, 4));
        let handle = sink.handle();

        handle.emit(record(0));
        handle.emit(record(1));
        sink.stop().await;

        assert_eq!(writer.batches(), vec![vec![record(0), record(1)]]);
        assert!(!handle.is_active());
        // dropped silently once stopped
        handle.emit(record(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_workers_defer_flush() {
        let writer = Arc::new(RecordingWriter::gated());
        let sink = TelemetrySink::spawn(writer.clone(), options(2, 1));
        let handle = sink.handle();

        for n in 0..4 {
            handle.emit(record(n));
        }
        settle().await;
        assert!(writer.batches().is_empty());

        writer.gate.as_ref().unwrap().add_permits(16);
        settle().await;
        assert_eq!(writer.batches(), vec![vec![record(0), record(1)]]);

        handle.emit(record(4));
        settle().await;
        assert_eq!(
            writer.batches(),
            vec![vec![record(0), record(1)], vec![record(2), record(3)]]
        );
    }

    #[tokio::test]
    async fn test_inactive_handle_is_noop() {
        let handle = TelemetryHandle::inactive();
        assert!(!handle.is_active());
        handle.emit(record(0));
    }

    #[test]
    fn test_record_document_field_names() {
        let doc = serde_json::to_value(record(200)).unwrap();
        assert_eq!(doc["ServiceName"], "svc");
        assert_eq!(doc["TransmitTime"], 1);
        assert_eq!(doc["ResultTime"], 2);
        assert_eq!(doc["Host"], "10.0.0.1");
        assert_eq!(doc["StatusCode"], 200);
    }
}
