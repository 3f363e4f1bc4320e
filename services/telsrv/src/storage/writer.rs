//! Batched history writer
//!
//! Decoded results are queued on a channel and flushed by a single task
//! when either threshold trips: the buffer reaches `batch_size`, or
//! `flush_interval` has elapsed since the first unflushed row. The timer
//! is armed only while the buffer is non-empty, so an idle writer sleeps
//! on the channel alone. A failed batch insert degrades to per-row
//! inserts so one poison row cannot sink its neighbours.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::model::ParsedFrameResult;
use crate::storage::store::{HistoryStore, ValueCache};

const QUEUE_DEPTH: usize = 4096;

/// Hook observing each flush; used by supervision and tests
pub trait FlushObserver: Send + Sync {
    fn on_flush(&self, written: usize, failed: usize);
}

/// Cheap cloneable handle feeding the writer task
#[derive(Clone)]
pub struct BatchWriter {
    tx: mpsc::Sender<ParsedFrameResult>,
}

impl BatchWriter {
    /// Spawn the writer task and return its handle
    pub fn spawn(
        store: Arc<dyn HistoryStore>,
        cache: Option<Arc<dyn ValueCache>>,
        batch_size: usize,
        flush_interval: Duration,
        observer: Option<Arc<dyn FlushObserver>>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let task = WriterTask {
            store,
            cache,
            batch_size: batch_size.max(1),
            flush_interval,
            observer,
        };
        let handle = tokio::spawn(task.run(rx));
        (Self { tx }, handle)
    }

    /// Queue a result for persistence. Never blocks the decode path; a
    /// full queue drops the row with a warning.
    pub fn submit(&self, row: ParsedFrameResult) {
        if let Err(e) = self.tx.try_send(row) {
            warn!("history queue full, dropping row: {e}");
        }
    }
}

struct WriterTask {
    store: Arc<dyn HistoryStore>,
    cache: Option<Arc<dyn ValueCache>>,
    batch_size: usize,
    flush_interval: Duration,
    observer: Option<Arc<dyn FlushObserver>>,
}

impl WriterTask {
    async fn run(self, mut rx: mpsc::Receiver<ParsedFrameResult>) {
        let mut buffer: Vec<ParsedFrameResult> = Vec::with_capacity(self.batch_size);
        // Armed when the first row lands in an empty buffer
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                row = rx.recv() => {
                    match row {
                        Some(row) => {
                            if buffer.is_empty() {
                                deadline = Some(Instant::now() + self.flush_interval);
                            }
                            buffer.push(row);
                            if buffer.len() >= self.batch_size {
                                self.flush(&mut buffer).await;
                                deadline = None;
                            }
                        }
                        None => {
                            // Channel closed: final flush, then exit
                            self.flush(&mut buffer).await;
                            return;
                        }
                    }
                }
                () = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.flush(&mut buffer).await;
                    deadline = None;
                }
            }
        }
    }

    async fn flush(&self, buffer: &mut Vec<ParsedFrameResult>) {
        if buffer.is_empty() {
            return;
        }
        let rows = std::mem::take(buffer);
        let total = rows.len();

        let mut failed = 0;
        if let Err(e) = self.store.insert_batch(&rows).await {
            warn!(rows = total, "batch insert failed, retrying per row: {e}");
            for row in &rows {
                if let Err(e) = self.store.insert_one(row).await {
                    error!(device_id = row.device_id, "row insert failed: {e}");
                    failed += 1;
                }
            }
        }

        if let Some(cache) = &self.cache {
            for row in &rows {
                if let Err(e) = cache.publish(row).await {
                    warn!(device_id = row.device_id, "cache publish failed: {e}");
                }
            }
        }

        debug!(written = total - failed, failed, "history flush");
        if let Some(observer) = &self.observer {
            observer.on_flush(total - failed, failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, TelSrvError};
    use crate::model::{ByteOrder, DeviceSnapshot, ProtocolKind};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct MemoryStore {
        batches: Mutex<Vec<usize>>,
        rows: Mutex<Vec<ParsedFrameResult>>,
        fail_batches: bool,
        fail_rows_with_device: Option<u32>,
    }

    impl MemoryStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                rows: Mutex::new(Vec::new()),
                fail_batches: false,
                fail_rows_with_device: None,
            })
        }
    }

    #[async_trait]
    impl HistoryStore for MemoryStore {
        async fn insert_batch(&self, rows: &[ParsedFrameResult]) -> Result<()> {
            if self.fail_batches {
                return Err(TelSrvError::StorageError("batch rejected".to_string()));
            }
            self.batches.lock().push(rows.len());
            self.rows.lock().extend(rows.iter().cloned());
            Ok(())
        }

        async fn insert_one(&self, row: &ParsedFrameResult) -> Result<()> {
            if self.fail_rows_with_device == Some(row.device_id) {
                return Err(TelSrvError::StorageError("row rejected".to_string()));
            }
            self.rows.lock().push(row.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingObserver {
        flushes: Mutex<Vec<(usize, usize)>>,
    }

    impl FlushObserver for CountingObserver {
        fn on_flush(&self, written: usize, failed: usize) {
            self.flushes.lock().push((written, failed));
        }
    }

    fn row(device_id: u32) -> ParsedFrameResult {
        let device = DeviceSnapshot {
            id: device_id,
            code: format!("D{device_id}"),
            link_id: 1,
            protocol: ProtocolKind::Modbus,
            heartbeat: Vec::new(),
            registration: Vec::new(),
            require_registration: false,
            poll_interval_secs: 30,
            byte_order: ByteOrder::BigEndian,
            unit_id: 1,
            registers: Vec::new(),
        };
        ParsedFrameResult::new(&device, "read_holding_register")
    }

    async fn settle() {
        // Let the writer task observe queued rows
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_threshold_splits_batches() {
        let store = MemoryStore::new();
        let observer = Arc::new(CountingObserver::default());
        let (writer, handle) = BatchWriter::spawn(
            store.clone(),
            None,
            100,
            Duration::from_millis(200),
            Some(observer.clone()),
        );

        for i in 0..150 {
            writer.submit(row(i));
        }
        settle().await;
        // First 100 flushed immediately on the size threshold
        assert_eq!(store.batches.lock().as_slice(), &[100]);

        tokio::time::advance(Duration::from_millis(201)).await;
        settle().await;
        // Remaining 50 flushed by the interval timer
        assert_eq!(store.batches.lock().as_slice(), &[100, 50]);
        assert_eq!(observer.flushes.lock().as_slice(), &[(100, 0), (50, 0)]);

        drop(writer);
        handle.await.expect("writer task");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_armed_by_first_row() {
        let store = MemoryStore::new();
        let (writer, handle) =
            BatchWriter::spawn(store.clone(), None, 100, Duration::from_millis(200), None);

        // Idle writer: no flush however long we wait
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert!(store.batches.lock().is_empty());

        writer.submit(row(1));
        settle().await;
        tokio::time::advance(Duration::from_millis(150)).await;
        settle().await;
        assert!(store.batches.lock().is_empty());

        tokio::time::advance(Duration::from_millis(51)).await;
        settle().await;
        assert_eq!(store.batches.lock().as_slice(), &[1]);

        drop(writer);
        handle.await.expect("writer task");
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_failure_falls_back_per_row() {
        let store = Arc::new(MemoryStore {
            batches: Mutex::new(Vec::new()),
            rows: Mutex::new(Vec::new()),
            fail_batches: true,
            fail_rows_with_device: Some(2),
        });
        let observer = Arc::new(CountingObserver::default());
        let (writer, handle) = BatchWriter::spawn(
            store.clone(),
            None,
            100,
            Duration::from_millis(200),
            Some(observer.clone()),
        );

        writer.submit(row(1));
        writer.submit(row(2));
        writer.submit(row(3));
        settle().await;
        tokio::time::advance(Duration::from_millis(201)).await;
        settle().await;

        // Rows 1 and 3 survive the per-row fallback, row 2 is reported
        let saved: Vec<u32> = store.rows.lock().iter().map(|r| r.device_id).collect();
        assert_eq!(saved, vec![1, 3]);
        assert_eq!(observer.flushes.lock().as_slice(), &[(2, 1)]);

        drop(writer);
        handle.await.expect("writer task");
    }

    #[tokio::test]
    async fn test_shutdown_flushes_remainder() {
        let store = MemoryStore::new();
        let (writer, handle) =
            BatchWriter::spawn(store.clone(), None, 100, Duration::from_secs(60), None);

        writer.submit(row(1));
        writer.submit(row(2));
        drop(writer);
        handle.await.expect("writer task");

        assert_eq!(store.batches.lock().as_slice(), &[2]);
    }
}
