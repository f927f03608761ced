//! Background delivery loop over a [`PersistentQueue`]

use super::{PersistentQueue, QueueError};
use crate::config::QueueConfig;
use crate::delivery::{Deliver, deliver_catching};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pulls batches from a queue and hands them to a delivery function
#[derive(Clone)]
pub struct QueueProcessor {
    queue: Arc<PersistentQueue>,
    deliver: Arc<dyn Deliver>,
    config: QueueConfig,
    cancel: Arc<Mutex<Option<CancellationToken>>>,
}

impl QueueProcessor {
    pub fn new(queue: Arc<PersistentQueue>, deliver: Arc<dyn Deliver>, config: QueueConfig) -> Self {
        Self {
            queue,
            deliver,
            config,
            cancel: Arc::new(Mutex::new(None)),
        }
    }

    pub fn queue(&self) -> &Arc<PersistentQueue> {
        &self.queue
    }

    /// Deliver up to `batch_size` ready entries, then run queue maintenance
    ///
    /// Delivery errors and panics are recorded on the entry and retried with
    /// backoff; they are not returned. Returns the number of entries taken
    /// from the queue.
    ///
    /// # Errors
    ///
    /// Returns the underlying `QueueError` when a store cannot be locked or
    /// written.
    pub fn process_batch(&self) -> Result<usize, QueueError> {
        let mut processed = 0;
        while processed < self.config.batch_size {
            let Some(entry) = self.queue.dequeue()? else {
                break;
            };
            processed += 1;

            match deliver_catching(self.deliver.as_ref(), &entry.message) {
                Ok(()) => {
                    self.queue.mark_delivered(&entry.queue_id)?;
                }
                Err(e) => {
                    let retrying = self
                        .queue
                        .mark_failed(&entry.queue_id, &e.to_string(), true)?;
                    if retrying {
                        debug!(queue_id = %entry.queue_id, error = %e, "delivery failed, will retry");
                    }
                }
            }
        }

        let cleaned = self.queue.cleanup_expired_entries()?;
        let recovered = self.queue.retry_failed_messages()?;
        if processed > 0 || cleaned > 0 || recovered > 0 {
            debug!(processed, cleaned, recovered, "batch complete");
        }
        Ok(processed)
    }

    /// Spawn the processing loop on the current tokio runtime
    ///
    /// Calling this while a loop is already running stops the previous loop.
    pub fn start_processing(&self) -> JoinHandle<()> {
        let token = CancellationToken::new();
        if let Some(previous) = self.slot().replace(token.clone()) {
            previous.cancel();
        }
        let this = self.clone();
        tokio::spawn(async move { this.run(token).await })
    }

    /// Signal the loop started by [`start_processing`](Self::start_processing) to exit
    ///
    /// The loop stops within one poll interval; a delivery in flight
    /// completes first.
    pub fn stop_processing(&self) {
        if let Some(token) = self.slot().take() {
            token.cancel();
        }
    }

    /// Processing loop body; runs until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            root = %self.queue.root().display(),
            "Starting queue processor (poll interval: {:?})",
            self.config.poll_interval()
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let this = self.clone();
            let processed = match tokio::task::spawn_blocking(move || this.process_batch()).await {
                Ok(Ok(processed)) => processed,
                Ok(Err(e)) => {
                    error!("Queue processing failed: {}", e);
                    0
                }
                Err(e) => {
                    warn!("Queue processing task aborted: {}", e);
                    0
                }
            };

            // A full batch means more work is likely waiting.
            if processed >= self.config.batch_size {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = cancel.cancelled() => {}
            }
        }

        info!("Queue processor stopped");
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for QueueProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProcessor")
            .field("queue", &self.queue.root())
            .field("batch_size", &self.config.batch_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::delivery::DeliveryError;
    use crate::io::LockManager;
    use crate::schema::{EntryStatus, Message, MessageType, Priority};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn config() -> QueueConfig {
        QueueConfig {
            retry_base_delay_ms: 0,
            retry_max_delay_ms: 0,
            poll_interval_ms: 20,
            ..QueueConfig::default()
        }
    }

    fn open_queue(dir: &TempDir, config: &QueueConfig) -> Arc<PersistentQueue> {
        let locks = Arc::new(LockManager::new(LockConfig::default()));
        Arc::new(PersistentQueue::open(dir.path().join("queue"), config.clone(), locks).unwrap())
    }

    fn message(content: &str) -> Message {
        Message::new("a", "b", MessageType::Direct, content, Priority::Normal)
    }

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<String>>,
    }

    impl Deliver for Recorder {
        fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
            self.delivered.lock().unwrap().push(message.content.clone());
            Ok(())
        }
    }

    #[test]
    fn test_process_batch_delivers_in_priority_order() {
        let temp_dir = TempDir::new().unwrap();
        let config = config();
        let queue = open_queue(&temp_dir, &config);
        queue.enqueue(message("low"), Some(1.0)).unwrap();
        queue.enqueue(message("high"), Some(9.0)).unwrap();

        let recorder = Arc::new(Recorder::default());
        let processor = QueueProcessor::new(queue.clone(), recorder.clone(), config);

        assert_eq!(processor.process_batch().unwrap(), 2);
        assert_eq!(*recorder.delivered.lock().unwrap(), vec!["high", "low"]);
        assert_eq!(queue.get_queue_stats().unwrap().delivered, 2);
    }

    #[test]
    fn test_process_batch_respects_batch_size() {
        let temp_dir = TempDir::new().unwrap();
        let config = QueueConfig {
            batch_size: 2,
            ..config()
        };
        let queue = open_queue(&temp_dir, &config);
        for i in 0..5 {
            queue.enqueue(message(&i.to_string()), None).unwrap();
        }

        let processor = QueueProcessor::new(queue.clone(), Arc::new(Recorder::default()), config);
        assert_eq!(processor.process_batch().unwrap(), 2);
        assert_eq!(queue.pending_entries().unwrap().len(), 3);
    }

    #[test]
    fn test_transient_failures_then_success() {
        let temp_dir = TempDir::new().unwrap();
        let config = config();
        let queue = open_queue(&temp_dir, &config);
        let id = queue.enqueue(message("flaky"), None).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let flaky = move |_: &Message| -> Result<(), DeliveryError> {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DeliveryError::Rejected("busy".into()))
            } else {
                Ok(())
            }
        };
        let processor = QueueProcessor::new(queue.clone(), Arc::new(flaky), config);

        for _ in 0..3 {
            processor.process_batch().unwrap();
        }

        let entry = queue.get_entry(&id).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Delivered);
        assert_eq!(entry.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_delivery_counts_as_failure() {
        let temp_dir = TempDir::new().unwrap();
        let config = QueueConfig {
            max_attempts: 1,
            ..config()
        };
        let queue = open_queue(&temp_dir, &config);
        let id = queue.enqueue(message("boom"), None).unwrap();

        let boom = |_: &Message| -> Result<(), DeliveryError> { panic!("callback bug") };
        let processor = QueueProcessor::new(queue.clone(), Arc::new(boom), config);
        assert_eq!(processor.process_batch().unwrap(), 1);

        let entry = queue.get_entry(&id).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.last_error.as_deref(), Some("delivery panicked: callback bug"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loop_delivers_and_stops() {
        let temp_dir = TempDir::new().unwrap();
        let config = config();
        let queue = open_queue(&temp_dir, &config);
        let recorder = Arc::new(Recorder::default());
        let processor = QueueProcessor::new(queue.clone(), recorder.clone(), config);

        let handle = processor.start_processing();
        queue.enqueue(message("late"), None).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while recorder.delivered.lock().unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "message never delivered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        processor.stop_processing();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
        assert_eq!(*recorder.delivered.lock().unwrap(), vec!["late"]);
    }

    #[tokio::test]
    async fn test_run_exits_when_already_cancelled() {
        let temp_dir = TempDir::new().unwrap();
        let config = config();
        let queue = open_queue(&temp_dir, &config);
        let processor = QueueProcessor::new(queue, Arc::new(Recorder::default()), config);

        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), processor.run(cancel))
            .await
            .unwrap();
    }
}
