// Upload Progress Engine
// One tokio task per file, live metrics per task, cancellation that aborts server-side

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::browser::Browser;
use crate::providers::{ProgressFn, StorageError, UploadSource};

/// S3 rejects multipart parts below 5 MiB (except the last)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
/// Parts are sized so a file needs about this many
pub const TARGET_PART_COUNT: u64 = 100;
/// Parts of one file in flight at once
pub const DEFAULT_QUEUE_SIZE: usize = 4;
/// How long a finished task stays visible at 100%
pub const DEFAULT_COMPLETION_GRACE: Duration = Duration::from_millis(1000);

const EVENT_CAPACITY: usize = 256;

/// Part size for an object of `total` bytes: `max(5 MiB, ceil(total / 100))`
pub fn part_size_for(total: u64) -> u64 {
    MIN_PART_SIZE.max(total.div_ceil(TARGET_PART_COUNT))
}

/// Time left for an upload
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Eta {
    /// No elapsed time or no throughput yet
    Calculating,
    Remaining(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressMetrics {
    pub percent: u8,
    pub elapsed: Duration,
    pub bytes_per_sec: f64,
    pub eta: Eta,
}

/// Derive percent, throughput and ETA from one progress callback
pub fn compute_metrics(loaded: u64, total: u64, elapsed: Duration) -> ProgressMetrics {
    let percent = if total == 0 {
        0
    } else {
        ((loaded as f64 / total as f64) * 100.0).round().min(100.0) as u8
    };

    let secs = elapsed.as_secs_f64();
    let bytes_per_sec = if secs > 0.0 { loaded as f64 / secs } else { 0.0 };

    let eta = if secs > 0.0 && bytes_per_sec > 0.0 {
        let remaining = total.saturating_sub(loaded) as f64 / bytes_per_sec;
        Eta::Remaining(Duration::from_secs_f64(remaining))
    } else {
        Eta::Calculating
    };

    ProgressMetrics {
        percent,
        elapsed,
        bytes_per_sec,
        eta,
    }
}

/// Human readable throughput
pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec < 1024.0 {
        format!("{:.0} B/s", bytes_per_sec)
    } else if bytes_per_sec < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bytes_per_sec / 1024.0)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / (1024.0 * 1024.0))
    }
}

/// Human readable ETA
pub fn format_eta(eta: Eta) -> String {
    match eta {
        Eta::Calculating => "calculating...".to_string(),
        Eta::Remaining(d) => {
            let secs = d.as_secs_f64().round() as u64;
            if secs < 60 {
                format!("{}s", secs)
            } else {
                format!("{}m {}s", secs / 60, secs % 60)
            }
        }
    }
}

/// A file being uploaded
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: String,
    pub file_name: String,
    pub key: String,
    pub total_bytes: u64,
    pub loaded_bytes: u64,
    pub started: Instant,
    pub completed: bool,
    cancel: CancellationToken,
}

impl UploadTask {
    pub fn snapshot(&self) -> UploadSnapshot {
        let mut metrics = compute_metrics(self.loaded_bytes, self.total_bytes, self.started.elapsed());
        if self.completed {
            metrics.percent = 100;
        }
        UploadSnapshot {
            id: self.id.clone(),
            file_name: self.file_name.clone(),
            key: self.key.clone(),
            total_bytes: self.total_bytes,
            loaded_bytes: self.loaded_bytes,
            metrics,
        }
    }
}

/// Point-in-time view of a task for presentation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSnapshot {
    pub id: String,
    pub file_name: String,
    pub key: String,
    pub total_bytes: u64,
    pub loaded_bytes: u64,
    pub metrics: ProgressMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadEvent {
    Started { id: String, file_name: String, key: String, total_bytes: u64 },
    Progress(UploadSnapshot),
    Completed { id: String, key: String },
    Failed { id: String, file_name: String, error: String },
    Cancelled { id: String },
}

/// Handle to one started upload
pub struct UploadHandle {
    pub id: String,
    pub key: String,
    join: JoinHandle<Result<String, StorageError>>,
}

impl UploadHandle {
    /// Wait for the upload (and its completion grace) to finish
    pub async fn wait(self) -> Result<String, StorageError> {
        self.join
            .await
            .map_err(|e| StorageError::TransferFailed(format!("upload task failed: {}", e)))?
    }
}

type TaskMap = Arc<Mutex<HashMap<String, UploadTask>>>;

fn lock_tasks(tasks: &TaskMap) -> MutexGuard<'_, HashMap<String, UploadTask>> {
    tasks.lock().unwrap_or_else(|e| e.into_inner())
}

/// Tracks concurrent uploads and publishes their progress
#[derive(Clone)]
pub struct UploadEngine {
    browser: Browser,
    tasks: TaskMap,
    events: broadcast::Sender<UploadEvent>,
    completion_grace: Duration,
}

impl UploadEngine {
    pub fn new(browser: Browser, completion_grace: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            browser,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            events,
            completion_grace,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    /// Tracked tasks, oldest first
    pub fn active(&self) -> Vec<UploadSnapshot> {
        let tasks = lock_tasks(&self.tasks);
        let mut list: Vec<&UploadTask> = tasks.values().collect();
        list.sort_by_key(|t| t.started);
        list.into_iter().map(UploadTask::snapshot).collect()
    }

    /// Start uploading every source to `destination_prefix`; all run concurrently
    pub async fn start_batch(
        &self,
        sources: Vec<UploadSource>,
        destination_prefix: &str,
    ) -> Vec<Result<UploadHandle, StorageError>> {
        let mut handles = Vec::with_capacity(sources.len());
        for source in sources {
            handles.push(self.start(source, destination_prefix).await);
        }
        handles
    }

    /// Start one upload to `destination_prefix + file name`
    pub async fn start(
        &self,
        source: UploadSource,
        destination_prefix: &str,
    ) -> Result<UploadHandle, StorageError> {
        let total_bytes = source.len().await?;
        let file_name = source.name().to_string();
        let key = format!("{}{}", destination_prefix, file_name);
        let content_type = source.content_type();
        let id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        lock_tasks(&self.tasks).insert(
            id.clone(),
            UploadTask {
                id: id.clone(),
                file_name: file_name.clone(),
                key: key.clone(),
                total_bytes,
                loaded_bytes: 0,
                started: Instant::now(),
                completed: false,
                cancel: cancel.clone(),
            },
        );
        let _ = self.events.send(UploadEvent::Started {
            id: id.clone(),
            file_name: file_name.clone(),
            key: key.clone(),
            total_bytes,
        });
        info!("Upload {} started: {} -> {} ({} bytes)", id, file_name, key, total_bytes);

        let engine = self.clone();
        let task_id = id.clone();
        let task_key = key.clone();
        let join = tokio::spawn(async move {
            let on_progress: ProgressFn = {
                let tasks = engine.tasks.clone();
                let events = engine.events.clone();
                let id = task_id.clone();
                Box::new(move |loaded, _total| {
                    let snapshot = {
                        let mut tasks = lock_tasks(&tasks);
                        let Some(task) = tasks.get_mut(&id) else { return };
                        task.loaded_bytes = task.loaded_bytes.max(loaded);
                        task.snapshot()
                    };
                    let _ = events.send(UploadEvent::Progress(snapshot));
                })
            };

            let store = engine.browser.store().clone();
            let result = store
                .upload(&source, &task_key, &content_type, Some(on_progress), cancel)
                .await;
            engine.finish(&task_id, &file_name, result).await
        });

        Ok(UploadHandle { id, key, join })
    }

    async fn finish(
        &self,
        id: &str,
        file_name: &str,
        result: Result<String, StorageError>,
    ) -> Result<String, StorageError> {
        match result {
            Ok(key) => {
                {
                    let mut tasks = lock_tasks(&self.tasks);
                    if let Some(task) = tasks.get_mut(id) {
                        task.loaded_bytes = task.total_bytes;
                        task.completed = true;
                    }
                }
                let _ = self.events.send(UploadEvent::Completed {
                    id: id.to_string(),
                    key: key.clone(),
                });
                info!("Upload {} completed: {}", id, key);

                tokio::time::sleep(self.completion_grace).await;
                lock_tasks(&self.tasks).remove(id);
                if let Err(e) = self.browser.refresh().await {
                    warn!("Refresh after upload of {} failed: {}", key, e);
                }
                Ok(key)
            }
            Err(StorageError::Cancelled) => {
                // cancel() already untracked the task and published the event
                lock_tasks(&self.tasks).remove(id);
                Err(StorageError::Cancelled)
            }
            Err(e) => {
                lock_tasks(&self.tasks).remove(id);
                warn!("Upload {} of {} failed: {}", id, file_name, e);
                let _ = self.events.send(UploadEvent::Failed {
                    id: id.to_string(),
                    file_name: file_name.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Stop tracking a task and abort its transfer.
    ///
    /// Returns false for unknown ids and for uploads that already committed.
    pub fn cancel(&self, id: &str) -> bool {
        let task = {
            let mut tasks = lock_tasks(&self.tasks);
            match tasks.get(id).map(|task| task.completed) {
                Some(false) => tasks.remove(id),
                _ => None,
            }
        };
        let Some(task) = task else {
            return false;
        };
        task.cancel.cancel();
        let _ = self.events.send(UploadEvent::Cancelled { id: id.to_string() });
        info!("Upload {} cancelled: {}", id, task.key);
        true
    }

    /// Cancel every tracked task
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = lock_tasks(&self.tasks).keys().cloned().collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::memory::MemoryStore;

    const MIB: u64 = 1024 * 1024;

    fn engine(store: Arc<MemoryStore>, grace: Duration) -> UploadEngine {
        UploadEngine::new(Browser::new(store), grace)
    }

    #[test]
    fn test_part_size_policy() {
        assert_eq!(part_size_for(0), MIN_PART_SIZE);
        assert_eq!(part_size_for(10 * MIB), 5 * MIB);
        assert_eq!(part_size_for(2500 * MIB), 25 * MIB);
        assert_eq!(part_size_for(1000 * MIB + 1), 10 * MIB + 1);
    }

    #[test]
    fn test_compute_metrics() {
        let m = compute_metrics(50, 100, Duration::from_secs(10));
        assert_eq!(m.percent, 50);
        assert_eq!(m.bytes_per_sec, 5.0);
        assert_eq!(m.eta, Eta::Remaining(Duration::from_secs(10)));

        let m = compute_metrics(1, 3, Duration::from_secs(1));
        assert_eq!(m.percent, 33);
    }

    #[test]
    fn test_eta_shrinks_as_upload_nears_total() {
        let elapsed = Duration::from_secs(4);
        let mut previous: Option<Duration> = None;
        for loaded in [10, 25, 50, 75, 90, 99, 100] {
            let Eta::Remaining(eta) = compute_metrics(loaded, 100, elapsed).eta else {
                panic!("eta should be known at {loaded} bytes");
            };
            if let Some(previous) = previous {
                assert!(eta < previous, "eta did not shrink at {loaded} bytes");
            }
            previous = Some(eta);
        }
        assert_eq!(previous, Some(Duration::ZERO));
    }

    #[test]
    fn test_metrics_eta_calculating() {
        assert_eq!(compute_metrics(10, 100, Duration::ZERO).eta, Eta::Calculating);
        assert_eq!(compute_metrics(0, 100, Duration::from_secs(5)).eta, Eta::Calculating);
        assert_eq!(compute_metrics(0, 0, Duration::from_secs(5)).percent, 0);
    }

    #[test]
    fn test_format_speed_and_eta() {
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(1536.0), "1.5 KB/s");
        assert_eq!(format_speed(2.5 * MIB as f64), "2.5 MB/s");
        assert_eq!(format_eta(Eta::Calculating), "calculating...");
        assert_eq!(format_eta(Eta::Remaining(Duration::from_secs(45))), "45s");
        assert_eq!(format_eta(Eta::Remaining(Duration::from_secs(125))), "2m 5s");
    }

    #[tokio::test]
    async fn test_completed_task_stays_for_grace_then_relists() {
        let store = Arc::new(MemoryStore::default().with_delay(Duration::from_millis(5)));
        let engine = engine(store.clone(), Duration::from_millis(150));
        let mut events = engine.subscribe();

        let handle = engine
            .start(UploadSource::from_bytes("a.txt", b"hello".to_vec()), "docs/")
            .await
            .unwrap();
        assert_eq!(handle.key, "docs/a.txt");

        loop {
            match events.recv().await.unwrap() {
                UploadEvent::Completed { key, .. } => {
                    assert_eq!(key, "docs/a.txt");
                    break;
                }
                UploadEvent::Failed { error, .. } => panic!("upload failed: {error}"),
                _ => {}
            }
        }
        let active = engine.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].metrics.percent, 100);

        handle.wait().await.unwrap();
        assert!(engine.active().is_empty());
        assert_eq!(store.keys(), vec!["docs/a.txt"]);
        // Browser is at the root; the refresh lists it
        assert_eq!(store.list_calls.lock().unwrap().as_slice(), [""]);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let store = Arc::new(MemoryStore::default().with_delay(Duration::from_millis(5)));
        let engine = engine(store, Duration::ZERO);
        let mut events = engine.subscribe();

        let handle = engine
            .start(UploadSource::from_bytes("b.bin", vec![0u8; 400]), "")
            .await
            .unwrap();
        handle.wait().await.unwrap();

        let mut last = 0;
        while let Ok(event) = events.try_recv() {
            if let UploadEvent::Progress(snapshot) = event {
                assert!(snapshot.loaded_bytes >= last);
                last = snapshot.loaded_bytes;
            }
        }
        assert_eq!(last, 400);
    }

    #[tokio::test]
    async fn test_failed_upload_removed_immediately() {
        let store = Arc::new(MemoryStore::default());
        *store.fail_prefix.lock().unwrap() = Some("locked/".to_string());
        let engine = engine(store, Duration::from_secs(60));
        let mut events = engine.subscribe();

        let handle = engine
            .start(UploadSource::from_bytes("c.txt", b"x".to_vec()), "locked/")
            .await
            .unwrap();
        assert!(handle.wait().await.is_err());
        assert!(engine.active().is_empty());

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            if let UploadEvent::Failed { file_name, .. } = event {
                assert_eq!(file_name, "c.txt");
                failed = true;
            }
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn test_cancel_aborts_and_untracks() {
        let store = Arc::new(MemoryStore::default().with_delay(Duration::from_millis(200)));
        let engine = engine(store.clone(), Duration::ZERO);

        let handle = engine
            .start(UploadSource::from_bytes("big.iso", vec![1u8; 64]), "isos/")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(engine.cancel(&handle.id));
        assert!(engine.active().is_empty());
        assert!(!engine.cancel(&handle.id));

        assert!(matches!(handle.wait().await, Err(StorageError::Cancelled)));
        assert_eq!(*store.aborted.lock().unwrap(), vec!["isos/big.iso"]);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_refused_after_commit() {
        let store = Arc::new(MemoryStore::default());
        let engine = engine(store.clone(), Duration::from_millis(150));
        let mut events = engine.subscribe();

        let handle = engine
            .start(UploadSource::from_bytes("a.txt", b"hello".to_vec()), "")
            .await
            .unwrap();
        loop {
            if let UploadEvent::Completed { .. } = events.recv().await.unwrap() {
                break;
            }
        }

        // Still listed at 100% during the grace delay
        assert_eq!(engine.active().len(), 1);
        assert!(!engine.cancel(&handle.id));
        assert_eq!(engine.cancel_all(), 0);

        assert_eq!(handle.wait().await.unwrap(), "a.txt");
        assert_eq!(store.keys(), vec!["a.txt"]);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, UploadEvent::Cancelled { .. }));
        }
    }

    #[tokio::test]
    async fn test_batch_runs_concurrently() {
        let store = Arc::new(MemoryStore::default().with_delay(Duration::from_millis(50)));
        let engine = engine(store.clone(), Duration::ZERO);

        let started = Instant::now();
        let handles = engine
            .start_batch(
                vec![
                    UploadSource::from_bytes("1.txt", b"1".to_vec()),
                    UploadSource::from_bytes("2.txt", b"2".to_vec()),
                    UploadSource::from_bytes("3.txt", b"3".to_vec()),
                ],
                "batch/",
            )
            .await;
        assert_eq!(engine.active().len(), 3);
        for handle in handles {
            handle.unwrap().wait().await.unwrap();
        }
        // Four 50 ms steps each; sequential would take 600 ms
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(store.keys().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_file_rejected_before_tracking() {
        let engine = engine(Arc::new(MemoryStore::default()), Duration::ZERO);
        let dir = tempfile::tempdir().unwrap();
        let source = UploadSource::from_path(dir.path().join("missing.bin")).unwrap();
        assert!(engine.start(source, "").await.is_err());
        assert!(engine.active().is_empty());
    }
}
