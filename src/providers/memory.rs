//! In-memory object store used by unit tests

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{
    CommonPrefix, ListItem, Listing, ObjectEntry, ObjectStore, PresignOptions, ProgressFn,
    StorageError, UploadSource,
};

#[derive(Default)]
pub(crate) struct MemoryStore {
    pub objects: Mutex<BTreeMap<String, Vec<u8>>>,
    /// Keys whose upload was aborted after cancellation
    pub aborted: Mutex<Vec<String>>,
    /// Per-step delay of uploads and delay of listings
    pub delay: Duration,
    /// Per-prefix listing delay override
    pub list_delays: Mutex<BTreeMap<String, Duration>>,
    /// Fail every operation touching keys with this prefix
    pub fail_prefix: Mutex<Option<String>>,
    /// Error every listing with this
    pub list_error: Mutex<Option<fn() -> StorageError>>,
    pub list_calls: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn with_objects<'a>(keys: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Self {
        let store = MemoryStore::default();
        {
            let mut objects = store.objects.lock().unwrap();
            for (key, data) in keys {
                objects.insert(key.to_string(), data.to_vec());
            }
        }
        store
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    fn check(&self, key: &str) -> Result<(), StorageError> {
        match self.fail_prefix.lock().unwrap().as_deref() {
            Some(prefix) if key.starts_with(prefix) => {
                Err(StorageError::ServerError(format!("injected failure for {}", key)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        "memory"
    }

    fn display_name(&self) -> String {
        "memory://".to_string()
    }

    async fn list(&self, prefix: &str) -> Result<Listing, StorageError> {
        self.list_calls.lock().unwrap().push(prefix.to_string());
        let delay = self
            .list_delays
            .lock()
            .unwrap()
            .get(prefix)
            .copied()
            .unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(make_error) = *self.list_error.lock().unwrap() {
            return Err(make_error());
        }

        let objects = self.objects.lock().unwrap();
        let mut folders: Vec<String> = Vec::new();
        let mut items = Vec::new();
        for (key, data) in objects.range(prefix.to_string()..) {
            let Some(rest) = key.strip_prefix(prefix) else { break };
            match rest.find('/') {
                Some(idx) => {
                    let folder = format!("{}{}", prefix, &rest[..=idx]);
                    if folders.last() != Some(&folder) {
                        folders.push(folder);
                    }
                }
                _ => items.push(ListItem::Object(ObjectEntry::new(key.clone(), data.len() as u64))),
            }
        }
        let items = folders
            .into_iter()
            .map(|p| ListItem::Folder(CommonPrefix::new(p)))
            .chain(items);
        Ok(Listing::from_items(prefix, items))
    }

    async fn upload(
        &self,
        source: &UploadSource,
        key: &str,
        _content_type: &str,
        on_progress: Option<ProgressFn>,
        cancel: CancellationToken,
    ) -> Result<String, StorageError> {
        self.check(key)?;
        let total = source.len().await?;
        let data = source.read_range(0, total).await?;

        for step in 0..=4u64 {
            if let Some(ref progress) = on_progress {
                progress(total * step / 4, total);
            }
            if step == 4 {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.aborted.lock().unwrap().push(key.to_string());
                    return Err(StorageError::Cancelled);
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(key.to_string())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut failed = Vec::new();
        for key in keys {
            if self.check(key).is_err() {
                failed.push(format!("{} (AccessDenied)", key));
                continue;
            }
            self.objects.lock().unwrap().remove(key);
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(StorageError::DeleteFailed(failed))
        }
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.check(from)?;
        let mut objects = self.objects.lock().unwrap();
        let data = objects
            .get(from)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        objects.insert(to.to_string(), data);
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> Result<String, StorageError> {
        let key = format!("{}/", path.trim_end_matches('/'));
        self.check(&key)?;
        self.objects.lock().unwrap().insert(key.clone(), Vec::new());
        Ok(key)
    }

    async fn presign_url(&self, key: &str, options: &PresignOptions) -> Result<String, StorageError> {
        let mut url = format!("memory://{}?expires={}", key, options.effective_ttl());
        if let Some(ref ct) = options.content_type {
            url.push_str(&format!("&type={}", ct));
        }
        if let Some(ref disposition) = options.disposition {
            url.push_str(&format!("&disposition={}", disposition));
        }
        Ok(url)
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.check(key)?;
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}
