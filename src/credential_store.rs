// AeroBucket Credential Store
// Remember-me persistence of bucket credentials: persistent file storage or
// process-lifetime session storage, one encoded blob per location

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto::CredentialCodec;
use crate::providers::S3Config;

/// Key the encoded blob is stored under, in both locations
pub const STORAGE_KEY: &str = "aerobucket_creds";
const STORAGE_FILENAME: &str = "storage.json";

static BUCKET_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9.-]+$").expect("valid bucket name regex"));

// ============ Error Types ============

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid bucket name '{0}': only lowercase letters, digits, '.' and '-' are allowed")]
    InvalidBucketName(String),
    #[error("Stored credentials could not be decoded: {0}")]
    Decode(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

// ============ Credentials ============

/// Connection secrets for one bucket
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub bucket_name: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("bucket_name", &self.bucket_name)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn new(
        bucket_name: impl Into<String>,
        region: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            region: region.into(),
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    /// Trimmed copy, or the first validation failure
    pub fn validate(&self) -> Result<Credentials, CredentialError> {
        let trimmed = Credentials {
            bucket_name: self.bucket_name.trim().to_string(),
            region: self.region.trim().to_string(),
            access_key_id: self.access_key_id.trim().to_string(),
            secret_access_key: self.secret_access_key.trim().to_string(),
        };

        for (name, value) in [
            ("bucketName", &trimmed.bucket_name),
            ("region", &trimmed.region),
            ("accessKeyId", &trimmed.access_key_id),
            ("secretAccessKey", &trimmed.secret_access_key),
        ] {
            if value.is_empty() {
                return Err(CredentialError::MissingField(name));
            }
        }

        if !BUCKET_NAME_RE.is_match(&trimmed.bucket_name) {
            return Err(CredentialError::InvalidBucketName(trimmed.bucket_name));
        }
        Ok(trimmed)
    }

    /// Gateway settings for these credentials
    pub fn to_s3_config(&self, endpoint: Option<String>, path_style: bool) -> S3Config {
        S3Config {
            endpoint,
            region: self.region.clone(),
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone().into(),
            bucket: self.bucket_name.clone(),
            path_style,
        }
    }

    /// Encode for storage
    pub fn encode(&self, codec: &CredentialCodec) -> Result<String, CredentialError> {
        let json = serde_json::to_string(self)
            .map_err(|e| CredentialError::Serialization(e.to_string()))?;
        codec.encode(&json).map_err(CredentialError::Serialization)
    }

    /// Decode a stored blob; anything unexpected is a decode failure
    pub fn decode(blob: &str, codec: &CredentialCodec) -> Result<Credentials, CredentialError> {
        let json = codec.decode(blob).map_err(CredentialError::Decode)?;
        let credentials: Credentials = serde_json::from_str(&json)
            .map_err(|e| CredentialError::Decode(e.to_string()))?;
        credentials
            .validate()
            .map_err(|e| CredentialError::Decode(e.to_string()))
    }
}

// ============ Storage Locations ============

/// A string key-value location (persistent or session scoped)
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CredentialError>;
    fn set(&self, key: &str, value: &str) -> Result<(), CredentialError>;
    fn remove(&self, key: &str) -> Result<(), CredentialError>;
}

/// Persistent storage: a JSON object in a file with owner-only permissions
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config_dir>/aerobucket/storage.json`
    pub fn default_location() -> Self {
        Self::new(crate::config::app_dir().join(STORAGE_FILENAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<HashMap<String, String>, CredentialError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let data = std::fs::read(&self.path)?;
        serde_json::from_slice(&data).map_err(|e| CredentialError::Serialization(e.to_string()))
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<(), CredentialError> {
        if let Some(dir) = self.path.parent() {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
                ensure_secure_permissions(dir)?;
            }
        }
        let data = serde_json::to_vec_pretty(map)
            .map_err(|e| CredentialError::Serialization(e.to_string()))?;
        std::fs::write(&self.path, &data)?;
        ensure_secure_permissions(&self.path)?;
        Ok(())
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, CredentialError> {
        Ok(self.read_map()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CredentialError> {
        // An unreadable file is replaced rather than blocking a new connect
        let mut map = self.read_map().unwrap_or_else(|e| {
            warn!("Replacing unreadable storage {:?}: {}", self.path, e);
            HashMap::new()
        });
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)
    }

    fn remove(&self, key: &str) -> Result<(), CredentialError> {
        if !self.path.exists() {
            return Ok(());
        }
        let mut map = match self.read_map() {
            Ok(map) => map,
            Err(_) => HashMap::new(),
        };
        map.remove(key);
        self.write_map(&map)
    }
}

/// Session storage: lives as long as the process
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, CredentialError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CredentialError> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CredentialError> {
        self.entries().remove(key);
        Ok(())
    }
}

// ============ Credential Store ============

/// Result of looking for remembered credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Credentials restored; `remember` tells which location held them
    Restored { remember: bool },
    /// Neither location holds a blob
    Nothing,
    /// A blob was present but could not be decoded; both locations were cleared
    Discarded,
}

pub struct CredentialStore {
    persistent: Box<dyn KeyValueStorage>,
    session: Box<dyn KeyValueStorage>,
    codec: CredentialCodec,
    current: Option<Credentials>,
    remember: bool,
}

impl CredentialStore {
    pub fn new(
        persistent: Box<dyn KeyValueStorage>,
        session: Box<dyn KeyValueStorage>,
        codec: CredentialCodec,
    ) -> Self {
        Self {
            persistent,
            session,
            codec,
            current: None,
            remember: false,
        }
    }

    /// File-backed persistent location, in-memory session location
    pub fn with_default_locations(codec: CredentialCodec) -> Self {
        Self::new(
            Box::new(FileStorage::default_location()),
            Box::new(MemoryStorage::default()),
            codec,
        )
    }

    pub fn current(&self) -> Option<&Credentials> {
        self.current.as_ref()
    }

    pub fn is_remembered(&self) -> bool {
        self.current.is_some() && self.remember
    }

    /// Validate, activate and persist credentials.
    ///
    /// The blob goes to persistent storage when `remember` is set, to session
    /// storage otherwise; the other location is cleared.
    pub fn connect(&mut self, credentials: &Credentials, remember: bool) -> Result<&Credentials, CredentialError> {
        let credentials = credentials.validate()?;
        let blob = credentials.encode(&self.codec)?;

        let (target, other) = if remember {
            (&self.persistent, &self.session)
        } else {
            (&self.session, &self.persistent)
        };
        target.set(STORAGE_KEY, &blob)?;
        if let Err(e) = other.remove(STORAGE_KEY) {
            warn!("Failed to clear stale credentials: {}", e);
        }

        info!(
            "Connected to bucket {} ({})",
            credentials.bucket_name,
            if remember { "remembered" } else { "session only" }
        );
        self.remember = remember;
        Ok(self.current.insert(credentials))
    }

    /// Restore remembered credentials: persistent location first, then session
    pub fn restore(&mut self) -> RestoreOutcome {
        for (remember, storage) in [(true, &self.persistent), (false, &self.session)] {
            let blob = match storage.get(STORAGE_KEY) {
                Ok(Some(blob)) => blob,
                Ok(None) => continue,
                Err(CredentialError::Serialization(e)) => {
                    warn!("Discarding unreadable credential storage: {}", e);
                    self.clear_storage();
                    self.current = None;
                    return RestoreOutcome::Discarded;
                }
                Err(e) => {
                    warn!("Failed to read stored credentials: {}", e);
                    continue;
                }
            };

            match Credentials::decode(&blob, &self.codec) {
                Ok(credentials) => {
                    info!("Restored credentials for bucket {}", credentials.bucket_name);
                    self.current = Some(credentials);
                    self.remember = remember;
                    return RestoreOutcome::Restored { remember };
                }
                Err(e) => {
                    warn!("Discarding stored credentials: {}", e);
                    self.clear_storage();
                    self.current = None;
                    return RestoreOutcome::Discarded;
                }
            }
        }
        RestoreOutcome::Nothing
    }

    /// Forget credentials in memory and in both locations
    pub fn disconnect(&mut self) {
        self.current = None;
        self.remember = false;
        self.clear_storage();
        info!("Disconnected, stored credentials cleared");
    }

    fn clear_storage(&self) {
        for storage in [&self.persistent, &self.session] {
            if let Err(e) = storage.remove(STORAGE_KEY) {
                warn!("Failed to clear stored credentials: {}", e);
            }
        }
    }
}

// ============ Permission Hardening ============

/// Ensure secure file/directory permissions (0o600 files, 0o700 dirs on Unix)
pub fn ensure_secure_permissions(path: &Path) -> Result<(), CredentialError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if path.is_dir() { 0o700 } else { 0o600 };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
