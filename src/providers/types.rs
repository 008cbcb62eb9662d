//! Shared types for the storage gateway
//!
//! Configuration, listing shapes and the error type returned by every
//! `ObjectStore` operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Connection settings for one bucket on an S3-compatible service
#[derive(Clone)]
pub struct S3Config {
    /// S3-compatible endpoint URL (None for AWS S3)
    pub endpoint: Option<String>,
    /// AWS region (e.g., us-east-1)
    pub region: String,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key (SecretString for memory zeroization)
    pub secret_access_key: secrecy::SecretString,
    /// Bucket name
    pub bucket: String,
    /// Use path-style addressing (for MinIO, etc.)
    pub path_style: bool,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("bucket", &self.bucket)
            .field("path_style", &self.path_style)
            .finish_non_exhaustive()
    }
}

/// One object returned by a listing call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectEntry {
    /// Full object key (virtual path)
    pub key: String,
    /// Last modification time reported by the store
    pub last_modified: Option<DateTime<Utc>>,
    /// Object size in bytes
    pub size: u64,
    /// Entity tag without surrounding quotes
    #[serde(default)]
    pub etag: Option<String>,
    /// Storage class (STANDARD, GLACIER, ...)
    #[serde(default)]
    pub storage_class: Option<String>,
}

impl ObjectEntry {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            last_modified: None,
            size,
            etag: None,
            storage_class: None,
        }
    }

    /// Last path segment of the key
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// File extension as written in the key, if any
    pub fn extension(&self) -> Option<&str> {
        let name = self.name();
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
            _ => None,
        }
    }
}

/// A grouping of keys sharing everything up to the next delimiter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommonPrefix {
    pub prefix: String,
}

impl CommonPrefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

/// Tagged listing item, so callers never have to guess the shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListItem {
    Folder(CommonPrefix),
    Object(ObjectEntry),
}

/// Result of listing one prefix with the "/" delimiter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    /// Prefix the listing was requested for
    pub prefix: String,
    /// Common prefixes (virtual folders)
    pub folders: Vec<CommonPrefix>,
    /// Objects directly under the prefix
    pub files: Vec<ObjectEntry>,
}

impl Listing {
    /// Partition tagged items into folders and files.
    ///
    /// The zero-byte folder marker whose key equals the prefix itself is dropped.
    pub fn from_items(prefix: &str, items: impl IntoIterator<Item = ListItem>) -> Self {
        let mut listing = Listing {
            prefix: prefix.to_string(),
            ..Default::default()
        };
        for item in items {
            match item {
                ListItem::Folder(folder) => listing.folders.push(folder),
                ListItem::Object(entry) => {
                    if entry.key == prefix {
                        continue;
                    }
                    listing.files.push(entry);
                }
            }
        }
        listing
    }

    pub fn items(&self) -> impl Iterator<Item = ListItem> + '_ {
        self.folders
            .iter()
            .cloned()
            .map(ListItem::Folder)
            .chain(self.files.iter().cloned().map(ListItem::Object))
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.files.is_empty()
    }
}

/// Options for presigned GET URLs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignOptions {
    /// Validity in seconds
    pub ttl_secs: u64,
    /// Override for the Content-Type the store answers with
    pub content_type: Option<String>,
    /// Override for Content-Disposition (e.g. `attachment; filename="a.txt"`)
    pub disposition: Option<String>,
}

/// Default share link lifetime (15 minutes)
pub const DEFAULT_PRESIGN_TTL_SECS: u64 = 900;
/// SigV4 presigned URLs cannot outlive 7 days
pub const MAX_PRESIGN_TTL_SECS: u64 = 604_800;

impl Default for PresignOptions {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_PRESIGN_TTL_SECS,
            content_type: None,
            disposition: None,
        }
    }
}

impl PresignOptions {
    pub fn with_ttl(ttl_secs: u64) -> Self {
        Self {
            ttl_secs,
            ..Default::default()
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn disposition(mut self, disposition: impl Into<String>) -> Self {
        self.disposition = Some(disposition.into());
        self
    }

    /// TTL clamped to what SigV4 accepts
    pub fn effective_ttl(&self) -> u64 {
        self.ttl_secs.clamp(1, MAX_PRESIGN_TTL_SECS)
    }
}

/// Data handed to the gateway for upload
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// A local file, read part by part
    File { path: PathBuf, name: String },
    /// An in-memory buffer
    Bytes { name: String, data: std::sync::Arc<Vec<u8>> },
}

impl UploadSource {
    /// Source backed by a local file; the object name is the file name
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| StorageError::InvalidPath(path.display().to_string()))?
            .to_string();
        Ok(UploadSource::File {
            path: path.to_path_buf(),
            name,
        })
    }

    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        UploadSource::Bytes {
            name: name.into(),
            data: std::sync::Arc::new(data),
        }
    }

    /// Object name (last key segment)
    pub fn name(&self) -> &str {
        match self {
            UploadSource::File { name, .. } | UploadSource::Bytes { name, .. } => name,
        }
    }

    /// Total size in bytes
    pub async fn len(&self) -> Result<u64, StorageError> {
        match self {
            UploadSource::File { path, .. } => Ok(tokio::fs::metadata(path).await?.len()),
            UploadSource::Bytes { data, .. } => Ok(data.len() as u64),
        }
    }

    /// Read `len` bytes starting at `offset`
    pub async fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>, StorageError> {
        match self {
            UploadSource::File { path, .. } => {
                use tokio::io::{AsyncReadExt, AsyncSeekExt};
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf).await?;
                Ok(buf)
            }
            UploadSource::Bytes { data, .. } => {
                let start = offset as usize;
                let end = start.saturating_add(len as usize).min(data.len());
                if start > end {
                    return Err(StorageError::InvalidPath(format!(
                        "range {}+{} outside buffer of {} bytes",
                        offset,
                        len,
                        data.len()
                    )));
                }
                Ok(data[start..end].to_vec())
            }
        }
    }

    /// Guess the Content-Type from the name
    pub fn content_type(&self) -> String {
        mime_guess::from_path(self.name())
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string()
    }
}

/// Progress callback: `(bytes_loaded, bytes_total)`
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Storage gateway error types
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Failed to delete {} object(s): {}", .0.len(), .0.join(", "))]
    DeleteFailed(Vec<String>),

    #[error("Timeout")]
    Timeout,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl StorageError {
    /// No HTTP response came back at all
    pub fn is_transport(&self) -> bool {
        matches!(self, StorageError::NetworkError(_) | StorageError::Timeout)
    }

    /// The store rejected the credentials or the policy denies the call
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            StorageError::AuthenticationFailed(_) | StorageError::PermissionDenied(_)
        )
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StorageError::Timeout
        } else {
            StorageError::NetworkError(e.to_string())
        }
    }
}
