//! Storage Gateway Module
//!
//! Everything the browser and the upload engine need from an S3 bucket goes
//! through the `ObjectStore` trait. `S3Gateway` is the production backend;
//! tests use an in-memory double.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐
//! │   Browser    │   │ UploadEngine  │
//! └──────┬───────┘   └───────┬───────┘
//!        └─────────┬─────────┘
//!                  ▼
//! ┌─────────────────────────────────────────────┐
//! │              ObjectStore Trait              │
//! │  list, upload, delete, copy, presign, get   │
//! └─────────────────────────────────────────────┘
//!                  │
//!                  ▼
//!          ┌──────────────┐
//!          │  S3Gateway   │  SigV4 over reqwest
//!          └──────────────┘
//! ```

pub mod types;
pub mod s3;
pub mod s3_xml;

#[cfg(test)]
pub(crate) mod memory;

pub use types::*;
pub use s3::S3Gateway;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Unified object store trait
///
/// Keys are full virtual paths without a leading "/". Folders are common
/// prefixes ending in "/".
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket this store is bound to
    fn bucket(&self) -> &str;

    /// Get display name for this store instance
    fn display_name(&self) -> String;

    /// List folders and files directly under `prefix` ("" = bucket root).
    ///
    /// Follows continuation tokens until the listing is complete.
    async fn list(&self, prefix: &str) -> Result<Listing, StorageError>;

    /// Upload `source` to `key`, returning the key written.
    ///
    /// Sources larger than one part go through multipart upload. When
    /// `cancel` fires the in-flight parts are dropped and the multipart
    /// upload is aborted before `StorageError::Cancelled` is returned.
    async fn upload(
        &self,
        source: &UploadSource,
        key: &str,
        content_type: &str,
        on_progress: Option<ProgressFn>,
        cancel: CancellationToken,
    ) -> Result<String, StorageError>;

    /// Delete a set of keys. Per-key failures surface as `DeleteFailed`.
    async fn delete(&self, keys: &[String]) -> Result<(), StorageError>;

    /// Server-side copy within the bucket
    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Create a folder marker (zero-byte object with trailing "/"), returning its key
    async fn create_folder(&self, path: &str) -> Result<String, StorageError>;

    /// Time-limited GET URL for `key`
    async fn presign_url(&self, key: &str, options: &PresignOptions) -> Result<String, StorageError>;

    /// Whole object body
    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Object body as text; invalid UTF-8 is replaced, not rejected
    async fn get_text_content(&self, key: &str) -> Result<String, StorageError> {
        let bytes = self.get_bytes(key).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
