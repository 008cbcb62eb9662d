// AeroBucket - S3 bucket browser core
// Virtual folders over flat keys, multipart uploads with live progress,
// remembered credentials

pub mod browser;
pub mod config;
pub mod cors;
pub mod credential_store;
pub mod crypto;
pub mod file_types;
pub mod providers;
pub mod session;
pub mod upload;

pub use browser::{Browser, BrowserEvent, BrowserState, ListFailure, ListStatus};
pub use config::AppConfig;
pub use credential_store::{CredentialError, CredentialStore, Credentials, RestoreOutcome};
pub use providers::{ObjectStore, S3Gateway, StorageError};
pub use session::{Preview, Session, SessionError};
pub use upload::{UploadEngine, UploadEvent};
