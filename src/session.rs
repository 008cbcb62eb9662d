//! Application Session
//!
//! The explicit application state: settings, the credential store and, once
//! connected, the gateway with its browser and upload engine. Presentation
//! layers hold one `Session` and call into it; nothing else is global.

use std::path::Path;
use std::sync::Arc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::browser::Browser;
use crate::config::AppConfig;
use crate::credential_store::{CredentialError, CredentialStore, Credentials, RestoreOutcome};
use crate::file_types::FileKind;
use crate::providers::{ObjectStore, PresignOptions, S3Gateway, StorageError};
use crate::upload::UploadEngine;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Not connected to a bucket")]
    NotConnected,
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Live handles for the connected bucket
#[derive(Clone)]
pub struct Connection {
    pub store: Arc<dyn ObjectStore>,
    pub browser: Browser,
    pub uploads: UploadEngine,
}

/// How to show an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Preview {
    Image { url: String },
    Video { url: String },
    Audio { url: String },
    Pdf { url: String },
    Text { content: String },
    /// No inline preview: a link that downloads the object
    Download { url: String },
}

pub struct Session {
    config: AppConfig,
    credentials: Mutex<CredentialStore>,
    connection: RwLock<Option<Connection>>,
}

impl Session {
    pub fn new(config: AppConfig, credentials: CredentialStore) -> Self {
        Self {
            config,
            credentials: Mutex::new(credentials),
            connection: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn gateway_for(&self, credentials: &Credentials) -> Result<Arc<dyn ObjectStore>, StorageError> {
        let config = credentials.to_s3_config(self.config.endpoint.clone(), self.config.path_style);
        let gateway = S3Gateway::new(
            config,
            self.config.request_timeout(),
            self.config.upload_queue_size,
        )?;
        Ok(Arc::new(gateway))
    }

    /// Install a store as the active connection, replacing (and cancelling) any previous one
    async fn activate(&self, store: Arc<dyn ObjectStore>) -> Connection {
        let browser = Browser::new(store.clone());
        let uploads = UploadEngine::new(browser.clone(), self.config.completion_grace());
        let connection = Connection {
            store,
            browser,
            uploads,
        };

        let previous = self.connection.write().await.replace(connection.clone());
        if let Some(previous) = previous {
            let cancelled = previous.uploads.cancel_all();
            if cancelled > 0 {
                info!("Cancelled {} upload(s) of the previous connection", cancelled);
            }
        }
        connection
    }

    /// Validate credentials, connect, and remember them as requested.
    ///
    /// Invalid input is rejected before anything is stored or sent.
    pub async fn connect(&self, credentials: &Credentials, remember: bool) -> Result<Connection, SessionError> {
        let credentials = credentials.validate()?;
        let store = self.gateway_for(&credentials)?;
        self.credentials.lock().await.connect(&credentials, remember)?;
        info!("Session connected to {}", store.display_name());
        Ok(self.activate(store).await)
    }

    /// Reconnect from remembered credentials, if any
    pub async fn restore(&self) -> Result<RestoreOutcome, SessionError> {
        let (outcome, credentials) = {
            let mut store = self.credentials.lock().await;
            let outcome = store.restore();
            (outcome, store.current().cloned())
        };

        if let (RestoreOutcome::Restored { .. }, Some(credentials)) = (outcome, credentials) {
            let store = self.gateway_for(&credentials)?;
            info!("Session restored for {}", store.display_name());
            self.activate(store).await;
        }
        Ok(outcome)
    }

    /// Drop the connection, cancel uploads and forget every stored credential
    pub async fn disconnect(&self) {
        if let Some(connection) = self.connection.write().await.take() {
            connection.uploads.cancel_all();
        }
        self.credentials.lock().await.disconnect();
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    pub async fn credentials(&self) -> Option<Credentials> {
        self.credentials.lock().await.current().cloned()
    }

    pub async fn is_remembered(&self) -> bool {
        self.credentials.lock().await.is_remembered()
    }

    pub async fn connection(&self) -> Result<Connection, SessionError> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or(SessionError::NotConnected)
    }

    /// Fetch an object and write it to `local_path`, returning the byte count
    pub async fn download(&self, key: &str, local_path: &Path) -> Result<u64, SessionError> {
        let connection = self.connection().await?;
        let bytes = connection.store.get_bytes(key).await?;
        if let Some(parent) = local_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(local_path, &bytes).await?;
        info!("Downloaded {} -> {:?} ({} bytes)", key, local_path, bytes.len());
        Ok(bytes.len() as u64)
    }

    /// Share link for `key`; `ttl_secs` defaults to the configured lifetime
    pub async fn share(&self, key: &str, ttl_secs: Option<u64>) -> Result<String, SessionError> {
        let connection = self.connection().await?;
        let options = PresignOptions::with_ttl(ttl_secs.unwrap_or(self.config.presign_ttl_secs));
        Ok(connection.store.presign_url(key, &options).await?)
    }

    /// Preview strategy by file kind
    pub async fn preview(&self, key: &str) -> Result<Preview, SessionError> {
        let connection = self.connection().await?;
        let store = &connection.store;
        let ttl = self.config.presign_ttl_secs;
        let url = |options: PresignOptions| async move { store.presign_url(key, &options).await };

        let preview = match FileKind::of(key) {
            FileKind::Image => Preview::Image {
                url: url(PresignOptions::with_ttl(ttl)).await?,
            },
            FileKind::Audio => Preview::Audio {
                url: url(PresignOptions::with_ttl(ttl)).await?,
            },
            FileKind::Video => Preview::Video {
                url: url(PresignOptions::with_ttl(ttl).content_type("video/mp4")).await?,
            },
            FileKind::Pdf => Preview::Pdf {
                url: url(PresignOptions::with_ttl(ttl).content_type("application/pdf")).await?,
            },
            kind if kind.is_text() => Preview::Text {
                content: store.get_text_content(key).await?,
            },
            _ => {
                let name = key.rsplit('/').next().unwrap_or(key).replace('"', "");
                let options = PresignOptions::with_ttl(ttl)
                    .disposition(format!("attachment; filename=\"{}\"", name));
                Preview::Download {
                    url: url(options).await?,
                }
            }
        };
        Ok(preview)
    }
}
