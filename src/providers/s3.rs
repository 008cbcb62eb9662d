//! S3 Storage Gateway
//!
//! Implementation of the ObjectStore trait for Amazon S3 and S3-compatible storage.
//! Supports AWS S3, MinIO, Backblaze B2, DigitalOcean Spaces, Cloudflare R2, Wasabi, etc.
//!
//! This implementation uses reqwest with AWS Signature Version 4 for authentication,
//! avoiding the heavyweight aws-sdk-s3 dependency for better compile times and smaller binaries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::s3_xml;
use super::{
    Listing, ObjectStore, PresignOptions, ProgressFn, S3Config, StorageError, UploadSource,
};
use crate::upload::part_size_for;

type HmacSha256 = Hmac<Sha256>;

/// DeleteObjects accepts at most 1000 keys per request
const DELETE_BATCH_SIZE: usize = 1000;

/// Where a request goes: scheme+authority, Host header and canonical path
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    base: String,
    host: String,
    path: String,
}

/// S3 Storage Gateway
pub struct S3Gateway {
    config: S3Config,
    client: Client,
    queue_size: usize,
}

/// SigV4 URI encoding: everything but unreserved characters
fn uri_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Encode a key for the request path, keeping "/" separators
fn encode_key(key: &str) -> String {
    key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Canonical query string: keys and values encoded, sorted by key then value
fn canonical_query(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (uri_encode(k), uri_encode(v)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

impl S3Gateway {
    /// Create a new gateway with the given configuration
    pub fn new(config: S3Config, timeout: Duration, queue_size: usize) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::InvalidConfig(format!("HTTP client: {}", e)))?;

        if let Some(ref endpoint) = config.endpoint {
            url::Url::parse(endpoint)
                .map_err(|e| StorageError::InvalidConfig(format!("endpoint '{}': {}", endpoint, e)))?;
        }

        Ok(Self {
            config,
            client,
            queue_size: queue_size.max(1),
        })
    }

    /// Get the S3 endpoint URL
    fn endpoint(&self) -> String {
        if let Some(ref endpoint) = self.config.endpoint {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("https://s3.{}.amazonaws.com", self.config.region)
        }
    }

    /// Resolve the target for an object key (empty key = bucket root)
    fn target(&self, key: &str) -> Target {
        let endpoint = self.endpoint();
        let scheme = if endpoint.starts_with("http://") { "http" } else { "https" };
        let authority = endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string();
        let encoded_key = encode_key(key);
        // Dotted bucket hosts never match the wildcard TLS certificate
        let path_style = self.config.path_style || (scheme == "https" && self.config.bucket.contains('.'));

        if path_style {
            // Path-style: https://endpoint/bucket/key
            let path = if key.is_empty() {
                format!("/{}", self.config.bucket)
            } else {
                format!("/{}/{}", self.config.bucket, encoded_key)
            };
            Target {
                base: format!("{}://{}", scheme, authority),
                host: authority,
                path,
            }
        } else {
            // Virtual-hosted style: https://bucket.endpoint/key
            let host = format!("{}.{}", self.config.bucket, authority);
            Target {
                base: format!("{}://{}", scheme, host),
                host,
                path: format!("/{}", encoded_key),
            }
        }
    }

    /// Build the full URL for an object key
    #[cfg(test)]
    fn build_url(&self, key: &str) -> String {
        let target = self.target(key);
        format!("{}{}", target.base, target.path)
    }

    fn signing_key(&self, date_stamp: &str) -> Vec<u8> {
        let k_date = hmac_sha256(
            format!("AWS4{}", self.config.secret_access_key.expose_secret()).as_bytes(),
            date_stamp.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.config.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        hmac_sha256(&k_service, b"aws4_request")
    }

    /// Sign a request using AWS Signature Version 4.
    ///
    /// Adds `host`, `x-amz-date` and `x-amz-content-sha256` to `headers` and
    /// returns the Authorization header value. Every header in the map is signed.
    fn sign_request(
        &self,
        method: &str,
        target: &Target,
        query: &str,
        headers: &mut BTreeMap<String, String>,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> String {
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        headers.insert("host".to_string(), target.host.clone());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());

        let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, target.path, query, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&date_stamp),
            string_to_sign.as_bytes(),
        ));

        format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.config.access_key_id, credential_scope, signed_headers, signature
        )
    }

    /// Make a signed request to S3
    async fn s3_request(
        &self,
        method: Method,
        key: &str,
        query_params: &[(String, String)],
        extra_headers: &[(&str, String)],
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, StorageError> {
        let target = self.target(key);
        let query = canonical_query(query_params);
        let url = if query.is_empty() {
            format!("{}{}", target.base, target.path)
        } else {
            format!("{}{}?{}", target.base, target.path, query)
        };

        let payload_hash = sha256_hex(body.as_deref().unwrap_or(&[]));

        let mut headers: BTreeMap<String, String> = extra_headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        let authorization = self.sign_request(
            method.as_str(),
            &target,
            &query,
            &mut headers,
            &payload_hash,
            Utc::now(),
        );

        let mut request = self.client.request(method, &url);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = request.header("Authorization", authorization);

        if let Some(body_data) = body {
            request = request.body(body_data);
        }

        Ok(request.send().await?)
    }

    /// Turn a non-success response into a StorageError
    async fn error_from_response(response: reqwest::Response, context: &str) -> StorageError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let parsed = s3_xml::parse_error(&body);
        let detail = match parsed {
            Some(ref err) if !err.message.is_empty() => format!("{}: {}", err.code, err.message),
            Some(ref err) => err.code.clone(),
            None => status.to_string(),
        };
        let code = parsed.map(|e| e.code).unwrap_or_default();

        match status {
            StatusCode::UNAUTHORIZED => StorageError::AuthenticationFailed(detail),
            StatusCode::FORBIDDEN
                if matches!(
                    code.as_str(),
                    "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken"
                ) =>
            {
                StorageError::AuthenticationFailed(detail)
            }
            StatusCode::FORBIDDEN => StorageError::PermissionDenied(format!("{} ({})", context, detail)),
            StatusCode::NOT_FOUND => StorageError::NotFound(format!("{} ({})", context, detail)),
            _ => StorageError::ServerError(format!("{} failed with status {}: {}", context, status, detail)),
        }
    }

    async fn put_object(
        &self,
        key: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<(), StorageError> {
        let response = self
            .s3_request(
                Method::PUT,
                key,
                &[],
                &[("content-type", content_type.to_string())],
                Some(data),
            )
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from_response(response, &format!("PUT {}", key)).await)
        }
    }

    async fn create_multipart_upload(&self, key: &str, content_type: &str) -> Result<String, StorageError> {
        let response = self
            .s3_request(
                Method::POST,
                key,
                &[("uploads".to_string(), String::new())],
                &[("content-type", content_type.to_string())],
                None,
            )
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response, &format!("CreateMultipartUpload {}", key)).await);
        }
        let xml = response
            .text()
            .await
            .map_err(|e| StorageError::ParseError(e.to_string()))?;
        s3_xml::parse_upload_id(&xml)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<String, StorageError> {
        let response = self
            .s3_request(
                Method::PUT,
                key,
                &[
                    ("partNumber".to_string(), part_number.to_string()),
                    ("uploadId".to_string(), upload_id.to_string()),
                ],
                &[],
                Some(data),
            )
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response, &format!("UploadPart {} #{}", key, part_number)).await);
        }

        response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| StorageError::ParseError(format!("part {} returned no ETag", part_number)))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<(), StorageError> {
        let body = s3_xml::complete_multipart_body(parts);
        let response = self
            .s3_request(
                Method::POST,
                key,
                &[("uploadId".to_string(), upload_id.to_string())],
                &[("content-type", "application/xml".to_string())],
                Some(body.into_bytes()),
            )
            .await?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| StorageError::ParseError(e.to_string()))?;

        // CompleteMultipartUpload can fail with a 200 and an <Error> body
        match s3_xml::parse_error(&text) {
            Some(err) => Err(StorageError::TransferFailed(format!(
                "CompleteMultipartUpload {}: {} {}",
                key, err.code, err.message
            ))),
            None if status.is_success() => Ok(()),
            None => Err(StorageError::ServerError(format!(
                "CompleteMultipartUpload {} failed with status {}",
                key, status
            ))),
        }
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        let response = self
            .s3_request(
                Method::DELETE,
                key,
                &[("uploadId".to_string(), upload_id.to_string())],
                &[],
                None,
            )
            .await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Self::error_from_response(response, &format!("AbortMultipartUpload {}", key)).await),
        }
    }

    /// Upload every part with bounded concurrency, then commit.
    ///
    /// Stops at the first failed part or on cancellation; the caller aborts.
    async fn upload_parts(
        &self,
        source: &UploadSource,
        key: &str,
        upload_id: &str,
        total: u64,
        part_size: u64,
        on_progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let part_count = total.div_ceil(part_size) as u32;
        debug!(
            "Multipart upload {}: {} parts of {} bytes, {} in flight",
            key, part_count, part_size, self.queue_size
        );

        let mut parts = stream::iter(1..=part_count)
            .map(|number| async move {
                let offset = u64::from(number - 1) * part_size;
                let len = part_size.min(total - offset);
                let data = source.read_range(offset, len).await?;
                let etag = self.upload_part(key, upload_id, number, data).await?;
                Ok::<_, StorageError>((number, etag, len))
            })
            .buffer_unordered(self.queue_size);

        let mut completed: Vec<(u32, String)> = Vec::with_capacity(part_count as usize);
        let mut loaded = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                next = parts.next() => next,
            };
            let Some(result) = next else { break };
            let (number, etag, len) = result?;
            completed.push((number, etag));
            loaded += len;
            if let Some(progress) = on_progress {
                progress(loaded, total);
            }
        }
        drop(parts);

        completed.sort_by_key(|(number, _)| *number);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
            result = self.complete_multipart_upload(key, upload_id, &completed) => result,
        }
    }

    /// Build a presigned GET URL valid from `now`
    fn presign_at(
        &self,
        key: &str,
        options: &PresignOptions,
        now: DateTime<Utc>,
    ) -> String {
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let credential = format!("{}/{}", self.config.access_key_id, credential_scope);

        let target = self.target(key);

        let mut params = vec![
            ("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
            ("X-Amz-Credential".to_string(), credential),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-Expires".to_string(), options.effective_ttl().to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        if let Some(ref content_type) = options.content_type {
            params.push(("response-content-type".to_string(), content_type.clone()));
        }
        if let Some(ref disposition) = options.disposition {
            params.push(("response-content-disposition".to_string(), disposition.clone()));
        }
        let query = canonical_query(&params);

        let canonical_request = format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            target.path, query, target.host
        );

        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&date_stamp),
            string_to_sign.as_bytes(),
        ));

        format!("{}{}?{}&X-Amz-Signature={}", target.base, target.path, query, signature)
    }
}

fn require_key(key: &str) -> Result<&str, StorageError> {
    let key = key.trim_start_matches('/');
    if key.is_empty() {
        Err(StorageError::InvalidPath("empty object key".to_string()))
    } else {
        Ok(key)
    }
}

#[async_trait]
impl ObjectStore for S3Gateway {
    fn bucket(&self) -> &str {
        &self.config.bucket
    }

    fn display_name(&self) -> String {
        if self.config.endpoint.is_some() {
            format!("s3://{} (custom)", self.config.bucket)
        } else {
            format!("s3://{} ({})", self.config.bucket, self.config.region)
        }
    }

    async fn list(&self, prefix: &str) -> Result<Listing, StorageError> {
        let mut folders = Vec::new();
        let mut files = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("list-type".to_string(), "2".to_string()),
                ("delimiter".to_string(), "/".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                params.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                params.push(("continuation-token".to_string(), token.clone()));
            }

            let response = self.s3_request(Method::GET, "", &params, &[], None).await?;
            if response.status() != StatusCode::OK {
                return Err(Self::error_from_response(response, &format!("List '{}'", prefix)).await);
            }

            let xml = response
                .text()
                .await
                .map_err(|e| StorageError::ParseError(e.to_string()))?;
            let page = s3_xml::parse_list_objects(&xml)?;
            folders.extend(page.folders);
            files.extend(page.files);

            match page.next_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        let items = folders
            .into_iter()
            .map(super::ListItem::Folder)
            .chain(files.into_iter().map(super::ListItem::Object));
        Ok(Listing::from_items(prefix, items))
    }

    async fn upload(
        &self,
        source: &UploadSource,
        key: &str,
        content_type: &str,
        on_progress: Option<ProgressFn>,
        cancel: CancellationToken,
    ) -> Result<String, StorageError> {
        let key = require_key(key)?;
        let total = source.len().await?;
        let part_size = part_size_for(total);

        if let Some(ref progress) = on_progress {
            progress(0, total);
        }

        if total <= part_size {
            let data = source.read_range(0, total).await?;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                result = self.put_object(key, content_type, data) => result?,
            }
            if let Some(ref progress) = on_progress {
                progress(total, total);
            }
            info!("Uploaded {} ({} bytes)", key, total);
            return Ok(key.to_string());
        }

        let upload_id = self.create_multipart_upload(key, content_type).await?;
        let result = self
            .upload_parts(source, key, &upload_id, total, part_size, on_progress.as_ref(), &cancel)
            .await;

        match result {
            Ok(()) => {
                info!("Uploaded {} ({} bytes, multipart)", key, total);
                Ok(key.to_string())
            }
            Err(e) => {
                if let Err(abort_err) = self.abort_multipart_upload(key, &upload_id).await {
                    warn!("Failed to abort multipart upload {} for {}: {}", upload_id, key, abort_err);
                } else {
                    info!("Aborted multipart upload {} for {}", upload_id, key);
                }
                Err(e)
            }
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StorageError> {
        use base64::Engine;
        use md5::Md5;

        let mut failed = Vec::new();
        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            let body = s3_xml::delete_objects_body(batch);
            let content_md5 = base64::engine::general_purpose::STANDARD.encode(Md5::digest(body.as_bytes()));

            let response = self
                .s3_request(
                    Method::POST,
                    "",
                    &[("delete".to_string(), String::new())],
                    &[
                        ("content-md5", content_md5),
                        ("content-type", "application/xml".to_string()),
                    ],
                    Some(body.into_bytes()),
                )
                .await?;

            if !response.status().is_success() {
                return Err(Self::error_from_response(response, "DeleteObjects").await);
            }
            let xml = response
                .text()
                .await
                .map_err(|e| StorageError::ParseError(e.to_string()))?;
            failed.extend(s3_xml::parse_delete_errors(&xml)?);
        }

        if failed.is_empty() {
            info!("Deleted {} object(s)", keys.len());
            Ok(())
        } else {
            Err(StorageError::DeleteFailed(failed))
        }
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let from = require_key(from)?;
        let to = require_key(to)?;
        let copy_source = format!("{}/{}", self.config.bucket, encode_key(from));

        let response = self
            .s3_request(Method::PUT, to, &[], &[("x-amz-copy-source", copy_source)], None)
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::error_from_response(response, &format!("Copy {} -> {}", from, to)).await);
        }
        // CopyObject can fail with a 200 and an <Error> body
        let text = response.text().await.unwrap_or_default();
        if let Some(err) = s3_xml::parse_error(&text) {
            return Err(StorageError::ServerError(format!(
                "Copy {} -> {}: {} {}",
                from, to, err.code, err.message
            )));
        }
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> Result<String, StorageError> {
        // S3 doesn't have real directories, but we can create a zero-byte object with trailing /
        let key = format!("{}/", require_key(path)?.trim_end_matches('/'));
        self.put_object(&key, "application/x-directory", Vec::new()).await?;
        info!("Created folder marker {}", key);
        Ok(key)
    }

    async fn presign_url(&self, key: &str, options: &PresignOptions) -> Result<String, StorageError> {
        let key = require_key(key)?;
        Ok(self.presign_at(key, options, Utc::now()))
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let key = require_key(key)?;
        let response = self.s3_request(Method::GET, key, &[], &[], None).await?;

        if response.status() != StatusCode::OK {
            return Err(Self::error_from_response(response, &format!("GET {}", key)).await);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StorageError::TransferFailed(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
