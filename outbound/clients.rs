// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The two external collaborators consumed, not implemented, by this
//! system (§1, §6): cloud object storage and the booking notify API.
//! Modeled as capability interfaces per §9 so the queue can be tested
//! without a network.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base::{Error, ErrorKind};
use jiff::Timestamp;

#[async_trait]
pub trait ObjectStoreClient: Send + Sync + 'static {
    async fn put_file(&self, local: &Path, remote_key: &str) -> Result<String, Error>;
    async fn put_directory(&self, local: &Path, remote_prefix: &str) -> Result<Vec<String>, Error>;
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, Error>;
    async fn delete_key(&self, key: &str) -> Result<(), Error>;
    fn base_url(&self) -> &str;
}

#[async_trait]
pub trait NotifyClient: Send + Sync + 'static {
    #[allow(clippy::too_many_arguments)]
    async fn save_video_available(
        &self,
        booking_id: &str,
        kind: &str,
        preview_url: &str,
        thumbnail_url: &str,
        unique_id: &str,
        start: Timestamp,
        end: Timestamp,
        duration_secs: f64,
    ) -> Result<(), Error>;
}

/// `reqwest`-backed object store client assuming an S3-compatible PUT API
/// at `base_url/<key>`.
pub struct ReqwestObjectStoreClient {
    http: reqwest::Client,
    base_url: String,
}

impl ReqwestObjectStoreClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        ReqwestObjectStoreClient {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds with static config"),
            base_url: base_url.into(),
        }
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStoreClient for ReqwestObjectStoreClient {
    async fn put_file(&self, local: &Path, remote_key: &str) -> Result<String, Error> {
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|e| Error::wrap(ErrorKind::Transient, "reading file for upload", e))?;
        let url = self.url_for(remote_key);
        let resp = self
            .http
            .put(&url)
            .body(bytes)
            .send()
            .await
            .map_err(|e| Error::wrap(ErrorKind::Transient, "uploading to object store", e))?;
        if !resp.status().is_success() {
            return classify_http_failure(resp.status(), "object store upload");
        }
        Ok(url)
    }

    async fn put_directory(&self, local: &Path, remote_prefix: &str) -> Result<Vec<String>, Error> {
        let mut urls = Vec::new();
        let mut entries = tokio::fs::read_dir(local)
            .await
            .map_err(|e| Error::wrap(ErrorKind::Transient, "reading directory for upload", e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::wrap(ErrorKind::Transient, "listing directory for upload", e))?
        {
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let key = format!("{}/{}", remote_prefix.trim_end_matches('/'), name.to_string_lossy());
            urls.push(self.put_file(&entry.path(), &key).await?);
        }
        Ok(urls)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let url = format!("{}?prefix={}", self.base_url.trim_end_matches('/'), prefix);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::wrap(ErrorKind::Transient, "listing object store prefix", e))?;
        if !resp.status().is_success() {
            return classify_http_failure(resp.status(), "object store list");
        }
        let keys: Vec<String> = resp
            .json()
            .await
            .map_err(|e| Error::wrap(ErrorKind::Transient, "decoding object store list response", e))?;
        Ok(keys)
    }

    async fn delete_key(&self, key: &str) -> Result<(), Error> {
        let url = self.url_for(key);
        let resp = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|e| Error::wrap(ErrorKind::Transient, "deleting object store key", e))?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return classify_http_failure(resp.status(), "object store delete").map(|_: String| ());
        }
        Ok(())
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// `reqwest`-backed notify client for the third-party booking API.
pub struct ReqwestNotifyClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ReqwestNotifyClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        ReqwestNotifyClient {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds with static config"),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl NotifyClient for ReqwestNotifyClient {
    async fn save_video_available(
        &self,
        booking_id: &str,
        kind: &str,
        preview_url: &str,
        thumbnail_url: &str,
        unique_id: &str,
        start: Timestamp,
        end: Timestamp,
        duration_secs: f64,
    ) -> Result<(), Error> {
        let body = serde_json::json!({
            "booking_id": booking_id,
            "kind": kind,
            "preview_url": preview_url,
            "thumbnail_url": thumbnail_url,
            "unique_id": unique_id,
            "start": start.to_string(),
            "end": end.to_string(),
            "duration_sec": duration_secs,
        });
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::wrap(ErrorKind::Transient, "calling notify API", e))?;
        if !resp.status().is_success() {
            return classify_http_failure(resp.status(), "notify API").map(|_: String| ());
        }
        Ok(())
    }
}

/// 4xx (other than 429) is a permanent rejection; everything else (5xx,
/// 429) is transient and worth retrying.
fn classify_http_failure<T>(status: reqwest::StatusCode, what: &str) -> Result<T, Error> {
    if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(base::err!(PermanentRejection, "{what} rejected with {status}"))
    } else {
        Err(base::err!(Transient, "{what} failed with {status}"))
    }
}
