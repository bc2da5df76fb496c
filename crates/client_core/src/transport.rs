//! HTTP side of the backend contract: snapshot/stats fetches and commands.

use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, RequestBuilder,
};
use shared::{
    domain::{SpeedLimits, TorrentId},
    error::ErrorBody,
    protocol::{
        GlobalLimitsQuery, GlobalStats, PushMessage, SnapshotRecord, TorrentUpdateRequest,
        UploadQuery,
    },
};
use tracing::debug;
use url::Url;

use crate::error::{ApiError, ChannelError, DecodeError, TransportError};

pub const TORRENT_FILE_SUFFIX: &str = ".torrent";

/// A `.torrent` file selected by the operator.
#[derive(Debug, Clone)]
pub struct TorrentUpload {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub limits: SpeedLimits,
}

impl TorrentUpload {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
            limits: SpeedLimits::UNLIMITED,
        }
    }

    pub fn with_limits(mut self, limits: SpeedLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Reject what the backend would reject anyway, before any bytes move.
    pub fn validate(&self) -> Result<(), ApiError> {
        if !self.filename.ends_with(TORRENT_FILE_SUFFIX) {
            return Err(ApiError::InvalidUpload(format!(
                "'{}' is not a {TORRENT_FILE_SUFFIX} file",
                self.filename
            )));
        }
        if self.bytes.is_empty() {
            return Err(ApiError::InvalidUpload(format!(
                "'{}' is empty",
                self.filename
            )));
        }
        Ok(())
    }
}

#[async_trait]
pub trait TorrentApi: Send + Sync {
    async fn fetch_torrents(&self) -> Result<Vec<SnapshotRecord>, ApiError>;
    async fn fetch_stats(&self) -> Result<GlobalStats, ApiError>;
    async fn pause(&self, id: &TorrentId) -> Result<(), ApiError>;
    async fn resume(&self, id: &TorrentId) -> Result<(), ApiError>;
    async fn delete(&self, id: &TorrentId) -> Result<(), ApiError>;
    async fn update_limits(&self, id: &TorrentId, limits: SpeedLimits) -> Result<(), ApiError>;
    async fn set_global_limits(&self, limits: SpeedLimits) -> Result<(), ApiError>;
    /// Returns the id the backend assigned to the new torrent.
    async fn upload(&self, upload: TorrentUpload) -> Result<TorrentId, ApiError>;
}

pub fn decode_snapshot(raw: &str) -> Result<Vec<SnapshotRecord>, DecodeError> {
    serde_json::from_str(raw).map_err(|e| DecodeError::new("snapshot", e))
}

pub fn decode_stats(raw: &str) -> Result<GlobalStats, DecodeError> {
    serde_json::from_str(raw).map_err(|e| DecodeError::new("stats", e))
}

pub fn decode_push_message(raw: &str) -> Result<PushMessage, DecodeError> {
    serde_json::from_str(raw).map_err(|e| DecodeError::new("push", e))
}

/// Websocket endpoint next to the REST API: `http://host/api` → `ws://host/api/ws`.
pub fn push_channel_url(api_base_url: &str) -> Result<Url, ChannelError> {
    let base = api_base_url.trim_end_matches('/');
    let ws_url = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}/ws")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}/ws")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        format!("{base}/ws")
    } else {
        return Err(ChannelError::InvalidUrl(api_base_url.to_string()));
    };
    Url::parse(&ws_url).map_err(|_| ChannelError::InvalidUrl(api_base_url.to_string()))
}

pub struct HttpTorrentApi {
    http: Client,
    base_url: String,
}

impl HttpTorrentApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn execute(
        &self,
        method: &'static str,
        endpoint: String,
        request: RequestBuilder,
    ) -> Result<String, TransportError> {
        let response = request
            .send()
            .await
            .map_err(|source| TransportError::Request {
                method,
                endpoint: endpoint.clone(),
                source,
            })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| TransportError::Request {
                method,
                endpoint: endpoint.clone(),
                source,
            })?;

        if !status.is_success() {
            let detail = serde_json::from_str::<ErrorBody>(&body)
                .map(|error| error.message())
                .unwrap_or_else(|_| body.trim().to_string());
            return Err(TransportError::Status {
                method,
                endpoint,
                status,
                detail,
            });
        }

        debug!(method, %endpoint, %status, "backend request completed");
        Ok(body)
    }
}

#[async_trait]
impl TorrentApi for HttpTorrentApi {
    async fn fetch_torrents(&self) -> Result<Vec<SnapshotRecord>, ApiError> {
        let endpoint = self.endpoint("/torrents");
        let body = self
            .execute("GET", endpoint.clone(), self.http.get(&endpoint))
            .await?;
        Ok(decode_snapshot(&body)?)
    }

    async fn fetch_stats(&self) -> Result<GlobalStats, ApiError> {
        let endpoint = self.endpoint("/stats");
        let body = self
            .execute("GET", endpoint.clone(), self.http.get(&endpoint))
            .await?;
        Ok(decode_stats(&body)?)
    }

    async fn pause(&self, id: &TorrentId) -> Result<(), ApiError> {
        let endpoint = self.endpoint(&format!("/torrents/{id}/pause"));
        self.execute("POST", endpoint.clone(), self.http.post(&endpoint))
            .await?;
        Ok(())
    }

    async fn resume(&self, id: &TorrentId) -> Result<(), ApiError> {
        let endpoint = self.endpoint(&format!("/torrents/{id}/resume"));
        self.execute("POST", endpoint.clone(), self.http.post(&endpoint))
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &TorrentId) -> Result<(), ApiError> {
        let endpoint = self.endpoint(&format!("/torrents/{id}"));
        self.execute("DELETE", endpoint.clone(), self.http.delete(&endpoint))
            .await?;
        Ok(())
    }

    async fn update_limits(&self, id: &TorrentId, limits: SpeedLimits) -> Result<(), ApiError> {
        let endpoint = self.endpoint(&format!("/torrents/{id}"));
        let request = self
            .http
            .put(&endpoint)
            .json(&TorrentUpdateRequest::from(limits));
        self.execute("PUT", endpoint, request).await?;
        Ok(())
    }

    async fn set_global_limits(&self, limits: SpeedLimits) -> Result<(), ApiError> {
        let endpoint = self.endpoint("/settings/global-limits");
        let request = self
            .http
            .post(&endpoint)
            .query(&GlobalLimitsQuery::from(limits));
        self.execute("POST", endpoint, request).await?;
        Ok(())
    }

    async fn upload(&self, upload: TorrentUpload) -> Result<TorrentId, ApiError> {
        upload.validate()?;
        let endpoint = self.endpoint("/torrents/upload");
        let query = UploadQuery::from(upload.limits);
        let part = Part::bytes(upload.bytes)
            .file_name(upload.filename)
            .mime_str("application/x-bittorrent")
            .map_err(|source| TransportError::Request {
                method: "POST",
                endpoint: endpoint.clone(),
                source,
            })?;
        let request = self
            .http
            .post(&endpoint)
            .query(&query)
            .multipart(Form::new().part("file", part));
        let body = self.execute("POST", endpoint, request).await?;

        let created: SnapshotRecord = serde_json::from_str(&body)
            .map_err(|e| DecodeError::new("upload response", e))?;
        Ok(created.id)
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
