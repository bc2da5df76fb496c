use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::{Eta, SpeedLimits, TorrentId, TorrentStatus};

/// Rates arrive as floats (`bytes/s`); negative or non-finite values are
/// clamped to zero.
fn rate_from_f64(raw: f64) -> u64 {
    if raw.is_finite() && raw > 0.0 {
        raw.round() as u64
    } else {
        0
    }
}

fn de_rate<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?
        .map(rate_from_f64)
        .unwrap_or(0))
}

fn de_opt_rate<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.map(rate_from_f64))
}

fn default_status() -> TorrentStatus {
    TorrentStatus::Queued
}

/// One full torrent record as returned by `GET /torrents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: TorrentId,
    pub name: String,
    #[serde(rename = "size")]
    pub size_bytes: u64,
    #[serde(rename = "progress", default)]
    pub progress_percent: f64,
    #[serde(rename = "download_rate", default, deserialize_with = "de_rate")]
    pub download_rate_bps: u64,
    #[serde(rename = "upload_rate", default, deserialize_with = "de_rate")]
    pub upload_rate_bps: u64,
    #[serde(default)]
    pub eta: Eta,
    #[serde(default = "default_status")]
    pub status: TorrentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<NaiveDateTime>,
    #[serde(rename = "download_speed_limit", default)]
    pub download_limit_bps: Option<u64>,
    #[serde(rename = "upload_speed_limit", default)]
    pub upload_limit_bps: Option<u64>,
}

impl SnapshotRecord {
    pub fn limits(&self) -> SpeedLimits {
        SpeedLimits::new(self.download_limit_bps, self.upload_limit_bps)
    }
}

/// Partial high-frequency update for one torrent. Only the fields present in
/// the push message are `Some`; anything else the backend sends (`state`,
/// peer counts, byte totals) is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    #[serde(rename = "progress", default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<f64>,
    #[serde(
        rename = "download_rate",
        default,
        deserialize_with = "de_opt_rate",
        skip_serializing_if = "Option::is_none"
    )]
    pub download_rate_bps: Option<u64>,
    #[serde(
        rename = "upload_rate",
        default,
        deserialize_with = "de_opt_rate",
        skip_serializing_if = "Option::is_none"
    )]
    pub upload_rate_bps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<Eta>,
}

/// Messages delivered over the `/ws` push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    TorrentUpdate {
        stats: HashMap<TorrentId, DeltaRecord>,
    },
}

/// Aggregate counters, either reported by `GET /stats` or recomputed locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_downloads: u64,
    pub active_downloads: u64,
    pub completed_downloads: u64,
    pub total_downloaded: u64,
    pub total_uploaded: u64,
    #[serde(deserialize_with = "de_rate")]
    pub global_download_rate: u64,
    #[serde(deserialize_with = "de_rate")]
    pub global_upload_rate: u64,
}

/// Body of `PUT /torrents/{id}`. Nulls are sent explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentUpdateRequest {
    pub download_speed_limit: Option<u64>,
    pub upload_speed_limit: Option<u64>,
}

impl From<SpeedLimits> for TorrentUpdateRequest {
    fn from(limits: SpeedLimits) -> Self {
        Self {
            download_speed_limit: limits.download_bps,
            upload_speed_limit: limits.upload_bps,
        }
    }
}

/// Query string of `POST /torrents/upload`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_speed_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_speed_limit: Option<u64>,
}

impl From<SpeedLimits> for UploadQuery {
    fn from(limits: SpeedLimits) -> Self {
        Self {
            download_speed_limit: limits.download_bps,
            upload_speed_limit: limits.upload_bps,
        }
    }
}

/// Query string of `POST /settings/global-limits`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalLimitsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_limit: Option<u64>,
}

impl From<SpeedLimits> for GlobalLimitsQuery {
    fn from(limits: SpeedLimits) -> Self {
        Self {
            download_limit: limits.download_bps,
            upload_limit: limits.upload_bps,
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
