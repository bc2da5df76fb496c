//! Presentation-ready projection of the store. Everything here is pure.

use std::{cmp::Ordering, collections::HashMap};

use chrono::NaiveDateTime;
use shared::{
    domain::{Eta, TorrentId, TorrentStatus},
    protocol::GlobalStats,
};

use crate::store::Torrent;

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Binary-scaled size with two decimals: `1536` → `"1.50 KB"`. Anything
/// below one KiB is printed as whole bytes.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    // 1023.995 and up would print as "1024.00"
    if (value * 100.0).round() >= 102_400.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

pub fn format_rate(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_limit(limit_bps: Option<u64>) -> String {
    match limit_bps {
        Some(limit) => format_rate(limit),
        None => "Unlimited".to_string(),
    }
}

/// `H:MM:SS`, with days folded into the hour count.
pub fn format_eta(eta: &Eta) -> String {
    match eta {
        Eta::Known(remaining) => {
            let total = remaining.as_secs();
            format!(
                "{}:{:02}:{:02}",
                total / 3600,
                (total % 3600) / 60,
                total % 60
            )
        }
        Eta::Unknown => "Unknown".to_string(),
    }
}

pub fn format_progress(progress_percent: f64) -> String {
    format!("{progress_percent:.1}%")
}

/// Aggregate counters recomputed from the visible torrents. Upload totals
/// are not tracked by the backend and stay at zero.
pub fn compute_stats<'a, I>(torrents: I) -> GlobalStats
where
    I: IntoIterator<Item = &'a Torrent>,
{
    let mut stats = GlobalStats::default();
    for torrent in torrents {
        stats.total_downloads += 1;
        if torrent.status.is_active() {
            stats.active_downloads += 1;
        }
        if torrent.status == TorrentStatus::Completed {
            stats.completed_downloads += 1;
        }
        stats.total_downloaded += torrent.downloaded_bytes();
        stats.global_download_rate += torrent.download_rate_bps;
        stats.global_upload_rate += torrent.upload_rate_bps;
    }
    stats
}

#[derive(Debug, Clone, PartialEq)]
pub struct TorrentRow {
    pub id: TorrentId,
    pub name: String,
    pub status: TorrentStatus,
    pub size: String,
    pub downloaded: String,
    pub progress: String,
    pub download_rate: String,
    pub upload_rate: String,
    pub eta: String,
    pub download_limit: String,
    pub upload_limit: String,
    pub created_at: Option<NaiveDateTime>,
}

impl TorrentRow {
    pub fn from_torrent(torrent: &Torrent) -> Self {
        Self {
            id: torrent.id.clone(),
            name: torrent.name.clone(),
            status: torrent.status,
            size: format_bytes(torrent.size_bytes),
            downloaded: format_bytes(torrent.downloaded_bytes()),
            progress: format_progress(torrent.progress_percent),
            download_rate: format_rate(torrent.download_rate_bps),
            upload_rate: format_rate(torrent.upload_rate_bps),
            eta: format_eta(&torrent.eta),
            download_limit: format_limit(torrent.download_limit_bps),
            upload_limit: format_limit(torrent.upload_limit_bps),
            created_at: torrent.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardView {
    /// Computed from the rows below.
    pub stats: GlobalStats,
    /// Last stats reported by the backend, when polled.
    pub server_stats: Option<GlobalStats>,
    pub rows: Vec<TorrentRow>,
}

impl DashboardView {
    pub fn project(
        torrents: &HashMap<TorrentId, Torrent>,
        server_stats: Option<GlobalStats>,
    ) -> Self {
        let mut ordered: Vec<&Torrent> = torrents.values().collect();
        ordered.sort_by(|a, b| newest_first(a, b));
        Self {
            stats: compute_stats(ordered.iter().copied()),
            server_stats,
            rows: ordered.into_iter().map(TorrentRow::from_torrent).collect(),
        }
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{} torrents, {} active, {} completed | down {} | up {} | {} downloaded",
            self.stats.total_downloads,
            self.stats.active_downloads,
            self.stats.completed_downloads,
            format_rate(self.stats.global_download_rate),
            format_rate(self.stats.global_upload_rate),
            format_bytes(self.stats.total_downloaded),
        )
    }
}

// undated rows sink to the bottom
fn newest_first(a: &Torrent, b: &Torrent) -> Ordering {
    match (a.created_at, b.created_at) {
        (Some(a_at), Some(b_at)) => b_at.cmp(&a_at),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.name.cmp(&b.name))
    .then_with(|| a.id.as_str().cmp(b.id.as_str()))
}

#[cfg(test)]
#[path = "tests/view_tests.rs"]
mod tests;
