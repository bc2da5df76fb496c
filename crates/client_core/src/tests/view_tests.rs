use std::time::Duration;

use super::*;
use chrono::NaiveDate;

fn torrent(id: &str, name: &str, status: TorrentStatus, created_day: Option<u32>) -> Torrent {
    Torrent {
        id: TorrentId::from(id),
        name: name.to_string(),
        size_bytes: 2048,
        status,
        progress_percent: 50.0,
        download_rate_bps: 1536,
        upload_rate_bps: 100,
        eta: Eta::Unknown,
        download_limit_bps: None,
        upload_limit_bps: None,
        created_at: created_day.and_then(|day| {
            NaiveDate::from_ymd_opt(2024, 5, day).and_then(|date| date.and_hms_opt(12, 0, 0))
        }),
        completed_at: None,
    }
}

#[test]
fn bytes_use_binary_units_with_two_decimals() {
    assert_eq!(format_bytes(0), "0 B");
    assert_eq!(format_bytes(1023), "1023 B");
    assert_eq!(format_bytes(1024), "1.00 KB");
    assert_eq!(format_bytes(1536), "1.50 KB");
    assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    assert_eq!(format_bytes(1_048_575), "1.00 MB");
    assert_eq!(format_bytes(1_048_570), "1023.99 KB");
    assert_eq!(format_rate(1024 * 1024 * 1024 - 1), "1.00 GB/s");
    assert_eq!(format_rate(1536), "1.50 KB/s");
    assert_eq!(format_rate(0), "0 B/s");
}

#[test]
fn limits_eta_and_progress_render_for_humans() {
    assert_eq!(format_limit(None), "Unlimited");
    assert_eq!(format_limit(Some(2048)), "2.00 KB/s");
    assert_eq!(format_eta(&Eta::Unknown), "Unknown");
    assert_eq!(format_eta(&Eta::Known(Duration::from_secs(3725))), "1:02:05");
    assert_eq!(
        format_eta(&Eta::Known(Duration::from_secs(86_400 + 60))),
        "24:01:00"
    );
    assert_eq!(format_progress(45.26), "45.3%");
    assert_eq!(format_progress(100.0), "100.0%");
}

#[test]
fn stats_are_summed_from_visible_torrents() {
    let torrents = [
        torrent("a", "a", TorrentStatus::Downloading, None),
        torrent("b", "b", TorrentStatus::Queued, None),
        torrent("c", "c", TorrentStatus::Completed, None),
        torrent("d", "d", TorrentStatus::Paused, None),
    ];
    let stats = compute_stats(torrents.iter());
    assert_eq!(stats.total_downloads, 4);
    assert_eq!(stats.active_downloads, 2);
    assert_eq!(stats.completed_downloads, 1);
    assert_eq!(stats.total_downloaded, 4 * 1024);
    assert_eq!(stats.total_uploaded, 0);
    assert_eq!(stats.global_download_rate, 4 * 1536);
    assert_eq!(stats.global_upload_rate, 400);
}

#[test]
fn rows_are_newest_first_then_by_name() {
    let mut torrents = HashMap::new();
    for t in [
        torrent("1", "zeta", TorrentStatus::Queued, Some(1)),
        torrent("2", "beta", TorrentStatus::Queued, Some(3)),
        torrent("3", "alpha", TorrentStatus::Queued, Some(3)),
        torrent("4", "undated", TorrentStatus::Queued, None),
    ] {
        torrents.insert(t.id.clone(), t);
    }

    let view = DashboardView::project(&torrents, None);
    let names: Vec<&str> = view.rows.iter().map(|row| row.name.as_str()).collect();
    assert_eq!(names, ["alpha", "beta", "zeta", "undated"]);
    assert_eq!(view.stats.total_downloads, 4);
    assert!(view.server_stats.is_none());
    assert_eq!(view.rows[0].download_rate, "1.50 KB/s");
    assert_eq!(view.rows[0].progress, "50.0%");
    assert_eq!(view.rows[0].downloaded, "1.00 KB");
}

#[test]
fn empty_store_projects_to_zeroes() {
    let view = DashboardView::project(&HashMap::new(), None);
    assert!(view.rows.is_empty());
    assert_eq!(view.stats, GlobalStats::default());
    assert_eq!(
        view.summary_line(),
        "0 torrents, 0 active, 0 completed | down 0 B/s | up 0 B/s | 0 B downloaded"
    );
}
