use std::{fmt, time::Duration};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(TorrentId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Error,
    Checking,
    DownloadingMetadata,
}

impl TorrentStatus {
    /// Statuses the backend counts as "active" in its own stats.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TorrentStatus::Queued
                | TorrentStatus::Downloading
                | TorrentStatus::Checking
                | TorrentStatus::DownloadingMetadata
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            TorrentStatus::Queued => "queued",
            TorrentStatus::Downloading => "downloading",
            TorrentStatus::Paused => "paused",
            TorrentStatus::Completed => "completed",
            TorrentStatus::Error => "error",
            TorrentStatus::Checking => "checking",
            TorrentStatus::DownloadingMetadata => "downloading_metadata",
        }
    }
}

impl fmt::Display for TorrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Estimated time remaining. The backend renders this as a Python
/// `timedelta` string (`"0:05:23"`, `"2 days, 1:00:00"`) or `"Unknown"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Eta {
    Known(Duration),
    #[default]
    Unknown,
}

impl Eta {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("unknown") {
            return Some(Eta::Unknown);
        }

        let (days, clock) = match raw.split_once(',') {
            Some((day_part, clock)) => {
                let days = day_part
                    .trim()
                    .trim_end_matches("days")
                    .trim_end_matches("day")
                    .trim()
                    .parse::<u64>()
                    .ok()?;
                (days, clock.trim())
            }
            None => (0, raw),
        };

        let mut parts = clock.split(':');
        let hours = parts.next()?.trim().parse::<u64>().ok()?;
        let minutes = parts.next()?.trim().parse::<u64>().ok()?;
        // timedelta prints fractional seconds when present
        let seconds = parts.next()?.trim().parse::<f64>().ok()?;
        if parts.next().is_some() || minutes >= 60 || !(0.0..60.0).contains(&seconds) {
            return None;
        }

        // absurd day counts overflow; treat them like any other garbage
        let total = days
            .checked_mul(86_400)?
            .checked_add(hours.checked_mul(3_600)?)?
            .checked_add(minutes * 60 + seconds.trunc() as u64)?;
        Some(Eta::Known(Duration::from_secs(total)))
    }
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eta::Unknown => f.write_str("Unknown"),
            Eta::Known(duration) => {
                let total = duration.as_secs();
                let days = total / 86_400;
                let rem = total % 86_400;
                let (h, m, s) = (rem / 3_600, (rem % 3_600) / 60, rem % 60);
                match days {
                    0 => write!(f, "{h}:{m:02}:{s:02}"),
                    1 => write!(f, "1 day, {h}:{m:02}:{s:02}"),
                    n => write!(f, "{n} days, {h}:{m:02}:{s:02}"),
                }
            }
        }
    }
}

impl Serialize for Eta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Eta {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawEta {
            Text(String),
            Seconds(f64),
        }

        // An eta the backend could not render sensibly (negative timedelta,
        // NaN) is treated as unknown instead of failing the whole record.
        Ok(match Option::<RawEta>::deserialize(deserializer)? {
            Some(RawEta::Seconds(secs)) if secs.is_finite() && secs >= 0.0 => {
                Eta::Known(Duration::from_secs(secs as u64))
            }
            Some(RawEta::Text(text)) => Eta::parse(&text).unwrap_or(Eta::Unknown),
            Some(RawEta::Seconds(_)) | None => Eta::Unknown,
        })
    }
}

/// Per-torrent or global rate caps in bytes per second. `None` is unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpeedLimits {
    pub download_bps: Option<u64>,
    pub upload_bps: Option<u64>,
}

impl SpeedLimits {
    pub const UNLIMITED: SpeedLimits = SpeedLimits {
        download_bps: None,
        upload_bps: None,
    };

    pub fn new(download_bps: Option<u64>, upload_bps: Option<u64>) -> Self {
        Self {
            download_bps,
            upload_bps,
        }
    }
}
