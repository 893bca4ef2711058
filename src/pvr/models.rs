//! Data models for recording discovery

use std::path::Path;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Default delay before a scheduled discovery pass runs
fn default_discovery_delay_ms() -> u64 {
    1000
}

/// A discovered recording as persisted in the `recording` table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    pub recording_id: String,
    pub title: String,
    pub episode_name: String,
    pub series_number: i32,
    pub episode_number: i32,
    pub year: i32,
    pub stream_url: String,
    pub directory: String,
    pub plot: String,
    pub channel_name: String,
    pub recording_time: i64, // Unix timestamp
    pub duration: i32,       // Seconds
}

impl Recording {
    /// Whether the row carries everything a host needs to present it
    pub fn is_presentable(&self) -> bool {
        !self.recording_id.is_empty() && !self.title.is_empty() && !self.stream_url.is_empty()
    }
}

/// One item returned by a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub path: String,
    pub is_folder: bool,
}

/// Extended file properties read from a recorded TV file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordingProperty {
    Title,
    EpisodeName,
    SeasonNumber,
    EpisodeNumber,
    OriginalBroadcastDate,
    RecordingTime,
    Duration,
    ProgramDescription,
    StationName,
}

impl RecordingProperty {
    /// Canonical property system name
    pub fn canonical_name(&self) -> &'static str {
        match self {
            RecordingProperty::Title => "System.Title",
            RecordingProperty::EpisodeName => "System.RecordedTV.EpisodeName",
            RecordingProperty::SeasonNumber => "System.Media.SeasonNumber",
            RecordingProperty::EpisodeNumber => "System.Media.EpisodeNumber",
            RecordingProperty::OriginalBroadcastDate => "System.RecordedTV.OriginalBroadcastDate",
            RecordingProperty::RecordingTime => "System.RecordedTV.RecordingTime",
            RecordingProperty::Duration => "System.Media.Duration",
            RecordingProperty::ProgramDescription => "System.RecordedTV.ProgramDescription",
            RecordingProperty::StationName => "System.RecordedTV.StationName",
        }
    }
}

/// User-configurable settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Folder holding the recorded TV files; empty when not configured
    pub recordedtv_folder: String,
    /// Delay applied when a discovery pass is (re)scheduled
    #[serde(default = "default_discovery_delay_ms")]
    pub discovery_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            recordedtv_folder: String::new(),
            discovery_delay_ms: default_discovery_delay_ms(),
        }
    }
}

impl Settings {
    /// Parse settings from JSON, filling in defaults for missing keys
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Load settings from a JSON file; a missing file yields the defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Self::from_json(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Properties supplied by the host when the service is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvrProperties {
    /// Per-installation user data directory (holds the database)
    pub user_path: Utf8PathBuf,
}

impl Default for PvrProperties {
    fn default() -> Self {
        let base = dirs::data_dir()
            .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
            .unwrap_or_else(|| Utf8PathBuf::from("."));
        Self {
            user_path: base.join("mcerecordings"),
        }
    }
}
