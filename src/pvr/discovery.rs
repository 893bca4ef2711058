//! Recording discovery
//!
//! A discovery pass lists the recorded TV folder, reads each file's
//! properties into a temporary staging table, then merges the staging table
//! into `recording` in one short transaction: rows that disappeared from the
//! folder are deleted and rows not yet known are inserted. Existing rows are
//! never updated.
//!
//! A file whose properties cannot be read is logged and skipped. Folder
//! listing and database failures fail the whole pass and leave `recording`
//! as it was.

use std::io;

use chrono::Datelike;
use rusqlite::{params, Connection, Statement, Transaction, TransactionBehavior};
use tracing::{debug, error, info, warn};

use crate::pvr::callbacks::AddonCallbacks;
use crate::pvr::condition::ScalarCondition;
use crate::pvr::error::{Error, Result};
use crate::pvr::models::{Recording, RecordingProperty};

/// Extensions listed from the recorded TV folder
pub const RECORDING_MASK: &str = ".wtv";

/// FILETIME resolution
const TICKS_PER_SECOND: u64 = 10_000_000;

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_EPOCH_OFFSET: i64 = 11_644_473_600;

/// A file that could not be turned into a recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub path: String,
    pub reason: String,
}

/// Result of one discovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    /// The merge inserted or deleted at least one row
    pub changed: bool,
    /// Recordings written to the staging table
    pub staged: usize,
    pub failures: Vec<FileFailure>,
    /// The pass stopped early and merged nothing
    pub cancelled: bool,
}

/// Convert a FILETIME to Unix seconds; zero stays zero
pub fn filetime_to_unix(ticks: u64) -> i64 {
    if ticks == 0 {
        return 0;
    }
    (ticks / TICKS_PER_SECOND) as i64 - FILETIME_EPOCH_OFFSET
}

/// Calendar year (UTC) of a FILETIME; zero when unavailable
pub fn filetime_to_year(ticks: u64) -> i32 {
    if ticks == 0 {
        return 0;
    }
    chrono::DateTime::from_timestamp(filetime_to_unix(ticks), 0)
        .map(|dt| dt.year())
        .unwrap_or(0)
}

/// Convert a 100ns tick duration to whole seconds
pub fn ticks_to_seconds(ticks: u64) -> i32 {
    i32::try_from(ticks / TICKS_PER_SECOND).unwrap_or(i32::MAX)
}

/// Rewrite alternate URI forms into a native path.
///
/// `smb://server/share/file.wtv` becomes `\\server\share\file.wtv` and
/// `file://` URIs are reduced to their path.
pub fn normalize_locator(path: &str) -> String {
    let lower = path.to_ascii_lowercase();

    if lower.starts_with("smb://") {
        return format!("\\\\{}", path[6..].replace('/', "\\"));
    }

    if lower.starts_with("file://") {
        let rest = &path[7..];
        let bytes = rest.as_bytes();
        // file:///C:/dir -> C:/dir
        if bytes.len() > 2 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':' {
            return rest[1..].to_string();
        }
        return rest.to_string();
    }

    path.to_string()
}

/// Stable identifier of a recording: the file stem of its locator
pub fn recording_id(locator: &str) -> String {
    let name = locator.rsplit(['/', '\\']).next().unwrap_or(locator);
    match name.rfind('.') {
        Some(dot) if dot > 0 => name[..dot].to_string(),
        _ => name.to_string(),
    }
}

/// Build a recording from one file's properties
pub fn extract_recording(addon: &dyn AddonCallbacks, path: &str) -> Result<Recording> {
    let stream_url = normalize_locator(path);
    let recording_id = recording_id(&stream_url);
    if recording_id.is_empty() {
        return Err(Error::Metadata {
            path: path.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "no file name to identify the recording"),
        });
    }

    let props = addon
        .open_properties(&stream_url)
        .map_err(|source| Error::Metadata {
            path: path.to_string(),
            source,
        })?;

    let title = props.string(RecordingProperty::Title);
    Ok(Recording {
        recording_id,
        directory: title.clone(),
        title,
        episode_name: props.string(RecordingProperty::EpisodeName),
        series_number: i32::try_from(props.uint32(RecordingProperty::SeasonNumber)).unwrap_or(0),
        episode_number: i32::try_from(props.uint32(RecordingProperty::EpisodeNumber)).unwrap_or(0),
        year: filetime_to_year(props.filetime(RecordingProperty::OriginalBroadcastDate)),
        stream_url,
        plot: props.string(RecordingProperty::ProgramDescription),
        channel_name: props.string(RecordingProperty::StationName),
        recording_time: filetime_to_unix(props.filetime(RecordingProperty::RecordingTime)),
        duration: ticks_to_seconds(props.uint64(RecordingProperty::Duration)),
    })
}

/// Temporary table for one pass, dropped on every exit path
struct StagingTable<'c> {
    conn: &'c Connection,
}

impl<'c> StagingTable<'c> {
    fn create(conn: &'c Connection) -> Result<Self> {
        conn.execute_batch(
            "DROP TABLE IF EXISTS temp.discover_recording;
             CREATE TEMP TABLE discover_recording (
                recording_id TEXT,
                title TEXT,
                episode_name TEXT,
                series_number INTEGER,
                episode_number INTEGER,
                year INTEGER,
                stream_url TEXT,
                directory TEXT,
                plot TEXT,
                channel_name TEXT,
                recording_time INTEGER,
                duration INTEGER
             )",
        )?;
        Ok(Self { conn })
    }

    fn insert_statement(&self) -> Result<Statement<'c>> {
        Ok(self.conn.prepare(
            "INSERT INTO temp.discover_recording (
                recording_id, title, episode_name, series_number, episode_number, year,
                stream_url, directory, plot, channel_name, recording_time, duration
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )?)
    }
}

impl Drop for StagingTable<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.conn.execute_batch("DROP TABLE IF EXISTS temp.discover_recording") {
            warn!("Failed to drop discovery staging table: {}", e);
        }
    }
}

fn stage(insert: &mut Statement<'_>, recording: &Recording) -> Result<()> {
    insert.execute(params![
        recording.recording_id,
        recording.title,
        recording.episode_name,
        recording.series_number,
        recording.episode_number,
        recording.year,
        recording.stream_url,
        recording.directory,
        recording.plot,
        recording.channel_name,
        recording.recording_time,
        recording.duration,
    ])?;
    Ok(())
}

/// Apply the staged set to `recording`; returns whether anything changed
fn merge_staged(conn: &Connection) -> Result<bool> {
    // Dropping the transaction without commit rolls it back
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    let deleted = tx.execute(
        "DELETE FROM main.recording
         WHERE NOT EXISTS (
            SELECT 1 FROM temp.discover_recording AS staged
            WHERE staged.recording_id = recording.recording_id COLLATE NOCASE
         )",
        [],
    )?;

    // OR IGNORE absorbs ids that appear twice in one pass with different case
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO main.recording (
            recording_id, title, episode_name, series_number, episode_number, year,
            stream_url, directory, plot, channel_name, recording_time, duration
         )
         SELECT recording_id, title, episode_name, series_number, episode_number, year,
            stream_url, directory, plot, channel_name, recording_time, duration
         FROM temp.discover_recording AS staged
         WHERE NOT EXISTS (
            SELECT 1 FROM main.recording AS existing
            WHERE existing.recording_id = staged.recording_id COLLATE NOCASE
         )",
        [],
    )?;

    tx.commit()?;

    debug!("Discovery merge: {} deleted, {} inserted", deleted, inserted);
    Ok(deleted > 0 || inserted > 0)
}

/// Reconcile `recording` with the files currently in `folder`
pub fn discover_recordings(
    conn: &Connection,
    addon: &dyn AddonCallbacks,
    folder: &str,
    cancel: &ScalarCondition<bool>,
) -> Result<DiscoveryOutcome> {
    let mut outcome = DiscoveryOutcome::default();

    // Not configured is not the same as configured-but-empty: leave the table alone
    if folder.trim().is_empty() {
        debug!("No recorded TV folder configured, skipping discovery");
        return Ok(outcome);
    }

    if cancel.test(&true) {
        outcome.cancelled = true;
        return Ok(outcome);
    }

    let folder = normalize_locator(folder);
    let staging = StagingTable::create(conn)?;

    let entries = addon
        .get_directory(&folder, RECORDING_MASK)
        .map_err(|source| Error::Enumeration {
            folder: folder.clone(),
            source,
        })?;

    let mut insert = staging.insert_statement()?;
    for entry in entries.iter().filter(|entry| !entry.is_folder) {
        if cancel.test(&true) {
            info!("Recording discovery cancelled after {} file(s)", outcome.staged);
            outcome.cancelled = true;
            return Ok(outcome);
        }

        match extract_recording(addon, &entry.path) {
            Ok(recording) => {
                stage(&mut insert, &recording)?;
                outcome.staged += 1;
            }
            Err(e) => {
                error!("Unable to discover recording {}: {}", entry.path, e);
                outcome.failures.push(FileFailure {
                    path: entry.path.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
    drop(insert);

    if cancel.test(&true) {
        info!("Recording discovery cancelled before merge");
        outcome.cancelled = true;
        return Ok(outcome);
    }

    outcome.changed = merge_staged(conn)?;
    drop(staging);

    info!(
        "Discovered {} recording(s) in {} ({} failed, changed: {})",
        outcome.staged,
        folder,
        outcome.failures.len(),
        outcome.changed
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pvr::callbacks::{FileProperties, LocalAddon, SidecarProperties};
    use crate::pvr::database::{database_uri, default_open_flags, open_database};
    use crate::pvr::models::DirectoryEntry;
    use camino::Utf8PathBuf;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    /// 2017-01-01T00:00:00Z
    const JAN_2017_TICKS: u64 = (1_483_228_800 + 11_644_473_600) * 10_000_000;

    fn open_catalog(dir: &Path) -> Connection {
        let path = Utf8PathBuf::from_path_buf(dir.join("catalog.db")).unwrap();
        open_database(&database_uri(&path), default_open_flags(), true).unwrap()
    }

    fn write_recording(folder: &Path, name: &str, title: &str) {
        let file = folder.join(name);
        fs::write(&file, b"").unwrap();
        let sidecar = serde_json::json!({
            "System.Title": title,
            "System.RecordedTV.EpisodeName": "Pilot",
            "System.Media.SeasonNumber": 2,
            "System.Media.EpisodeNumber": 5,
            "System.RecordedTV.OriginalBroadcastDate": JAN_2017_TICKS,
            "System.RecordedTV.RecordingTime": JAN_2017_TICKS,
            "System.Media.Duration": 18_000_000_000u64,
            "System.RecordedTV.StationName": "WXYZ",
        });
        fs::write(format!("{}.json", file.display()), sidecar.to_string()).unwrap();
    }

    fn ids(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT recording_id FROM recording ORDER BY recording_id")
            .unwrap();
        let ids = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<String>>>()
            .unwrap();
        ids
    }

    fn staging_exists(conn: &Connection) -> bool {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_temp_master WHERE name = 'discover_recording'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        count > 0
    }

    fn insert_row(conn: &Connection, id: &str, title: &str) {
        conn.execute(
            "INSERT INTO recording (recording_id, title, stream_url, directory) VALUES (?1, ?2, ?3, ?2)",
            params![id, title, format!("/old/{}.wtv", id)],
        )
        .unwrap();
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_time_conversions() {
        assert_eq!(filetime_to_unix(0), 0);
        assert_eq!(filetime_to_unix(116_444_736_000_000_000), 0);
        assert_eq!(filetime_to_unix(JAN_2017_TICKS), 1_483_228_800);
        assert_eq!(filetime_to_year(JAN_2017_TICKS), 2017);
        assert_eq!(filetime_to_year(0), 0);
        assert_eq!(ticks_to_seconds(18_000_000_000), 1800);
    }

    #[test]
    fn test_normalize_locator_and_id() {
        assert_eq!(
            normalize_locator("smb://server/Recorded TV/Show_2017.wtv"),
            "\\\\server\\Recorded TV\\Show_2017.wtv"
        );
        assert_eq!(normalize_locator("file:///C:/tv/show.wtv"), "C:/tv/show.wtv");
        assert_eq!(normalize_locator("file:///srv/tv/show.wtv"), "/srv/tv/show.wtv");
        assert_eq!(normalize_locator("/srv/tv/show.wtv"), "/srv/tv/show.wtv");

        assert_eq!(recording_id("\\\\server\\tv\\f1.wtv"), "f1");
        assert_eq!(recording_id("/srv/tv/News.Night.wtv"), "News.Night");
        assert_eq!(recording_id("/srv/tv/"), "");
    }

    #[test]
    fn test_extract_recording_fields() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), "f1.wtv", "The Show");
        let path = dir.path().join("f1.wtv");

        let recording = extract_recording(&LocalAddon, path.to_str().unwrap()).unwrap();
        assert_eq!(recording.recording_id, "f1");
        assert_eq!(recording.title, "The Show");
        assert_eq!(recording.directory, "The Show");
        assert_eq!(recording.episode_name, "Pilot");
        assert_eq!(recording.series_number, 2);
        assert_eq!(recording.episode_number, 5);
        assert_eq!(recording.year, 2017);
        assert_eq!(recording.recording_time, 1_483_228_800);
        assert_eq!(recording.duration, 1800);
        assert_eq!(recording.channel_name, "WXYZ");
        assert_eq!(recording.plot, "");
        assert_eq!(recording.stream_url, path.to_str().unwrap());
    }

    #[test]
    fn test_bad_file_is_skipped_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("tv");
        fs::create_dir(&folder).unwrap();
        write_recording(&folder, "f1.wtv", "Good");
        fs::write(folder.join("f2.wtv"), b"").unwrap(); // no properties
        let conn = open_catalog(dir.path());
        let cancel = ScalarCondition::new(false);

        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let outcome = tracing::subscriber::with_default(subscriber, || {
            discover_recordings(&conn, &LocalAddon, folder.to_str().unwrap(), &cancel)
        })
        .unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.staged, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].path.ends_with("f2.wtv"));
        assert_eq!(ids(&conn), ["f1"]);
        assert!(!staging_exists(&conn));

        let logs = String::from_utf8(logs.0.lock().clone()).unwrap();
        let errors: Vec<_> = logs
            .lines()
            .filter(|line| line.contains("ERROR") && line.contains("f2.wtv"))
            .collect();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_second_pass_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), "a.wtv", "A");
        write_recording(dir.path(), "b.wtv", "B");
        let conn = open_catalog(dir.path());
        let cancel = ScalarCondition::new(false);
        let folder = dir.path().to_str().unwrap();

        assert!(discover_recordings(&conn, &LocalAddon, folder, &cancel).unwrap().changed);
        let second = discover_recordings(&conn, &LocalAddon, folder, &cancel).unwrap();
        assert!(!second.changed);
        assert_eq!(second.staged, 2);
        assert_eq!(ids(&conn), ["a", "b"]);
    }

    #[test]
    fn test_missing_files_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), "keep.wtv", "Keep");
        let conn = open_catalog(dir.path());
        insert_row(&conn, "gone", "Gone");
        let cancel = ScalarCondition::new(false);

        let outcome = discover_recordings(&conn, &LocalAddon, dir.path().to_str().unwrap(), &cancel).unwrap();
        assert!(outcome.changed);
        assert_eq!(ids(&conn), ["keep"]);
    }

    #[test]
    fn test_existing_rows_match_case_insensitively_and_are_not_updated() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), "f1.wtv", "Corrected Title");
        let conn = open_catalog(dir.path());
        insert_row(&conn, "F1", "Old Title");
        let cancel = ScalarCondition::new(false);

        let outcome = discover_recordings(&conn, &LocalAddon, dir.path().to_str().unwrap(), &cancel).unwrap();
        assert!(!outcome.changed);

        let rows: Vec<(String, String)> = conn
            .prepare("SELECT recording_id, title FROM recording")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(rows, [("F1".to_string(), "Old Title".to_string())]);
    }

    #[test]
    fn test_configured_but_empty_folder_clears_table() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("empty");
        fs::create_dir(&folder).unwrap();
        let conn = open_catalog(dir.path());
        insert_row(&conn, "old", "Old");
        let cancel = ScalarCondition::new(false);

        let outcome = discover_recordings(&conn, &LocalAddon, folder.to_str().unwrap(), &cancel).unwrap();
        assert!(outcome.changed);
        assert!(ids(&conn).is_empty());

        let outcome = discover_recordings(&conn, &LocalAddon, folder.to_str().unwrap(), &cancel).unwrap();
        assert!(!outcome.changed);
    }

    #[test]
    fn test_unset_folder_leaves_table_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_catalog(dir.path());
        let cancel = ScalarCondition::new(false);

        let outcome = discover_recordings(&conn, &LocalAddon, "", &cancel).unwrap();
        assert_eq!(outcome, DiscoveryOutcome::default());
        assert!(ids(&conn).is_empty());

        insert_row(&conn, "stale", "Stale");
        let outcome = discover_recordings(&conn, &LocalAddon, "  ", &cancel).unwrap();
        assert!(!outcome.changed);
        assert_eq!(ids(&conn), ["stale"]);
    }

    #[test]
    fn test_enumeration_failure_leaves_table_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_catalog(dir.path());
        insert_row(&conn, "known", "Known");
        let cancel = ScalarCondition::new(false);
        let missing = dir.path().join("missing");

        let result = discover_recordings(&conn, &LocalAddon, missing.to_str().unwrap(), &cancel);
        assert!(matches!(result, Err(Error::Enumeration { .. })));
        assert_eq!(ids(&conn), ["known"]);
        assert!(!staging_exists(&conn));
    }

    #[test]
    fn test_file_as_folder_is_enumeration_failure() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_catalog(dir.path());
        insert_row(&conn, "known", "Known");
        let cancel = ScalarCondition::new(false);
        let file = dir.path().join("show.wtv");
        fs::write(&file, b"").unwrap();

        let result = discover_recordings(&conn, &LocalAddon, file.to_str().unwrap(), &cancel);
        assert!(matches!(result, Err(Error::Enumeration { .. })));
        assert_eq!(ids(&conn), ["known"]);
        assert!(!staging_exists(&conn));
    }

    #[test]
    fn test_out_of_range_numbers_default_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("show.wtv");
        fs::write(&file, b"").unwrap();
        let sidecar = serde_json::json!({
            "System.Title": "Show",
            "System.Media.SeasonNumber": u32::MAX,
            "System.Media.EpisodeNumber": 4,
        });
        fs::write(format!("{}.json", file.display()), sidecar.to_string()).unwrap();

        let recording = extract_recording(&LocalAddon, file.to_str().unwrap()).unwrap();
        assert_eq!(recording.series_number, 0);
        assert_eq!(recording.episode_number, 4);
    }

    #[test]
    fn test_merge_failure_drops_staging_table() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), "f1.wtv", "Show");
        let conn = open_catalog(dir.path());
        conn.execute_batch("DROP TABLE recording").unwrap();
        let cancel = ScalarCondition::new(false);

        let result = discover_recordings(&conn, &LocalAddon, dir.path().to_str().unwrap(), &cancel);
        assert!(matches!(result, Err(Error::Sqlite(_))));
        assert!(!staging_exists(&conn));
        assert!(conn.is_autocommit());
    }

    /// Lists fixed entries and raises cancellation once the first file is read
    struct CancellingAddon {
        entries: Vec<DirectoryEntry>,
        cancel: Arc<ScalarCondition<bool>>,
    }

    impl AddonCallbacks for CancellingAddon {
        fn get_directory(&self, _folder: &str, _mask: &str) -> io::Result<Vec<DirectoryEntry>> {
            Ok(self.entries.clone())
        }

        fn open_properties(&self, _path: &str) -> io::Result<Box<dyn FileProperties>> {
            self.cancel.set(true);
            Ok(Box::new(SidecarProperties::from_json(r#"{"System.Title": "Show"}"#)?))
        }

        fn delete_file(&self, _path: &str) -> bool {
            false
        }
    }

    #[test]
    fn test_cancellation_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_catalog(dir.path());
        insert_row(&conn, "existing", "Existing");

        let cancel = Arc::new(ScalarCondition::new(false));
        let addon = CancellingAddon {
            entries: ["/tv/one.wtv", "/tv/two.wtv", "/tv/three.wtv"]
                .iter()
                .map(|path| DirectoryEntry {
                    path: path.to_string(),
                    is_folder: false,
                })
                .collect(),
            cancel: cancel.clone(),
        };

        let outcome = discover_recordings(&conn, &addon, "/tv", &cancel).unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.changed);
        assert_eq!(outcome.staged, 1);
        assert_eq!(ids(&conn), ["existing"]);
        assert!(!staging_exists(&conn));
    }
}
