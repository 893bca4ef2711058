//! Recording catalog queries used by the host-facing layer

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::pvr::callbacks::AddonCallbacks;
use crate::pvr::error::{Error, Result};
use crate::pvr::models::Recording;

/// Number of recordings in the catalog; 0 when it cannot be read
pub fn get_recording_count(conn: &Connection) -> i64 {
    match conn.query_row("SELECT COUNT(*) FROM recording", [], |row| row.get(0)) {
        Ok(count) => count,
        Err(e) => {
            warn!("Unable to count recordings: {}", e);
            0
        }
    }
}

fn recording_from_row(row: &Row<'_>) -> rusqlite::Result<Recording> {
    Ok(Recording {
        recording_id: row.get::<_, Option<String>>("recording_id")?.unwrap_or_default(),
        title: row.get::<_, Option<String>>("title")?.unwrap_or_default(),
        episode_name: row.get::<_, Option<String>>("episode_name")?.unwrap_or_default(),
        series_number: row.get::<_, Option<i32>>("series_number")?.unwrap_or_default(),
        episode_number: row.get::<_, Option<i32>>("episode_number")?.unwrap_or_default(),
        year: row.get::<_, Option<i32>>("year")?.unwrap_or_default(),
        stream_url: row.get::<_, Option<String>>("stream_url")?.unwrap_or_default(),
        directory: row.get::<_, Option<String>>("directory")?.unwrap_or_default(),
        plot: row.get::<_, Option<String>>("plot")?.unwrap_or_default(),
        channel_name: row.get::<_, Option<String>>("channel_name")?.unwrap_or_default(),
        recording_time: row.get::<_, Option<i64>>("recording_time")?.unwrap_or_default(),
        duration: row.get::<_, Option<i32>>("duration")?.unwrap_or_default(),
    })
}

/// Invoke `callback` for every presentable recording, ordered by identifier.
///
/// Rows missing an identifier, title or stream URL are skipped.
pub fn enumerate_recordings<F>(conn: &Connection, mut callback: F) -> Result<()>
where
    F: FnMut(&Recording),
{
    let mut stmt = conn.prepare(
        "SELECT recording_id, title, episode_name, series_number, episode_number, year,
            stream_url, directory, plot, channel_name, recording_time, duration
         FROM recording ORDER BY recording_id",
    )?;

    let rows = stmt.query_map([], recording_from_row)?;
    for recording in rows {
        let recording = recording?;
        if !recording.is_presentable() {
            debug!("Skipping incomplete recording {:?}", recording.recording_id);
            continue;
        }
        callback(&recording);
    }

    Ok(())
}

/// Stream URL of a recording; empty when the recording is unknown
pub fn get_recording_stream_url(conn: &Connection, recording_id: &str) -> Result<String> {
    let url: Option<Option<String>> = conn
        .query_row(
            "SELECT stream_url FROM recording WHERE recording_id = ?1",
            params![recording_id],
            |row| row.get(0),
        )
        .optional()?;

    Ok(url.flatten().unwrap_or_default())
}

/// Delete a recording and its file.
///
/// The file deleter is handed the recording's stored `stream_url` (its file
/// path), not the recording identifier.
///
/// Returns `Ok(false)` when no such recording exists. When the row was
/// removed but the file could not be deleted, `Error::FileDelete` is
/// returned; the row stays deleted.
pub fn delete_recording(
    conn: &Connection,
    addon: &dyn AddonCallbacks,
    recording_id: &str,
) -> Result<bool> {
    let removed: Option<Option<String>> = conn
        .query_row(
            "DELETE FROM recording WHERE recording_id = ?1 RETURNING stream_url",
            params![recording_id],
            |row| row.get(0),
        )
        .optional()?;

    let Some(stream_url) = removed else {
        debug!("Recording {} not found, nothing to delete", recording_id);
        return Ok(false);
    };
    info!("Deleted recording {} from database", recording_id);

    let path = stream_url.unwrap_or_default();
    if path.is_empty() || !addon.delete_file(&path) {
        return Err(Error::FileDelete {
            id: recording_id.to_string(),
            path,
        });
    }

    info!("Deleted recording file {}", path);
    Ok(true)
}
