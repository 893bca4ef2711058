//! Host collaborator interfaces
//!
//! The catalog never touches the host directly. Directory listings, file
//! metadata, file deletion and change notification all go through these
//! traits. `LocalAddon` implements the file-system side with plain files and
//! JSON property sidecars.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::pvr::models::{DirectoryEntry, RecordingProperty};

/// Typed access to one file's extended properties.
///
/// Every accessor returns its default (empty string or zero) when the
/// property is absent or has the wrong type.
pub trait FileProperties {
    fn string(&self, property: RecordingProperty) -> String;
    fn uint32(&self, property: RecordingProperty) -> u32;
    fn uint64(&self, property: RecordingProperty) -> u64;
    /// FILETIME value in 100ns ticks since 1601-01-01
    fn filetime(&self, property: RecordingProperty) -> u64;
}

/// File-system services provided by the host
pub trait AddonCallbacks: Send + Sync {
    /// List the direct children of `folder` matching `mask` (`|`-separated
    /// extensions). Folders are always listed.
    fn get_directory(&self, folder: &str, mask: &str) -> io::Result<Vec<DirectoryEntry>>;

    /// Open the extended properties of a file
    fn open_properties(&self, path: &str) -> io::Result<Box<dyn FileProperties>>;

    /// Delete a file, reporting whether it succeeded
    fn delete_file(&self, path: &str) -> bool;
}

/// PVR services provided by the host
pub trait PvrCallbacks: Send + Sync {
    /// The recording catalog changed and should be re-read
    fn trigger_recording_update(&self);
}

/// Properties stored in a `<file>.json` sidecar keyed by canonical name
#[derive(Debug, Clone, Default)]
pub struct SidecarProperties {
    values: Map<String, Value>,
}

impl SidecarProperties {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        Ok(Self {
            values: serde_json::from_str(json)?,
        })
    }

    fn get(&self, property: RecordingProperty) -> Option<&Value> {
        self.values.get(property.canonical_name())
    }
}

impl FileProperties for SidecarProperties {
    fn string(&self, property: RecordingProperty) -> String {
        self.get(property)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default()
    }

    fn uint32(&self, property: RecordingProperty) -> u32 {
        self.get(property)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or_default()
    }

    fn uint64(&self, property: RecordingProperty) -> u64 {
        self.get(property).and_then(Value::as_u64).unwrap_or_default()
    }

    fn filetime(&self, property: RecordingProperty) -> u64 {
        self.uint64(property)
    }
}

/// Sidecar path holding the properties of `path`
pub fn sidecar_path(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{}.json", path))
}

fn matches_mask(path: &Utf8Path, mask: &str) -> bool {
    if mask.is_empty() {
        return true;
    }
    let name = path.as_str().to_ascii_lowercase();
    mask.split('|')
        .map(str::trim)
        .filter(|ext| !ext.is_empty())
        .any(|ext| name.ends_with(&ext.to_ascii_lowercase()))
}

/// File-system backed host services
#[derive(Debug, Clone, Default)]
pub struct LocalAddon;

impl AddonCallbacks for LocalAddon {
    fn get_directory(&self, folder: &str, mask: &str) -> io::Result<Vec<DirectoryEntry>> {
        // WalkDir yields nothing for a plain file, which would read as an empty folder
        if !std::fs::metadata(folder)?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", folder),
            ));
        }

        let mut entries = Vec::new();

        for entry in WalkDir::new(folder).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry?;
            let Some(path) = Utf8Path::from_path(entry.path()) else {
                warn!("Skipping non UTF-8 path {:?}", entry.path());
                continue;
            };

            let is_folder = entry.file_type().is_dir();
            if is_folder || matches_mask(path, mask) {
                entries.push(DirectoryEntry {
                    path: path.to_string(),
                    is_folder,
                });
            }
        }

        debug!("Listed {} entries in {}", entries.len(), folder);
        Ok(entries)
    }

    fn open_properties(&self, path: &str) -> io::Result<Box<dyn FileProperties>> {
        // The recording itself must exist even though its properties live beside it
        std::fs::metadata(path)?;
        let json = std::fs::read_to_string(sidecar_path(Utf8Path::new(path)))?;
        Ok(Box::new(SidecarProperties::from_json(&json)?))
    }

    fn delete_file(&self, path: &str) -> bool {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to delete recording file {}: {}", path, e);
            return false;
        }

        let sidecar = sidecar_path(Utf8Path::new(path));
        if let Err(e) = std::fs::remove_file(&sidecar) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to delete sidecar {}: {}", sidecar, e);
            }
        }
        true
    }
}
