//! Whole-file JSON persistence shared by the goal, task and health stores.
//!
//! Each store is one versioned JSON document rewritten wholesale on every
//! mutation. Writes go to a sibling temp file first and are then renamed
//! over the target, so a crash mid-write leaves the previous document intact.

use crate::error::{Result, VigilError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Current on-disk schema version.
pub const STATE_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    #[serde(default = "default_version")]
    version: u8,
    items: Vec<T>,
}

fn default_version() -> u8 {
    STATE_VERSION
}

/// Load a record collection. A missing file is an empty collection;
/// an unreadable or malformed file is a [`VigilError::Persistence`].
pub fn load_collection<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let Some(bytes) = read_if_exists(path)? else {
        return Ok(Vec::new());
    };

    let envelope: Envelope<T> = serde_json::from_slice(&bytes).map_err(|e| {
        VigilError::Persistence(format!("cannot parse {}: {e}", path.display()))
    })?;

    if envelope.version > STATE_VERSION {
        return Err(VigilError::Persistence(format!(
            "{} has schema version {} (newest supported is {STATE_VERSION})",
            path.display(),
            envelope.version
        )));
    }

    Ok(envelope.items)
}

/// Replace a record collection on disk.
pub fn save_collection<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    #[derive(Serialize)]
    struct EnvelopeRef<'a, T> {
        version: u8,
        items: &'a [T],
    }

    let json = serde_json::to_vec_pretty(&EnvelopeRef {
        version: STATE_VERSION,
        items,
    })
    .map_err(|e| VigilError::Persistence(format!("cannot serialize {}: {e}", path.display())))?;

    write_atomic(path, &json)
}

/// Load a single record. Missing file yields `None`.
pub fn load_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let Some(bytes) = read_if_exists(path)? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| VigilError::Persistence(format!("cannot parse {}: {e}", path.display())))
}

/// Replace a single record on disk.
pub fn save_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(record)
        .map_err(|e| VigilError::Persistence(format!("cannot serialize {}: {e}", path.display())))?;
    write_atomic(path, &json)
}

fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(VigilError::Persistence(format!(
            "cannot read {}: {e}",
            path.display()
        ))),
    }
}

/// Write `bytes` to a writer-unique sibling temp file, then rename it over
/// `path`. Concurrent writers never share a temp file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            VigilError::Persistence(format!("cannot create {}: {e}", parent.display()))
        })?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(
        ".{file_name}.{}.tmp",
        uuid::Uuid::new_v4().simple()
    ));
    std::fs::write(&tmp_path, bytes).map_err(|e| {
        VigilError::Persistence(format!("cannot write {}: {e}", tmp_path.display()))
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        VigilError::Persistence(format!("cannot finalize {}: {e}", path.display()))
    })?;
    Ok(())
}
