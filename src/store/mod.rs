//! Durable document store — one JSON file per concern
//!
//! Every write is an atomic replace: serialize to a temp file next to the
//! target, then rename into place. A crash mid-write leaves the previous
//! document intact, never a truncated one.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Atomically replace `path` with the JSON serialization of `value`.
///
/// Failures are returned to the caller but are never fatal to the process:
/// the in-memory state stays authoritative and the next flush retries.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| format!("serialize {}: {}", path.display(), e))?;

    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let tmp: PathBuf = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
    std::fs::write(&tmp, json)
        .map_err(|e| format!("write {}: {}", tmp.display(), e))?;

    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(format!("rename into {}: {}", path.display(), e));
    }
    Ok(())
}

/// Like [`save_json`] but logs the error instead of returning it.
pub fn save_json_logged<T: Serialize>(path: &Path, value: &T) {
    if let Err(e) = save_json(path, value) {
        warn!("Persistence failure (will retry on next flush): {}", e);
    }
}

/// Load a JSON document, falling back to `T::default()` when the file is
/// missing or unreadable.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(value) => value,
            Err(e) => {
                warn!("Corrupt document {} ({}), starting fresh", path.display(), e);
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}
