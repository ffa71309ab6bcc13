use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::app::error::AppError;

/// Serializes `value` next to `path` and renames it into place, so readers never see a torn file.
pub fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
    trace_id: &str,
) -> Result<(), AppError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|err| {
        AppError::persistence(
            format!("Failed to create {}: {err}", parent.display()),
            trace_id,
        )
    })?;

    let payload = serde_json::to_string_pretty(value).map_err(|err| {
        AppError::persistence(format!("Failed to serialize {}: {err}", path.display()), trace_id)
    })?;

    let mut temp = NamedTempFile::new_in(&parent).map_err(|err| {
        AppError::persistence(format!("Failed to create temp file: {err}"), trace_id)
    })?;
    temp.write_all(payload.as_bytes())
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| {
            AppError::persistence(format!("Failed to write {}: {err}", path.display()), trace_id)
        })?;
    temp.persist(path).map_err(|err| {
        AppError::persistence(
            format!("Failed to replace {}: {}", path.display(), err.error),
            trace_id,
        )
    })?;
    Ok(())
}

/// Loads a JSON document, falling back to `T::default()` when the file is missing.
///
/// A file that exists but does not parse is moved aside to `<name>.corrupt` so the next write
/// does not destroy it, and the default value is returned.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read persisted state");
            return T::default();
        }
    };
    match serde_json::from_str::<T>(&raw) {
        Ok(value) => value,
        Err(err) => {
            let mut aside = path.as_os_str().to_owned();
            aside.push(".corrupt");
            let aside = PathBuf::from(aside);
            warn!(
                path = %path.display(),
                moved_to = %aside.display(),
                error = %err,
                "persisted state is unreadable; starting empty"
            );
            if let Err(err) = fs::rename(path, &aside) {
                warn!(path = %path.display(), error = %err, "failed to move corrupt file aside");
            }
            T::default()
        }
    }
}
