//! On-disk snapshots of the selector cache.
//!
//! One JSON file per service name, `<dir>/<name>.json`, holding an array of
//! service records. Writes go to a temp file that is synced and renamed over
//! the target, so a reader never sees a half-written snapshot.

use crate::config::SelectorConfig;
use crate::registry::Service;
use crate::{DodoError, Result};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn snapshot_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, SelectorConfig::SNAPSHOT_EXTENSION))
}

/// Read one snapshot. Returns `None` if the file doesn't exist.
pub fn read_snapshot(path: &Path) -> Result<Option<Vec<Service>>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(DodoError::Io {
                message: format!("Failed to read {}", path.display()),
                path: Some(path.to_path_buf()),
                source: Some(e),
            })
        }
    };

    let services = serde_json::from_str(&contents).map_err(|e| DodoError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;
    Ok(Some(services))
}

/// Write the snapshot for `name` atomically.
pub fn write_snapshot(dir: &Path, name: &str, services: &[Service]) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| DodoError::Io {
            message: format!("Failed to create directory {}", dir.display()),
            path: Some(dir.to_path_buf()),
            source: Some(e),
        })?;
    }

    let path = snapshot_path(dir, name);
    let temp_path = path.with_extension(format!(
        "{}.{}.{}.tmp",
        SelectorConfig::SNAPSHOT_EXTENSION,
        process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let serialized = serde_json::to_string_pretty(services).map_err(|e| DodoError::Json {
        message: format!("Failed to serialize snapshot for {}: {}", name, e),
        source: Some(e),
    })?;

    let write = |file: &mut File| -> std::io::Result<()> {
        file.write_all(serialized.as_bytes())?;
        file.flush()?;
        file.sync_all()
    };

    let result = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .and_then(|mut file| write(&mut file));
    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(DodoError::Io {
            message: format!("Failed to write temp file {}", temp_path.display()),
            path: Some(temp_path),
            source: Some(e),
        });
    }

    fs::rename(&temp_path, &path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        DodoError::Io {
            message: format!("Failed to rename {} to {}", temp_path.display(), path.display()),
            path: Some(path.clone()),
            source: Some(e),
        }
    })?;

    debug!("Wrote snapshot {}", path.display());
    Ok(())
}

/// Delete the snapshot for `name`, if any.
pub fn remove_snapshot(dir: &Path, name: &str) -> Result<()> {
    let path = snapshot_path(dir, name);
    match fs::remove_file(&path) {
        Ok(()) => {
            debug!("Removed snapshot {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DodoError::io_with_path(e, path)),
    }
}

/// Load every snapshot in `dir`, keyed by service name.
///
/// Returns `None` if the directory doesn't exist. Files without the snapshot
/// extension are skipped with a warning.
pub fn load_dir(dir: &Path) -> Result<Option<HashMap<String, Vec<Service>>>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DodoError::io_with_path(e, dir)),
    };

    let mut services = HashMap::new();
    for entry in entries {
        let path = entry.map_err(|e| DodoError::io_with_path(e, dir))?.path();
        if !path.is_file() {
            continue;
        }

        let is_snapshot = path
            .extension()
            .is_some_and(|ext| ext == SelectorConfig::SNAPSHOT_EXTENSION);
        let name = path.file_stem().and_then(|stem| stem.to_str());
        let (true, Some(name)) = (is_snapshot, name) else {
            warn!("Skipping non-snapshot file {}", path.display());
            continue;
        };

        if let Some(list) = read_snapshot(&path)? {
            services.insert(name.to_string(), list);
        }
    }
    Ok(Some(services))
}
