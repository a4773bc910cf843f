//! Device Identity
//!
//! Device authentication needs a stable id per installation. An explicit
//! id in settings wins; otherwise the id persisted at `device_id_path` is
//! reused, and a fresh UUID is generated and written back when that file
//! is missing or blank.

use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::settings::Settings;

/// Device id errors.
#[derive(Debug, Error)]
pub enum DeviceIdError {
    /// Reading or writing the persisted id failed.
    #[error("device id storage at {path}: {source}")]
    Storage {
        /// File that failed.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Resolve the device id for `settings`.
pub fn resolve_device_id(settings: &Settings) -> Result<String, DeviceIdError> {
    if let Some(id) = settings.device_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }

    match settings.device_id_path.as_deref() {
        Some(path) => load_or_create(path),
        None => {
            let id = generate_device_id();
            debug!(device_id = %id, "using ephemeral device id");
            Ok(id)
        }
    }
}

/// Read the id stored at `path`, creating and persisting one if needed.
pub fn load_or_create(path: &Path) -> Result<String, DeviceIdError> {
    let storage_err = |source| DeviceIdError::Storage {
        path: path.display().to_string(),
        source,
    };

    match std::fs::read_to_string(path) {
        Ok(stored) if !stored.trim().is_empty() => return Ok(stored.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(storage_err(e)),
    }

    let id = generate_device_id();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(storage_err)?;
    }
    std::fs::write(path, &id).map_err(storage_err)?;
    info!(device_id = %id, path = %path.display(), "generated new device id");
    Ok(id)
}

fn generate_device_id() -> String {
    Uuid::new_v4().to_string()
}
