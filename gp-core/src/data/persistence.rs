//! Per-run working area and atomic JSON persistence
//!
//! Run state lives under `<work_base>/<pid>/` for the lifetime of the
//! process. The directory is removed when the [`WorkArea`] drops and by the
//! signal handler in the binary.

use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use gp_error::{ProvisionError, Result};

/// Write JSON to `path` atomically: temp file, fsync, rename
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let json = serde_json::to_string_pretty(value)?;
    let temp_path = path.with_extension("json.tmp");

    let mut file = fs::File::create(&temp_path)
        .map_err(|e| ProvisionError::FileWrite { path: temp_path.clone(), source: e })?;

    file.write_all(json.as_bytes())
        .map_err(|e| ProvisionError::FileWrite { path: temp_path.clone(), source: e })?;

    file.sync_all()
        .map_err(|e| ProvisionError::FileWrite { path: temp_path.clone(), source: e })?;

    drop(file);

    fs::rename(&temp_path, path)
        .map_err(|e| ProvisionError::FileWrite { path: path.to_path_buf(), source: e })?;

    debug!("Wrote {:?}", path);
    Ok(())
}

/// Read and deserialize a JSON file
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)
        .map_err(|e| ProvisionError::FileRead { path: path.to_path_buf(), source: e })?;
    Ok(serde_json::from_str(&contents)?)
}

/// Directory owned by this process for the duration of one run
#[derive(Debug)]
pub struct WorkArea {
    root: PathBuf,
    keep: bool,
}

impl WorkArea {
    /// Create `<base>/<pid>/`
    pub fn create(base: &Path) -> Result<Self> {
        Self::create_for(base, std::process::id())
    }

    pub fn create_for(base: &Path, pid: u32) -> Result<Self> {
        let root = base.join(pid.to_string());
        fs::create_dir_all(&root)
            .map_err(|e| ProvisionError::FileWrite { path: root.clone(), source: e })?;
        debug!("Work area at {:?}", root);
        Ok(Self { root, keep: false })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        write_json_atomic(&self.file(name), value)
    }

    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.file(name);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Leave the directory in place on drop
    pub fn persist(&mut self) {
        self.keep = true;
    }
}

impl Drop for WorkArea {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = remove_work_dir(&self.root) {
            warn!("Failed to remove work area {:?}: {}", self.root, e);
        }
    }
}

/// Remove a work directory; missing is fine
pub fn remove_work_dir(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
