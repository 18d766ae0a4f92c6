//! JSON file watermark store.
//!
//! The whole state is one small JSON document, rewritten on every change
//! through a temp file and a rename so a crash never leaves it half written.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use sync_core::{WatermarkError, WatermarkStore};
use sync_types::{DataKind, Timestamp};
use tracing::debug;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    watermarks: BTreeMap<DataKind, Timestamp>,
}

/// Watermarks persisted to a JSON file.
#[derive(Debug, Clone)]
pub struct JsonWatermarkStore {
    path: PathBuf,
    marks: BTreeMap<DataKind, Timestamp>,
}

impl JsonWatermarkStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, WatermarkError> {
        let path = path.into();
        let marks = match fs::read_to_string(&path) {
            Ok(contents) => parse(&path, &contents)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(WatermarkError::Read { path, source }),
        };
        debug!(path = %path.display(), kinds = marks.len(), "opened watermark store");
        Ok(Self { path, marks })
    }

    /// Location of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All stored watermarks, ordered by kind.
    pub fn iter(&self) -> impl Iterator<Item = (DataKind, Timestamp)> + '_ {
        self.marks.iter().map(|(k, v)| (*k, *v))
    }

    fn persist(&self) -> Result<(), WatermarkError> {
        let write_err = |source| WatermarkError::Write {
            path: self.path.clone(),
            source,
        };

        let state = StateFile {
            version: STATE_VERSION,
            watermarks: self.marks.clone(),
        };
        let contents = serde_json::to_string_pretty(&state)
            .map_err(|e| write_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)?;
        Ok(())
    }
}

fn parse(path: &Path, contents: &str) -> Result<BTreeMap<DataKind, Timestamp>, WatermarkError> {
    let corrupt = |reason: String| WatermarkError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let state: StateFile = serde_json::from_str(contents).map_err(|e| corrupt(e.to_string()))?;
    if state.version != STATE_VERSION {
        return Err(corrupt(format!("unsupported version {}", state.version)));
    }
    Ok(state.watermarks)
}

impl WatermarkStore for JsonWatermarkStore {
    fn get(&self, kind: DataKind) -> Option<Timestamp> {
        self.marks.get(&kind).copied()
    }

    fn set(&mut self, kind: DataKind, ts: Timestamp) -> Result<(), WatermarkError> {
        let previous = self.marks.insert(kind, ts);
        if let Err(e) = self.persist() {
            // Memory must not run ahead of disk.
            match previous {
                Some(old) => self.marks.insert(kind, old),
                None => self.marks.remove(&kind),
            };
            return Err(e);
        }
        debug!(%kind, %ts, "watermark persisted");
        Ok(())
    }
}
