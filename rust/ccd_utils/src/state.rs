// SPDX-License-Identifier: GPL-2.0

//! Persisted controller state.
//!
//! Two JSON files under the user's state directory: the daemon's
//! (`ccdbind/state.json`) and the wrapper coordinator's
//! (`ccdpin/state.json`). Saves go through a same-directory temp file, sync,
//! then rename, so a crash leaves either the old or the new file complete.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const STATE_VERSION: u32 = 1;

/// Daemon state: what was pinned and what to restore it to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonState {
    pub version: u32,
    pub pin_applied: bool,
    /// Original `AllowedCPUs` per managed slice; the empty string means
    /// "clear the constraint on restore". Populated exactly while pinned.
    pub original_allowed_cpus: BTreeMap<String, String>,
    pub os_cpus: String,
    pub game_cpus: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pin_apply: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restore: Option<DateTime<Utc>>,
}

/// Wrapper coordinator state: live instances and the shared snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PinState {
    pub version: u32,
    /// pid (as a string key) -> start_time of each live wrapper instance.
    pub instances: BTreeMap<String, u64>,
    pub original_allowed_cpus: BTreeMap<String, String>,
    pub os_cpus: String,
    pub slices: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Load a state file, yielding the default for a missing file. Unknown
/// versions parse best-effort and are upgraded on the next save.
pub fn load<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => {
            return Err(Error::StateLoad {
                path: path.to_path_buf(),
                source: Box::new(e),
            })
        }
    };
    serde_json::from_slice(&data).map_err(|e| Error::StateLoad {
        path: path.to_path_buf(),
        source: Box::new(e),
    })
}

/// Atomic save: temp file in the target directory, flush + sync, rename.
pub fn save<T: Serialize>(path: &Path, state: &T) -> Result<()> {
    let save_err = |source: std::io::Error| Error::StateSave {
        path: path.to_path_buf(),
        source: Box::new(source),
    };

    let data = serde_json::to_vec_pretty(state).map_err(|e| Error::StateSave {
        path: path.to_path_buf(),
        source: Box::new(e),
    })?;

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(save_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp).map_err(save_err)?;
        file.write_all(&data).map_err(save_err)?;
        file.write_all(b"\n").map_err(save_err)?;
        file.sync_all().map_err(save_err)?;
    }
    fs::rename(&tmp, path).map_err(save_err)
}

/// `$XDG_STATE_HOME`, falling back to `~/.local/state`.
pub fn state_home() -> Option<PathBuf> {
    match std::env::var_os("XDG_STATE_HOME") {
        Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::state_dir().or_else(|| dirs::home_dir().map(|h| h.join(".local/state"))),
    }
}

pub fn daemon_state_path() -> Option<PathBuf> {
    state_home().map(|d| d.join("ccdbind").join("state.json"))
}

pub fn wrapper_state_dir() -> Option<PathBuf> {
    state_home().map(|d| d.join("ccdpin"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_loads_default() {
        let tmp = tempdir().unwrap();
        let state: DaemonState = load(&tmp.path().join("state.json")).unwrap();
        assert!(!state.pin_applied);
        assert!(state.original_allowed_cpus.is_empty());
    }

    #[test]
    fn round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("ccdbind").join("state.json");

        let mut state = DaemonState {
            version: STATE_VERSION,
            pin_applied: true,
            os_cpus: "0-7".to_string(),
            game_cpus: "8-15".to_string(),
            last_pin_apply: Some(Utc::now()),
            ..Default::default()
        };
        state
            .original_allowed_cpus
            .insert("app.slice".to_string(), String::new());

        save(&path, &state).unwrap();
        let loaded: DaemonState = load(&path).unwrap();
        assert!(loaded.pin_applied);
        assert_eq!(loaded.os_cpus, "0-7");
        assert_eq!(loaded.original_allowed_cpus["app.slice"], "");
        // No temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_a_load_error() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            load::<DaemonState>(&path),
            Err(Error::StateLoad { .. })
        ));
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(
            &path,
            br#"{"version": 7, "pin_applied": true, "future_field": [1, 2]}"#,
        )
        .unwrap();
        let state: DaemonState = load(&path).unwrap();
        assert_eq!(state.version, 7);
        assert!(state.pin_applied);
    }
}
