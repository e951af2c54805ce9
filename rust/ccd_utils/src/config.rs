// SPDX-License-Identifier: GPL-2.0

//! Daemon configuration.
//!
//! A TOML file under the user's config directory; a missing file yields the
//! defaults. The ignore list can be extended from a free-form text file, one
//! executable basename per line.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_INTERVAL_SECS: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct Config {
    /// Reconciler tick interval in seconds.
    pub interval_secs: f64,
    /// Environment keys that identify a game, in priority order.
    pub env_keys: Vec<String>,
    /// Executable basenames treated as games without an env match.
    pub exe_allowlist: Vec<String>,
    /// Executable basenames never treated as games.
    pub ignore_exe: Vec<String>,
    pub ignore_file: PathBuf,
    pub pin_session_slice: bool,
    pub pin_slices: Vec<String>,
    pub os_cpus_override: String,
    pub game_cpus_override: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TomlConfig {
    interval: Option<f64>,
    env_keys: Vec<String>,
    exe_allowlist: Vec<String>,
    ignore_exe: Vec<String>,
    ignore_file: Option<String>,
    pin_session_slice: Option<bool>,
    pin_slices: Vec<String>,
    os_cpus: Option<String>,
    game_cpus: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            env_keys: vec![
                "SteamAppId".to_string(),
                "SteamGameId".to_string(),
                "STEAM_COMPAT_APP_ID".to_string(),
            ],
            exe_allowlist: Vec::new(),
            ignore_exe: [
                "steam",
                "steamwebhelper",
                "steamservice",
                "steam-runtime-launcher-interface-0",
                "steam-runtime-supervisor",
                "pressure-vessel",
                "pressure-vessel-wrap",
                "wineserver",
                "wine64",
                "wine",
                "services.exe",
                "explorer.exe",
                "conhost.exe",
                "rpcss.exe",
                "winedevice.exe",
                "plugplay.exe",
                "svchost.exe",
                "winedbg",
                "gameoverlayui",
                "gameoverlayui.exe",
                "steam_monitor",
                "reaper",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            ignore_file: PathBuf::new(),
            pin_session_slice: false,
            pin_slices: vec!["app.slice".to_string(), "background.slice".to_string()],
            os_cpus_override: String::new(),
            game_cpus_override: String::new(),
        }
    }
}

impl Config {
    /// Managed OS slices for this configuration: `pin_slices` plus
    /// `session.slice` when enabled, deduped, with the stock pair as
    /// fallback when the result is empty.
    pub fn slices_to_pin(&self) -> Vec<String> {
        let mut slices: Vec<String> = Vec::new();
        let mut push = |s: &str| {
            let s = s.trim();
            if !s.is_empty() && !slices.iter().any(|have| have.as_str() == s) {
                slices.push(s.to_string());
            }
        };
        for slice in &self.pin_slices {
            push(slice);
        }
        if self.pin_session_slice {
            push("session.slice");
        }
        if slices.is_empty() {
            return vec!["app.slice".to_string(), "background.slice".to_string()];
        }
        slices
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    config_home().map(|d| d.join("ccdbind").join("config.toml"))
}

pub fn default_ignore_path() -> Option<PathBuf> {
    config_home().map(|d| d.join("ccdbind").join("ignore.txt"))
}

fn config_home() -> Option<PathBuf> {
    match std::env::var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::config_dir(),
    }
}

/// Load the config at `path` (missing file = defaults), then merge in the
/// ignore file.
pub fn load(path: &Path) -> Result<Config> {
    let config_err = |source: Box<dyn std::error::Error + Send + Sync>| Error::ConfigLoad {
        path: path.to_path_buf(),
        source,
    };

    let mut cfg = Config::default();
    match fs::read_to_string(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(config_err(Box::new(e))),
        Ok(data) => {
            let tc: TomlConfig = toml::from_str(&data).map_err(|e| config_err(Box::new(e)))?;
            if let Some(interval) = tc.interval {
                if !interval.is_finite() || interval <= 0.0 {
                    return Err(config_err(
                        format!("invalid interval {interval}").into(),
                    ));
                }
                cfg.interval_secs = interval;
            }
            if !tc.env_keys.is_empty() {
                cfg.env_keys = dedupe_non_empty(tc.env_keys, false);
            }
            if !tc.exe_allowlist.is_empty() {
                cfg.exe_allowlist = dedupe_non_empty(tc.exe_allowlist, true);
            }
            if !tc.ignore_exe.is_empty() {
                cfg.ignore_exe = dedupe_non_empty(tc.ignore_exe, true);
            }
            if let Some(file) = tc.ignore_file {
                let file = file.trim();
                if !file.is_empty() {
                    cfg.ignore_file = PathBuf::from(file);
                }
            }
            if let Some(pin_session) = tc.pin_session_slice {
                cfg.pin_session_slice = pin_session;
            }
            if !tc.pin_slices.is_empty() {
                cfg.pin_slices = dedupe_non_empty(tc.pin_slices, false);
            }
            if let Some(os) = tc.os_cpus {
                cfg.os_cpus_override = os.trim().to_string();
            }
            if let Some(game) = tc.game_cpus {
                cfg.game_cpus_override = game.trim().to_string();
            }
        }
    }

    if cfg.ignore_file.as_os_str().is_empty() {
        cfg.ignore_file = default_ignore_path().ok_or_else(|| {
            config_err("cannot determine config directory".into())
        })?;
    }
    cfg.ignore_file = expand_tilde(&cfg.ignore_file);

    match load_ignore_file(&cfg.ignore_file) {
        Ok(extra) => {
            let mut merged = cfg.ignore_exe;
            merged.extend(extra);
            cfg.ignore_exe = dedupe_non_empty(merged, true);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(config_err(Box::new(e))),
    }

    Ok(cfg)
}

/// One basename per line; `#` comments and blank lines are skipped.
fn load_ignore_file(path: &Path) -> std::io::Result<Vec<String>> {
    let data = fs::read_to_string(path)?;
    Ok(data
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn dedupe_non_empty(items: Vec<String>, lowercase: bool) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let mut item = item.trim().to_string();
        if lowercase {
            item = item.to_lowercase();
        }
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn expand_tilde(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" {
        return dirs::home_dir().unwrap_or_else(|| path.to_path_buf());
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempdir().unwrap();
        let cfg = load(&tmp.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.interval_secs, DEFAULT_INTERVAL_SECS);
        assert_eq!(cfg.env_keys[0], "SteamAppId");
        assert!(cfg.ignore_exe.contains(&"steam".to_string()));
        assert_eq!(cfg.slices_to_pin(), vec!["app.slice", "background.slice"]);
    }

    #[test]
    fn parses_overrides_and_merges_ignore_file() {
        let tmp = tempdir().unwrap();
        let ignore = tmp.path().join("ignore.txt");
        fs::write(&ignore, "# comment\n\nMyLauncher\nsteam\n").unwrap();

        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            format!(
                r#"
interval = 1.5
env_keys = ["STEAM_COMPAT_APP_ID"]
exe_allowlist = ["Factorio"]
ignore_file = "{}"
pin_session_slice = true
pin_slices = ["app.slice", "app.slice", " "]
os_cpus = "0-7"
game_cpus = "8-15"
"#,
                ignore.display()
            ),
        )
        .unwrap();

        let cfg = load(&path).unwrap();
        assert_eq!(cfg.interval_secs, 1.5);
        assert_eq!(cfg.env_keys, vec!["STEAM_COMPAT_APP_ID"]);
        assert_eq!(cfg.exe_allowlist, vec!["factorio"]);
        assert!(cfg.ignore_exe.contains(&"mylauncher".to_string()));
        // Merged lists stay deduped.
        assert_eq!(
            cfg.ignore_exe.iter().filter(|e| *e == "steam").count(),
            1
        );
        assert_eq!(cfg.slices_to_pin(), vec!["app.slice", "session.slice"]);
        assert_eq!(cfg.os_cpus_override, "0-7");
        assert_eq!(cfg.game_cpus_override, "8-15");
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "interval = [nonsense").unwrap();
        assert!(matches!(load(&path), Err(Error::ConfigLoad { .. })));
    }

    #[test]
    fn rejects_nonpositive_interval() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "interval = 0.0").unwrap();
        assert!(load(&path).is_err());
    }
}
