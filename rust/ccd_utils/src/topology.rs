// SPDX-License-Identifier: GPL-2.0

//! Cache-topology detection.
//!
//! CPUs are grouped by the `shared_cpu_list` of their highest-level unified
//! or data cache. On multi-CCD AMD parts each group is one CCD; the last
//! group (highest minimum CPU) is reserved for games and the rest stay with
//! the OS.

use std::fs;
use std::path::Path;

use log::debug;

use crate::cpulist;
use crate::error::{Error, Result};

pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Detected CPU grouping, all lists in canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// One canonical CPU list per cache group, ordered by minimum CPU.
    pub groups: Vec<String>,
    /// Union of every group except the last; the sole group when only one
    /// exists.
    pub os_cpus: String,
    /// The last group, empty when only one group exists.
    pub game_cpus: String,
}

pub fn detect() -> Result<Topology> {
    detect_at(Path::new(DEFAULT_SYSFS_ROOT))
}

/// Detect cache groups under the given sysfs root. Deterministic for a given
/// snapshot: identical trees produce identical results.
pub fn detect_at(sysfs_root: &Path) -> Result<Topology> {
    let cpu_root = sysfs_root.join("devices/system/cpu");
    let entries = fs::read_dir(&cpu_root).map_err(|e| {
        Error::TopologyNotAvailable(format!("{}: {e}", cpu_root.display()))
    })?;

    let mut raw_groups: Vec<String> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !is_cpu_dir(name) {
            continue;
        }
        if let Some(shared) = last_level_shared_list(&entry.path()) {
            let shared = shared.trim().to_string();
            if !shared.is_empty() && !raw_groups.contains(&shared) {
                raw_groups.push(shared);
            }
        }
    }

    if raw_groups.is_empty() {
        return Err(Error::TopologyNotAvailable(
            "no cache groups found under sysfs".to_string(),
        ));
    }

    let mut parsed: Vec<Vec<usize>> = Vec::with_capacity(raw_groups.len());
    for raw in &raw_groups {
        let cpus = cpulist::parse(raw)?;
        if !cpus.is_empty() {
            parsed.push(cpus);
        }
    }
    if parsed.is_empty() {
        return Err(Error::TopologyNotAvailable(
            "cache groups were all empty".to_string(),
        ));
    }
    parsed.sort_by_key(|cpus| cpus[0]);

    let groups: Vec<String> = parsed.iter().map(|c| cpulist::format(c)).collect();
    debug!("detected cache groups: {groups:?}");

    let (os_cpus, game_cpus) = if parsed.len() == 1 {
        (groups[0].clone(), String::new())
    } else {
        let mut os: Vec<usize> = parsed[..parsed.len() - 1].concat();
        os.sort_unstable();
        os.dedup();
        (cpulist::format(&os), groups[groups.len() - 1].clone())
    };

    Ok(Topology {
        groups,
        os_cpus,
        game_cpus,
    })
}

fn is_cpu_dir(name: &str) -> bool {
    name.strip_prefix("cpu")
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

/// `shared_cpu_list` of the highest-level Unified or Data cache of one CPU.
fn last_level_shared_list(cpu_dir: &Path) -> Option<String> {
    let cache_dir = cpu_dir.join("cache");
    let entries = fs::read_dir(&cache_dir).ok()?;

    let mut best: Option<(i64, String)> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("index") {
            continue;
        }
        let index_dir = entry.path();
        let cache_type = read_trimmed(&index_dir.join("type"))?;
        if cache_type != "Unified" && cache_type != "Data" {
            continue;
        }
        let level = read_trimmed(&index_dir.join("level"))?.parse::<i64>().ok()?;
        let shared = read_trimmed(&index_dir.join("shared_cpu_list"))?;
        if best.as_ref().is_none_or(|(l, _)| level > *l) {
            best = Some((level, shared));
        }
    }
    best.map(|(_, shared)| shared)
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_cache(root: &Path, cpu: usize, index: usize, level: u32, ty: &str, shared: &str) {
        let dir = root.join(format!("devices/system/cpu/cpu{cpu}/cache/index{index}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("level"), format!("{level}\n")).unwrap();
        fs::write(dir.join("type"), format!("{ty}\n")).unwrap();
        fs::write(dir.join("shared_cpu_list"), format!("{shared}\n")).unwrap();
    }

    fn two_ccd_root() -> tempfile::TempDir {
        let tmp = tempdir().unwrap();
        for cpu in 0..16 {
            let shared = if cpu < 8 { "0-7" } else { "8-15" };
            write_cache(tmp.path(), cpu, 0, 1, "Data", &format!("{cpu}"));
            write_cache(tmp.path(), cpu, 1, 1, "Instruction", &format!("{cpu}"));
            write_cache(tmp.path(), cpu, 3, 3, "Unified", shared);
        }
        tmp
    }

    #[test]
    fn detects_two_ccds() {
        let tmp = two_ccd_root();
        let topo = detect_at(tmp.path()).unwrap();
        assert_eq!(topo.groups, vec!["0-7", "8-15"]);
        assert_eq!(topo.os_cpus, "0-7");
        assert_eq!(topo.game_cpus, "8-15");
    }

    #[test]
    fn detection_is_deterministic() {
        let tmp = two_ccd_root();
        let first = detect_at(tmp.path()).unwrap();
        for _ in 0..5 {
            assert_eq!(detect_at(tmp.path()).unwrap(), first);
        }
    }

    #[test]
    fn single_group_has_empty_game_cpus() {
        let tmp = tempdir().unwrap();
        for cpu in 0..8 {
            write_cache(tmp.path(), cpu, 3, 3, "Unified", "0-7");
        }
        let topo = detect_at(tmp.path()).unwrap();
        assert_eq!(topo.groups, vec!["0-7"]);
        assert_eq!(topo.os_cpus, "0-7");
        assert_eq!(topo.game_cpus, "");
    }

    #[test]
    fn ignores_instruction_caches_and_prefers_highest_level() {
        let tmp = tempdir().unwrap();
        for cpu in 0..4 {
            write_cache(tmp.path(), cpu, 0, 1, "Data", &format!("{cpu}"));
            write_cache(tmp.path(), cpu, 1, 2, "Instruction", "0-3");
            write_cache(tmp.path(), cpu, 2, 2, "Unified", if cpu < 2 { "0-1" } else { "2-3" });
        }
        let topo = detect_at(tmp.path()).unwrap();
        assert_eq!(topo.groups, vec!["0-1", "2-3"]);
    }

    #[test]
    fn missing_sysfs_is_not_available() {
        let tmp = tempdir().unwrap();
        assert!(matches!(
            detect_at(tmp.path()),
            Err(Error::TopologyNotAvailable(_))
        ));
    }
}
