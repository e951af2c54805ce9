// SPDX-License-Identifier: GPL-2.0

//! Per-user process-table scanning.
//!
//! Game processes advertise themselves through launcher environment
//! variables (`SteamAppId` and friends); everything else is matched against
//! an executable allowlist. Processes can exit mid-scan, so every per-process
//! read treats "not found" as "skip".

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::debug;

use crate::cpulist;
use crate::error::{Error, Result};

const MAX_ENVIRON_SIZE: usize = 128 * 1024;

/// One process identified as belonging to a game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameProcess {
    pub pid: i32,
    /// Per-boot start-time counter from /proc/<pid>/stat, pid-reuse tiebreaker.
    pub start_time: u64,
    pub exe: String,
    pub allowed_cpus: String,
    pub game_id: String,
    /// The env key that identified the game, or "exe" for allowlist hits.
    pub id_source: String,
}

/// A user-owned process and its current CPU constraint, for status reporting.
#[derive(Debug, Clone)]
pub struct CpuConstraint {
    pub pid: i32,
    pub start_time: u64,
    pub exe: String,
    pub allowed_cpus: String,
}

pub struct Scanner {
    proc_root: PathBuf,
    uid: u32,
    env_keys: Vec<String>,
    exe_allowlist: Vec<String>,
    ignore_exe: Vec<String>,
}

impl Scanner {
    pub fn new(
        uid: u32,
        env_keys: Vec<String>,
        exe_allowlist: Vec<String>,
        ignore_exe: Vec<String>,
    ) -> Self {
        Self::with_proc_root(PathBuf::from("/proc"), uid, env_keys, exe_allowlist, ignore_exe)
    }

    pub fn with_proc_root(
        proc_root: PathBuf,
        uid: u32,
        env_keys: Vec<String>,
        exe_allowlist: Vec<String>,
        ignore_exe: Vec<String>,
    ) -> Self {
        Self {
            proc_root,
            uid,
            env_keys,
            exe_allowlist: lowered(exe_allowlist),
            ignore_exe: lowered(ignore_exe),
        }
    }

    /// Scan the process table and group identified game processes by game id.
    /// Groups are keyed ascending; processes within a group are ordered by
    /// ascending pid.
    pub fn scan(&self) -> Result<BTreeMap<String, Vec<GameProcess>>> {
        let mut games: BTreeMap<String, Vec<GameProcess>> = BTreeMap::new();

        for pid in list_pids(&self.proc_root)? {
            match self.examine(pid) {
                Ok(Some(proc_rec)) => {
                    games.entry(proc_rec.game_id.clone()).or_default().push(proc_rec);
                }
                Ok(None) => {}
                Err(err) => debug!("pid {pid}: skipped: {err}"),
            }
        }

        for procs in games.values_mut() {
            procs.sort_by_key(|p| p.pid);
        }
        Ok(games)
    }

    fn examine(&self, pid: i32) -> std::io::Result<Option<GameProcess>> {
        let status = match read_status(&self.proc_root, pid) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if status.uid != Some(self.uid) {
            return Ok(None);
        }

        let exe = exe_basename_lower(&self.proc_root, pid);
        if exe.is_empty() {
            return Ok(None);
        }
        if self.ignore_exe.iter().any(|ig| ig == &exe) {
            return Ok(None);
        }

        let (game_id, id_source) = match self.identify(pid, &exe) {
            Some(id) => id,
            None => return Ok(None),
        };

        let start_time = start_time(&self.proc_root, pid).unwrap_or(0);
        let allowed_cpus = status
            .cpus_allowed_list
            .map(|raw| cpulist::canonicalize(&raw).unwrap_or(raw))
            .unwrap_or_default();

        Ok(Some(GameProcess {
            pid,
            start_time,
            exe,
            allowed_cpus,
            game_id,
            id_source,
        }))
    }

    /// Env keys win in priority order; the allowlist is the fallback.
    fn identify(&self, pid: i32, exe: &str) -> Option<(String, String)> {
        let environ = read_environ(&self.proc_root, pid).unwrap_or_default();
        for key in &self.env_keys {
            if let Some(value) = environ.get(key.as_str()) {
                if !value.is_empty() {
                    return Some((value.clone(), key.clone()));
                }
            }
        }
        if self.exe_allowlist.iter().any(|a| a.as_str() == exe) {
            return Some((exe.to_string(), "exe".to_string()));
        }
        None
    }

    /// Every process of the scanner's UID with a non-empty CPU constraint.
    pub fn scan_cpu_constraints(&self) -> Result<Vec<CpuConstraint>> {
        let mut out = Vec::new();
        for pid in list_pids(&self.proc_root)? {
            let status = match read_status(&self.proc_root, pid) {
                Ok(s) => s,
                Err(_) => continue,
            };
            if status.uid != Some(self.uid) {
                continue;
            }
            let exe = exe_basename_lower(&self.proc_root, pid);
            if exe.is_empty() {
                continue;
            }
            let Some(raw) = status.cpus_allowed_list else { continue };
            if raw.trim().is_empty() {
                continue;
            }
            let allowed = cpulist::canonicalize(&raw).unwrap_or(raw);
            out.push(CpuConstraint {
                pid,
                start_time: start_time(&self.proc_root, pid).unwrap_or(0),
                exe,
                allowed_cpus: allowed,
            });
        }
        Ok(out)
    }

    /// Current canonical `Cpus_allowed_list` of one pid.
    pub fn allowed_cpus(&self, pid: i32) -> std::io::Result<String> {
        allowed_cpus_at(&self.proc_root, pid)
    }
}

fn list_pids(proc_root: &Path) -> Result<Vec<i32>> {
    let entries = fs::read_dir(proc_root).map_err(Error::Scan)?;
    let mut pids = Vec::with_capacity(256);
    for entry in entries.flatten() {
        if let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        {
            if pid > 0 {
                pids.push(pid);
            }
        }
    }
    pids.sort_unstable();
    Ok(pids)
}

struct ProcStatus {
    uid: Option<u32>,
    cpus_allowed_list: Option<String>,
}

fn read_status(proc_root: &Path, pid: i32) -> std::io::Result<ProcStatus> {
    let data = fs::read_to_string(proc_root.join(pid.to_string()).join("status"))?;
    let mut status = ProcStatus {
        uid: None,
        cpus_allowed_list: None,
    };
    for line in data.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            // First field is the real uid.
            status.uid = rest.split_whitespace().next().and_then(|f| f.parse().ok());
        } else if let Some(rest) = line.strip_prefix("Cpus_allowed_list:") {
            status.cpus_allowed_list = Some(rest.trim().to_string());
        }
    }
    Ok(status)
}

pub fn allowed_cpus_at(proc_root: &Path, pid: i32) -> std::io::Result<String> {
    let status = read_status(proc_root, pid)?;
    let raw = status.cpus_allowed_list.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "Cpus_allowed_list not found")
    })?;
    Ok(cpulist::canonicalize(&raw).unwrap_or_else(|_| raw.trim().to_string()))
}

/// Start-time counter: field 22 of /proc/<pid>/stat, located after the
/// parenthesized comm so executable names containing `)` do not confuse the
/// split.
pub fn start_time(proc_root: &Path, pid: i32) -> std::io::Result<u64> {
    let data = fs::read_to_string(proc_root.join(pid.to_string()).join("stat"))?;
    let line = data.trim();
    let close = line.rfind(')').ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed stat line")
    })?;
    let fields: Vec<&str> = line[close + 1..].split_whitespace().collect();
    // fields[0] is the state, so starttime (field 22 overall) is fields[19].
    fields
        .get(19)
        .and_then(|f| f.parse::<u64>().ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "stat too short"))
}

fn exe_basename_lower(proc_root: &Path, pid: i32) -> String {
    let Ok(target) = fs::read_link(proc_root.join(pid.to_string()).join("exe")) else {
        return String::new();
    };
    let base = target
        .file_name()
        .map(|n| n.to_string_lossy().trim().to_lowercase())
        .unwrap_or_default();
    if base == "." || base == "/" {
        return String::new();
    }
    base
}

fn read_environ(proc_root: &Path, pid: i32) -> std::io::Result<BTreeMap<String, String>> {
    let file = fs::File::open(proc_root.join(pid.to_string()).join("environ"))?;
    let mut buf = Vec::new();
    file.take(MAX_ENVIRON_SIZE as u64).read_to_end(&mut buf)?;

    let mut env = BTreeMap::new();
    for record in buf.split(|b| *b == 0) {
        if record.is_empty() {
            continue;
        }
        let record = String::from_utf8_lossy(record);
        if let Some((key, value)) = record.split_once('=') {
            if !key.is_empty() {
                env.entry(key.to_string()).or_insert_with(|| value.to_string());
            }
        }
    }
    Ok(env)
}

fn lowered(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let item = item.trim().to_lowercase();
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::{tempdir, TempDir};

    struct FakeProc {
        root: TempDir,
    }

    impl FakeProc {
        fn new() -> Self {
            Self { root: tempdir().unwrap() }
        }

        fn add(&self, pid: i32, uid: u32, exe: &str, env: &[(&str, &str)], start: u64) {
            let dir = self.root.path().join(pid.to_string());
            fs::create_dir_all(&dir).unwrap();
            fs::write(
                dir.join("status"),
                format!(
                    "Name:\t{exe}\nUid:\t{uid}\t{uid}\t{uid}\t{uid}\nCpus_allowed_list:\t0-15\n"
                ),
            )
            .unwrap();
            fs::write(
                dir.join("stat"),
                format!("{pid} ({exe}) S 1 {pid} {pid} 0 -1 4194560 1 0 0 0 0 0 0 0 20 0 1 0 {start} 1000 100 18446744073709551615"),
            )
            .unwrap();
            let environ: Vec<u8> = env
                .iter()
                .flat_map(|(k, v)| format!("{k}={v}\0").into_bytes())
                .collect();
            fs::write(dir.join("environ"), environ).unwrap();
            let bin_dir = self.root.path().join("bin").join(pid.to_string());
            fs::create_dir_all(&bin_dir).unwrap();
            let target = bin_dir.join(exe);
            fs::write(&target, b"").unwrap();
            symlink(&target, dir.join("exe")).unwrap();
        }

        fn scanner(&self, uid: u32, allow: &[&str], ignore: &[&str]) -> Scanner {
            Scanner::with_proc_root(
                self.root.path().to_path_buf(),
                uid,
                vec![
                    "SteamAppId".to_string(),
                    "SteamGameId".to_string(),
                    "STEAM_COMPAT_APP_ID".to_string(),
                ],
                allow.iter().map(|s| s.to_string()).collect(),
                ignore.iter().map(|s| s.to_string()).collect(),
            )
        }
    }

    #[test]
    fn filters_by_uid() {
        let proc = FakeProc::new();
        proc.add(100, 1000, "game.exe", &[("SteamAppId", "730")], 111);
        proc.add(101, 1001, "game.exe", &[("SteamAppId", "730")], 222);

        let games = proc.scanner(1000, &[], &[]).scan().unwrap();
        let procs = &games["730"];
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].pid, 100);
        assert_eq!(procs[0].start_time, 111);
        assert_eq!(procs[0].allowed_cpus, "0-15");
    }

    #[test]
    fn env_key_priority_wins() {
        let proc = FakeProc::new();
        proc.add(
            200,
            1000,
            "game.exe",
            &[("STEAM_COMPAT_APP_ID", "999"), ("SteamAppId", "730")],
            1,
        );

        let games = proc.scanner(1000, &[], &[]).scan().unwrap();
        assert!(games.contains_key("730"));
        assert_eq!(games["730"][0].id_source, "SteamAppId");
    }

    #[test]
    fn empty_env_value_falls_through() {
        let proc = FakeProc::new();
        proc.add(
            201,
            1000,
            "game.exe",
            &[("SteamAppId", ""), ("STEAM_COMPAT_APP_ID", "42")],
            1,
        );

        let games = proc.scanner(1000, &[], &[]).scan().unwrap();
        assert_eq!(games["42"][0].id_source, "STEAM_COMPAT_APP_ID");
    }

    #[test]
    fn allowlist_without_env_uses_exe_source() {
        let proc = FakeProc::new();
        proc.add(300, 1000, "factorio", &[], 5);

        let games = proc.scanner(1000, &["factorio"], &[]).scan().unwrap();
        assert_eq!(games["factorio"][0].id_source, "exe");

        let none = proc.scanner(1000, &[], &[]).scan().unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn ignorelist_beats_env_identity() {
        let proc = FakeProc::new();
        proc.add(400, 1000, "steam", &[("SteamAppId", "1")], 1);

        let games = proc.scanner(1000, &[], &["Steam"]).scan().unwrap();
        assert!(games.is_empty());
    }

    #[test]
    fn groups_sorted_by_pid() {
        let proc = FakeProc::new();
        proc.add(502, 1000, "game.exe", &[("SteamAppId", "730")], 2);
        proc.add(501, 1000, "game.exe", &[("SteamAppId", "730")], 1);

        let games = proc.scanner(1000, &[], &[]).scan().unwrap();
        let pids: Vec<i32> = games["730"].iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![501, 502]);
    }

    #[test]
    fn start_time_survives_parens_in_comm() {
        let proc = FakeProc::new();
        proc.add(600, 1000, "we(ird) name", &[("SteamAppId", "7")], 4242);
        assert_eq!(start_time(proc.root.path(), 600).unwrap(), 4242);
    }

    #[test]
    fn constraint_sweep_reports_user_processes() {
        let proc = FakeProc::new();
        proc.add(700, 1000, "browser", &[], 1);
        proc.add(701, 1001, "other", &[], 2);

        let scanner = proc.scanner(1000, &[], &[]);
        let all = scanner.scan_cpu_constraints().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].exe, "browser");
        assert_eq!(all[0].allowed_cpus, "0-15");
    }
}
