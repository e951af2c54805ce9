// SPDX-License-Identifier: GPL-2.0

//! The reconciler: one tick compares the scanned process table against the
//! persisted pin state and the live `AllowedCPUs` values, then converges
//! systemd on the desired partitioning.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};

use ccd_utils::procscan::{GameProcess, Scanner};
use ccd_utils::state::{self, DaemonState, STATE_VERSION};
use ccd_utils::systemd::{scope_unit_for_game, UserSystemd};

pub const GAME_SLICE: &str = "game.slice";

/// Binding of a pid to the scope it was attached to, with the start time
/// observed at attach so pid reuse is detected.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PidRecord {
    unit: String,
    start_time: u64,
}

pub struct Reconciler {
    sys: UserSystemd,
    scanner: Scanner,
    slices: Vec<String>,
    os_cpus: String,
    game_cpus: String,
    state_path: PathBuf,
    dry_run: bool,
    shutdown: Arc<AtomicBool>,
    pid_to_unit: HashMap<i32, PidRecord>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sys: UserSystemd,
        scanner: Scanner,
        slices: Vec<String>,
        os_cpus: String,
        game_cpus: String,
        state_path: PathBuf,
        dry_run: bool,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            sys,
            scanner,
            slices,
            os_cpus,
            game_cpus,
            state_path,
            dry_run,
            shutdown,
            pid_to_unit: HashMap::new(),
        }
    }

    /// Startup recovery: a pin left applied by a crash is unwound unless
    /// games are still running (in which case the tick loop takes over).
    pub fn restore_if_needed(&mut self, st: &mut DaemonState) -> Result<()> {
        if !st.pin_applied {
            return Ok(());
        }
        let games = self.scanner.scan()?;
        if !games.is_empty() {
            info!("pin still applied and games running; keeping state");
            return Ok(());
        }
        info!("pin applied but no games running; restoring slices");
        self.restore_slices(&st.original_allowed_cpus)?;
        st.pin_applied = false;
        st.last_restore = Some(Utc::now());
        self.save(st);
        Ok(())
    }

    /// Shutdown path: unwind the pin if it is applied. State is left with
    /// `pin_applied=true` on restore failure so the next startup retries.
    pub fn restore_on_exit(&mut self, st: &mut DaemonState) {
        if !st.pin_applied {
            return;
        }
        match self.restore_slices(&st.original_allowed_cpus) {
            Ok(()) => {
                st.pin_applied = false;
                st.last_restore = Some(Utc::now());
                self.save(st);
            }
            Err(err) => warn!("restore on exit failed: {err:#}"),
        }
    }

    pub fn tick(&mut self, st: &mut DaemonState) -> Result<()> {
        let games = self.scanner.scan().context("scan")?;

        if games.is_empty() {
            if st.pin_applied {
                info!("no games active; restoring slices");
                self.restore_slices(&st.original_allowed_cpus)?;
                st.pin_applied = false;
                st.last_restore = Some(Utc::now());
                self.save(st);
                self.pid_to_unit.clear();
            }
            return Ok(());
        }

        let current = self.read_allowed()?;

        if reapply_needed(st.pin_applied, &current, &self.os_cpus) {
            let originals = merge_originals(
                st.pin_applied,
                &st.original_allowed_cpus,
                &current,
                &self.os_cpus,
            );
            info!(
                "{} slices={:?} to os_cpus={:?}",
                if st.pin_applied { "games active; reapplying pin" } else { "games active; pinning" },
                self.slices,
                self.os_cpus
            );
            for unit in &self.slices {
                self.sys.set_allowed_cpus(unit, &self.os_cpus)?;
            }
            st.version = STATE_VERSION;
            st.pin_applied = true;
            st.original_allowed_cpus = originals;
            st.os_cpus = self.os_cpus.clone();
            st.game_cpus = self.game_cpus.clone();
            st.last_pin_apply = Some(Utc::now());
            self.save(st);
        }

        let mut alive: Vec<i32> = Vec::with_capacity(32);
        for (game_id, procs) in &games {
            if self.shutdown.load(Ordering::Relaxed) {
                debug!("shutdown requested; skipping remaining games this tick");
                break;
            }
            alive.extend(procs.iter().map(|p| p.pid));
            self.converge_game(game_id, procs)
                .with_context(|| format!("game {game_id}"))?;
        }

        self.pid_to_unit.retain(|pid, _| alive.contains(pid));
        Ok(())
    }

    fn converge_game(&mut self, game_id: &str, procs: &[GameProcess]) -> Result<()> {
        if procs.is_empty() {
            return Ok(());
        }
        let unit = scope_unit_for_game(game_id);
        let pids: Vec<i32> = procs.iter().map(|p| p.pid).collect();
        let new_pids = new_pids_for_unit(&self.pid_to_unit, &unit, procs);

        let created = self
            .sys
            .ensure_transient_scope(&unit, &pids, GAME_SLICE, &format!("ccdbind game {game_id}"))?;
        self.sys.set_allowed_cpus(&unit, &self.game_cpus)?;

        if created {
            for proc_rec in procs {
                self.pid_to_unit.insert(
                    proc_rec.pid,
                    PidRecord { unit: unit.clone(), start_time: proc_rec.start_time },
                );
            }
        } else if !new_pids.is_empty() {
            self.sys.attach_processes(&unit, "", &new_pids)?;
            for proc_rec in procs.iter().filter(|p| new_pids.contains(&p.pid)) {
                self.pid_to_unit.insert(
                    proc_rec.pid,
                    PidRecord { unit: unit.clone(), start_time: proc_rec.start_time },
                );
            }
        }
        Ok(())
    }

    fn read_allowed(&self) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for unit in &self.slices {
            let value = self.sys.get_allowed_cpus(unit)?;
            out.insert(unit.clone(), value);
        }
        Ok(out)
    }

    fn restore_slices(&self, originals: &BTreeMap<String, String>) -> Result<()> {
        for unit in &self.slices {
            let value = originals.get(unit).map(String::as_str).unwrap_or("");
            self.sys
                .set_allowed_cpus(unit, value)
                .with_context(|| format!("restore {unit}"))?;
        }
        Ok(())
    }

    /// Saves are best-effort: a failure keeps the in-memory state and the
    /// next tick retries. Dry-run never writes.
    fn save(&self, st: &DaemonState) {
        if self.dry_run {
            debug!("dry-run: not writing state to {}", self.state_path.display());
            return;
        }
        if let Err(err) = state::save(&self.state_path, st) {
            warn!("{err}");
        }
    }
}

/// A reapply is needed when nothing is pinned yet or any managed slice
/// drifted from `os_cpus`.
fn reapply_needed(
    pin_applied: bool,
    current: &BTreeMap<String, String>,
    os_cpus: &str,
) -> bool {
    !pin_applied || current.values().any(|value| value != os_cpus)
}

/// Original-value policy: from a clean state, snapshot everything. On
/// reapply, only backfill slices with no recorded original, and never adopt
/// a value equal to `os_cpus` as an original (that would freeze our own pin
/// in place); record the empty string instead, meaning "clear on restore".
fn merge_originals(
    pin_applied: bool,
    existing: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
    os_cpus: &str,
) -> BTreeMap<String, String> {
    if !pin_applied {
        return current.clone();
    }
    let mut originals = existing.clone();
    for (unit, value) in current {
        originals.entry(unit.clone()).or_insert_with(|| {
            if value != os_cpus {
                value.clone()
            } else {
                String::new()
            }
        });
    }
    originals
}

/// A pid is new to the unit when unseen, previously bound elsewhere, or
/// reused (start_time changed, or either side lacks one).
fn new_pids_for_unit(
    map: &HashMap<i32, PidRecord>,
    unit: &str,
    procs: &[GameProcess],
) -> Vec<i32> {
    let mut new_pids = Vec::new();
    for proc_rec in procs {
        match map.get(&proc_rec.pid) {
            None => new_pids.push(proc_rec.pid),
            Some(rec) if rec.unit != unit => new_pids.push(proc_rec.pid),
            Some(rec) if rec.start_time == 0 || proc_rec.start_time == 0 => {
                new_pids.push(proc_rec.pid)
            }
            Some(rec) if rec.start_time != proc_rec.start_time => new_pids.push(proc_rec.pid),
            Some(_) => {}
        }
    }
    new_pids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game_proc(pid: i32, start_time: u64) -> GameProcess {
        GameProcess {
            pid,
            start_time,
            exe: "game.exe".to_string(),
            allowed_cpus: String::new(),
            game_id: "730".to_string(),
            id_source: "SteamAppId".to_string(),
        }
    }

    fn map_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn reapply_when_not_pinned() {
        let current = map_of(&[("app.slice", "0-15")]);
        assert!(reapply_needed(false, &current, "0-7"));
    }

    #[test]
    fn no_reapply_when_converged() {
        let current = map_of(&[("app.slice", "0-7")]);
        assert!(!reapply_needed(true, &current, "0-7"));
    }

    #[test]
    fn reapply_on_external_drift() {
        let current = map_of(&[("app.slice", "0-15")]);
        assert!(reapply_needed(true, &current, "0-7"));
    }

    #[test]
    fn clean_pin_snapshots_everything() {
        let current = map_of(&[("app.slice", "0-15"), ("background.slice", "")]);
        let originals = merge_originals(false, &BTreeMap::new(), &current, "0-7");
        assert_eq!(originals, current);
    }

    #[test]
    fn backfill_never_adopts_our_own_pin() {
        // A slice observed already at os_cpus with no recorded original must
        // restore to "clear", not stay pinned forever.
        let existing = map_of(&[("app.slice", "0-15")]);
        let current = map_of(&[("app.slice", "0-7"), ("background.slice", "0-7")]);
        let originals = merge_originals(true, &existing, &current, "0-7");
        assert_eq!(originals["app.slice"], "0-15");
        assert_eq!(originals["background.slice"], "");
    }

    #[test]
    fn backfill_adopts_foreign_values() {
        let existing = BTreeMap::new();
        let current = map_of(&[("background.slice", "2-5")]);
        let originals = merge_originals(true, &existing, &current, "0-7");
        assert_eq!(originals["background.slice"], "2-5");
    }

    #[test]
    fn unknown_pid_is_new() {
        let map = HashMap::new();
        let procs = vec![game_proc(100, 7)];
        assert_eq!(new_pids_for_unit(&map, "u.scope", &procs), vec![100]);
    }

    #[test]
    fn bound_pid_with_same_start_is_not_new() {
        let mut map = HashMap::new();
        map.insert(100, PidRecord { unit: "u.scope".to_string(), start_time: 7 });
        let procs = vec![game_proc(100, 7)];
        assert!(new_pids_for_unit(&map, "u.scope", &procs).is_empty());
    }

    #[test]
    fn pid_reuse_is_new() {
        let mut map = HashMap::new();
        map.insert(100, PidRecord { unit: "u.scope".to_string(), start_time: 7 });
        let procs = vec![game_proc(100, 8)];
        assert_eq!(new_pids_for_unit(&map, "u.scope", &procs), vec![100]);
    }

    #[test]
    fn rebound_to_other_unit_is_new() {
        let mut map = HashMap::new();
        map.insert(100, PidRecord { unit: "other.scope".to_string(), start_time: 7 });
        let procs = vec![game_proc(100, 7)];
        assert_eq!(new_pids_for_unit(&map, "u.scope", &procs), vec![100]);
    }

    #[test]
    fn missing_start_time_is_treated_as_new() {
        let mut map = HashMap::new();
        map.insert(100, PidRecord { unit: "u.scope".to_string(), start_time: 0 });
        let procs = vec![game_proc(100, 7)];
        assert_eq!(new_pids_for_unit(&map, "u.scope", &procs), vec![100]);
    }
}
