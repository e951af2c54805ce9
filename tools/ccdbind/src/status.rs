// SPDX-License-Identifier: GPL-2.0

//! The `status` subcommand: a point-in-time snapshot of the persisted state,
//! the managed slices, and the processes currently constrained to either CPU
//! group.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, ValueEnum};
use serde::Serialize;

use ccd_utils::config;
use ccd_utils::procscan::Scanner;
use ccd_utils::state::{self, DaemonState};
use ccd_utils::systemd::UserSystemd;

use crate::resolve_cpus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Filter {
    /// Only identified game processes.
    Games,
    /// Also group every user process pinned to either CPU set.
    All,
}

#[derive(Debug, Args)]
pub struct StatusOpts {
    /// Output JSON instead of the human-readable form.
    #[clap(long)]
    json: bool,

    /// Process filter.
    #[clap(long, value_enum, default_value = "games")]
    filter: Filter,

    /// Alias for --filter games.
    #[clap(long)]
    only_games: bool,

    /// Alias for --filter all.
    #[clap(long)]
    all: bool,

    /// Config file path (TOML). Default: XDG config path.
    #[clap(long)]
    config: Option<std::path::PathBuf>,
}

#[derive(Debug, Serialize)]
struct SliceStatus {
    unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed_cpus: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    original_allowed_cpus: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    read_error: Option<String>,
}

#[derive(Debug, Serialize)]
struct GameProcStatus {
    pid: i32,
    exe: String,
    game_id: String,
    id_source: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    allowed_cpus: String,
}

#[derive(Debug, Serialize)]
struct ProgramSummary {
    exe: String,
    /// "os" or "game", by exact allowed-mask match.
    class: &'static str,
    allowed_cpus: String,
    count: usize,
    sample_pids: Vec<i32>,
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    generated_at: DateTime<Utc>,
    filter: Filter,
    config_path: String,
    state_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    os_cpus: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    game_cpus: String,
    state: DaemonState,
    slices: Vec<SliceStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    games: Vec<GameProcStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    all: Vec<ProgramSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

pub fn run(opts: &StatusOpts, parent_config: Option<&Path>) -> Result<()> {
    if opts.only_games && opts.all {
        bail!("cannot use --only-games and --all together");
    }
    let filter = if opts.only_games {
        Filter::Games
    } else if opts.all {
        Filter::All
    } else {
        opts.filter
    };

    let cfg_path = crate::config_path(opts.config.as_deref().or(parent_config))?;
    let cfg = config::load(&cfg_path)?;
    let state_path = state::daemon_state_path().context("cannot determine state directory")?;
    let st: DaemonState = state::load(&state_path)?;

    let mut os_cpus = st.os_cpus.trim().to_string();
    let mut game_cpus = st.game_cpus.trim().to_string();
    if os_cpus.is_empty() || game_cpus.is_empty() {
        if let Ok((detected_os, detected_game)) = resolve_cpus(&cfg) {
            if os_cpus.is_empty() {
                os_cpus = detected_os;
            }
            if game_cpus.is_empty() {
                game_cpus = detected_game;
            }
        }
    }

    let mut out = StatusOutput {
        generated_at: Utc::now(),
        filter,
        config_path: cfg_path.display().to_string(),
        state_path: state_path.display().to_string(),
        os_cpus,
        game_cpus,
        state: st,
        slices: Vec::new(),
        games: Vec::new(),
        all: Vec::new(),
        errors: Vec::new(),
    };

    let sys = match UserSystemd::connect(false) {
        Ok(sys) => Some(sys),
        Err(err) => {
            out.errors.push(format!("user dbus: {err}"));
            None
        }
    };

    for unit in cfg.slices_to_pin() {
        let original = out
            .state
            .original_allowed_cpus
            .get(&unit)
            .cloned()
            .unwrap_or_default();
        let mut slice = SliceStatus {
            unit: unit.clone(),
            allowed_cpus: None,
            original_allowed_cpus: original,
            read_error: None,
        };
        if let Some(sys) = &sys {
            match sys.get_allowed_cpus(&unit) {
                Ok(value) => slice.allowed_cpus = Some(value),
                Err(err) => slice.read_error = Some(err.to_string()),
            }
        }
        out.slices.push(slice);
    }

    let uid = nix::unistd::Uid::current().as_raw();
    let scanner = Scanner::new(
        uid,
        cfg.env_keys.clone(),
        cfg.exe_allowlist.clone(),
        cfg.ignore_exe.clone(),
    );

    match scanner.scan() {
        Ok(games) => {
            for procs in games.values() {
                for game_proc in procs {
                    out.games.push(GameProcStatus {
                        pid: game_proc.pid,
                        exe: game_proc.exe.clone(),
                        game_id: game_proc.game_id.clone(),
                        id_source: game_proc.id_source.clone(),
                        allowed_cpus: game_proc.allowed_cpus.clone(),
                    });
                }
            }
        }
        Err(err) => out.errors.push(format!("scan games: {err}")),
    }

    if filter == Filter::All {
        match scanner.scan_cpu_constraints() {
            Ok(constraints) => {
                out.all = summarize(&constraints, &out.os_cpus, &out.game_cpus);
            }
            Err(err) => out.errors.push(format!("scan all processes: {err}")),
        }
    }

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_human(&out);
    }
    Ok(())
}

/// Group user processes pinned to exactly one of the two CPU sets by
/// (class, exe), keeping up to 8 sample pids per group. Ordering: class
/// ascending, then count descending, then exe.
fn summarize(
    constraints: &[ccd_utils::procscan::CpuConstraint],
    os_cpus: &str,
    game_cpus: &str,
) -> Vec<ProgramSummary> {
    let mut groups: BTreeMap<(&'static str, String), ProgramSummary> = BTreeMap::new();
    for constraint in constraints {
        let class = if !os_cpus.is_empty() && constraint.allowed_cpus == os_cpus {
            "os"
        } else if !game_cpus.is_empty() && constraint.allowed_cpus == game_cpus {
            "game"
        } else {
            continue;
        };
        let entry = groups
            .entry((class, constraint.exe.clone()))
            .or_insert_with(|| ProgramSummary {
                exe: constraint.exe.clone(),
                class,
                allowed_cpus: constraint.allowed_cpus.clone(),
                count: 0,
                sample_pids: Vec::new(),
            });
        entry.count += 1;
        if entry.sample_pids.len() < 8 {
            entry.sample_pids.push(constraint.pid);
        }
    }

    let mut summaries: Vec<ProgramSummary> = groups.into_values().collect();
    summaries.sort_by(|a, b| {
        a.class
            .cmp(b.class)
            .then(b.count.cmp(&a.count))
            .then(a.exe.cmp(&b.exe))
    });
    summaries
}

fn print_human(out: &StatusOutput) {
    println!("state: {}", out.state_path);
    println!("pin_applied: {}", out.state.pin_applied);
    if !out.os_cpus.is_empty() {
        println!("os_cpus: {}", out.os_cpus);
    }
    if !out.game_cpus.is_empty() {
        println!("game_cpus: {}", out.game_cpus);
    }

    if !out.slices.is_empty() {
        println!("slices:");
        for slice in &out.slices {
            let mut line = match (&slice.allowed_cpus, &slice.read_error) {
                (_, Some(err)) => format!("  {}: error={err}", slice.unit),
                (Some(value), None) => format!("  {}: AllowedCPUs={value:?}", slice.unit),
                (None, None) => format!("  {}: AllowedCPUs=?", slice.unit),
            };
            if !slice.original_allowed_cpus.is_empty() || out.state.pin_applied {
                line.push_str(&format!(" (original={:?})", slice.original_allowed_cpus));
            }
            println!("{line}");
        }
    }

    if out.games.is_empty() {
        println!("games: none");
    } else {
        println!("games:");
        for game in &out.games {
            let allowed = if game.allowed_cpus.is_empty() {
                "?"
            } else {
                &game.allowed_cpus
            };
            println!(
                "  pid={} exe={} game_id={} src={} allowed={}",
                game.pid, game.exe, game.game_id, game.id_source, allowed
            );
        }
    }

    if out.filter == Filter::All {
        if out.all.is_empty() {
            println!("affected: none");
        } else {
            println!("affected:");
            for summary in &out.all {
                println!(
                    "  class={} exe={} count={} allowed={} pids={:?}",
                    summary.class,
                    summary.exe,
                    summary.count,
                    summary.allowed_cpus,
                    summary.sample_pids
                );
            }
        }
    }

    if !out.errors.is_empty() {
        println!("errors:");
        for err in &out.errors {
            println!("  {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccd_utils::procscan::CpuConstraint;

    fn constraint(pid: i32, exe: &str, allowed: &str) -> CpuConstraint {
        CpuConstraint {
            pid,
            start_time: 1,
            exe: exe.to_string(),
            allowed_cpus: allowed.to_string(),
        }
    }

    #[test]
    fn classifies_by_exact_mask() {
        let constraints = vec![
            constraint(1, "browser", "0-7"),
            constraint(2, "game.exe", "8-15"),
            constraint(3, "unrelated", "0-15"),
        ];
        let summaries = summarize(&constraints, "0-7", "8-15");
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].class, "game");
        assert_eq!(summaries[0].exe, "game.exe");
        assert_eq!(summaries[1].class, "os");
    }

    #[test]
    fn orders_by_class_then_count_then_exe() {
        let mut constraints = Vec::new();
        for pid in 0..3 {
            constraints.push(constraint(pid, "bbb", "0-7"));
        }
        constraints.push(constraint(10, "aaa", "0-7"));
        constraints.push(constraint(11, "aaa2", "0-7"));

        let summaries = summarize(&constraints, "0-7", "8-15");
        let order: Vec<(&str, usize)> = summaries
            .iter()
            .map(|s| (s.exe.as_str(), s.count))
            .collect();
        assert_eq!(order, vec![("bbb", 3), ("aaa", 1), ("aaa2", 1)]);
    }

    #[test]
    fn caps_sample_pids_at_eight() {
        let constraints: Vec<CpuConstraint> =
            (0..12).map(|pid| constraint(pid, "many", "8-15")).collect();
        let summaries = summarize(&constraints, "0-7", "8-15");
        assert_eq!(summaries[0].count, 12);
        assert_eq!(summaries[0].sample_pids.len(), 8);
    }

    #[test]
    fn empty_masks_never_match() {
        let constraints = vec![constraint(1, "idle", "")];
        assert!(summarize(&constraints, "", "8-15").is_empty());
    }
}
