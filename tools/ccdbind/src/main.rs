// SPDX-License-Identifier: GPL-2.0
//
// ccdbind: pins background slices to the OS CCD and game processes to the
// game CCD on multi-CCD CPUs, via the per-user systemd instance.

mod reconcile;
mod status;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use ccd_utils::config::{self, Config};
use ccd_utils::cpulist;
use ccd_utils::procscan::Scanner;
use ccd_utils::state::{self, DaemonState, STATE_VERSION};
use ccd_utils::systemd::UserSystemd;
use ccd_utils::topology;

use crate::reconcile::{Reconciler, GAME_SLICE};

#[derive(Debug, Parser)]
#[command(
    name = "ccdbind",
    version,
    about = "CCD-aware CPU pinning daemon for the per-user systemd instance."
)]
struct Opts {
    /// Config file path (TOML). Default: XDG config path.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Tick interval override in seconds.
    #[clap(long)]
    interval: Option<f64>,

    /// Print detected CPU topology and exit.
    #[clap(long)]
    print_topology: bool,

    /// Log actions without mutating systemd state.
    #[clap(long)]
    dry_run: bool,

    /// Print persisted state JSON and exit.
    #[clap(long)]
    dump_state: bool,

    /// Enable debug logging.
    #[clap(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a snapshot of the pin state and observed processes.
    Status(status::StatusOpts),
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(opts.verbose)?;

    if let Some(Command::Status(status_opts)) = opts.command {
        return status::run(&status_opts, opts.config.as_deref());
    }

    run_daemon(&opts)
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    let _ = lcfg.set_time_offset_to_local();
    lcfg.set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        level,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )
    .context("logger init")
}

pub(crate) fn config_path(explicit: Option<&std::path::Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => config::default_config_path().context("cannot determine config directory"),
    }
}

/// Effective (os_cpus, game_cpus): config overrides when both are set,
/// detection otherwise. An empty game list is fatal: with a single cache
/// group there is nothing safe to pin.
pub(crate) fn resolve_cpus(cfg: &Config) -> Result<(String, String)> {
    if !cfg.os_cpus_override.is_empty() && !cfg.game_cpus_override.is_empty() {
        let os = cpulist::canonicalize(&cfg.os_cpus_override).context("os_cpus override")?;
        let game = cpulist::canonicalize(&cfg.game_cpus_override).context("game_cpus override")?;
        return Ok((os, game));
    }
    let topo = topology::detect()?;
    if topo.game_cpus.is_empty() {
        bail!(
            "topology detection found only one cache group ({:?}); refusing to pin",
            topo.groups
        );
    }
    Ok((topo.os_cpus, topo.game_cpus))
}

fn run_daemon(opts: &Opts) -> Result<()> {
    let state_path = state::daemon_state_path().context("cannot determine state directory")?;

    if opts.dump_state {
        let st: DaemonState = state::load(&state_path)?;
        println!("{}", serde_json::to_string_pretty(&st)?);
        return Ok(());
    }

    let cfg_path = config_path(opts.config.as_deref())?;
    let mut cfg = config::load(&cfg_path)?;
    if let Some(interval) = opts.interval {
        if !interval.is_finite() || interval <= 0.0 {
            bail!("invalid --interval {interval}");
        }
        cfg.interval_secs = interval;
    }

    let (os_cpus, game_cpus) = resolve_cpus(&cfg)?;

    if opts.print_topology {
        println!("OS_CPUS={os_cpus}");
        println!("GAME_CPUS={game_cpus}");
        return Ok(());
    }

    let uid = nix::unistd::Uid::current().as_raw();
    let slices = cfg.slices_to_pin();
    let scanner = Scanner::new(
        uid,
        cfg.env_keys.clone(),
        cfg.exe_allowlist.clone(),
        cfg.ignore_exe.clone(),
    );

    let sys = UserSystemd::connect(opts.dry_run).context("connect to user dbus")?;
    if let Err(err) = sys.start_unit(GAME_SLICE) {
        warn!("start {GAME_SLICE}: {err}");
    }

    let mut st: DaemonState = state::load(&state_path)?;
    st.version = STATE_VERSION;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("set signal handler")?;

    let interval = Duration::from_secs_f64(cfg.interval_secs);
    info!(
        "ccdbind started interval={interval:?} os_cpus={os_cpus:?} game_cpus={game_cpus:?} dry_run={}",
        opts.dry_run
    );

    let mut reconciler = Reconciler::new(
        sys,
        scanner,
        slices,
        os_cpus,
        game_cpus,
        state_path,
        opts.dry_run,
        shutdown.clone(),
    );

    if let Err(err) = reconciler.restore_if_needed(&mut st) {
        warn!("startup restore: {err:#}");
    }

    while !shutdown.load(Ordering::Relaxed) {
        sleep_interruptible(interval, &shutdown);
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if let Err(err) = reconciler.tick(&mut st) {
            warn!("tick: {err:#}");
        }
    }

    info!("signal received; shutting down");
    reconciler.restore_on_exit(&mut st);
    Ok(())
}

// Ticks never overlap: the loop sleeps, then runs one reconciliation to
// completion. The sleep is chunked so shutdown stays responsive.
fn sleep_interruptible(total: Duration, shutdown: &Arc<AtomicBool>) {
    let mut remaining = total;
    let step = Duration::from_millis(100);
    while !remaining.is_zero() {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let chunk = remaining.min(step);
        std::thread::sleep(chunk);
        remaining -= chunk;
    }
}
