// SPDX-License-Identifier: GPL-2.0
//
// ccdpin: launches one command on the game CCD while the OS slices are
// pinned away from it, sharing the pin with concurrent invocations.

mod pin;

use std::fs::OpenOptions;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use ccd_utils::cpulist;
use ccd_utils::state;
use ccd_utils::systemd::UserSystemd;
use ccd_utils::topology;

use crate::pin::SlicePinManager;

const ENV_GAME_CPUS: &str = "STEAM_CCD_GAME_CPUS";
const ENV_OS_CPUS: &str = "STEAM_CCD_OS_CPUS";
const ENV_SWAP: &str = "STEAM_CCD_SWAP";
const ENV_NO_OS_PIN: &str = "STEAM_CCD_NO_OS_PIN";
const ENV_OS_SLICES: &str = "STEAM_CCD_OS_SLICES";
const ENV_DEBUG: &str = "STEAM_CCD_DEBUG";

const GAME_SLICE: &str = "game.slice";

#[derive(Debug, Parser)]
#[command(
    name = "ccdpin",
    version,
    about = "Run a command on the game CCD, pinning OS slices away from it.",
    override_usage = "ccdpin [flags] [--] COMMAND [args...]",
    after_help = "environment overrides (compat):\n  \
                  STEAM_CCD_GAME_CPUS, STEAM_CCD_OS_CPUS, STEAM_CCD_SWAP,\n  \
                  STEAM_CCD_NO_OS_PIN, STEAM_CCD_OS_SLICES, STEAM_CCD_DEBUG"
)]
struct Opts {
    /// Print detected topology and selected CPU sets, then exit.
    #[clap(long)]
    print: bool,

    /// Swap the OS and GAME CPU assignments.
    #[clap(long)]
    swap: bool,

    /// Do not pin OS slices.
    #[clap(long)]
    no_os_pin: bool,

    /// Override the GAME CPU list.
    #[clap(long)]
    game_cpus: Option<String>,

    /// Override the OS CPU list.
    #[clap(long)]
    os_cpus: Option<String>,

    /// Command to run.
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Debug)]
struct Resolved {
    os_cpus: String,
    game_cpus: String,
    groups: Vec<String>,
    no_os_pin: bool,
    os_slices: Vec<String>,
    debug: bool,
}

fn main() {
    // All cleanup (pin release, log flush) happens via Drop inside run();
    // only then is the child's exit code turned into ours.
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            warn!("{err:#}");
            eprintln!("ccdpin: {err:#}");
            2
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let opts = Opts::parse();
    let debug = parse_bool_env(ENV_DEBUG);
    init_logging(debug);
    info!(
        "ccdpin started, pid={}, args={:?}",
        std::process::id(),
        std::env::args().collect::<Vec<_>>()
    );

    let resolved = resolve(&opts)?;

    if opts.print {
        print_topology(&resolved);
        return Ok(0);
    }
    if opts.command.is_empty() {
        bail!("no command provided");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    }) {
        warn!("set signal handler: {err}");
    }

    let sys = match UserSystemd::connect(false) {
        Ok(sys) => Some(sys),
        Err(err) => {
            warn_user(&format!("os slice pin disabled: {err}"));
            None
        }
    };

    let manager = if sys.is_some() && !resolved.no_os_pin {
        match SlicePinManager::new(&resolved.os_cpus, &resolved.os_slices) {
            Ok(manager) => Some(manager),
            Err(err) => {
                warn_user(&format!("os slice pin disabled: {err:#}"));
                None
            }
        }
    } else {
        if resolved.no_os_pin {
            debug!("OS slice pinning disabled");
        }
        None
    };

    // The pin is released when `_guard` drops, on success, error, or panic
    // alike.
    let mut _guard = None;
    if let (Some(manager), Some(sys)) = (manager.as_ref(), sys.as_ref()) {
        match manager.acquire_and_pin(sys) {
            Ok(guard) => _guard = Some(guard),
            Err(err) => warn_user(&format!("failed to pin OS slices: {err:#}")),
        }
    }

    let code = run_game(&resolved, &opts.command, &shutdown, sys.as_ref());
    info!("child exited with code {code}");
    Ok(code)
}

fn init_logging(debug: bool) {
    let stderr_level = if debug {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Warn
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    let _ = lcfg.set_time_offset_to_local();
    lcfg.set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);

    let mut loggers: Vec<Box<dyn simplelog::SharedLogger>> = vec![simplelog::TermLogger::new(
        stderr_level,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )];

    // Crash log next to the coordinator state, best-effort.
    if let Some(dir) = state::wrapper_state_dir() {
        if std::fs::create_dir_all(&dir).is_ok() {
            if let Ok(file) = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("ccdpin.log"))
            {
                loggers.push(simplelog::WriteLogger::new(
                    simplelog::LevelFilter::Info,
                    lcfg.build(),
                    file,
                ));
            }
        }
    }

    let _ = simplelog::CombinedLogger::init(loggers);
}

fn resolve(opts: &Opts) -> Result<Resolved> {
    let debug = parse_bool_env(ENV_DEBUG);
    let no_os_pin = opts.no_os_pin || parse_bool_env(ENV_NO_OS_PIN);
    let swap = opts.swap || parse_bool_env(ENV_SWAP);

    let mut os_slices = parse_slices_env(&env_trimmed(ENV_OS_SLICES));
    if os_slices.is_empty() {
        os_slices = vec![
            "app.slice".to_string(),
            "background.slice".to_string(),
            "session.slice".to_string(),
        ];
    }

    let mut os_cpus = opts
        .os_cpus
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| env_trimmed(ENV_OS_CPUS));
    let mut game_cpus = opts
        .game_cpus
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| env_trimmed(ENV_GAME_CPUS));

    // Detect only when something is missing (or the caller wants to see it).
    let mut groups = Vec::new();
    if opts.print || os_cpus.is_empty() || game_cpus.is_empty() || swap {
        let topo = topology::detect()?;
        if os_cpus.is_empty() {
            os_cpus = topo.os_cpus;
        }
        if game_cpus.is_empty() {
            game_cpus = topo.game_cpus;
        }
        groups = topo.groups;
    }
    if game_cpus.is_empty() {
        bail!("could not resolve GAME_CPUS");
    }

    if !os_cpus.is_empty() {
        os_cpus = cpulist::canonicalize(&os_cpus)
            .with_context(|| format!("invalid OS CPU list {os_cpus:?}"))?;
    }
    if !game_cpus.is_empty() {
        game_cpus = cpulist::canonicalize(&game_cpus)
            .with_context(|| format!("invalid GAME CPU list {game_cpus:?}"))?;
    }

    if swap {
        if os_cpus.is_empty() {
            bail!("cannot swap without OS_CPUS");
        }
        std::mem::swap(&mut os_cpus, &mut game_cpus);
    }

    Ok(Resolved {
        os_cpus,
        game_cpus,
        groups,
        no_os_pin,
        os_slices,
        debug,
    })
}

fn print_topology(resolved: &Resolved) {
    if !resolved.groups.is_empty() {
        println!("Detected CCD CPU groups:");
        for (i, group) in resolved.groups.iter().enumerate() {
            println!("  CCD[{i}] = {group}");
        }
        println!();
    }
    println!("Selected:");
    if !resolved.os_cpus.is_empty() {
        println!("  OS_CPUS   = {}", resolved.os_cpus);
    }
    println!("  GAME_CPUS = {}", resolved.game_cpus);
    if !resolved.os_slices.is_empty() {
        println!("  OS_SLICES = {}", resolved.os_slices.join(" "));
    }
}

/// Launch the command, preferring a transient scope in game.slice, then a
/// plain affinity mask, then unpinned as a last resort.
fn run_game(
    resolved: &Resolved,
    command: &[String],
    shutdown: &Arc<AtomicBool>,
    sys: Option<&UserSystemd>,
) -> i32 {
    let game_cpus = &resolved.game_cpus;
    let user_systemd = user_systemd_available();
    if user_systemd {
        if let Some(sys) = sys {
            let _ = sys.start_unit(GAME_SLICE);
        }
    }

    if user_systemd && has_binary("systemd-run") {
        let mut args: Vec<String> = vec![
            "--user".to_string(),
            "--scope".to_string(),
            "--wait".to_string(),
            "--quiet".to_string(),
            format!("--slice={GAME_SLICE}"),
            "-p".to_string(),
            format!("AllowedCPUs={game_cpus}"),
        ];
        // The scope must see the caller's environment (PROTON_* and
        // friends), which systemd-run does not forward on its own.
        for (key, value) in std::env::vars() {
            args.push(format!("--setenv={key}={value}"));
        }
        args.push("--".to_string());
        if has_binary("taskset") {
            args.extend([
                "taskset".to_string(),
                "-c".to_string(),
                game_cpus.clone(),
                "--".to_string(),
            ]);
        }
        args.extend(command.iter().cloned());
        return run_command("systemd-run", &args, resolved.debug, shutdown);
    }

    if has_binary("taskset") {
        let mut args = vec!["-c".to_string(), game_cpus.clone(), "--".to_string()];
        args.extend(command.iter().cloned());
        return run_command("taskset", &args, resolved.debug, shutdown);
    }

    warn_user("neither systemd-run nor taskset available; running without pin");
    run_command(&command[0], &command[1..], resolved.debug, shutdown)
}

fn run_command(bin: &str, args: &[String], debug: bool, shutdown: &Arc<AtomicBool>) -> i32 {
    if debug {
        debug!("exec: {bin} {}", args.join(" "));
    }
    let child = Command::new(bin).args(args).spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(err) => {
            let err = ccd_utils::Error::ChildLaunch {
                command: bin.to_string(),
                source: err,
            };
            warn_user(&err.to_string());
            return 1;
        }
    };
    wait_forwarding_signals(&mut child, shutdown)
}

/// Wait for the child; a termination signal to the wrapper is forwarded once
/// as SIGTERM. Signal death is encoded as 128+signo.
fn wait_forwarding_signals(child: &mut Child, shutdown: &Arc<AtomicBool>) -> i32 {
    let mut forwarded = false;
    loop {
        if shutdown.load(Ordering::Relaxed) && !forwarded {
            forwarded = true;
            let _ = signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
        }
        match child.try_wait() {
            Ok(Some(status)) => {
                if let Some(signo) = status.signal() {
                    return 128 + signo;
                }
                return status.code().unwrap_or(1);
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(err) => {
                warn!("wait for child: {err}");
                return 1;
            }
        }
    }
}

/// The user systemd instance is reachable when `systemctl --user` answers
/// within a second.
fn user_systemd_available() -> bool {
    if !has_binary("systemctl") {
        return false;
    }
    let child = Command::new("systemctl")
        .args(["--user", "show", "-p", "Version", "--value"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    let Ok(mut child) = child else { return false };

    let deadline = Instant::now() + Duration::from_secs(1);
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.success(),
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return false;
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(20)),
            Err(_) => return false,
        }
    }
}

fn has_binary(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}

fn env_trimmed(key: &str) -> String {
    std::env::var(key).unwrap_or_default().trim().to_string()
}

/// Whitespace-separated list of `*.slice` names, deduped; anything else is
/// dropped.
fn parse_slices_env(value: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for field in value.split_whitespace() {
        if !field.ends_with(".slice") {
            continue;
        }
        if !out.iter().any(|have| have.as_str() == field) {
            out.push(field.to_string());
        }
    }
    out
}

fn parse_bool_env(key: &str) -> bool {
    let value = env_trimmed(key);
    if value.is_empty() {
        return false;
    }
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" | "enable" | "enabled" => true,
        "0" | "false" | "no" | "n" | "off" | "disable" | "disabled" => false,
        // Any other non-empty value counts as set.
        _ => true,
    }
}

fn warn_user(msg: &str) {
    warn!("{msg}");
    eprintln!("ccdpin: {msg}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_env_keeps_only_slices() {
        assert_eq!(
            parse_slices_env("app.slice  junk background.slice app.slice"),
            vec!["app.slice", "background.slice"]
        );
        assert!(parse_slices_env("").is_empty());
    }

    #[test]
    fn bool_env_table() {
        for (value, expected) in [
            ("1", true),
            ("TRUE", true),
            ("Yes", true),
            ("on", true),
            ("enabled", true),
            ("0", false),
            ("false", false),
            ("No", false),
            ("off", false),
            ("disabled", false),
            ("weird", true),
            ("", false),
        ] {
            std::env::set_var("CCDPIN_TEST_BOOL", value);
            assert_eq!(parse_bool_env("CCDPIN_TEST_BOOL"), expected, "{value:?}");
        }
        std::env::remove_var("CCDPIN_TEST_BOOL");
    }
}
