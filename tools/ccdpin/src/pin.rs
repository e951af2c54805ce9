// SPDX-License-Identifier: GPL-2.0

//! Reference-counted OS-slice pinning shared across concurrent wrapper
//! invocations.
//!
//! All coordination happens under an exclusive advisory flock on the lock
//! file next to the state file. The first live instance pins and snapshots
//! the original `AllowedCPUs` values; the last one out restores them.
//! Instances that died without releasing are pruned on every acquisition, so
//! a crashed wrapper is cleaned up by the next one.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::{debug, warn};
use nix::fcntl::{Flock, FlockArg};

use ccd_utils::procscan;
use ccd_utils::state::{self, PinState, STATE_VERSION};
use ccd_utils::systemd::UserSystemd;
use ccd_utils::Error;

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SlicePinManager {
    os_cpus: String,
    slices: Vec<String>,
    pid: i32,
    start_time: u64,
    state_path: PathBuf,
    lock_path: PathBuf,
}

/// Undoes this instance's share of the pin when dropped, so restore runs on
/// every exit path, panics included.
pub struct PinGuard<'a> {
    manager: &'a SlicePinManager,
    sys: &'a UserSystemd,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.manager.release_and_restore(self.sys);
    }
}

impl SlicePinManager {
    pub fn new(os_cpus: &str, slices: &[String]) -> Result<Self> {
        if os_cpus.trim().is_empty() {
            bail!("empty OS CPU list");
        }
        if slices.is_empty() {
            bail!("no OS slices configured");
        }
        let state_dir = state::wrapper_state_dir().context("cannot determine state directory")?;
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("create {}", state_dir.display()))?;

        let pid = std::process::id() as i32;
        let start_time = procscan::start_time(Path::new("/proc"), pid).unwrap_or(0);
        Ok(Self {
            os_cpus: os_cpus.to_string(),
            slices: slices.to_vec(),
            pid,
            start_time,
            state_path: state_dir.join("state.json"),
            lock_path: state_dir.join("lock"),
        })
    }

    /// Register this instance and pin the OS slices if it is the first live
    /// one. The returned guard releases on drop.
    pub fn acquire_and_pin<'a>(&'a self, sys: &'a UserSystemd) -> Result<PinGuard<'a>> {
        let lock = self.lock()?;
        let mut st: PinState = state::load(&self.state_path)?;
        st.version = STATE_VERSION;

        prune_dead_instances(&mut st, Path::new("/proc"));
        st.instances.insert(self.pid.to_string(), self.start_time);

        if st.instances.len() == 1 {
            if let Err(err) = self.pin_slices(sys, &mut st) {
                st.instances.remove(&self.pid.to_string());
                let _ = state::save(&self.state_path, &st);
                drop(lock);
                return Err(err);
            }
        } else {
            debug!(
                "{} other instance(s) already hold the pin",
                st.instances.len() - 1
            );
        }

        st.updated_at = Some(Utc::now());
        state::save(&self.state_path, &st)?;
        drop(lock);

        Ok(PinGuard { manager: self, sys })
    }

    /// Pin every configured slice that exists, snapshotting originals first.
    /// Slices whose `AllowedCPUs` cannot be read are skipped, mirroring
    /// setups where e.g. session.slice is absent. A set failure rolls back
    /// the slices already pinned.
    fn pin_slices(&self, sys: &UserSystemd, st: &mut PinState) -> Result<()> {
        let mut pinned: Vec<String> = Vec::with_capacity(self.slices.len());
        let mut current: BTreeMap<String, String> = BTreeMap::new();
        for unit in &self.slices {
            match sys.get_allowed_cpus(unit) {
                Ok(value) => {
                    current.insert(unit.clone(), value);
                    pinned.push(unit.clone());
                }
                Err(err) => debug!("skipping slice {unit}: {err}"),
            }
        }
        if pinned.is_empty() {
            bail!("no OS slices could be pinned");
        }

        st.original_allowed_cpus = current;
        st.os_cpus = self.os_cpus.clone();
        st.slices = pinned.clone();

        for unit in &pinned {
            if let Err(err) = sys.set_allowed_cpus(unit, &self.os_cpus) {
                for rollback_unit in &pinned {
                    if let Some(orig) = st.original_allowed_cpus.get(rollback_unit) {
                        let _ = sys.set_allowed_cpus(rollback_unit, orig);
                    }
                }
                return Err(err).with_context(|| format!("pin {unit}"));
            }
        }
        Ok(())
    }

    /// Deregister this instance; the last one out restores the snapshot.
    fn release_and_restore(&self, sys: &UserSystemd) {
        let lock = match self.lock() {
            Ok(lock) => lock,
            Err(err) => {
                warn!("release lock: {err:#}");
                return;
            }
        };
        let mut st: PinState = match state::load(&self.state_path) {
            Ok(st) => st,
            Err(err) => {
                warn!("release load: {err}");
                return;
            }
        };

        prune_dead_instances(&mut st, Path::new("/proc"));
        let key = self.pid.to_string();
        if let Some(recorded) = st.instances.get(&key).copied() {
            if recorded == 0 || self.start_time == 0 || recorded == self.start_time {
                st.instances.remove(&key);
            }
        }

        if st.instances.is_empty() && !st.original_allowed_cpus.is_empty() {
            for unit in &st.slices {
                let orig = st
                    .original_allowed_cpus
                    .get(unit)
                    .map(String::as_str)
                    .unwrap_or("");
                if let Err(err) = sys.set_allowed_cpus(unit, orig) {
                    warn!("restore {unit}: {err}");
                }
            }
            st.original_allowed_cpus.clear();
            st.os_cpus.clear();
            st.slices.clear();
        }

        st.updated_at = Some(Utc::now());
        if let Err(err) = state::save(&self.state_path, &st) {
            warn!("release save: {err}");
        }
        drop(lock);
    }

    /// Exclusive advisory lock, retried non-blocking so a wedged holder
    /// surfaces as `LockContention` instead of hanging forever.
    fn lock(&self) -> Result<Flock<File>> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&self.lock_path)
                .with_context(|| format!("open {}", self.lock_path.display()))?;
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => return Ok(lock),
                Err((_, nix::errno::Errno::EWOULDBLOCK)) => {
                    if Instant::now() >= deadline {
                        return Err(Error::LockContention {
                            path: self.lock_path.clone(),
                        }
                        .into());
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err((_, errno)) => {
                    return Err(anyhow::anyhow!(
                        "flock {}: {errno}",
                        self.lock_path.display()
                    ))
                }
            }
        }
    }
}

/// Drop instances whose pid is gone or whose start_time no longer matches
/// (the pid was reused by an unrelated process).
fn prune_dead_instances(st: &mut PinState, proc_root: &Path) {
    st.instances.retain(|pid_str, recorded| {
        let Ok(pid) = pid_str.parse::<i32>() else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        match procscan::start_time(proc_root, pid) {
            Ok(live) => *recorded == 0 || live == 0 || live == *recorded,
            Err(_) => false,
        }
    });
}
