// SPDX-License-Identifier: GPL-2.0

//! Client for the per-user systemd instance.
//!
//! The controller is an ordinary D-Bus peer of `org.freedesktop.systemd1` on
//! the session bus: it starts units, creates transient scopes for game
//! processes, attaches late-spawned pids, and reads/writes the `AllowedCPUs`
//! resource-control property. `AllowedCPUs` travels on the wire as a cpuset
//! bitmask (`ay`, byte i bit j = CPU i*8+j); this module converts between
//! that and canonical CPU-list strings.
//!
//! All calls are driven from a private current-thread tokio runtime so each
//! one carries a hard deadline; the rest of the program stays synchronous.

use std::future::Future;
use std::time::Duration;

use log::{debug, info};
use tokio::runtime::Runtime;
use zbus::zvariant::{OwnedObjectPath, Value};
use zbus::{Connection, Proxy};

use crate::cpulist;
use crate::error::{Error, Result};

const SYSTEMD_DEST: &str = "org.freedesktop.systemd1";
const MANAGER_PATH: &str = "/org/freedesktop/systemd1";
const MANAGER_IFACE: &str = "org.freedesktop.systemd1.Manager";
const SLICE_IFACE: &str = "org.freedesktop.systemd1.Slice";
const SCOPE_IFACE: &str = "org.freedesktop.systemd1.Scope";

const ERR_UNIT_EXISTS: &str = "org.freedesktop.systemd1.UnitExists";
const ERR_NO_SUCH_UNIT: &str = "org.freedesktop.systemd1.NoSuchUnit";

const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);
const SCOPE_CREATE_DEADLINE: Duration = Duration::from_secs(10);
const ATTACH_DEADLINE: Duration = Duration::from_secs(5);

/// Prefix for the per-game transient scopes the daemon creates.
pub const GAME_SCOPE_PREFIX: &str = "ccdbind-game-";

/// Connection mode. Dry-run still reads from the bus but logs every mutation
/// instead of performing it.
enum Transport {
    Real(Connection),
    DryRun(Connection),
}

impl Transport {
    fn conn(&self) -> &Connection {
        match self {
            Transport::Real(conn) | Transport::DryRun(conn) => conn,
        }
    }

    fn dry_run(&self) -> bool {
        matches!(self, Transport::DryRun(_))
    }
}

pub struct UserSystemd {
    rt: Runtime,
    transport: Transport,
}

impl UserSystemd {
    /// Connect to the user instance on the session bus.
    pub fn connect(dry_run: bool) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::SupervisorUnavailable(e.to_string()))?;
        let conn = rt
            .block_on(Connection::session())
            .map_err(|e| Error::SupervisorUnavailable(e.to_string()))?;
        let transport = if dry_run {
            Transport::DryRun(conn)
        } else {
            Transport::Real(conn)
        };
        Ok(Self { rt, transport })
    }

    fn call<T, F>(&self, name: &str, deadline: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = zbus::Result<T>>,
    {
        match self.rt.block_on(tokio::time::timeout(deadline, fut)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Error::supervisor_call(name, err)),
            Err(_) => Err(Error::supervisor_call(
                name,
                format!("deadline of {deadline:?} exceeded"),
            )),
        }
    }

    /// Best-effort load/start of a named unit, tolerating "already active".
    pub fn start_unit(&self, unit: &str) -> Result<()> {
        if self.transport.dry_run() {
            info!("dry-run: would start unit {unit}");
            return Ok(());
        }
        let conn = self.transport.conn();
        let result: Result<OwnedObjectPath> = self.call("StartUnit", DEFAULT_DEADLINE, async {
            let manager = manager_proxy(conn).await?;
            let reply = manager.call_method("StartUnit", &(unit, "replace")).await?;
            reply.body().deserialize()
        });
        match result {
            Ok(_) => Ok(()),
            // An already-running unit or an active job against it is fine.
            Err(Error::SupervisorCall { reason, .. }) if reason.contains("JobExists") => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Current `AllowedCPUs` of a slice or scope, as a canonical list string.
    /// The empty string means no constraint is set.
    pub fn get_allowed_cpus(&self, unit: &str) -> Result<String> {
        let conn = self.transport.conn();
        let iface = unit_iface(unit);
        let mask: Vec<u8> = self.call("Get AllowedCPUs", DEFAULT_DEADLINE, async {
            let manager = manager_proxy(conn).await?;
            let reply = manager.call_method("GetUnit", &(unit,)).await?;
            let path: OwnedObjectPath = reply.body().deserialize()?;
            let proxy = unit_proxy(conn, path, iface).await?;
            proxy.get_property::<Vec<u8>>("AllowedCPUs").await
        })?;
        Ok(mask_to_list(&mask))
    }

    /// Set `AllowedCPUs` with the runtime-only flag. An empty list clears the
    /// constraint.
    pub fn set_allowed_cpus(&self, unit: &str, list: &str) -> Result<()> {
        let mask = list_to_mask(list)?;
        if self.transport.dry_run() {
            info!("dry-run: would set AllowedCPUs={list:?} on {unit}");
            return Ok(());
        }
        let conn = self.transport.conn();
        self.call("SetUnitProperties", DEFAULT_DEADLINE, async {
            let manager = manager_proxy(conn).await?;
            let props: Vec<(&str, Value)> = vec![("AllowedCPUs", Value::from(mask))];
            manager
                .call_method("SetUnitProperties", &(unit, true, props))
                .await?;
            Ok(())
        })
    }

    /// Create the named transient scope under `slice` with `pids` as initial
    /// members, unless it already exists. Returns whether this call created
    /// it. Safe to repeat: `UnitExists` folds into `Ok(false)`.
    pub fn ensure_transient_scope(
        &self,
        unit: &str,
        pids: &[i32],
        slice: &str,
        description: &str,
    ) -> Result<bool> {
        let conn = self.transport.conn();

        let loaded: Option<OwnedObjectPath> = {
            let result = self.call("GetUnit", DEFAULT_DEADLINE, async {
                let manager = manager_proxy(conn).await?;
                let reply = manager.call_method("GetUnit", &(unit,)).await?;
                reply.body().deserialize()
            });
            match result {
                Ok(path) => Some(path),
                Err(Error::SupervisorCall { reason, .. }) if reason.contains(ERR_NO_SUCH_UNIT) => {
                    None
                }
                Err(err) => return Err(err),
            }
        };
        if loaded.is_some() {
            debug!("scope {unit} already loaded");
            return Ok(false);
        }

        if self.transport.dry_run() {
            info!("dry-run: would create scope {unit} under {slice} with pids {pids:?}");
            return Ok(true);
        }

        let pids_u32: Vec<u32> = pids.iter().filter(|p| **p > 0).map(|p| *p as u32).collect();
        let result: Result<OwnedObjectPath> =
            self.call("StartTransientUnit", SCOPE_CREATE_DEADLINE, async {
                let manager = manager_proxy(conn).await?;
                let props: Vec<(&str, Value)> = vec![
                    ("Description", Value::from(description)),
                    ("Slice", Value::from(slice)),
                    ("PIDs", Value::from(pids_u32)),
                ];
                let aux: Vec<(&str, Vec<(&str, Value)>)> = Vec::new();
                let reply = manager
                    .call_method("StartTransientUnit", &(unit, "fail", props, aux))
                    .await?;
                reply.body().deserialize()
            });
        match result {
            Ok(_) => {
                info!("created scope {unit} under {slice}");
                Ok(true)
            }
            Err(Error::SupervisorCall { reason, .. }) if reason.contains(ERR_UNIT_EXISTS) => {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Attach additional pids to an existing unit's cgroup.
    pub fn attach_processes(&self, unit: &str, subcgroup: &str, pids: &[i32]) -> Result<()> {
        if pids.is_empty() {
            return Ok(());
        }
        if self.transport.dry_run() {
            info!("dry-run: would attach pids {pids:?} to {unit}");
            return Ok(());
        }
        let conn = self.transport.conn();
        let pids_u32: Vec<u32> = pids.iter().filter(|p| **p > 0).map(|p| *p as u32).collect();
        self.call("AttachProcessesToUnit", ATTACH_DEADLINE, async {
            let manager = manager_proxy(conn).await?;
            manager
                .call_method("AttachProcessesToUnit", &(unit, subcgroup, pids_u32))
                .await?;
            Ok(())
        })
    }
}

async fn manager_proxy(conn: &Connection) -> zbus::Result<Proxy<'_>> {
    Proxy::new(conn, SYSTEMD_DEST, MANAGER_PATH, MANAGER_IFACE).await
}

async fn unit_proxy<'a>(
    conn: &'a Connection,
    path: OwnedObjectPath,
    iface: &'static str,
) -> zbus::Result<Proxy<'a>> {
    zbus::proxy::Builder::new(conn)
        .destination(SYSTEMD_DEST)?
        .path(path)?
        .interface(iface)?
        .cache_properties(zbus::proxy::CacheProperties::No)
        .build()
        .await
}

fn unit_iface(unit: &str) -> &'static str {
    if unit.ends_with(".scope") {
        SCOPE_IFACE
    } else {
        SLICE_IFACE
    }
}

/// Deterministic scope name for a game id: stable across restarts so
/// repeated scans converge on the same unit, and injective so distinct games
/// never collide. Bytes outside `[A-Za-z0-9:.-]`, plus `_` itself, are
/// escaped as `_XX`.
pub fn scope_unit_for_game(game_id: &str) -> String {
    let mut escaped = String::with_capacity(game_id.len());
    for byte in game_id.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b':' | b'.' | b'-' => {
                escaped.push(byte as char)
            }
            _ => escaped.push_str(&format!("_{byte:02X}")),
        }
    }
    format!("{GAME_SCOPE_PREFIX}{escaped}.scope")
}

/// CPU-list string to the cpuset byte mask systemd expects. The empty string
/// maps to the empty mask, which clears the constraint.
pub fn list_to_mask(list: &str) -> Result<Vec<u8>> {
    let cpus = cpulist::parse(list)?;
    let Some(max) = cpus.last() else {
        return Ok(Vec::new());
    };
    let mut mask = vec![0u8; max / 8 + 1];
    for cpu in cpus {
        mask[cpu / 8] |= 1 << (cpu % 8);
    }
    Ok(mask)
}

/// Cpuset byte mask to canonical CPU-list string.
pub fn mask_to_list(mask: &[u8]) -> String {
    let mut cpus = Vec::new();
    for (i, byte) in mask.iter().enumerate() {
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                cpus.push(i * 8 + bit);
            }
        }
    }
    cpulist::format(&cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_names_are_stable_and_escaped() {
        assert_eq!(scope_unit_for_game("730"), "ccdbind-game-730.scope");
        assert_eq!(scope_unit_for_game("730"), scope_unit_for_game("730"));
        assert_eq!(scope_unit_for_game("half life"), "ccdbind-game-half_20life.scope");
        assert_eq!(scope_unit_for_game("a_b"), "ccdbind-game-a_5Fb.scope");
        // Escaping is injective for ids that would otherwise collide.
        assert_ne!(scope_unit_for_game("a_20b"), scope_unit_for_game("a b"));
    }

    #[test]
    fn mask_round_trip() {
        for list in ["", "0", "0-7", "8-15", "0-3,8,10-11", "63"] {
            let mask = list_to_mask(list).unwrap();
            assert_eq!(mask_to_list(&mask), list);
        }
    }

    #[test]
    fn mask_layout_matches_cpuset() {
        assert_eq!(list_to_mask("0-7").unwrap(), vec![0xFF]);
        assert_eq!(list_to_mask("8-15").unwrap(), vec![0x00, 0xFF]);
        assert_eq!(list_to_mask("0").unwrap(), vec![0x01]);
        assert_eq!(list_to_mask("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn iface_follows_unit_suffix() {
        assert_eq!(unit_iface("app.slice"), SLICE_IFACE);
        assert_eq!(unit_iface("ccdbind-game-730.scope"), SCOPE_IFACE);
    }
}
