// SPDX-License-Identifier: GPL-2.0

use std::path::PathBuf;

/// Error taxonomy shared by the daemon and the wrapper.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cpu topology not available: {0}")]
    TopologyNotAvailable(String),

    #[error("invalid CPU list {list:?}: {reason}")]
    InvalidCpuList { list: String, reason: String },

    #[error("failed to load config from {}: {source}", path.display())]
    ConfigLoad {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to load state from {}: {source}", path.display())]
    StateLoad {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to save state to {}: {source}", path.display())]
    StateSave {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("user systemd instance unavailable: {0}")]
    SupervisorUnavailable(String),

    #[error("systemd call {call} failed: {reason}")]
    SupervisorCall { call: String, reason: String },

    #[error("process scan failed: {0}")]
    Scan(#[source] std::io::Error),

    #[error("timed out waiting for the coordinator lock at {}", path.display())]
    LockContention { path: PathBuf },

    #[error("failed to launch child command {command:?}: {source}")]
    ChildLaunch {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn invalid_cpu_list(list: &str, reason: impl Into<String>) -> Self {
        Error::InvalidCpuList {
            list: list.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn supervisor_call(call: &str, reason: impl ToString) -> Self {
        Error::SupervisorCall {
            call: call.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
