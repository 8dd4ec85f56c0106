//! Health and liveness types served by the liveness endpoint.
//!
//! A poll task records one [`MachineLiveness`] entry per machine after every
//! iteration; the HTTP listener wraps them into a [`HealthSnapshot`].

use serde::{Deserialize, Serialize};

/// Field-link state of a single machine session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// No session is open.
    #[default]
    Disconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// Session is open and usable.
    Connected,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
        }
    }
}

/// Per-machine liveness information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineLiveness {
    /// Machine identifier.
    pub machine: String,
    /// Current link state.
    pub link: LinkState,
    /// Consecutive failed poll iterations.
    pub consecutive_failures: u32,
    /// Last error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Last successful poll (millis since epoch).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<i64>,
}

impl MachineLiveness {
    /// Liveness entry for a machine that has not been polled yet.
    pub fn new(machine: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
            link: LinkState::Disconnected,
            consecutive_failures: 0,
            last_error: None,
            last_success: None,
        }
    }
}

/// Health report for the whole process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Overall status, always "healthy" while the process answers.
    pub status: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Machines configured.
    pub machines_total: u64,
    /// Machines with an open session.
    pub machines_connected: u64,
    /// Per-machine details, sorted by machine id.
    pub machines: Vec<MachineLiveness>,
}

impl HealthSnapshot {
    /// Build a snapshot from per-machine entries.
    pub fn new(uptime_secs: u64, mut machines: Vec<MachineLiveness>) -> Self {
        machines.sort_by(|a, b| a.machine.cmp(&b.machine));
        let machines_connected = machines
            .iter()
            .filter(|m| m.link == LinkState::Connected)
            .count() as u64;

        Self {
            status: "healthy".to_string(),
            uptime_secs,
            machines_total: machines.len() as u64,
            machines_connected,
            machines,
        }
    }
}
