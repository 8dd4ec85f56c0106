//! Per-machine link status shared between poll tasks and the health endpoint.

use std::collections::HashMap;
use std::time::Instant;

use loomwatch_common::{HealthSnapshot, MachineLiveness};
use parking_lot::RwLock;

/// Latest link status of every machine.
#[derive(Debug)]
pub struct LivenessBoard {
    start_time: Instant,
    machines: RwLock<HashMap<String, MachineLiveness>>,
}

impl Default for LivenessBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessBoard {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            machines: RwLock::new(HashMap::new()),
        }
    }

    /// Announce a machine before its first poll.
    pub fn register(&self, machine: &str) {
        self.machines
            .write()
            .entry(machine.to_string())
            .or_insert_with(|| MachineLiveness::new(machine));
    }

    /// Replace the entry for `entry.machine`.
    pub fn record(&self, entry: MachineLiveness) {
        self.machines.write().insert(entry.machine.clone(), entry);
    }

    pub fn get(&self, machine: &str) -> Option<MachineLiveness> {
        self.machines.read().get(machine).cloned()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let machines = self.machines.read().values().cloned().collect();
        HealthSnapshot::new(self.start_time.elapsed().as_secs(), machines)
    }
}
