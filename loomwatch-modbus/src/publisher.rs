//! Periodic push of the whole registry to the collector.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::collector::CollectorError;
use crate::registry::MachineRegistry;
use crate::state::MachineState;

/// Destination of published machine states.
pub trait CollectorSink: Send + Sync + 'static {
    fn push(
        &self,
        logs: &BTreeMap<String, MachineState>,
    ) -> impl Future<Output = Result<(), CollectorError>> + Send;
}

/// Result of one publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published {
        machines: usize,
        snapshots_cleared: usize,
    },
    /// A previous publish is still running.
    Skipped,
    Failed,
}

/// Clears the in-flight flag on drop, whatever the exit path.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Pushes registry snapshots on a fixed tick, at most one at a time.
pub struct Publisher<S> {
    sink: S,
    registry: Arc<MachineRegistry>,
    interval: Duration,
    in_flight: AtomicBool,
}

impl<S: CollectorSink> Publisher<S> {
    pub fn new(sink: S, registry: Arc<MachineRegistry>, interval: Duration) -> Self {
        Self {
            sink,
            registry,
            interval,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Publish the current registry unless a publish is already running.
    pub async fn publish_once(&self) -> PublishOutcome {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            debug!("Previous publish still running, skipping tick");
            return PublishOutcome::Skipped;
        };

        let logs = self.registry.snapshot();
        match self.sink.push(&logs).await {
            Ok(()) => {
                let snapshots_cleared = self.registry.clear_published_snapshots(&logs);
                if snapshots_cleared > 0 {
                    info!(count = snapshots_cleared, "Closed-shift snapshots delivered");
                }
                debug!(machines = logs.len(), "Published machine states");
                PublishOutcome::Published {
                    machines: logs.len(),
                    snapshots_cleared,
                }
            }
            Err(e) => {
                warn!(error = %e, machines = logs.len(), "Publish failed, retrying next tick");
                PublishOutcome::Failed
            }
        }
    }

    /// Tick forever, spawning one publish per tick.
    pub async fn run(self: Arc<Self>) {
        info!(interval = ?self.interval, "Starting publisher");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let publisher = self.clone();
            tokio::spawn(async move {
                publisher.publish_once().await;
            });
        }
    }
}
