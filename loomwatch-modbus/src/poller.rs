//! Per-machine polling loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use loomwatch_common::{MachineLiveness, current_timestamp_millis};
use tracing::{debug, info, warn};

use crate::config::{MachineConfig, ModbusConfig};
use crate::connection::{ConnectionManager, ModbusTcpTransport, RegisterTransport};
use crate::liveness::LivenessBoard;
use crate::profile::{DeviceProfile, FrameError, RegisterWindow};
use crate::registry::{MachineHandle, MachineRegistry};
use crate::state::{StateMachine, Transition, Update};

/// Error type for polling operations.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Read timed out after {0:?}")]
    ReadTimeout(Duration),
    #[error("Malformed response: {0}")]
    ReadProtocol(String),
}

impl From<FrameError> for PollError {
    fn from(e: FrameError) -> Self {
        PollError::ReadProtocol(e.to_string())
    }
}

/// Delay between iterations: nominal after success, doubling up to a cap after failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    nominal: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(nominal: Duration, cap: Duration) -> Self {
        Self {
            nominal,
            cap: cap.max(nominal),
            current: nominal,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn on_success(&mut self) -> Duration {
        self.current = self.nominal;
        self.current
    }

    pub fn on_failure(&mut self) -> Duration {
        self.current = self.current.saturating_mul(2).min(self.cap);
        self.current
    }
}

/// Result of one successful iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Frame applied to the machine state.
    Updated(Update),
    /// Controller returned its all-zero placeholder frame; state untouched.
    Sentinel,
}

/// A poller for a single loom.
pub struct MachinePoller<T> {
    machine: MachineConfig,
    profile: &'static DeviceProfile,
    window: RegisterWindow,
    conn: ConnectionManager<T>,
    state: MachineHandle,
    liveness: Arc<LivenessBoard>,
    backoff: Backoff,
    consecutive_failures: u32,
    last_success: Option<i64>,
}

impl MachinePoller<ModbusTcpTransport> {
    /// Create a poller talking Modbus TCP.
    pub fn new(
        machine: MachineConfig,
        modbus: &ModbusConfig,
        registry: &MachineRegistry,
        liveness: Arc<LivenessBoard>,
    ) -> Self {
        Self::with_transport(
            ModbusTcpTransport::new(),
            machine,
            modbus,
            registry,
            liveness,
        )
    }
}

impl<T: RegisterTransport> MachinePoller<T> {
    /// Create a poller over an arbitrary transport.
    pub fn with_transport(
        transport: T,
        machine: MachineConfig,
        modbus: &ModbusConfig,
        registry: &MachineRegistry,
        liveness: Arc<LivenessBoard>,
    ) -> Self {
        let profile = machine.profile.profile();
        let (host, port) = machine.endpoint(modbus);
        let conn = ConnectionManager::new(
            transport,
            host,
            port,
            modbus.unit_id_for(profile),
            modbus.read_timeout(),
        );
        liveness.register(&machine.id);

        Self {
            state: registry.handle(&machine.id),
            window: modbus.window_for(profile),
            profile,
            conn,
            liveness,
            backoff: Backoff::new(modbus.poll_interval(), modbus.max_backoff()),
            consecutive_failures: 0,
            last_success: None,
            machine,
        }
    }

    pub fn machine(&self) -> &MachineConfig {
        &self.machine
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.conn
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Run the polling loop forever.
    pub async fn run(mut self) {
        info!(
            machine = %self.machine.id,
            endpoint = %self.conn.endpoint(),
            profile = self.profile.name,
            "Starting loom poller"
        );

        loop {
            let delay = self.tick().await;
            tokio::time::sleep(delay).await;
        }
    }

    /// One iteration including error bookkeeping; returns the delay before the next one.
    pub async fn tick(&mut self) -> Duration {
        let delay = match self.poll_once().await {
            Ok(outcome) => {
                self.log_outcome(&outcome);
                self.conn.clear_error();
                self.consecutive_failures = 0;
                self.last_success = Some(current_timestamp_millis());
                self.backoff.on_success()
            }
            Err(e) => {
                self.conn.record_error(e.to_string());
                self.conn.force_close();
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let delay = self.backoff.on_failure();
                warn!(
                    machine = %self.machine.id,
                    error = %e,
                    failures = self.consecutive_failures,
                    retry_in = ?delay,
                    "Poll failed"
                );
                delay
            }
        };

        self.liveness.record(MachineLiveness {
            machine: self.machine.id.clone(),
            link: self.conn.state(),
            consecutive_failures: self.consecutive_failures,
            last_error: self.conn.last_error().map(str::to_string),
            last_success: self.last_success,
        });

        delay
    }

    /// Connect if needed, read the window once, and apply it.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, PollError> {
        if !self.conn.is_connected() {
            self.conn.connect().await;
        }
        if !self.conn.is_connected() {
            let reason = self.conn.last_error().unwrap_or("Not connected");
            return Err(PollError::Connection(reason.to_string()));
        }

        let frame = self.conn.read_window(&self.window).await?;
        let transport = self.machine.transport;
        let fields = self.profile.fields(&frame, transport)?;

        if fields.is_sentinel() {
            debug!(
                machine = %self.machine.id,
                registers = ?frame.registers(),
                "Placeholder frame, skipping"
            );
            return Ok(PollOutcome::Sentinel);
        }

        let snapshot = self.profile.adjust(&frame, transport);
        let machine = StateMachine::new(self.profile, transport);
        let now = Utc::now();
        let update = self
            .state
            .update(|slot| machine.update(slot, &fields, snapshot, now));

        Ok(PollOutcome::Updated(update))
    }

    fn log_outcome(&self, outcome: &PollOutcome) {
        let PollOutcome::Updated(update) = outcome else {
            return;
        };
        let id = &self.machine.id;

        match update.transition {
            Transition::FirstRunning => info!(machine = %id, "First frame: running"),
            Transition::FirstStopped => info!(machine = %id, "First frame: stopped"),
            Transition::Stopped => info!(machine = %id, "Loom stopped"),
            Transition::Started => info!(machine = %id, "Loom restarted"),
            Transition::Unchanged => {}
        }

        if let Some(stop) = &update.finished_stop {
            info!(
                machine = %id,
                code = stop.status_code,
                category = %stop.category,
                duration_secs = stop.duration,
                "Stop recorded"
            );
        }

        if let Some((old, new)) = update.shift_change {
            info!(machine = %id, from = old, to = new, "Shift changed, counters reset");
        }
    }
}
