//! Weaving-loom monitor over Modbus TCP.
//!
//! Each loom controller is polled on its own task. Every decoded register
//! window goes through a per-machine run/stop state machine, and the whole
//! registry is pushed to a central collector on a fixed tick.
//!
//! # Modules
//!
//! - [`profile`] - Vendor register layouts, stop classification, unit scaling
//! - [`state`] - Machine state and the transition applied on every frame
//! - [`connection`] - Field-device session with bounded connect and read
//! - [`poller`] - Per-machine poll loop with backoff
//! - [`registry`] - Shared per-machine state store
//! - [`publisher`] - Periodic push to the collector
//! - [`collector`] - HTTP client for the collector API
//! - [`liveness`] / [`http`] - Per-machine link status and the `/health` endpoint

pub mod collector;
pub mod config;
pub mod connection;
pub mod http;
pub mod liveness;
pub mod poller;
pub mod profile;
pub mod publisher;
pub mod registry;
pub mod state;

pub use collector::{CollectorError, HttpCollector, MachineListing};
pub use config::{ConfigError, MachineConfig, MonitorConfig, Overrides};
pub use connection::{ConnectionManager, ModbusTcpTransport, RegisterTransport, TransportError};
pub use http::HealthServer;
pub use liveness::LivenessBoard;
pub use poller::{Backoff, MachinePoller, PollError, PollOutcome};
pub use profile::{DeviceProfile, ProfileTag, StopCategory};
pub use publisher::{CollectorSink, PublishOutcome, Publisher};
pub use registry::{MachineHandle, MachineRegistry};
pub use state::{MachineState, StateMachine, StopEvent};
