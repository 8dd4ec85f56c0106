//! Field-device sessions.
//!
//! [`RegisterTransport`] is the black-box register-read client; the Modbus
//! framing lives in `tokio-modbus` behind [`ModbusTcpTransport`].
//! [`ConnectionManager`] owns one transport per machine and adds the
//! connect/backoff bookkeeping and the bounded timeouts.

use std::future::Future;
use std::time::Duration;

use loomwatch_common::LinkState;
use tokio_modbus::client::{Context, Reader};
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::poller::PollError;
use crate::profile::{Frame, RegisterWindow};

/// Errors reported by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Link error: {0}")]
    Link(String),
    #[error("Exception: {0}")]
    Exception(String),
    #[error("Not connected")]
    NotConnected,
}

/// Minimal register-read client.
pub trait RegisterTransport: Send {
    /// Open a session to `host:port`.
    fn connect(
        &mut self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Address subsequent requests to `unit_id`.
    fn set_unit(&mut self, unit_id: u8);

    /// Read `count` holding registers starting at the 0-based `address`.
    fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, TransportError>> + Send;

    /// Drop the session, half-open or not.
    fn close(&mut self);
}

/// Modbus TCP transport backed by `tokio-modbus`.
#[derive(Default)]
pub struct ModbusTcpTransport {
    ctx: Option<Context>,
}

impl ModbusTcpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegisterTransport for ModbusTcpTransport {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| TransportError::Link(format!("No address for {}:{}", host, port)))?;

        let ctx = tcp::connect(addr).await?;
        self.ctx = Some(ctx);
        Ok(())
    }

    fn set_unit(&mut self, unit_id: u8) {
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.set_slave(Slave(unit_id));
        }
    }

    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        let registers = ctx
            .read_holding_registers(address, count)
            .await
            .map_err(|e| TransportError::Link(e.to_string()))?
            .map_err(|e| TransportError::Exception(format!("{:?}", e)))?;
        Ok(registers)
    }

    fn close(&mut self) {
        // Dropping the context closes the socket
        self.ctx = None;
    }
}

/// One persistent session to a loom controller.
#[derive(Debug)]
pub struct ConnectionManager<T> {
    transport: T,
    host: String,
    port: u16,
    unit_id: u8,
    timeout: Duration,
    state: LinkState,
    last_error: Option<String>,
}

impl<T: RegisterTransport> ConnectionManager<T> {
    pub fn new(
        transport: T,
        host: impl Into<String>,
        port: u16,
        unit_id: u8,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            host: host.into(),
            port,
            unit_id,
            timeout,
            state: LinkState::Disconnected,
            last_error: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Record an error raised outside the manager.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Open the session unless one is open or being opened.
    ///
    /// Never fails: the outcome shows up in [`state`](Self::state) and
    /// [`last_error`](Self::last_error).
    pub async fn connect(&mut self) {
        if matches!(self.state, LinkState::Connected | LinkState::Connecting) {
            return;
        }

        self.state = LinkState::Connecting;
        debug!(endpoint = %self.endpoint(), "Connecting");

        let result = tokio::time::timeout(
            self.timeout,
            self.transport.connect(&self.host, self.port),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                self.transport.set_unit(self.unit_id);
                self.state = LinkState::Connected;
                self.last_error = None;
                info!(endpoint = %self.endpoint(), unit_id = self.unit_id, "Connected");
            }
            Ok(Err(e)) => self.fail(e.to_string()),
            Err(_) => self.fail(format!("Connection timeout after {:?}", self.timeout)),
        }
    }

    fn fail(&mut self, message: String) {
        warn!(endpoint = %self.endpoint(), error = %message, "Connect failed");
        self.last_error = Some(message);
        self.force_close();
    }

    /// Drop the session and go back to `Disconnected`.
    pub fn force_close(&mut self) {
        self.transport.close();
        self.state = LinkState::Disconnected;
    }

    /// One bounded read of the whole register window.
    pub async fn read_window(&mut self, window: &RegisterWindow) -> Result<Frame, PollError> {
        if !self.is_connected() {
            return Err(PollError::Connection("Not connected".to_string()));
        }

        let start = window.wire_start();
        let result = tokio::time::timeout(
            self.timeout,
            self.transport.read_holding_registers(start, window.count),
        )
        .await
        .map_err(|_| PollError::ReadTimeout(self.timeout))?;

        match result {
            Ok(registers) if registers.is_empty() => {
                Err(PollError::ReadProtocol("Empty response".to_string()))
            }
            Ok(registers) => Ok(Frame::new(start, registers)),
            Err(TransportError::Exception(e)) => Err(PollError::ReadProtocol(e)),
            Err(e) => Err(PollError::Connection(e.to_string())),
        }
    }
}
