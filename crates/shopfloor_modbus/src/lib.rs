//! Modbus TCP backend for the shop-floor register transport.
//!
//! Implements `Connector` / `RegisterTransport` over tokio-modbus. Holding
//! registers are read with FC 0x03 and written with FC 0x06 / 0x10, input
//! registers are read with FC 0x04.

use async_trait::async_trait;
use shopfloor_hal::config::{ConnectionConfig, RegisterKind};
use shopfloor_hal::traits::{Connector, RegisterTransport, TransportError};
use std::net::SocketAddr;
use tokio_modbus::client::{tcp, Client as _, Context, Reader, Writer};
use tokio_modbus::slave::Slave;

/// Opens one Modbus TCP session per `connect` call, bound to the profile's
/// unit id.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusConnector;

impl ModbusConnector {
    pub fn new() -> Self {
        Self
    }
}

async fn resolve(config: &ConnectionConfig) -> Result<SocketAddr, TransportError> {
    let mut addrs = tokio::net::lookup_host((config.host.as_str(), config.port))
        .await
        .map_err(|e| TransportError::ConfigError(format!("{}: {e}", config.endpoint())))?;
    addrs.next().ok_or_else(|| {
        TransportError::ConfigError(format!("{}: no address resolved", config.endpoint()))
    })
}

#[async_trait]
impl Connector for ModbusConnector {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn RegisterTransport>, TransportError> {
        let addr = resolve(config).await?;
        log::info!(
            "Connecting to Modbus TCP slave at {addr} (unit {})",
            config.unit_id
        );
        let ctx = tcp::connect_slave(addr, Slave(config.unit_id))
            .await
            .map_err(|e| TransportError::CommError(format!("connect {addr}: {e}")))?;
        Ok(Box::new(ModbusTransport { ctx, addr }))
    }
}

/// An open Modbus TCP session.
pub struct ModbusTransport {
    ctx: Context,
    addr: SocketAddr,
}

fn map_transport(op: &str, e: tokio_modbus::Error) -> TransportError {
    match e {
        tokio_modbus::Error::Transport(io) => TransportError::CommError(format!("{op}: {io}")),
        tokio_modbus::Error::Protocol(p) => TransportError::ProtocolError(format!("{op}: {p}")),
    }
}

fn map_exception(op: &str, code: tokio_modbus::ExceptionCode) -> TransportError {
    TransportError::ProtocolError(format!("{op}: Modbus exception {code:?}"))
}

#[async_trait]
impl RegisterTransport for ModbusTransport {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let (op, res) = match kind {
            RegisterKind::Holding => (
                "read_holding_registers",
                self.ctx.read_holding_registers(address, count).await,
            ),
            RegisterKind::Input => (
                "read_input_registers",
                self.ctx.read_input_registers(address, count).await,
            ),
        };
        let words = res
            .map_err(|e| map_transport(op, e))?
            .map_err(|code| map_exception(op, code))?;
        if words.len() < count as usize {
            return Err(TransportError::ProtocolError(format!(
                "{op}: expected {count} registers, got {}",
                words.len()
            )));
        }
        log::debug!("{op} @{address} x{count} -> {words:?}");
        Ok(words)
    }

    async fn write_registers(&mut self, address: u16, words: &[u16]) -> Result<(), TransportError> {
        match words {
            [] => Ok(()),
            [word] => self
                .ctx
                .write_single_register(address, *word)
                .await
                .map_err(|e| map_transport("write_single_register", e))?
                .map_err(|code| map_exception("write_single_register", code)),
            _ => self
                .ctx
                .write_multiple_registers(address, words)
                .await
                .map_err(|e| map_transport("write_multiple_registers", e))?
                .map_err(|code| map_exception("write_multiple_registers", code)),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ctx.disconnect().await {
            log::debug!("closing Modbus session to {}: {e}", self.addr);
        }
    }
}
