use crate::config::{ConnectionConfig, RegisterKind};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("timeout")]
    Timeout,
    #[error("communication error: {0}")]
    CommError(String),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("config error: {0}")]
    ConfigError(String),
}

impl TransportError {
    /// Whether the session itself is broken, as opposed to a single
    /// request being rejected or timing out.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, TransportError::CommError(_))
    }
}

/// Opens sessions to a controller.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn RegisterTransport>, TransportError>;
}

/// One open request/response session. Callers must not issue
/// overlapping requests; the protocol has no multiplexing.
#[async_trait]
pub trait RegisterTransport: Send {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn write_registers(&mut self, address: u16, words: &[u16]) -> Result<(), TransportError>;

    /// Best-effort close.
    async fn close(&mut self);
}
