use crate::model::OrderId;
use shopfloor_hal::config::{DataType, RegisterId};
use shopfloor_hal::traits::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("read of register {address} failed: {source}")]
    Read {
        address: u16,
        #[source]
        source: TransportError,
    },
    #[error("write of register {address} failed: {source}")]
    Write {
        address: u16,
        #[source]
        source: TransportError,
    },
    #[error("unknown register id {0}")]
    UnknownRegister(RegisterId),
    #[error("register {0} is read-only")]
    ReadOnly(u16),
    #[error("value {value} does not fit register {address} as {data_type:?}")]
    OutOfRange {
        address: u16,
        value: i64,
        data_type: DataType,
    },
}

impl RegisterError {
    pub fn is_transport_fault(&self) -> bool {
        match self {
            RegisterError::Read { source, .. } | RegisterError::Write { source, .. } => {
                source.is_transport_fault()
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected write: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum AccountingError {
    #[error("production order {0} not found")]
    OrderNotFound(OrderId),
    #[error("invalid quantity: produced {quantity}, rejected {rejected}")]
    InvalidQuantity { quantity: i64, rejected: i64 },
    #[error("appointment ends before it starts")]
    InvalidInterval,
    #[error("order {order_id}: {reason}")]
    InvalidTransition { order_id: OrderId, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}
