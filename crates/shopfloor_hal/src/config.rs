use serde::{Deserialize, Serialize};

/// Connection parameters for one controller.
///
/// Treated as an immutable snapshot: a changed profile restarts the
/// connection instead of mutating a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_port() -> u16 {
    502
}
fn default_unit_id() -> u8 {
    1
}
fn default_timeout() -> u64 {
    1000
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_reconnect_interval() -> u64 {
    5000
}
fn default_active() -> bool {
    true
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id: default_unit_id(),
            timeout_ms: default_timeout(),
            poll_interval_ms: default_poll_interval(),
            reconnect_interval_ms: default_reconnect_interval(),
            active: default_active(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub type RegisterId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    #[default]
    Holding,
    Input,
}

/// Interpretation of the raw 16-bit words behind a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    U16,
    I16,
    U32,
    I32,
}

impl DataType {
    /// Number of consecutive 16-bit registers the value occupies.
    pub fn word_count(self) -> u16 {
        match self {
            DataType::U16 | DataType::I16 => 1,
            DataType::U32 | DataType::I32 => 2,
        }
    }

    /// Decode words (high word first) into a signed value.
    pub fn decode(self, words: &[u16]) -> Option<i64> {
        match (self, words) {
            (DataType::U16, [w, ..]) => Some(i64::from(*w)),
            (DataType::I16, [w, ..]) => Some(i64::from(*w as i16)),
            (DataType::U32, [hi, lo, ..]) => Some(i64::from(join_words(*hi, *lo))),
            (DataType::I32, [hi, lo, ..]) => Some(i64::from(join_words(*hi, *lo) as i32)),
            _ => None,
        }
    }

    /// Encode a value into words (high word first), `None` if it does not fit.
    pub fn encode(self, value: i64) -> Option<Vec<u16>> {
        match self {
            DataType::U16 => u16::try_from(value).ok().map(|v| vec![v]),
            DataType::I16 => i16::try_from(value).ok().map(|v| vec![v as u16]),
            DataType::U32 => u32::try_from(value).ok().map(split_words),
            DataType::I32 => i32::try_from(value).ok().map(|v| split_words(v as u32)),
        }
    }
}

fn join_words(hi: u16, lo: u16) -> u32 {
    (u32::from(hi) << 16) | u32::from(lo)
}

fn split_words(v: u32) -> Vec<u16> {
    vec![(v >> 16) as u16, (v & 0xFFFF) as u16]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    pub id: RegisterId,
    pub address: u16,
    pub name: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub kind: RegisterKind,
    #[serde(default = "default_active")]
    pub enabled: bool,
}

impl RegisterDescriptor {
    pub fn new(id: RegisterId, address: u16, name: impl Into<String>) -> Self {
        Self {
            id,
            address,
            name: name.into(),
            data_type: DataType::default(),
            kind: RegisterKind::default(),
            enabled: true,
        }
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }
}

/// One controller connection plus the registers polled on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerProfile {
    pub connection: ConnectionConfig,
    pub registers: Vec<RegisterDescriptor>,
}

impl ControllerProfile {
    pub fn new(connection: ConnectionConfig, registers: Vec<RegisterDescriptor>) -> Self {
        Self {
            connection,
            registers,
        }
    }

    pub fn enabled_registers(&self) -> Vec<RegisterDescriptor> {
        self.registers.iter().filter(|r| r.enabled).cloned().collect()
    }
}
