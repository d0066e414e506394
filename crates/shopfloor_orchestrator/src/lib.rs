//! Shop-floor orchestrator: reads a TOML config file, selects the register
//! transport and assembles the runtime service.
//!
//! Supported modes:
//! - `sim`: in-memory `SimController` (tests, demos)
//! - `modbus_tcp`: `ModbusConnector` over TCP

use serde::Deserialize;
use shopfloor_hal::config::{ConnectionConfig, ControllerProfile, RegisterDescriptor};
use shopfloor_hal::sim::SimController;
use shopfloor_hal::traits::Connector;
use shopfloor_modbus::ModbusConnector;
use shopfloor_runtime::error::StoreError;
use shopfloor_runtime::model::{OrderId, ProductionOrder};
use shopfloor_runtime::service::ServiceSettings;
use shopfloor_runtime::store::{ConfigurationSource, MemoryStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Top-level config, deserialized from TOML.
#[derive(Debug, Deserialize)]
pub struct OrchestratorConfig {
    pub mode: ModeConfig,
    #[serde(default)]
    pub connection: Option<ConnectionConfig>,
    #[serde(default)]
    pub registers: Vec<RegisterDescriptor>,
    #[serde(default)]
    pub accounting: AccountingSection,
    #[serde(default)]
    pub sim: Option<SimSection>,
    #[serde(default)]
    pub orders: Vec<OrderSeed>,
}

#[derive(Debug, Deserialize)]
pub struct ModeConfig {
    #[serde(rename = "type")]
    pub mode_type: String,
}

#[derive(Debug, Deserialize)]
pub struct AccountingSection {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_duplicate_window")]
    pub duplicate_window_ms: u64,
    /// Order started automatically once the service is up.
    #[serde(default)]
    pub start_order: Option<OrderId>,
}

impl Default for AccountingSection {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            duplicate_window_ms: default_duplicate_window(),
            start_order: None,
        }
    }
}

fn default_channel_capacity() -> usize {
    256
}
fn default_duplicate_window() -> u64 {
    5000
}

/// Counter ramp driven by the binary in `sim` mode.
#[derive(Debug, Deserialize)]
pub struct SimSection {
    pub counter_address: u16,
    #[serde(default = "default_step")]
    pub step: u16,
    #[serde(default = "default_every")]
    pub every_ms: u64,
}

fn default_step() -> u16 {
    1
}
fn default_every() -> u64 {
    1000
}

#[derive(Debug, Deserialize)]
pub struct OrderSeed {
    pub id: OrderId,
    pub code: String,
    pub planned_quantity: i64,
}

/// Parsed mode selection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMode {
    Sim,
    ModbusTcp,
}

impl OrchestratorConfig {
    /// Parse from TOML string.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Parse from TOML file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OrchestratorError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content).map_err(|e| OrchestratorError::ConfigError(e.to_string()))
    }

    /// Resolve the mode from config.
    pub fn transport_mode(&self) -> Result<TransportMode, OrchestratorError> {
        match self.mode.mode_type.as_str() {
            "sim" => Ok(TransportMode::Sim),
            "modbus_tcp" => Ok(TransportMode::ModbusTcp),
            other => Err(OrchestratorError::ConfigError(format!(
                "unknown mode type: {other}"
            ))),
        }
    }

    /// The active controller profile, or `None` when the `[connection]`
    /// section is missing or marked inactive.
    pub fn profile(&self) -> Option<ControllerProfile> {
        self.connection
            .as_ref()
            .filter(|c| c.active)
            .map(|c| ControllerProfile::new(c.clone(), self.registers.clone()))
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            channel_capacity: self.accounting.channel_capacity,
            duplicate_window: Duration::from_millis(self.accounting.duplicate_window_ms),
        }
    }

    /// In-memory store seeded with the `[[orders]]` table.
    pub fn seeded_store(&self) -> MemoryStore {
        MemoryStore::with_orders(
            self.orders
                .iter()
                .map(|o| ProductionOrder::new(o.id, o.code.clone(), o.planned_quantity)),
        )
    }
}

/// Create the register transport for the configured mode. In `sim` mode the
/// returned controller handle lets the caller drive register values.
pub fn create_connector(
    config: &OrchestratorConfig,
) -> Result<(Arc<dyn Connector>, Option<SimController>), OrchestratorError> {
    match config.transport_mode()? {
        TransportMode::Sim => {
            let sim = SimController::new();
            Ok((Arc::new(sim.clone()), Some(sim)))
        }
        TransportMode::ModbusTcp => Ok((Arc::new(ModbusConnector::new()), None)),
    }
}

/// Configuration source backed by the TOML file; every call re-reads it so
/// operator edits are picked up on `reload`.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigurationSource for FileConfigSource {
    fn active_profile(&self) -> Result<Option<ControllerProfile>, StoreError> {
        OrchestratorConfig::from_file(&self.path)
            .map(|c| c.profile())
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("config error: {0}")]
    ConfigError(String),
    #[error("io error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopfloor_hal::config::{DataType, RegisterKind};

    #[test]
    fn parses_sim_config() {
        let toml = r#"
[mode]
type = "sim"
"#;
        let config = OrchestratorConfig::from_toml(toml).unwrap();
        assert_eq!(config.transport_mode().unwrap(), TransportMode::Sim);
        assert!(config.profile().is_none());
        assert_eq!(config.accounting.channel_capacity, 256);
        assert_eq!(
            config.service_settings().duplicate_window,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn parses_modbus_tcp_config() {
        let toml = r#"
[mode]
type = "modbus_tcp"

[connection]
host = "192.168.100.20"
port = 502
unit_id = 3
timeout_ms = 800
poll_interval_ms = 500

[[registers]]
id = 1
address = 0
name = "counter"
data_type = "u32"

[[registers]]
id = 2
address = 4
name = "speed"
kind = "input"
enabled = false

[[orders]]
id = 10
code = "OP-10"
planned_quantity = 1200
"#;
        let config = OrchestratorConfig::from_toml(toml).unwrap();
        assert_eq!(config.transport_mode().unwrap(), TransportMode::ModbusTcp);

        let profile = config.profile().unwrap();
        assert_eq!(profile.connection.unit_id, 3);
        assert_eq!(profile.connection.reconnect_interval_ms, 5000);
        assert_eq!(profile.registers[0].data_type, DataType::U32);
        assert_eq!(profile.registers[1].kind, RegisterKind::Input);
        assert_eq!(profile.enabled_registers().len(), 1);

        let store = config.seeded_store();
        use shopfloor_runtime::store::ProductionStore;
        assert_eq!(store.order(10).unwrap().unwrap().planned_quantity, 1200);
    }

    #[test]
    fn inactive_connection_has_no_profile() {
        let toml = r#"
[mode]
type = "modbus_tcp"

[connection]
host = "10.0.0.1"
active = false
"#;
        let config = OrchestratorConfig::from_toml(toml).unwrap();
        assert!(config.profile().is_none());
    }

    #[test]
    fn rejects_unknown_mode() {
        let toml = r#"
[mode]
type = "quantum"
"#;
        let config = OrchestratorConfig::from_toml(toml).unwrap();
        assert!(config.transport_mode().is_err());
        assert!(create_connector(&config).is_err());
    }

    #[test]
    fn sim_mode_returns_controller_handle() {
        let config = OrchestratorConfig::from_toml("[mode]\ntype = \"sim\"\n").unwrap();
        let (_connector, sim) = create_connector(&config).unwrap();
        assert!(sim.is_some());
    }

    #[test]
    fn parses_shipped_config_files() {
        let sim = OrchestratorConfig::from_file("../../config/shopfloor_sim.toml").unwrap();
        assert_eq!(sim.transport_mode().unwrap(), TransportMode::Sim);
        assert!(sim.profile().is_some());
        assert!(sim.sim.is_some());

        let tcp = OrchestratorConfig::from_file("../../config/shopfloor_modbus_tcp.toml").unwrap();
        assert_eq!(tcp.transport_mode().unwrap(), TransportMode::ModbusTcp);
    }

    #[test]
    fn file_source_reports_missing_file() {
        let source = FileConfigSource::new("/nonexistent/shopfloor.toml");
        assert!(matches!(
            source.active_profile(),
            Err(StoreError::Unavailable(_))
        ));
    }
}
