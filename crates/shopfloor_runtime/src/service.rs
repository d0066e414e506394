//! Wires the connection manager, poller, registry and accounting engine
//! around injected collaborators.

use crate::accounting::{ManualAppointmentRequest, ProductionAccountingEngine};
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::error::{AccountingError, StoreError};
use crate::events::{EventSink, ProductionUpdate};
use crate::model::{OrderId, ProductionOrder};
use crate::registry::ActiveOrderRegistry;
use crate::store::{ConfigurationSource, ProductionStore};
use shopfloor_hal::traits::Connector;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    /// Capacity of the poller -> accounting channel.
    pub channel_capacity: usize,
    pub duplicate_window: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            duplicate_window: crate::accounting::DEFAULT_DUPLICATE_WINDOW,
        }
    }
}

pub struct ShopfloorService {
    manager: ConnectionManager,
    engine: Arc<ProductionAccountingEngine>,
    source: Arc<dyn ConfigurationSource>,
    accounting: JoinHandle<()>,
}

impl ShopfloorService {
    /// Build the service and spawn the accounting task. Must be called from
    /// within a tokio runtime. Nothing connects until `start`.
    pub fn new(
        connector: Arc<dyn Connector>,
        source: Arc<dyn ConfigurationSource>,
        store: Arc<dyn ProductionStore>,
        sink: Arc<dyn EventSink>,
        settings: ServiceSettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
        let engine = Arc::new(ProductionAccountingEngine::with_duplicate_window(
            Arc::clone(&store),
            Arc::new(ActiveOrderRegistry::new()),
            Arc::clone(&sink),
            settings.duplicate_window,
        ));
        let accounting = Arc::clone(&engine).spawn(rx);
        let manager = ConnectionManager::new(connector, store, sink, tx);
        Self {
            manager,
            engine,
            source,
            accounting,
        }
    }

    /// Load the active profile and connect. With no active profile the
    /// service stays idle until `reload`.
    pub async fn start(&self) -> Result<(), StoreError> {
        self.reload().await
    }

    /// Re-read the configuration source and restart the connection.
    pub async fn reload(&self) -> Result<(), StoreError> {
        let profile = self.source.active_profile()?;
        match &profile {
            Some(p) => log::info!(
                "applying controller profile {} ({} registers enabled)",
                p.connection.endpoint(),
                p.enabled_registers().len()
            ),
            None => log::info!("no active controller profile"),
        }
        self.manager.reconnect_with_new_config(profile).await;
        Ok(())
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<ActiveOrderRegistry> {
        self.engine.registry()
    }

    pub fn engine(&self) -> &Arc<ProductionAccountingEngine> {
        &self.engine
    }

    pub fn status(&self) -> ConnectionStatus {
        self.manager.status()
    }

    pub fn create_manual_appointment(
        &self,
        req: ManualAppointmentRequest,
    ) -> Result<ProductionUpdate, AccountingError> {
        self.engine.create_manual_appointment(req)
    }

    pub fn start_order(&self, order_id: OrderId) -> Result<ProductionOrder, AccountingError> {
        self.engine.start_order(order_id)
    }

    pub fn pause_order(&self, order_id: OrderId) -> Result<ProductionOrder, AccountingError> {
        self.engine.pause_order(order_id)
    }

    pub fn resume_order(&self, order_id: OrderId) -> Result<ProductionOrder, AccountingError> {
        self.engine.resume_order(order_id)
    }

    /// Disconnect, then let accounting drain the changes already queued.
    pub async fn shutdown(self) {
        self.manager.disconnect().await;
        let Self {
            manager,
            mut accounting,
            ..
        } = self;
        drop(manager);
        if tokio::time::timeout(SHUTDOWN_DRAIN, &mut accounting)
            .await
            .is_err()
        {
            log::warn!("accounting did not drain within {SHUTDOWN_DRAIN:?}; aborting");
            accounting.abort();
        }
    }
}
