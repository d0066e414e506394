//! Notifications published to the external event sink.

use crate::model::{DefectRecord, ProductionAppointment, ProductionOrder, ValueChange};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductionUpdate {
    pub appointment: ProductionAppointment,
    pub order: ProductionOrder,
    pub delta: i64,
    pub defect: Option<DefectRecord>,
    /// Set when an identical manual appointment was recorded moments before.
    /// The appointment is still credited.
    pub duplicate_suspected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ShopfloorEvent {
    Connected { endpoint: String },
    Disconnected,
    Error { message: String },
    ValueChanged(ValueChange),
    ProductionUpdate(ProductionUpdate),
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: ShopfloorEvent);
}

/// Fan-out to any number of subscribers. Publishing with no subscriber
/// attached drops the event.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ShopfloorEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShopfloorEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: ShopfloorEvent) {
        if self.tx.send(event).is_err() {
            log::trace!("event dropped: no subscribers");
        }
    }
}
