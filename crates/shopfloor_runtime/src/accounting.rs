//! Converts counter deltas and operator entries into production appointments.
//!
//! Both paths, and order start/pause/resume, run under one order lock so a
//! read-modify-write of an order is never interleaved with another.

use crate::error::AccountingError;
use crate::events::{EventSink, ProductionUpdate, ShopfloorEvent};
use crate::model::{
    NewAppointment, NewDefect, OrderId, OrderStatus, ProductionOrder, UserId, ValueChange,
};
use crate::registry::ActiveOrderRegistry;
use crate::store::{AccountingBatch, CommittedBatch, ProductionStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualAppointmentRequest {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub quantity: i64,
    pub rejected_quantity: i64,
    pub notes: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ManualAppointmentRequest {
    pub fn new(order_id: OrderId, user_id: UserId, quantity: i64, rejected_quantity: i64) -> Self {
        Self {
            order_id,
            user_id,
            quantity,
            rejected_quantity,
            notes: None,
            started_at: None,
            ended_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NoActiveOrder,
    NonPositiveValue,
    NonPositiveDelta,
    OrderMissing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutomaticOutcome {
    Ignored(IgnoreReason),
    Recorded(ProductionUpdate),
}

pub struct ProductionAccountingEngine {
    store: Arc<dyn ProductionStore>,
    registry: Arc<ActiveOrderRegistry>,
    sink: Arc<dyn EventSink>,
    order_lock: Mutex<()>,
    duplicate_window: chrono::Duration,
}

impl ProductionAccountingEngine {
    pub fn new(
        store: Arc<dyn ProductionStore>,
        registry: Arc<ActiveOrderRegistry>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_duplicate_window(store, registry, sink, DEFAULT_DUPLICATE_WINDOW)
    }

    pub fn with_duplicate_window(
        store: Arc<dyn ProductionStore>,
        registry: Arc<ActiveOrderRegistry>,
        sink: Arc<dyn EventSink>,
        window: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            sink,
            order_lock: Mutex::new(()),
            duplicate_window: chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::seconds(5)),
        }
    }

    pub fn registry(&self) -> &Arc<ActiveOrderRegistry> {
        &self.registry
    }

    /// Consume value changes until every sender is dropped.
    pub fn spawn(self: Arc<Self>, mut changes: mpsc::Receiver<ValueChange>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                match self.on_value_changed(&change) {
                    Ok(AutomaticOutcome::Recorded(update)) => log::debug!(
                        "order {} credited {} from '{}'",
                        update.order.id,
                        update.delta,
                        change.register_name
                    ),
                    Ok(AutomaticOutcome::Ignored(reason)) => log::debug!(
                        "change on '{}' ignored: {reason:?}",
                        change.register_name
                    ),
                    Err(e) => {
                        log::warn!("automatic appointment failed: {e}");
                        self.sink.publish(ShopfloorEvent::Error {
                            message: format!("automatic appointment failed: {e}"),
                        });
                    }
                }
            }
            log::debug!("value-change channel closed; accounting stopped");
        })
    }

    /// Automatic path. Holds the registry for the whole step so the active
    /// order cannot change between reading it and crediting it. The order
    /// stops being active once it finishes.
    pub fn on_value_changed(
        &self,
        change: &ValueChange,
    ) -> Result<AutomaticOutcome, AccountingError> {
        self.registry.update(|slot| {
            let Some(order_id) = *slot else {
                return Ok(AutomaticOutcome::Ignored(IgnoreReason::NoActiveOrder));
            };
            if change.new_value <= 0 {
                return Ok(AutomaticOutcome::Ignored(IgnoreReason::NonPositiveValue));
            }
            if change.delta <= 0 {
                return Ok(AutomaticOutcome::Ignored(IgnoreReason::NonPositiveDelta));
            }

            let _guard = self.order_lock.lock();
            let Some(mut order) = self.store.order(order_id)? else {
                log::warn!("active order {order_id} not found; delta {} dropped", change.delta);
                return Ok(AutomaticOutcome::Ignored(IgnoreReason::OrderMissing));
            };
            let now = Utc::now();
            let finished = order.accrue(change.delta, 0, now);
            let committed = self.store.commit(AccountingBatch {
                order,
                appointment: NewAppointment::automatic(order_id, change.delta, change.new_value, now),
                defect: None,
            })?;
            if finished {
                *slot = None;
                log_finished(&committed.order);
            }
            Ok(AutomaticOutcome::Recorded(
                self.publish(committed, change.delta, false),
            ))
        })
    }

    /// Manual path. An identical entry within the duplicate window is still
    /// recorded, only flagged.
    pub fn create_manual_appointment(
        &self,
        req: ManualAppointmentRequest,
    ) -> Result<ProductionUpdate, AccountingError> {
        if req.quantity < 0
            || req.rejected_quantity < 0
            || (req.quantity == 0 && req.rejected_quantity == 0)
        {
            return Err(AccountingError::InvalidQuantity {
                quantity: req.quantity,
                rejected: req.rejected_quantity,
            });
        }
        if let (Some(start), Some(end)) = (req.started_at, req.ended_at) {
            if end < start {
                return Err(AccountingError::InvalidInterval);
            }
        }

        self.registry.update(|slot| self.record_manual(slot, req))
    }

    fn record_manual(
        &self,
        slot: &mut Option<OrderId>,
        req: ManualAppointmentRequest,
    ) -> Result<ProductionUpdate, AccountingError> {
        let _guard = self.order_lock.lock();
        let mut order = self
            .store
            .order(req.order_id)?
            .ok_or(AccountingError::OrderNotFound(req.order_id))?;

        let now = Utc::now();
        // TODO: confirm with production whether a repeat inside the window
        // should be rejected instead of flagged.
        let duplicate = self.store.has_recent_manual(
            req.order_id,
            req.user_id,
            req.quantity,
            now - self.duplicate_window,
        )?;
        if duplicate {
            log::warn!(
                "manual appointment for order {} by user {} ({} pcs) repeats one from the last {}s; recording anyway",
                req.order_id,
                req.user_id,
                req.quantity,
                self.duplicate_window.num_seconds()
            );
        }

        let finished = order.accrue(req.quantity, req.rejected_quantity, now);
        let defect = (req.rejected_quantity > 0)
            .then(|| NewDefect::manual(req.order_id, req.rejected_quantity, now));
        let committed = self.store.commit(AccountingBatch {
            order,
            appointment: NewAppointment {
                order_id: req.order_id,
                user_id: Some(req.user_id),
                quantity: req.quantity,
                rejected_quantity: req.rejected_quantity,
                automatic: false,
                source_counter_value: None,
                notes: req.notes,
                started_at: req.started_at,
                ended_at: req.ended_at,
                recorded_at: now,
            },
            defect,
        })?;
        if finished {
            if *slot == Some(req.order_id) {
                *slot = None;
            }
            log_finished(&committed.order);
        }
        Ok(self.publish(committed, req.quantity, duplicate))
    }

    /// Make `order_id` the target of automatic accounting.
    /// Accepts PROGRAMMING or PAUSED orders and refuses while another order
    /// is active.
    pub fn start_order(&self, order_id: OrderId) -> Result<ProductionOrder, AccountingError> {
        self.registry.update(|slot| {
            if let Some(other) = *slot {
                if other != order_id {
                    return Err(AccountingError::InvalidTransition {
                        order_id,
                        reason: format!("order {other} is already active"),
                    });
                }
            }
            let order = self.transition(order_id, |status| {
                matches!(status, OrderStatus::Programming | OrderStatus::Paused)
            })?;
            *slot = Some(order_id);
            log::info!("order {order_id} started; automatic accounting enabled");
            Ok(order)
        })
    }

    pub fn resume_order(&self, order_id: OrderId) -> Result<ProductionOrder, AccountingError> {
        let current = self.load(order_id)?;
        if current.status != OrderStatus::Paused {
            return Err(AccountingError::InvalidTransition {
                order_id,
                reason: format!("cannot resume from {:?}", current.status),
            });
        }
        self.start_order(order_id)
    }

    pub fn pause_order(&self, order_id: OrderId) -> Result<ProductionOrder, AccountingError> {
        self.registry.update(|slot| {
            let _guard = self.order_lock.lock();
            let mut order = self.load(order_id)?;
            if order.status != OrderStatus::Active {
                return Err(AccountingError::InvalidTransition {
                    order_id,
                    reason: format!("cannot pause from {:?}", order.status),
                });
            }
            order.status = OrderStatus::Paused;
            self.store.save_order(&order)?;
            if *slot == Some(order_id) {
                *slot = None;
            }
            log::info!("order {order_id} paused; automatic accounting disabled");
            Ok(order)
        })
    }

    fn transition(
        &self,
        order_id: OrderId,
        allowed: impl Fn(OrderStatus) -> bool,
    ) -> Result<ProductionOrder, AccountingError> {
        let _guard = self.order_lock.lock();
        let mut order = self.load(order_id)?;
        if order.status == OrderStatus::Active {
            return Ok(order);
        }
        if !allowed(order.status) {
            return Err(AccountingError::InvalidTransition {
                order_id,
                reason: format!("cannot start from {:?}", order.status),
            });
        }
        order.status = OrderStatus::Active;
        order.started_at.get_or_insert_with(Utc::now);
        self.store.save_order(&order)?;
        Ok(order)
    }

    fn load(&self, order_id: OrderId) -> Result<ProductionOrder, AccountingError> {
        self.store
            .order(order_id)?
            .ok_or(AccountingError::OrderNotFound(order_id))
    }

    fn publish(&self, committed: CommittedBatch, delta: i64, duplicate: bool) -> ProductionUpdate {
        let update = ProductionUpdate {
            appointment: committed.appointment,
            order: committed.order,
            delta,
            defect: committed.defect,
            duplicate_suspected: duplicate,
        };
        self.sink
            .publish(ShopfloorEvent::ProductionUpdate(update.clone()));
        update
    }
}

fn log_finished(order: &ProductionOrder) {
    log::info!(
        "order {} reached {}/{} pieces; finished",
        order.id,
        order.produced_quantity,
        order.planned_quantity
    );
}
