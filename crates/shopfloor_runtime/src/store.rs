//! Persistence and configuration seams, with in-memory implementations.

use crate::error::StoreError;
use crate::model::{
    AppointmentId, DefectRecord, NewAppointment, NewDefect, OrderId, ProductionAppointment,
    ProductionOrder, RegisterReading, UserId,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shopfloor_hal::config::ControllerProfile;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Everything one accounting step writes. Stores apply it all-or-nothing.
#[derive(Debug, Clone)]
pub struct AccountingBatch {
    /// Order snapshot after the credit has been applied.
    pub order: ProductionOrder,
    pub appointment: NewAppointment,
    pub defect: Option<NewDefect>,
}

#[derive(Debug, Clone)]
pub struct CommittedBatch {
    pub order: ProductionOrder,
    pub appointment: ProductionAppointment,
    pub defect: Option<DefectRecord>,
}

pub trait ProductionStore: Send + Sync {
    fn order(&self, id: OrderId) -> Result<Option<ProductionOrder>, StoreError>;

    fn save_order(&self, order: &ProductionOrder) -> Result<(), StoreError>;

    /// Whether a manual appointment with the same order, user and quantity
    /// was recorded at or after `since`.
    fn has_recent_manual(
        &self,
        order_id: OrderId,
        user_id: UserId,
        quantity: i64,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    fn commit(&self, batch: AccountingBatch) -> Result<CommittedBatch, StoreError>;

    fn record_reading(&self, reading: &RegisterReading) -> Result<(), StoreError>;
}

/// Supplies the active controller profile, if any.
pub trait ConfigurationSource: Send + Sync {
    fn active_profile(&self) -> Result<Option<ControllerProfile>, StoreError>;
}

/// Fixed profile held in memory; `replace` simulates an operator edit.
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    profile: Mutex<Option<ControllerProfile>>,
}

impl StaticConfigSource {
    pub fn new(profile: Option<ControllerProfile>) -> Self {
        Self {
            profile: Mutex::new(profile),
        }
    }

    pub fn replace(&self, profile: Option<ControllerProfile>) {
        *self.profile.lock() = profile;
    }
}

impl ConfigurationSource for StaticConfigSource {
    fn active_profile(&self) -> Result<Option<ControllerProfile>, StoreError> {
        Ok(self
            .profile
            .lock()
            .clone()
            .filter(|p| p.connection.active))
    }
}

#[derive(Default)]
struct MemoryState {
    orders: BTreeMap<OrderId, ProductionOrder>,
    appointments: Vec<ProductionAppointment>,
    defects: Vec<DefectRecord>,
    readings: Vec<RegisterReading>,
    next_appointment_id: AppointmentId,
    next_defect_id: i64,
}

/// Process-local store. The fault switches make a step of `commit` fail so
/// callers can observe that nothing from the batch was kept.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_commits: AtomicBool,
    fail_defects: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_orders(orders: impl IntoIterator<Item = ProductionOrder>) -> Self {
        let store = Self::new();
        for order in orders {
            store.insert_order(order);
        }
        store
    }

    pub fn insert_order(&self, order: ProductionOrder) {
        self.state.lock().orders.insert(order.id, order);
    }

    /// Insert an already-persisted appointment as is, bypassing order updates.
    pub fn insert_appointment(&self, record: NewAppointment) -> AppointmentId {
        let mut st = self.state.lock();
        st.next_appointment_id += 1;
        let id = st.next_appointment_id;
        st.appointments.push(ProductionAppointment { id, record });
        id
    }

    pub fn appointments(&self) -> Vec<ProductionAppointment> {
        self.state.lock().appointments.clone()
    }

    pub fn defects(&self) -> Vec<DefectRecord> {
        self.state.lock().defects.clone()
    }

    pub fn readings(&self) -> Vec<RegisterReading> {
        self.state.lock().readings.clone()
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn fail_defects(&self, fail: bool) {
        self.fail_defects.store(fail, Ordering::SeqCst);
    }
}

impl ProductionStore for MemoryStore {
    fn order(&self, id: OrderId) -> Result<Option<ProductionOrder>, StoreError> {
        Ok(self.state.lock().orders.get(&id).cloned())
    }

    fn save_order(&self, order: &ProductionOrder) -> Result<(), StoreError> {
        let mut st = self.state.lock();
        match st.orders.get_mut(&order.id) {
            Some(slot) => {
                *slot = order.clone();
                Ok(())
            }
            None => Err(StoreError::Rejected(format!("order {} does not exist", order.id))),
        }
    }

    fn has_recent_manual(
        &self,
        order_id: OrderId,
        user_id: UserId,
        quantity: i64,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.state.lock().appointments.iter().any(|a| {
            let r = &a.record;
            !r.automatic
                && r.order_id == order_id
                && r.user_id == Some(user_id)
                && r.quantity == quantity
                && r.recorded_at >= since
        }))
    }

    fn commit(&self, batch: AccountingBatch) -> Result<CommittedBatch, StoreError> {
        let mut st = self.state.lock();

        // Stage every row first; nothing touches `st` until all steps pass.
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("appointment table".into()));
        }
        if !st.orders.contains_key(&batch.order.id) {
            return Err(StoreError::Rejected(format!(
                "order {} does not exist",
                batch.order.id
            )));
        }
        let appointment = ProductionAppointment {
            id: st.next_appointment_id + 1,
            record: batch.appointment,
        };
        let defect = match batch.defect {
            Some(_) if self.fail_defects.load(Ordering::SeqCst) => {
                return Err(StoreError::Unavailable("defect table".into()));
            }
            Some(record) => Some(DefectRecord {
                id: st.next_defect_id + 1,
                appointment_id: appointment.id,
                record,
            }),
            None => None,
        };

        st.next_appointment_id = appointment.id;
        st.appointments.push(appointment.clone());
        if let Some(d) = &defect {
            st.next_defect_id = d.id;
            st.defects.push(d.clone());
        }
        st.orders.insert(batch.order.id, batch.order.clone());

        Ok(CommittedBatch {
            order: batch.order,
            appointment,
            defect,
        })
    }

    fn record_reading(&self, reading: &RegisterReading) -> Result<(), StoreError> {
        self.state.lock().readings.push(reading.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MANUAL_DEFECT_CATEGORY;
    use shopfloor_hal::config::ConnectionConfig;

    fn batch(with_defect: bool) -> AccountingBatch {
        let now = Utc::now();
        let mut order = ProductionOrder::new(1, "OP-1", 100);
        order.produced_quantity = 5;
        let mut appointment = NewAppointment::automatic(1, 5, 5, now);
        appointment.automatic = false;
        AccountingBatch {
            order,
            appointment,
            defect: with_defect.then(|| NewDefect::manual(1, 3, now)),
        }
    }

    #[test]
    fn commit_links_defect_to_appointment() {
        let store = MemoryStore::with_orders([ProductionOrder::new(1, "OP-1", 100)]);
        let done = store.commit(batch(true)).unwrap();
        let defect = done.defect.unwrap();
        assert_eq!(defect.appointment_id, done.appointment.id);
        assert_eq!(defect.record.category, MANUAL_DEFECT_CATEGORY);
        assert_eq!(store.order(1).unwrap().unwrap().produced_quantity, 5);
    }

    #[test]
    fn failed_defect_step_keeps_nothing() {
        let store = MemoryStore::with_orders([ProductionOrder::new(1, "OP-1", 100)]);
        store.fail_defects(true);
        assert!(store.commit(batch(true)).is_err());
        assert!(store.appointments().is_empty());
        assert!(store.defects().is_empty());
        assert_eq!(store.order(1).unwrap().unwrap().produced_quantity, 0);

        store.fail_defects(false);
        let done = store.commit(batch(true)).unwrap();
        assert_eq!(done.appointment.id, 1);
    }

    #[test]
    fn commit_rejects_unknown_order() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.commit(batch(false)),
            Err(StoreError::Rejected(_))
        ));
    }

    #[test]
    fn static_source_hides_inactive_profile() {
        let mut conn = ConnectionConfig::new("10.0.0.5", 502);
        conn.active = false;
        let source = StaticConfigSource::new(Some(ControllerProfile::new(conn, Vec::new())));
        assert_eq!(source.active_profile().unwrap(), None);

        source.replace(Some(ControllerProfile::new(
            ConnectionConfig::new("10.0.0.5", 502),
            Vec::new(),
        )));
        assert!(source.active_profile().unwrap().is_some());
    }
}
