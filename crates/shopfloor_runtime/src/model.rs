//! Production records and register observations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shopfloor_hal::config::RegisterId;

pub type OrderId = i64;
pub type UserId = i64;
pub type AppointmentId = i64;

/// Defect category attributed to losses entered on a manual appointment.
pub const MANUAL_DEFECT_CATEGORY: &str = "manual";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Programming,
    Active,
    Paused,
    Finished,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Finished | OrderStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionOrder {
    pub id: OrderId,
    pub code: String,
    pub status: OrderStatus,
    pub planned_quantity: i64,
    pub produced_quantity: i64,
    pub rejected_quantity: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProductionOrder {
    pub fn new(id: OrderId, code: impl Into<String>, planned_quantity: i64) -> Self {
        Self {
            id,
            code: code.into(),
            status: OrderStatus::Programming,
            planned_quantity,
            produced_quantity: 0,
            rejected_quantity: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Credit produced and rejected pieces. Returns `true` only for the call
    /// that moves an ACTIVE order to FINISHED. Credits on an order in any
    /// other status accrue but leave status and end time untouched; a
    /// PAUSED order that already met its plan finishes on the first credit
    /// after it is resumed.
    pub fn accrue(&mut self, produced: i64, rejected: i64, now: DateTime<Utc>) -> bool {
        self.produced_quantity += produced;
        self.rejected_quantity += rejected;
        if self.status != OrderStatus::Active || self.produced_quantity < self.planned_quantity {
            return false;
        }
        self.status = OrderStatus::Finished;
        self.finished_at = Some(now);
        true
    }
}

/// An appointment before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAppointment {
    pub order_id: OrderId,
    pub user_id: Option<UserId>,
    pub quantity: i64,
    pub rejected_quantity: i64,
    pub automatic: bool,
    pub source_counter_value: Option<i64>,
    pub notes: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

impl NewAppointment {
    pub fn automatic(order_id: OrderId, delta: i64, counter: i64, now: DateTime<Utc>) -> Self {
        Self {
            order_id,
            user_id: None,
            quantity: delta,
            rejected_quantity: 0,
            automatic: true,
            source_counter_value: Some(counter),
            notes: None,
            started_at: None,
            ended_at: None,
            recorded_at: now,
        }
    }
}

/// Immutable production record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionAppointment {
    pub id: AppointmentId,
    #[serde(flatten)]
    pub record: NewAppointment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDefect {
    pub order_id: OrderId,
    pub category: String,
    pub quantity: i64,
    pub recorded_at: DateTime<Utc>,
}

impl NewDefect {
    pub fn manual(order_id: OrderId, quantity: i64, now: DateTime<Utc>) -> Self {
        Self {
            order_id,
            category: MANUAL_DEFECT_CATEGORY.to_string(),
            quantity,
            recorded_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefectRecord {
    pub id: i64,
    pub appointment_id: AppointmentId,
    #[serde(flatten)]
    pub record: NewDefect,
}

/// Durable snapshot of a register value, written only when it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReading {
    pub register_id: RegisterId,
    pub register_name: String,
    pub value: i64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueChange {
    pub register_id: RegisterId,
    pub register_name: String,
    pub old_value: i64,
    pub new_value: i64,
    pub delta: i64,
    pub observed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accrue_finishes_exactly_once() {
        let mut order = ProductionOrder::new(1, "OP-1", 10);
        order.status = OrderStatus::Active;
        let t0 = Utc::now();

        assert!(!order.accrue(6, 0, t0));
        assert!(order.accrue(4, 0, t0));
        assert_eq!(order.status, OrderStatus::Finished);
        assert_eq!(order.finished_at, Some(t0));

        let later = t0 + chrono::Duration::seconds(30);
        assert!(!order.accrue(3, 0, later));
        assert_eq!(order.produced_quantity, 13);
        assert_eq!(order.finished_at, Some(t0));
    }

    #[test]
    fn only_active_orders_finish() {
        let mut order = ProductionOrder::new(1, "OP-1", 5);
        assert!(!order.accrue(8, 0, Utc::now()));
        assert_eq!(order.status, OrderStatus::Programming);
        assert!(order.finished_at.is_none());

        order.status = OrderStatus::Paused;
        assert!(!order.accrue(1, 0, Utc::now()));
        assert_eq!(order.status, OrderStatus::Paused);

        order.status = OrderStatus::Active;
        assert!(order.accrue(1, 0, Utc::now()));
        assert_eq!(order.produced_quantity, 10);
    }

    #[test]
    fn cancelled_order_never_finishes() {
        let mut order = ProductionOrder::new(1, "OP-1", 1);
        order.status = OrderStatus::Cancelled;
        assert!(!order.accrue(5, 1, Utc::now()));
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.rejected_quantity, 1);
    }

    #[test]
    fn appointment_serializes_flat() {
        let appt = ProductionAppointment {
            id: 7,
            record: NewAppointment::automatic(1, 5, 15, Utc::now()),
        };
        let json = serde_json::to_value(&appt).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["quantity"], 5);
        assert_eq!(json["source_counter_value"], 15);
        assert_eq!(json["automatic"], true);
    }
}
