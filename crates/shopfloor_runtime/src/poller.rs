//! Sequential register polling and change detection.

use crate::connection::ConnectionManager;
use crate::events::ShopfloorEvent;
use crate::model::{RegisterReading, ValueChange};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use shopfloor_hal::config::{RegisterDescriptor, RegisterId};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Baseline state of one register since the last connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Observation {
    Unobserved,
    Observed(i64),
}

impl Observation {
    /// Record `value`, returning the previous value when it differs.
    /// The first observation only sets the baseline.
    pub fn observe(&mut self, value: i64) -> Option<i64> {
        match std::mem::replace(self, Observation::Observed(value)) {
            Observation::Observed(old) if old != value => Some(old),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterStatus {
    pub id: RegisterId,
    pub name: String,
    pub observation: Observation,
}

#[derive(Default)]
struct TableState {
    entries: BTreeMap<RegisterId, (String, Observation)>,
    last_value: Option<i64>,
}

/// Last observed value per register, shared between the poll task and
/// status queries.
#[derive(Default)]
pub struct RegisterTable {
    state: Mutex<TableState>,
}

impl RegisterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every baseline and track exactly `registers`.
    pub fn reset(&self, registers: &[RegisterDescriptor]) {
        let mut st = self.state.lock();
        st.entries = registers
            .iter()
            .map(|r| (r.id, (r.name.clone(), Observation::Unobserved)))
            .collect();
        st.last_value = None;
    }

    /// Store `value` as the register's latest reading and as the table's
    /// `last_value`, changed or not. Returns the previous value on change.
    pub fn record(&self, id: RegisterId, value: i64) -> Option<i64> {
        let mut st = self.state.lock();
        st.last_value = Some(value);
        st.entries
            .get_mut(&id)
            .and_then(|(_, obs)| obs.observe(value))
    }

    pub fn last_value(&self) -> Option<i64> {
        self.state.lock().last_value
    }

    pub fn snapshot(&self) -> Vec<RegisterStatus> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|(id, (name, obs))| RegisterStatus {
                id: *id,
                name: name.clone(),
                observation: *obs,
            })
            .collect()
    }
}

/// Reads every enabled register once per tick, one request at a time.
pub struct RegisterPoller {
    manager: ConnectionManager,
    registers: Vec<RegisterDescriptor>,
    interval: Duration,
    cancel: CancellationToken,
}

impl RegisterPoller {
    pub fn new(
        manager: ConnectionManager,
        registers: Vec<RegisterDescriptor>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager,
            registers,
            interval: interval.max(Duration::from_millis(1)),
            cancel,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::debug!(
            "poller started: {} registers every {:?}",
            self.registers.len(),
            self.interval
        );
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        log::debug!("poller stopped");
    }

    pub async fn tick(&self) {
        for reg in &self.registers {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.manager.read_value(reg).await {
                Ok(value) => self.observe(reg, value).await,
                Err(e) if e.is_transport_fault() => {
                    // The manager has already torn the session down.
                    log::warn!("poll of '{}' aborted: {e}", reg.name);
                    return;
                }
                Err(e) => log::warn!("skipping register '{}' this tick: {e}", reg.name),
            }
        }
    }

    async fn observe(&self, reg: &RegisterDescriptor, value: i64) {
        let Some(old_value) = self.manager.table().record(reg.id, value) else {
            return;
        };
        let now = Utc::now();
        let change = ValueChange {
            register_id: reg.id,
            register_name: reg.name.clone(),
            old_value,
            new_value: value,
            delta: value - old_value,
            observed_at: now,
        };
        log::debug!(
            "register '{}' changed {old_value} -> {value} (delta {})",
            reg.name,
            change.delta
        );

        let reading = RegisterReading {
            register_id: reg.id,
            register_name: reg.name.clone(),
            value,
            recorded_at: now,
        };
        if let Err(e) = self.manager.store().record_reading(&reading) {
            log::warn!("failed to persist reading of '{}': {e}", reg.name);
        }
        self.manager.sink().publish(ShopfloorEvent::ValueChanged(change.clone()));
        if self.manager.changes().send(change).await.is_err() {
            log::debug!("accounting channel closed; change on '{}' not delivered", reg.name);
        }
    }
}
