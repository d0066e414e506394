//! Controller session lifecycle and serialized register I/O.
//!
//! `DISCONNECTED -> CONNECTING -> CONNECTED`; any transport fault or failed
//! connect returns to `DISCONNECTED` and arms one reconnect timer. The poller
//! only runs while `CONNECTED` and is stopped before the next attempt.

use crate::error::RegisterError;
use crate::events::{EventSink, ShopfloorEvent};
use crate::model::ValueChange;
use crate::poller::{RegisterPoller, RegisterStatus, RegisterTable};
use crate::store::ProductionStore;
use parking_lot::Mutex;
use serde::Serialize;
use shopfloor_hal::config::{ControllerProfile, DataType, RegisterDescriptor, RegisterId, RegisterKind};
use shopfloor_hal::traits::{Connector, RegisterTransport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub endpoint: Option<String>,
    /// Most recent value read from any register since the last connect.
    pub last_value: Option<i64>,
    pub reconnect_pending: bool,
    pub registers: Vec<RegisterStatus>,
}

struct Session {
    epoch: u64,
    transport: Box<dyn RegisterTransport>,
}

struct PollerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Lifecycle {
    state: ConnectionState,
    profile: Option<ControllerProfile>,
    /// Bumped on every teardown; work started under an older epoch is stale.
    epoch: u64,
    poller: Option<PollerHandle>,
    reconnect: Option<JoinHandle<()>>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    store: Arc<dyn ProductionStore>,
    sink: Arc<dyn EventSink>,
    changes: mpsc::Sender<ValueChange>,
    table: RegisterTable,
    lifecycle: Mutex<Lifecycle>,
    session: tokio::sync::Mutex<Option<Session>>,
}

/// Owns the single session to one controller. Cheap to clone; clones share
/// the same session.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<dyn ProductionStore>,
        sink: Arc<dyn EventSink>,
        changes: mpsc::Sender<ValueChange>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                store,
                sink,
                changes,
                table: RegisterTable::new(),
                lifecycle: Mutex::new(Lifecycle {
                    state: ConnectionState::Disconnected,
                    profile: None,
                    epoch: 0,
                    poller: None,
                    reconnect: None,
                }),
                session: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub(crate) fn table(&self) -> &RegisterTable {
        &self.shared.table
    }

    pub(crate) fn store(&self) -> &dyn ProductionStore {
        self.shared.store.as_ref()
    }

    pub(crate) fn sink(&self) -> &dyn EventSink {
        self.shared.sink.as_ref()
    }

    pub(crate) fn changes(&self) -> &mpsc::Sender<ValueChange> {
        &self.shared.changes
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.lock().state
    }

    pub fn profile(&self) -> Option<ControllerProfile> {
        self.shared.lifecycle.lock().profile.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        let (state, endpoint, reconnect_pending) = {
            let lc = self.shared.lifecycle.lock();
            (
                lc.state,
                lc.profile.as_ref().map(|p| p.connection.endpoint()),
                lc.reconnect.is_some(),
            )
        };
        ConnectionStatus {
            state,
            connected: state == ConnectionState::Connected,
            endpoint,
            last_value: self.shared.table.last_value(),
            reconnect_pending,
            registers: self.shared.table.snapshot(),
        }
    }

    /// Connect with `profile`. A no-op while connecting or connected.
    /// Failures never surface here: they leave the manager disconnected
    /// with a reconnect armed.
    pub async fn connect(&self, profile: ControllerProfile) {
        {
            let mut lc = self.shared.lifecycle.lock();
            if lc.state != ConnectionState::Disconnected {
                log::debug!("connect ignored: already {:?}", lc.state);
                return;
            }
            lc.profile = Some(profile);
        }
        self.attempt(None).await;
    }

    /// Stop polling, cancel any pending reconnect and close the session.
    pub async fn disconnect(&self) {
        let was = {
            let mut lc = self.shared.lifecycle.lock();
            lc.epoch += 1;
            if let Some(timer) = lc.reconnect.take() {
                timer.abort();
            }
            std::mem::replace(&mut lc.state, ConnectionState::Disconnected)
        };
        self.stop_poller().await;
        if let Some(mut session) = self.shared.session.lock().await.take() {
            session.transport.close().await;
        }
        if was != ConnectionState::Disconnected {
            log::info!("disconnected from controller");
            self.shared.sink.publish(ShopfloorEvent::Disconnected);
        }
    }

    /// Full restart with a new profile. `None` leaves the manager idle.
    pub async fn reconnect_with_new_config(&self, profile: Option<ControllerProfile>) {
        self.disconnect().await;
        self.shared.lifecycle.lock().profile = profile;
        self.attempt(None).await;
    }

    async fn attempt(&self, expected_epoch: Option<u64>) {
        let (config, registers, epoch) = {
            let mut lc = self.shared.lifecycle.lock();
            if lc.state != ConnectionState::Disconnected
                || expected_epoch.is_some_and(|e| e != lc.epoch)
            {
                return;
            }
            let Some(profile) = lc.profile.as_ref() else {
                log::info!("no controller profile configured; staying idle");
                return;
            };
            if !profile.connection.active {
                log::info!(
                    "controller profile {} is inactive; staying idle",
                    profile.connection.endpoint()
                );
                return;
            }
            let config = profile.connection.clone();
            let registers = profile.enabled_registers();
            if let Some(timer) = lc.reconnect.take() {
                timer.abort();
            }
            lc.state = ConnectionState::Connecting;
            (config, registers, lc.epoch)
        };
        self.stop_poller().await;

        let endpoint = config.endpoint();
        log::info!("connecting to {endpoint} (unit {})", config.unit_id);
        let limit = Duration::from_millis(config.timeout_ms);
        let result = match tokio::time::timeout(limit, self.shared.connector.connect(&config)).await
        {
            Ok(r) => r,
            Err(_) => Err(TransportError::Timeout),
        };
        let transport = match result {
            Ok(t) => t,
            Err(e) => {
                self.connect_failed(epoch, &endpoint, &e);
                return;
            }
        };

        let mut slot = self.shared.session.lock().await;
        let started = {
            let mut lc = self.shared.lifecycle.lock();
            if lc.epoch != epoch {
                false
            } else {
                lc.state = ConnectionState::Connected;
                self.shared.table.reset(&registers);
                let cancel = CancellationToken::new();
                let poller = RegisterPoller::new(
                    self.clone(),
                    registers,
                    Duration::from_millis(config.poll_interval_ms),
                    cancel.clone(),
                );
                lc.poller = Some(PollerHandle {
                    cancel,
                    task: tokio::spawn(poller.run()),
                });
                true
            }
        };
        if !started {
            drop(slot);
            log::info!("discarding session to {endpoint}: disconnected while connecting");
            let mut stale = transport;
            stale.close().await;
            return;
        }
        if let Some(mut old) = slot.replace(Session { epoch, transport }) {
            old.transport.close().await;
        }
        drop(slot);
        log::info!("connected to {endpoint}");
        self.shared
            .sink
            .publish(ShopfloorEvent::Connected { endpoint });
    }

    fn connect_failed(&self, epoch: u64, endpoint: &str, err: &TransportError) {
        {
            let mut lc = self.shared.lifecycle.lock();
            if lc.epoch != epoch {
                return;
            }
            lc.state = ConnectionState::Disconnected;
        }
        log::warn!("connect to {endpoint} failed: {err}");
        self.shared.sink.publish(ShopfloorEvent::Error {
            message: format!("connect to {endpoint} failed: {err}"),
        });
        self.shared.sink.publish(ShopfloorEvent::Disconnected);
        self.schedule_reconnect(epoch);
    }

    /// Tear down after a transport fault on the session opened under `epoch`.
    fn fail_session(&self, epoch: u64, err: &TransportError) {
        let next = {
            let mut lc = self.shared.lifecycle.lock();
            if lc.epoch != epoch || lc.state != ConnectionState::Connected {
                return;
            }
            lc.epoch += 1;
            lc.state = ConnectionState::Disconnected;
            if let Some(poller) = &lc.poller {
                poller.cancel.cancel();
            }
            lc.epoch
        };
        log::warn!("controller session lost: {err}");
        self.shared.sink.publish(ShopfloorEvent::Error {
            message: format!("controller session lost: {err}"),
        });
        self.shared.sink.publish(ShopfloorEvent::Disconnected);
        self.schedule_reconnect(next);
    }

    /// Arm the reconnect timer unless one is already pending.
    fn schedule_reconnect(&self, epoch: u64) {
        let mut lc = self.shared.lifecycle.lock();
        if lc.epoch != epoch || lc.reconnect.is_some() {
            return;
        }
        let Some(delay) = lc
            .profile
            .as_ref()
            .map(|p| Duration::from_millis(p.connection.reconnect_interval_ms))
        else {
            return;
        };
        log::info!("reconnecting in {delay:?}");
        let manager = self.clone();
        lc.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut lc = manager.shared.lifecycle.lock();
                if lc.epoch != epoch {
                    return;
                }
                let _own = lc.reconnect.take();
            }
            manager.attempt(Some(epoch)).await;
        }));
    }

    pub fn reconnect_pending(&self) -> bool {
        self.shared.lifecycle.lock().reconnect.is_some()
    }

    async fn stop_poller(&self) {
        let handle = self.shared.lifecycle.lock().poller.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                log::warn!("poller task ended abnormally: {e}");
            }
        }
    }

    fn op_timeout(&self) -> Duration {
        let ms = self
            .shared
            .lifecycle
            .lock()
            .profile
            .as_ref()
            .map_or(DEFAULT_TIMEOUT_MS, |p| p.connection.timeout_ms);
        Duration::from_millis(ms)
    }

    /// Close the session and tear down if `res` is a transport fault.
    async fn settle<T>(
        &self,
        mut slot: MutexGuard<'_, Option<Session>>,
        epoch: u64,
        res: Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        if let Err(e) = &res {
            if e.is_transport_fault() {
                if let Some(mut broken) = slot.take() {
                    broken.transport.close().await;
                }
                drop(slot);
                self.fail_session(epoch, e);
            }
        }
        res
    }

    /// A timed-out request may still be answered later, and that reply would
    /// be taken as the answer to the next request. Swap in a fresh transport
    /// so the session keeps its epoch and the caller still sees `Timeout`.
    /// If the controller cannot be reached again the session is failed.
    async fn reopen_after_timeout<T>(&self, session: &mut Session) -> Result<T, TransportError> {
        let Some(config) = self.profile().map(|p| p.connection) else {
            return Err(TransportError::NotConnected);
        };
        session.transport.close().await;
        let limit = Duration::from_millis(config.timeout_ms);
        let reopened = match tokio::time::timeout(limit, self.shared.connector.connect(&config)).await
        {
            Ok(r) => r,
            Err(_) => Err(TransportError::Timeout),
        };
        match reopened {
            Ok(transport) => {
                log::debug!("request to {} timed out; transport reopened", config.endpoint());
                session.transport = transport;
                Err(TransportError::Timeout)
            }
            Err(e) => Err(TransportError::CommError(format!(
                "reopen after timeout failed: {e}"
            ))),
        }
    }

    async fn read_words(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let limit = self.op_timeout();
        let mut slot = self.shared.session.lock().await;
        let session = slot.as_mut().ok_or(TransportError::NotConnected)?;
        let epoch = session.epoch;
        let outcome = tokio::time::timeout(
            limit,
            session.transport.read_registers(kind, address, count),
        )
        .await;
        let res = match outcome {
            Ok(r) => r,
            Err(_) => self.reopen_after_timeout(session).await,
        };
        self.settle(slot, epoch, res).await
    }

    async fn write_words(&self, address: u16, words: &[u16]) -> Result<(), TransportError> {
        let limit = self.op_timeout();
        let mut slot = self.shared.session.lock().await;
        let session = slot.as_mut().ok_or(TransportError::NotConnected)?;
        let epoch = session.epoch;
        let outcome =
            tokio::time::timeout(limit, session.transport.write_registers(address, words)).await;
        let res = match outcome {
            Ok(r) => r,
            Err(_) => self.reopen_after_timeout(session).await,
        };
        self.settle(slot, epoch, res).await
    }

    async fn read_typed(
        &self,
        kind: RegisterKind,
        address: u16,
        data_type: DataType,
    ) -> Result<i64, RegisterError> {
        let words = self
            .read_words(kind, address, data_type.word_count())
            .await
            .map_err(|source| RegisterError::Read { address, source })?;
        data_type.decode(&words).ok_or_else(|| RegisterError::Read {
            address,
            source: TransportError::ProtocolError(format!("short reply: {} words", words.len())),
        })
    }

    /// Diagnostic read of one holding register as an unsigned word.
    pub async fn read_register(&self, address: u16) -> Result<i64, RegisterError> {
        self.read_typed(RegisterKind::Holding, address, DataType::U16)
            .await
    }

    pub async fn read_value(&self, reg: &RegisterDescriptor) -> Result<i64, RegisterError> {
        self.read_typed(reg.kind, reg.address, reg.data_type).await
    }

    /// Diagnostic write of one holding register.
    pub async fn write_register(&self, address: u16, value: u16) -> Result<(), RegisterError> {
        self.write_words(address, &[value])
            .await
            .map_err(|source| RegisterError::Write { address, source })
    }

    pub async fn write_value(
        &self,
        reg: &RegisterDescriptor,
        value: i64,
    ) -> Result<(), RegisterError> {
        if reg.kind == RegisterKind::Input {
            return Err(RegisterError::ReadOnly(reg.address));
        }
        let words = reg
            .data_type
            .encode(value)
            .ok_or(RegisterError::OutOfRange {
                address: reg.address,
                value,
                data_type: reg.data_type,
            })?;
        self.write_words(reg.address, &words)
            .await
            .map_err(|source| RegisterError::Write {
                address: reg.address,
                source,
            })
    }

    /// Operator counter reset: write zero to a configured register.
    pub async fn reset_counter(&self, register_id: RegisterId) -> Result<(), RegisterError> {
        let reg = self
            .profile()
            .and_then(|p| p.registers.into_iter().find(|r| r.id == register_id))
            .ok_or(RegisterError::UnknownRegister(register_id))?;
        log::info!("resetting counter '{}' to zero", reg.name);
        self.write_value(&reg, 0).await
    }
}
