use crate::config::{ConnectionConfig, RegisterKind};
use crate::traits::{Connector, RegisterTransport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct SimState {
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
    refuse_connect: bool,
    failing: HashSet<u16>,
    hang_reads: bool,
    connect_delay: Option<Duration>,
    link_epoch: u64,
    connects: u32,
    accepted: u32,
    closes: u32,
    reads: u32,
}

/// In-memory controller. Cloned handles share the same register bank, so a
/// test can keep one handle to drive values while the runtime holds another
/// as its `Connector`.
#[derive(Clone, Default)]
pub struct SimController {
    state: Arc<Mutex<SimState>>,
}

impl SimController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_holding(&self, address: u16, value: u16) {
        self.state.lock().holding.insert(address, value);
    }

    pub fn set_input(&self, address: u16, value: u16) {
        self.state.lock().input.insert(address, value);
    }

    /// Store a 32-bit value across `address` (high word) and `address + 1`.
    pub fn set_holding_u32(&self, address: u16, value: u32) {
        let mut st = self.state.lock();
        st.holding.insert(address, (value >> 16) as u16);
        st.holding.insert(address.wrapping_add(1), (value & 0xFFFF) as u16);
    }

    pub fn holding(&self, address: u16) -> Option<u16> {
        self.state.lock().holding.get(&address).copied()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connect = refuse;
    }

    /// Reads of `address` answer with a controller exception.
    pub fn fail_register(&self, address: u16, fail: bool) {
        let mut st = self.state.lock();
        if fail {
            st.failing.insert(address);
        } else {
            st.failing.remove(&address);
        }
    }

    /// Reads never answer until cleared.
    pub fn hang_reads(&self, hang: bool) {
        self.state.lock().hang_reads = hang;
    }

    /// Hold every connect for `delay` before answering.
    pub fn delay_connects(&self, delay: Option<Duration>) {
        self.state.lock().connect_delay = delay;
    }

    /// Break every open session; later requests on them fail with a
    /// communication error.
    pub fn drop_link(&self) {
        self.state.lock().link_epoch += 1;
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().connects
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> u32 {
        let st = self.state.lock();
        st.accepted.saturating_sub(st.closes)
    }

    pub fn read_count(&self) -> u32 {
        self.state.lock().reads
    }
}

#[async_trait]
impl Connector for SimController {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn RegisterTransport>, TransportError> {
        let delay = self.state.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut st = self.state.lock();
        st.connects += 1;
        if st.refuse_connect {
            return Err(TransportError::CommError(format!(
                "connection refused by {}",
                config.endpoint()
            )));
        }
        st.accepted += 1;
        log::debug!("sim controller accepted session for unit {}", config.unit_id);
        Ok(Box::new(SimTransport {
            controller: self.clone(),
            epoch: st.link_epoch,
        }))
    }
}

struct SimTransport {
    controller: SimController,
    epoch: u64,
}

impl SimTransport {
    fn check_link(&self) -> Result<(), TransportError> {
        if self.controller.state.lock().link_epoch != self.epoch {
            return Err(TransportError::CommError("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RegisterTransport for SimTransport {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.check_link()?;
        let hang = self.controller.state.lock().hang_reads;
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let mut st = self.controller.state.lock();
        st.reads += 1;
        if st.failing.contains(&address) {
            return Err(TransportError::ProtocolError(format!(
                "illegal data address {address}"
            )));
        }
        let bank = match kind {
            RegisterKind::Holding => &st.holding,
            RegisterKind::Input => &st.input,
        };
        Ok((0..count)
            .map(|i| bank.get(&address.wrapping_add(i)).copied().unwrap_or(0))
            .collect())
    }

    async fn write_registers(&mut self, address: u16, words: &[u16]) -> Result<(), TransportError> {
        self.check_link()?;
        let mut st = self.controller.state.lock();
        for (i, w) in words.iter().enumerate() {
            st.holding.insert(address.wrapping_add(i as u16), *w);
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.controller.state.lock().closes += 1;
    }
}
