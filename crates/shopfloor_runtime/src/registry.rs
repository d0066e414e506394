use crate::model::OrderId;
use parking_lot::Mutex;

/// Which production order, if any, receives automatic appointments.
///
/// Business rules about who may become active live with the caller; `set`
/// replaces whatever was there.
#[derive(Debug, Default)]
pub struct ActiveOrderRegistry {
    slot: Mutex<Option<OrderId>>,
}

impl ActiveOrderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previously active order.
    pub fn set(&self, order_id: OrderId) -> Option<OrderId> {
        self.slot.lock().replace(order_id)
    }

    pub fn clear(&self) -> Option<OrderId> {
        self.slot.lock().take()
    }

    pub fn get(&self) -> Option<OrderId> {
        *self.slot.lock()
    }

    /// Run `f` with the active order while holding the registry, so no
    /// `set`/`clear` lands between reading the id and acting on it.
    pub fn with_active<R>(&self, f: impl FnOnce(Option<OrderId>) -> R) -> R {
        let guard = self.slot.lock();
        f(*guard)
    }

    /// Like `with_active`, with mutable access to the slot.
    pub fn update<R>(&self, f: impl FnOnce(&mut Option<OrderId>) -> R) -> R {
        let mut guard = self.slot.lock();
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_replaces_and_clear_empties() {
        let reg = ActiveOrderRegistry::new();
        assert_eq!(reg.get(), None);
        assert_eq!(reg.set(1), None);
        assert_eq!(reg.set(2), Some(1));
        assert_eq!(reg.get(), Some(2));
        assert_eq!(reg.clear(), Some(2));
        assert_eq!(reg.get(), None);
    }

    #[test]
    fn concurrent_writers_leave_a_single_value() {
        let reg = Arc::new(ActiveOrderRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        reg.set(i);
                        reg.with_active(|id| assert!(id.is_some()));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(matches!(reg.get(), Some(id) if (0..8).contains(&id)));
    }
}
