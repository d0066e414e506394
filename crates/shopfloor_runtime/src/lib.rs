//! Shop-floor acquisition runtime.
//!
//! A [`ConnectionManager`](connection::ConnectionManager) keeps one session
//! to a controller and runs a [`RegisterPoller`](poller::RegisterPoller)
//! while connected. Counter changes flow over a bounded channel to the
//! [`ProductionAccountingEngine`](accounting::ProductionAccountingEngine),
//! which credits the order held in the
//! [`ActiveOrderRegistry`](registry::ActiveOrderRegistry).

pub mod accounting;
pub mod connection;
pub mod error;
pub mod events;
pub mod model;
pub mod poller;
pub mod registry;
pub mod service;
pub mod store;
