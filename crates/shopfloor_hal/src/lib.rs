//! Shared kernel for the shop-floor acquisition stack.
//!
//! Holds the controller/register configuration types, the transport seam
//! implemented by protocol backends, and an in-memory simulated controller.

pub mod config;
pub mod sim;
pub mod traits;
