//! Lifecycle of a BLE button peripheral: scan, connect, discover, subscribe
//! and decode notifications into outbound events.

pub mod domain;
pub mod infrastructure;
