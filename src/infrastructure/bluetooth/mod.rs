//! Bluetooth Module
//!
//! Connection lifecycle of a single BLE button peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │   (single consumer of commands, callbacks and timers)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┬──────────────┐
//!         │             │              │              │
//!         ▼             ▼              ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Subscription │  │ Protocol │
//! │           │  │            │  │              │  │          │
//! │ - toggle  │  │ - GATT     │  │ - CCCD write │  │ - decode │
//! │ - timer   │  │   session  │  │              │  │          │
//! └───────────┘  └────────────┘  └──────────────┘  └──────────┘
//!                       │
//!                       ▼
//!               BleAdapter (WinRT / fake)
//! ```
//!
//! ## Modules
//!
//! - [`adapter`] - Platform seam and its callback events
//! - [`permissions`] - Runtime permission gate
//! - [`scanner`] - Time-bounded device discovery
//! - [`connection`] - GATT connection state machine
//! - [`subscription`] - Notification subscriptions
//! - [`protocol`] - GATT constants and notification decoding
//! - [`service`] - Main loop and its handle

pub mod adapter;
pub mod connection;
pub mod context;
pub mod fake;
pub mod permissions;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod sink;
pub mod subscription;
#[cfg(windows)]
pub mod winrt;

// Re-export main service for convenience
pub use service::{BluetoothService, LinkCommand, LinkHandle, LinkOptions};

use crate::domain::error::LinkResult;
use adapter::{AdapterEventSender, BleAdapter};

/// Bind to the platform Bluetooth stack
#[cfg(windows)]
pub async fn platform_adapter(events: AdapterEventSender) -> LinkResult<Box<dyn BleAdapter>> {
    let adapter = winrt::WinRtAdapter::new(events).await?;
    Ok(Box::new(adapter))
}

/// Bind to the platform Bluetooth stack
#[cfg(not(windows))]
pub async fn platform_adapter(_events: AdapterEventSender) -> LinkResult<Box<dyn BleAdapter>> {
    tracing::error!("No Bluetooth backend for this platform");
    Err(crate::domain::error::LinkError::AdapterUnavailable)
}
