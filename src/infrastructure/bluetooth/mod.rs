//! Bluetooth Module
//!
//! BLE session management: discovery, a single connection, GATT access
//! and notification delivery with a polling fallback.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   BleSessionService                      │
//! │  (Main coordinator - public API for the application)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Channel  │
//! │           │  │            │  │          │
//! │ - rounds  │  │ - states   │  │ - read   │
//! │ - registry│  │ - pairing  │  │ - write  │
//! │           │  │ - catalog  │  │ - notify/│
//! │           │  │            │  │   poll   │
//! └─────┬─────┘  └─────┬──────┘  └────┬─────┘
//!       │              │              │
//!       └──────────────┼──────────────┘
//!                      ▼
//!          ┌──────────────────────┐
//!          │  RadioLink/RadioPeer │
//!          │  (backend | mock)    │
//!          └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`radio`] - the seam to the platform radio stack
//! - [`backend`] - btleplug-backed production radio
//! - [`mock`] - scriptable radio for tests
//! - [`scanner`] - device discovery and the registry
//! - [`connection`] - session state machine, pairing, service catalog
//! - [`channel`] - characteristic I/O and subscriptions
//! - [`service`] - main service coordinator

pub mod backend;
pub mod channel;
pub mod connection;
pub mod mock;
pub mod radio;
pub mod scanner;
pub mod service;

// Re-export main service for convenience
pub use service::BleSessionService;
