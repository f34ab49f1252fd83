//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `dispatcher` - Gate command dispatch with ack correlation
//! - `monitor` - Device connection status monitoring
//! - `hub` - Realtime pub/sub for operator consoles
//! - `offline` - Durable offline transaction queue and replay

pub mod dispatcher;
pub mod hub;
pub mod monitor;
pub mod offline;

// Re-export commonly used types
pub use dispatcher::GateCommandDispatcher;
pub use hub::{CommandRouter, HubEvent, RealtimeHub};
pub use monitor::{ConnectionStatusMonitor, ProbeTarget};
pub use offline::{OfflineQueue, OfflineReplayer, TcpSyncSink};
