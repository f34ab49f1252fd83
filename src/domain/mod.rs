//! Domain models - core types for gates, links, commands, and events
//!
//! This module contains the canonical data types used throughout the system:
//! - `GateId` - entry/exit gate identifier
//! - `LinkState` - serial link lifecycle state
//! - `Command` / `CommandKind` - outbound command vocabulary
//! - `PeripheralEvent` - typed events decoded from the wire
//! - `DeviceStatus` - per-gate device health snapshot
//! - error taxonomy (`LinkError`, `DispatchError`, `HubError`)

pub mod types;
