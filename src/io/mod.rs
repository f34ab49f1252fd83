//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `protocol` - Line codec for the peripheral controller wire format
//! - `serial_link` - Serial transport with framing and auto-reconnect
//! - `console` - TCP console for operator clients (JSON lines)
//! - `http_api` - HTTP command/status/offline API plus /metrics

pub mod console;
pub mod http_api;
pub mod protocol;
pub mod serial_link;

// Re-export commonly used types
pub use console::ConsoleListener;
pub use http_api::{start_api_server, ApiContext};
pub use serial_link::{CommandPort, SerialLink};
