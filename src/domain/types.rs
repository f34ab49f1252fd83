//! Shared types for the gate control subsystem

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Current epoch time in milliseconds
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Gate identifier - the facility has exactly two gates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateId {
    Entry,
    Exit,
}

impl GateId {
    pub const ALL: [GateId; 2] = [GateId::Entry, GateId::Exit];

    pub fn as_str(&self) -> &'static str {
        match self {
            GateId::Entry => "entry",
            GateId::Exit => "exit",
        }
    }
}

impl std::fmt::Display for GateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown gate id")]
pub struct UnknownGate;

impl FromStr for GateId {
    type Err = UnknownGate;

    /// Case-insensitive; the web layer sends whatever casing its users typed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "entry" => Ok(GateId::Entry),
            "exit" => Ok(GateId::Exit),
            _ => Err(UnknownGate),
        }
    }
}

/// Serial link state, owned exclusively by the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Faulted => "faulted",
        }
    }
}

/// Outbound command vocabulary - a closed set, anything else is rejected
/// before it can touch hardware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    OpenGate,
    CloseGate,
    Status,
    CaptureImage,
    Print(String),
}

impl CommandKind {
    /// Parse a command name (case-insensitive) plus optional payload.
    /// Returns `None` for anything outside the vocabulary, or for a
    /// print command with no payload.
    pub fn parse(command: &str, payload: Option<&str>) -> Option<CommandKind> {
        match command.to_ascii_uppercase().as_str() {
            "OPEN_GATE" => Some(CommandKind::OpenGate),
            "CLOSE_GATE" => Some(CommandKind::CloseGate),
            "STATUS" => Some(CommandKind::Status),
            "CAPTURE_IMAGE" => Some(CommandKind::CaptureImage),
            "PRINT" => payload.map(|p| CommandKind::Print(p.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::OpenGate => "open_gate",
            CommandKind::CloseGate => "close_gate",
            CommandKind::Status => "status",
            CommandKind::CaptureImage => "capture_image",
            CommandKind::Print(_) => "print",
        }
    }

    /// The reply shape that acknowledges this command. The firmware does not
    /// echo correlation tokens, so correlation is by gate + expected shape;
    /// the single-in-flight-per-gate rule keeps that unambiguous.
    /// Capture and print have no wire-level reply - a successful write is
    /// their acknowledgment.
    pub fn expected_reply(&self) -> Option<PeripheralEventKind> {
        match self {
            CommandKind::OpenGate => Some(PeripheralEventKind::GateOpened),
            CommandKind::CloseGate => Some(PeripheralEventKind::GateClosed),
            CommandKind::Status => Some(PeripheralEventKind::StatusReply),
            CommandKind::CaptureImage | CommandKind::Print(_) => None,
        }
    }
}

/// A dispatched command with its correlation token. Short-lived: discarded
/// once acknowledged or timed out.
#[derive(Debug, Clone)]
pub struct Command {
    pub kind: CommandKind,
    pub gate: GateId,
    pub issued_at_ms: u64,
    pub correlation_id: Uuid,
}

impl Command {
    pub fn new(gate: GateId, kind: CommandKind) -> Self {
        Self { kind, gate, issued_at_ms: epoch_ms(), correlation_id: Uuid::now_v7() }
    }
}

/// Typed event decoded from one peripheral line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeripheralEventKind {
    VehicleDetected,
    ButtonPressed,
    GateOpened,
    GateClosed,
    StatusReply,
}

impl PeripheralEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeripheralEventKind::VehicleDetected => "vehicle_detected",
            PeripheralEventKind::ButtonPressed => "button_pressed",
            PeripheralEventKind::GateOpened => "gate_opened",
            PeripheralEventKind::GateClosed => "gate_closed",
            PeripheralEventKind::StatusReply => "status_reply",
        }
    }
}

/// One decoded peripheral message. The gate is stamped by the link that
/// received the line, never inferred from the payload.
#[derive(Debug, Clone, Serialize)]
pub struct PeripheralEvent {
    pub kind: PeripheralEventKind,
    pub gate: GateId,
    pub payload: String,
    pub ts_ms: u64,
}

/// Snapshot of one gate's device health. `link_state` carries the full
/// lifecycle state so consoles can tell "reconnecting" from "down";
/// `link_online` is its Connected-only projection for command validation.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DeviceStatus {
    pub gate: GateId,
    pub camera_online: bool,
    pub printer_online: bool,
    pub link_state: LinkState,
    pub link_online: bool,
    pub last_activity_ms: u64,
    pub last_probe_ms: u64,
}

impl DeviceStatus {
    /// Everything-offline placeholder used before the first probe completes
    pub fn offline(gate: GateId) -> Self {
        Self {
            gate,
            camera_online: false,
            printer_online: false,
            link_state: LinkState::Disconnected,
            link_online: false,
            last_activity_ms: 0,
            last_probe_ms: 0,
        }
    }
}

/// Transport-level failures surfaced by the serial link
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link not connected")]
    NotConnected,
    #[error("write timed out")]
    WriteTimeout,
    #[error("serial i/o: {0}")]
    Io(String),
}

/// Dispatch failure taxonomy.
///
/// `Timeout` is deliberately distinct from `TransportError`: the write
/// succeeded but no reply was observed, so the physical action may or may
/// not have happened. Callers should re-query STATUS rather than blindly
/// re-actuate.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid command")]
    InvalidCommand,
    #[error("device unreachable")]
    DeviceUnreachable,
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("timed out waiting for reply")]
    Timeout,
}

/// Successful dispatch outcome
#[derive(Debug, Clone)]
pub enum Ack {
    /// The expected reply arrived within the ack window
    Replied(PeripheralEvent),
    /// Command has no wire-level reply; the write succeeded
    Sent,
}

/// Hub-level failures
#[derive(Debug, Error)]
pub enum HubError {
    #[error("permission denied")]
    PermissionDenied,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_id_parse_case_insensitive() {
        assert_eq!("entry".parse::<GateId>().unwrap(), GateId::Entry);
        assert_eq!("EXIT".parse::<GateId>().unwrap(), GateId::Exit);
        assert_eq!("Entry".parse::<GateId>().unwrap(), GateId::Entry);
        assert!("lane3".parse::<GateId>().is_err());
    }

    #[test]
    fn test_command_kind_parse() {
        assert_eq!(CommandKind::parse("OPEN_GATE", None), Some(CommandKind::OpenGate));
        assert_eq!(CommandKind::parse("status", None), Some(CommandKind::Status));
        assert_eq!(
            CommandKind::parse("print", Some("ticket-42")),
            Some(CommandKind::Print("ticket-42".to_string()))
        );
        // Print without a payload is not a valid command
        assert_eq!(CommandKind::parse("PRINT", None), None);
        assert_eq!(CommandKind::parse("SELF_DESTRUCT", None), None);
    }

    #[test]
    fn test_expected_reply_shapes() {
        assert_eq!(
            CommandKind::OpenGate.expected_reply(),
            Some(PeripheralEventKind::GateOpened)
        );
        assert_eq!(
            CommandKind::Status.expected_reply(),
            Some(PeripheralEventKind::StatusReply)
        );
        assert_eq!(CommandKind::CaptureImage.expected_reply(), None);
        assert_eq!(CommandKind::Print("x".into()).expected_reply(), None);
    }

    #[test]
    fn test_command_correlation_ids_are_fresh() {
        let a = Command::new(GateId::Entry, CommandKind::Status);
        let b = Command::new(GateId::Entry, CommandKind::Status);
        assert_ne!(a.correlation_id, b.correlation_id);
    }
}
