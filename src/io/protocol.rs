//! Line codec for the peripheral wire protocol
//!
//! Protocol:
//! - Newline-terminated ASCII, one message per line
//! - Inbound: `PREFIX[:SUFFIX]` - prefix selects the event type, suffix
//!   refines the payload (e.g. `VEHICLE_DETECTED:ENTRY`)
//! - Outbound: `OPEN_GATE`, `CLOSE_GATE`, `STATUS`, `CAPTURE_IMAGE`,
//!   `PRINTV:<formatted-fields>`
//!
//! Decoding is pure and stateless. Unknown prefixes decode to `None` so new
//! firmware messages pass through harmlessly instead of faulting the link.

use crate::domain::types::{CommandKind, PeripheralEventKind};

/// Decode one line into an event kind plus payload (the suffix after `:`,
/// empty when absent). Returns `None` for empty or unrecognized lines.
pub fn decode_line(line: &str) -> Option<(PeripheralEventKind, String)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (prefix, suffix) = match line.split_once(':') {
        Some((p, s)) => (p, s),
        None => (line, ""),
    };

    let kind = match prefix {
        "VEHICLE_DETECTED" => PeripheralEventKind::VehicleDetected,
        "BUTTON_PRESSED" => PeripheralEventKind::ButtonPressed,
        "GATE_OPENED" => PeripheralEventKind::GateOpened,
        "GATE_CLOSED" => PeripheralEventKind::GateClosed,
        "STATUS" => PeripheralEventKind::StatusReply,
        _ => return None,
    };

    Some((kind, suffix.to_string()))
}

/// Render an outbound command as its wire line (without the trailing
/// newline - the link frames it). Print payloads are flattened to a single
/// line since a raw newline would split the frame.
pub fn encode_command(kind: &CommandKind) -> String {
    match kind {
        CommandKind::OpenGate => "OPEN_GATE".to_string(),
        CommandKind::CloseGate => "CLOSE_GATE".to_string(),
        CommandKind::Status => "STATUS".to_string(),
        CommandKind::CaptureImage => "CAPTURE_IMAGE".to_string(),
        CommandKind::Print(data) => {
            let flat: String =
                data.chars().map(|c| if c == '\n' || c == '\r' { ' ' } else { c }).collect();
            format!("PRINTV:{flat}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_lines() {
        assert_eq!(
            decode_line("VEHICLE_DETECTED:ENTRY"),
            Some((PeripheralEventKind::VehicleDetected, "ENTRY".to_string()))
        );
        assert_eq!(
            decode_line("BUTTON_PRESSED:EXIT"),
            Some((PeripheralEventKind::ButtonPressed, "EXIT".to_string()))
        );
        assert_eq!(
            decode_line("GATE_OPENED"),
            Some((PeripheralEventKind::GateOpened, String::new()))
        );
        assert_eq!(
            decode_line("GATE_CLOSED"),
            Some((PeripheralEventKind::GateClosed, String::new()))
        );
        assert_eq!(
            decode_line("STATUS:READY"),
            Some((PeripheralEventKind::StatusReply, "READY".to_string()))
        );
    }

    #[test]
    fn test_decode_trims_whitespace() {
        assert_eq!(
            decode_line("  GATE_OPENED \r"),
            Some((PeripheralEventKind::GateOpened, String::new()))
        );
    }

    #[test]
    fn test_unknown_lines_are_ignored() {
        assert_eq!(decode_line("FIRMWARE_BOOT:v2.1"), None);
        assert_eq!(decode_line("garbage"), None);
        assert_eq!(decode_line(""), None);
        assert_eq!(decode_line("   "), None);
    }

    #[test]
    fn test_encode_commands() {
        assert_eq!(encode_command(&CommandKind::OpenGate), "OPEN_GATE");
        assert_eq!(encode_command(&CommandKind::CloseGate), "CLOSE_GATE");
        assert_eq!(encode_command(&CommandKind::Status), "STATUS");
        assert_eq!(encode_command(&CommandKind::CaptureImage), "CAPTURE_IMAGE");
        assert_eq!(
            encode_command(&CommandKind::Print("TICKET|0042|12:30".to_string())),
            "PRINTV:TICKET|0042|12:30"
        );
    }

    #[test]
    fn test_encode_print_flattens_newlines() {
        let encoded = encode_command(&CommandKind::Print("line1\nline2".to_string()));
        assert_eq!(encoded, "PRINTV:line1 line2");
        assert!(!encoded.contains('\n'));
    }

    #[test]
    fn test_status_round_trip() {
        // A STATUS command's reply decodes back to the status shape
        let line = "STATUS:OPEN";
        let (kind, payload) = decode_line(line).unwrap();
        assert_eq!(kind, PeripheralEventKind::StatusReply);
        assert_eq!(payload, "OPEN");
    }
}
