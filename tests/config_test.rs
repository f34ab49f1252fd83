//! Integration tests for configuration loading

use parkgate::domain::types::GateId;
use parkgate::infra::Config;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "lot-north"

[gates.entry]
device = "/dev/ttyS0"
baud = 19200
camera_addr = "10.0.0.11:80"
printer_addr = "10.0.0.12:9100"

[gates.exit]
device = "/dev/ttyS1"

[link]
read_timeout_ms = 100
write_timeout_ms = 500
reconnect_delay_ms = 2000

[dispatch]
ack_timeout_ms = 1500

[monitor]
probe_interval_secs = 5
probe_timeout_ms = 250

[console]
enabled = true
port = 9300
admin_token = "hunter2"

[http]
port = 8088

[offline]
journal = "/var/lib/parkgate/queue.jsonl"
store_addr = "10.0.0.5:7000"
replay_interval_secs = 15
retention_hours = 24

[metrics]
interval_secs = 30
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "lot-north");
    assert_eq!(config.endpoint(GateId::Entry).device, "/dev/ttyS0");
    assert_eq!(config.endpoint(GateId::Entry).baud, 19200);
    assert_eq!(config.endpoint(GateId::Entry).camera_addr, "10.0.0.11:80");
    assert_eq!(config.endpoint(GateId::Exit).device, "/dev/ttyS1");
    // Unspecified per-gate fields fall back to defaults
    assert_eq!(config.endpoint(GateId::Exit).baud, 9600);
    assert!(config.endpoint(GateId::Exit).camera_addr.is_empty());

    assert_eq!(config.link_read_timeout(), Duration::from_millis(100));
    assert_eq!(config.link_reconnect_delay(), Duration::from_secs(2));
    assert_eq!(config.ack_timeout(), Duration::from_millis(1500));
    assert_eq!(config.probe_interval(), Duration::from_secs(5));
    assert_eq!(config.console_port(), 9300);
    assert_eq!(config.console_admin_token(), Some("hunter2"));
    assert_eq!(config.http_port(), 8088);
    assert_eq!(config.offline_journal(), "/var/lib/parkgate/queue.jsonl");
    assert_eq!(config.offline_store_addr(), Some("10.0.0.5:7000"));
    assert_eq!(config.offline_retention(), Duration::from_secs(24 * 3600));
    assert_eq!(config.metrics_interval_secs(), 30);
}

#[test]
fn test_minimal_config_uses_section_defaults() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[gates.entry]
device = "/dev/ttyUSB0"

[gates.exit]
device = "/dev/ttyUSB1"
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "parkgate");
    assert_eq!(config.ack_timeout(), Duration::from_secs(3));
    assert_eq!(config.probe_interval(), Duration::from_secs(10));
    assert!(config.console_enabled());
    assert!(config.console_admin_token().is_none());
    assert!(config.offline_store_addr().is_none());
}

#[test]
fn test_load_from_path_fallback() {
    // Nonexistent file falls back to defaults instead of failing startup
    let config = Config::load_from_path("/nonexistent/path/config.toml");
    assert_eq!(config.site_id(), "parkgate");
    assert_eq!(config.endpoint(GateId::Entry).device, "/dev/ttyUSB0");
}

#[test]
fn test_malformed_config_is_an_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[gates.entry\ndevice = ").unwrap();
    temp_file.flush().unwrap();

    assert!(Config::from_file(temp_file.path()).is_err());
}
