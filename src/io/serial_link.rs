//! Serial transport to one gate's peripheral controller
//!
//! Each `SerialLink` exclusively owns one port: nothing else opens or writes
//! to it. Inbound bytes are framed into newline-delimited messages, decoded,
//! and fanned into the shared event channel. On any I/O error the link
//! transitions to `Faulted` and reconnects after a fixed delay, forever -
//! a gate stranded closed because retries ran out is worse than a noisy log.

use crate::domain::types::{epoch_ms, GateId, LinkError, LinkState, PeripheralEvent};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::protocol;
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Write seam between the dispatcher and the physical link, so dispatch
/// logic is testable without a serial port.
#[async_trait]
pub trait CommandPort: Send + Sync {
    /// Write one newline-terminated command line. Fails fast when the link
    /// is not connected; a write failure faults the link.
    async fn send_line(&self, line: &str) -> Result<(), LinkError>;

    /// Observe the link state.
    fn state(&self) -> watch::Receiver<LinkState>;
}

pub struct SerialLink {
    gate: GateId,
    device: String,
    baud: u32,
    read_timeout: Duration,
    write_timeout: Duration,
    reconnect_delay: Duration,
    state_tx: watch::Sender<LinkState>,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    event_tx: mpsc::Sender<PeripheralEvent>,
    metrics: Arc<Metrics>,
}

impl SerialLink {
    pub fn new(
        gate: GateId,
        config: &Config,
        event_tx: mpsc::Sender<PeripheralEvent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let endpoint = config.endpoint(gate);
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        Self {
            gate,
            device: endpoint.device.clone(),
            baud: endpoint.baud,
            read_timeout: config.link_read_timeout(),
            write_timeout: config.link_write_timeout(),
            reconnect_delay: config.link_reconnect_delay(),
            state_tx,
            writer: Mutex::new(None),
            event_tx,
            metrics,
        }
    }

    pub fn gate(&self) -> GateId {
        self.gate
    }

    fn set_state(&self, next: LinkState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            info!(gate = %self.gate, state = next.as_str(), "link_state");
        }
    }

    /// Connect/read/reconnect lifecycle. Runs until shutdown; open failures
    /// and faults retry after a fixed delay, indefinitely.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            gate = %self.gate,
            device = %self.device,
            baud = %self.baud,
            "serial_link_started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(LinkState::Connecting);
            let port = match tokio_serial::new(&self.device, self.baud)
                .timeout(Duration::from_millis(100))
                .open_native_async()
            {
                Ok(p) => p,
                Err(e) => {
                    warn!(gate = %self.gate, device = %self.device, error = %e, "serial_open_failed");
                    self.set_state(LinkState::Disconnected);
                    if !self.sleep_before_retry(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            info!(gate = %self.gate, device = %self.device, "serial_port_opened");
            let (read_half, write_half) = tokio::io::split(port);
            *self.writer.lock().await = Some(write_half);
            self.set_state(LinkState::Connected);

            self.read_until_fault(read_half, &mut shutdown).await;

            // Read failures never propagate to callers; they only affect
            // link state and schedule a reconnect.
            self.writer.lock().await.take();
            if *shutdown.borrow() {
                break;
            }
            self.set_state(LinkState::Faulted);
            if !self.sleep_before_retry(&mut shutdown).await {
                break;
            }
        }

        self.set_state(LinkState::Disconnected);
        info!(gate = %self.gate, "serial_link_stopped");
    }

    /// Returns false when shutdown was signalled during the wait
    async fn sleep_before_retry(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.reconnect_delay) => true,
            _ = shutdown.changed() => !*shutdown.borrow(),
        }
    }

    /// Blocking-read loop with a short timeout so cancellation and fault
    /// transitions (from a failed write) are observed promptly.
    async fn read_until_fault(
        &self,
        mut read_half: ReadHalf<SerialStream>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let mut buf = [0u8; 256];
        let mut acc = BytesMut::with_capacity(512);
        let mut state_rx = self.state_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                changed = state_rx.changed() => {
                    // send_line faults the link on write errors; stop reading
                    // so the run loop can reconnect
                    if changed.is_err() || *state_rx.borrow() == LinkState::Faulted {
                        return;
                    }
                }
                res = tokio::time::timeout(self.read_timeout, read_half.read(&mut buf)) => {
                    match res {
                        Ok(Ok(0)) => {
                            warn!(gate = %self.gate, "serial_stream_closed");
                            return;
                        }
                        Ok(Ok(n)) => {
                            acc.extend_from_slice(&buf[..n]);
                            self.drain_lines(&mut acc);
                        }
                        Ok(Err(e)) => {
                            warn!(gate = %self.gate, error = %e, "serial_read_error");
                            return;
                        }
                        Err(_) => {
                            // Read timeout - loop to re-check cancellation
                        }
                    }
                }
            }
        }
    }

    /// Extract complete lines from the accumulator and hand each decoded
    /// event to the shared channel. Partial trailing data stays buffered.
    fn drain_lines(&self, acc: &mut BytesMut) {
        while let Some(pos) = acc.iter().position(|&b| b == b'\n') {
            let raw = acc.split_to(pos + 1);
            let line = String::from_utf8_lossy(&raw[..pos]);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match protocol::decode_line(line) {
                Some((kind, payload)) => {
                    self.metrics.record_event_parsed();
                    let event = PeripheralEvent {
                        kind,
                        gate: self.gate,
                        payload,
                        ts_ms: epoch_ms(),
                    };
                    debug!(gate = %self.gate, kind = kind.as_str(), "peripheral_event");
                    if self.event_tx.try_send(event).is_err() {
                        self.metrics.record_event_dropped();
                        warn!(gate = %self.gate, "event_channel_full");
                    }
                }
                None => {
                    // Malformed or future-firmware line: log and drop
                    self.metrics.record_line_ignored();
                    debug!(gate = %self.gate, line = %line, "unrecognized_line");
                }
            }
        }
    }
}

#[async_trait]
impl CommandPort for SerialLink {
    async fn send_line(&self, line: &str) -> Result<(), LinkError> {
        if *self.state_tx.borrow() != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }

        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(LinkError::NotConnected);
        };

        let framed = format!("{line}\n");
        match tokio::time::timeout(self.write_timeout, w.write_all(framed.as_bytes())).await {
            Ok(Ok(())) => {
                debug!(gate = %self.gate, line = %line, "serial_line_sent");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(gate = %self.gate, error = %e, "serial_write_error");
                writer.take();
                self.set_state(LinkState::Faulted);
                Err(LinkError::Io(e.to_string()))
            }
            Err(_) => {
                warn!(gate = %self.gate, "serial_write_timeout");
                writer.take();
                self.set_state(LinkState::Faulted);
                Err(LinkError::WriteTimeout)
            }
        }
    }

    fn state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }
}
