//! Gate command dispatch with single-in-flight ack correlation
//!
//! The firmware echoes no correlation tokens, so a reply can only be
//! matched to a command by its shape (OPEN_GATE is acknowledged by
//! GATE_OPENED, and so on). That correlation is safe precisely because at
//! most one command is in flight per gate at any time: later dispatches
//! for the same gate queue on the lane mutex until the current one
//! resolves. Commands to different gates proceed concurrently.

use crate::domain::types::{
    epoch_ms, Ack, Command, CommandKind, DispatchError, GateId, LinkError, LinkState,
    PeripheralEvent, PeripheralEventKind,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::protocol;
use crate::io::serial_link::CommandPort;
use crate::services::hub::{HubEvent, RealtimeHub};
use crate::services::monitor::ConnectionStatusMonitor;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

struct PendingReply {
    expects: PeripheralEventKind,
    correlation_id: Uuid,
    tx: oneshot::Sender<PeripheralEvent>,
}

/// One gate's dispatch lane. The async mutex is the in-flight guard: the
/// holder owns the wire until its command resolves or is cancelled.
struct Lane {
    port: Arc<dyn CommandPort>,
    in_flight: tokio::sync::Mutex<()>,
    pending: Mutex<Option<PendingReply>>,
}

/// Clears the lane's pending slot when the owning dispatch future is
/// dropped, so a cancelled wait cannot leave a stale reply expectation
/// for a later unsolicited event to satisfy.
struct PendingGuard<'a> {
    slot: &'a Mutex<Option<PendingReply>>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.slot.lock().take();
    }
}

pub struct GateCommandDispatcher {
    lanes: FxHashMap<GateId, Lane>,
    monitor: Arc<ConnectionStatusMonitor>,
    hub: Arc<RealtimeHub>,
    metrics: Arc<Metrics>,
    ack_timeout: Duration,
}

impl GateCommandDispatcher {
    pub fn new(
        config: &Config,
        monitor: Arc<ConnectionStatusMonitor>,
        hub: Arc<RealtimeHub>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            lanes: FxHashMap::default(),
            monitor,
            hub,
            metrics,
            ack_timeout: config.ack_timeout(),
        }
    }

    pub fn register_gate(&mut self, gate: GateId, port: Arc<dyn CommandPort>) {
        self.lanes.insert(
            gate,
            Lane { port, in_flight: tokio::sync::Mutex::new(()), pending: Mutex::new(None) },
        );
    }

    /// Dispatch from untyped input (HTTP, console). Vocabulary validation
    /// happens here, before any lane or hardware is touched; rejections
    /// are still broadcast so consoles see the attempt.
    pub async fn dispatch_str(
        &self,
        gate: GateId,
        command: &str,
        payload: Option<&str>,
    ) -> Result<Ack, DispatchError> {
        match CommandKind::parse(command, payload) {
            Some(kind) => self.dispatch(gate, kind).await,
            None => {
                warn!(gate = %gate, command = %command, "command_rejected");
                self.metrics.record_dispatch(false);
                self.hub.publish(HubEvent::CommandResult {
                    gate,
                    command: command.to_ascii_lowercase(),
                    correlation_id: None,
                    success: false,
                    message: DispatchError::InvalidCommand.to_string(),
                    ts_ms: epoch_ms(),
                });
                Err(DispatchError::InvalidCommand)
            }
        }
    }

    /// Dispatch a validated command and wait for its acknowledgment. Every
    /// attempt broadcasts a `CommandResult`, success or not.
    pub async fn dispatch(&self, gate: GateId, kind: CommandKind) -> Result<Ack, DispatchError> {
        let command = Command::new(gate, kind);
        let started = Instant::now();
        let result = self.run_command(&command).await;

        self.metrics.record_dispatch(result.is_ok());
        let message = match &result {
            Ok(Ack::Replied(event)) => {
                self.metrics.record_dispatch_latency(started.elapsed().as_micros() as u64);
                if event.payload.is_empty() {
                    event.kind.as_str().to_string()
                } else {
                    event.payload.clone()
                }
            }
            Ok(Ack::Sent) => {
                self.metrics.record_dispatch_latency(started.elapsed().as_micros() as u64);
                "sent".to_string()
            }
            Err(e) => e.to_string(),
        };

        if result.is_ok() {
            match command.kind {
                CommandKind::CaptureImage => {
                    self.hub.publish(HubEvent::CaptureTriggered { gate, ts_ms: epoch_ms() });
                }
                CommandKind::Print(_) => {
                    self.hub.publish(HubEvent::PrintJobSent { gate, ts_ms: epoch_ms() });
                }
                _ => {}
            }
        }

        info!(
            gate = %gate,
            command = command.kind.as_str(),
            correlation_id = %command.correlation_id,
            success = %result.is_ok(),
            "command_dispatched"
        );
        self.hub.publish(HubEvent::CommandResult {
            gate,
            command: command.kind.as_str().to_string(),
            correlation_id: Some(command.correlation_id),
            success: result.is_ok(),
            message,
            ts_ms: epoch_ms(),
        });

        result
    }

    async fn run_command(&self, command: &Command) -> Result<Ack, DispatchError> {
        let lane = self
            .lanes
            .get(&command.gate)
            .ok_or(DispatchError::DeviceUnreachable)?;

        // Short-circuit before queueing: a command to a dead link must fail
        // without touching the wire
        if !self.monitor.get_status(command.gate).link_online {
            return Err(DispatchError::DeviceUnreachable);
        }

        // Holding the guard IS the in-flight state; cancellation drops it
        // and the lane returns to idle
        let _guard = lane.in_flight.lock().await;

        let line = protocol::encode_command(&command.kind);
        match command.kind.expected_reply() {
            None => {
                // No wire-level reply defined; a successful write is the ack
                lane.port.send_line(&line).await.map_err(map_link_err)?;
                Ok(Ack::Sent)
            }
            Some(expects) => {
                let (tx, rx) = oneshot::channel();
                *lane.pending.lock() = Some(PendingReply {
                    expects,
                    correlation_id: command.correlation_id,
                    tx,
                });
                // Cleared on every exit path, cancellation included
                let _pending = PendingGuard { slot: &lane.pending };

                lane.port.send_line(&line).await.map_err(map_link_err)?;

                let mut state = lane.port.state();
                tokio::select! {
                    reply = rx => match reply {
                        Ok(event) => Ok(Ack::Replied(event)),
                        Err(_) => Err(DispatchError::TransportError(
                            "reply slot dropped".to_string(),
                        )),
                    },
                    res = state.wait_for(|s| *s != LinkState::Connected) => {
                        // The write landed but the link died before a reply:
                        // that is a transport failure, not an ambiguous timeout
                        let detail = match res {
                            Ok(s) => s.as_str().to_string(),
                            Err(_) => "link gone".to_string(),
                        };
                        Err(DispatchError::TransportError(format!(
                            "link {detail} while awaiting reply"
                        )))
                    }
                    _ = tokio::time::sleep(self.ack_timeout) => Err(DispatchError::Timeout),
                }
            }
        }
    }

    /// Offer an inbound event as the acknowledgment for the gate's pending
    /// command. Consumes the pending slot only on a shape match; unsolicited
    /// events return false and flow on to the hub untouched.
    pub fn offer_reply(&self, gate: GateId, event: &PeripheralEvent) -> bool {
        let Some(lane) = self.lanes.get(&gate) else {
            return false;
        };
        let mut pending = lane.pending.lock();
        match pending.as_ref() {
            Some(p) if p.expects == event.kind => {
                let p = pending.take().unwrap();
                info!(
                    gate = %gate,
                    correlation_id = %p.correlation_id,
                    reply = event.kind.as_str(),
                    "command_acknowledged"
                );
                // Receiver gone means the dispatch timed out or was
                // cancelled in the same instant; nothing to do
                let _ = p.tx.send(event.clone());
                true
            }
            _ => false,
        }
    }
}

fn map_link_err(e: LinkError) -> DispatchError {
    match e {
        LinkError::NotConnected => DispatchError::DeviceUnreachable,
        LinkError::WriteTimeout => DispatchError::TransportError("write timed out".to_string()),
        LinkError::Io(detail) => DispatchError::TransportError(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::monitor::ProbeTarget;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::watch;

    struct FakePort {
        lines: Mutex<Vec<String>>,
        state_tx: watch::Sender<LinkState>,
        fail_writes: AtomicBool,
    }

    impl FakePort {
        fn new(state: LinkState) -> Arc<Self> {
            let (state_tx, _) = watch::channel(state);
            Arc::new(Self {
                lines: Mutex::new(Vec::new()),
                state_tx,
                fail_writes: AtomicBool::new(false),
            })
        }

        fn sent(&self) -> Vec<String> {
            self.lines.lock().clone()
        }
    }

    #[async_trait]
    impl CommandPort for FakePort {
        async fn send_line(&self, line: &str) -> Result<(), LinkError> {
            if *self.state_tx.borrow() != LinkState::Connected {
                return Err(LinkError::NotConnected);
            }
            if self.fail_writes.load(Ordering::Relaxed) {
                self.state_tx.send_replace(LinkState::Faulted);
                return Err(LinkError::Io("broken pipe".to_string()));
            }
            self.lines.lock().push(line.to_string());
            Ok(())
        }

        fn state(&self) -> watch::Receiver<LinkState> {
            self.state_tx.subscribe()
        }
    }

    fn fixture(state: LinkState) -> (Arc<GateCommandDispatcher>, Arc<FakePort>, Arc<RealtimeHub>) {
        let config = Config::default();
        let port = FakePort::new(state);

        let mut targets = FxHashMap::default();
        targets.insert(
            GateId::Entry,
            ProbeTarget {
                camera_addr: String::new(),
                printer_addr: String::new(),
                link: port.state(),
            },
        );
        let monitor = Arc::new(ConnectionStatusMonitor::new(&config, targets));
        let metrics = Arc::new(Metrics::new());
        let hub = Arc::new(RealtimeHub::new(monitor.clone(), metrics.clone()));

        let mut dispatcher = GateCommandDispatcher::new(&config, monitor, hub.clone(), metrics);
        dispatcher.register_gate(GateId::Entry, port.clone());
        (Arc::new(dispatcher), port, hub)
    }

    fn reply(kind: PeripheralEventKind, payload: &str) -> PeripheralEvent {
        PeripheralEvent {
            kind,
            gate: GateId::Entry,
            payload: payload.to_string(),
            ts_ms: epoch_ms(),
        }
    }

    async fn wait_for_writes(port: &FakePort, n: usize) {
        while port.lines.lock().len() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_invalid_command_never_touches_the_wire() {
        let (dispatcher, port, hub) = fixture(LinkState::Connected);
        let mut sub = hub.subscribe(None, None, false);
        sub.rx.try_recv().unwrap(); // snapshot

        let err = dispatcher
            .dispatch_str(GateId::Entry, "SELF_DESTRUCT", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidCommand));
        assert!(port.sent().is_empty());

        // Rejection is still visible to consoles
        match sub.rx.try_recv().unwrap() {
            HubEvent::CommandResult { success, correlation_id, .. } => {
                assert!(!success);
                assert!(correlation_id.is_none());
            }
            other => panic!("expected command result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_gate_short_circuits_with_zero_writes() {
        let (dispatcher, port, _hub) = fixture(LinkState::Faulted);
        let err = dispatcher
            .dispatch(GateId::Entry, CommandKind::OpenGate)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::DeviceUnreachable));
        assert!(port.sent().is_empty());
    }

    #[tokio::test]
    async fn test_open_gate_resolves_on_gate_opened_reply() {
        let (dispatcher, port, _hub) = fixture(LinkState::Connected);

        let d = dispatcher.clone();
        let handle =
            tokio::spawn(async move { d.dispatch(GateId::Entry, CommandKind::OpenGate).await });
        wait_for_writes(&port, 1).await;
        assert_eq!(port.sent(), vec!["OPEN_GATE"]);

        assert!(dispatcher.offer_reply(GateId::Entry, &reply(PeripheralEventKind::GateOpened, "")));
        let ack = handle.await.unwrap().unwrap();
        match ack {
            Ack::Replied(event) => assert_eq!(event.kind, PeripheralEventKind::GateOpened),
            Ack::Sent => panic!("expected a replied ack"),
        }
    }

    #[tokio::test]
    async fn test_wrong_shape_reply_is_not_consumed_as_ack() {
        let (dispatcher, port, _hub) = fixture(LinkState::Connected);

        let d = dispatcher.clone();
        let handle =
            tokio::spawn(async move { d.dispatch(GateId::Entry, CommandKind::OpenGate).await });
        wait_for_writes(&port, 1).await;

        // An unsolicited vehicle detection must not satisfy OPEN_GATE
        assert!(!dispatcher
            .offer_reply(GateId::Entry, &reply(PeripheralEventKind::VehicleDetected, "")));
        assert!(dispatcher.offer_reply(GateId::Entry, &reply(PeripheralEventKind::GateOpened, "")));
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reply_resolves_timeout_and_clears_pending() {
        let (dispatcher, port, _hub) = fixture(LinkState::Connected);
        let err = dispatcher
            .dispatch(GateId::Entry, CommandKind::Status)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout));
        assert_eq!(port.sent(), vec!["STATUS"]);

        // The lane is idle again: a late reply finds no pending command
        assert!(!dispatcher.offer_reply(GateId::Entry, &reply(PeripheralEventKind::StatusReply, "CLOSED")));
    }

    #[tokio::test]
    async fn test_cancelled_dispatch_clears_pending_slot() {
        let (dispatcher, port, _hub) = fixture(LinkState::Connected);

        let d = dispatcher.clone();
        let handle =
            tokio::spawn(async move { d.dispatch(GateId::Entry, CommandKind::OpenGate).await });
        wait_for_writes(&port, 1).await;

        // Caller gives up mid-wait; the dropped future must scrub the lane
        handle.abort();
        let _ = handle.await;

        // A later unsolicited GATE_OPENED finds nothing to acknowledge
        assert!(!dispatcher.offer_reply(GateId::Entry, &reply(PeripheralEventKind::GateOpened, "")));

        // And the lane is idle: a fresh dispatch proceeds normally
        let d = dispatcher.clone();
        let handle =
            tokio::spawn(async move { d.dispatch(GateId::Entry, CommandKind::OpenGate).await });
        wait_for_writes(&port, 2).await;
        assert!(dispatcher.offer_reply(GateId::Entry, &reply(PeripheralEventKind::GateOpened, "")));
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_link_fault_mid_wait_is_transport_error_not_timeout() {
        let (dispatcher, port, _hub) = fixture(LinkState::Connected);

        let d = dispatcher.clone();
        let handle =
            tokio::spawn(async move { d.dispatch(GateId::Entry, CommandKind::Status).await });
        wait_for_writes(&port, 1).await;

        port.state_tx.send_replace(LinkState::Faulted);
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, DispatchError::TransportError(_)));
    }

    #[tokio::test]
    async fn test_write_failure_is_transport_error() {
        let (dispatcher, port, _hub) = fixture(LinkState::Connected);
        port.fail_writes.store(true, Ordering::Relaxed);

        let err = dispatcher
            .dispatch(GateId::Entry, CommandKind::Status)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::TransportError(_)));
    }

    #[tokio::test]
    async fn test_second_dispatch_queues_until_first_resolves() {
        let (dispatcher, port, _hub) = fixture(LinkState::Connected);

        let d1 = dispatcher.clone();
        let first =
            tokio::spawn(async move { d1.dispatch(GateId::Entry, CommandKind::Status).await });
        wait_for_writes(&port, 1).await;

        let d2 = dispatcher.clone();
        let second =
            tokio::spawn(async move { d2.dispatch(GateId::Entry, CommandKind::OpenGate).await });
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        // The lane is busy: OPEN_GATE has not been written yet
        assert_eq!(port.sent(), vec!["STATUS"]);

        assert!(dispatcher.offer_reply(GateId::Entry, &reply(PeripheralEventKind::StatusReply, "OPEN")));
        first.await.unwrap().unwrap();

        wait_for_writes(&port, 2).await;
        assert_eq!(port.sent(), vec!["STATUS", "OPEN_GATE"]);
        assert!(dispatcher.offer_reply(GateId::Entry, &reply(PeripheralEventKind::GateOpened, "")));
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_capture_acks_on_write_and_announces() {
        let (dispatcher, port, hub) = fixture(LinkState::Connected);
        let mut sub = hub.subscribe(None, None, false);
        sub.rx.try_recv().unwrap(); // snapshot

        let ack = dispatcher
            .dispatch(GateId::Entry, CommandKind::CaptureImage)
            .await
            .unwrap();
        assert!(matches!(ack, Ack::Sent));
        assert_eq!(port.sent(), vec!["CAPTURE_IMAGE"]);

        assert!(matches!(sub.rx.try_recv().unwrap(), HubEvent::CaptureTriggered { .. }));
        assert!(matches!(
            sub.rx.try_recv().unwrap(),
            HubEvent::CommandResult { success: true, .. }
        ));
    }
}
