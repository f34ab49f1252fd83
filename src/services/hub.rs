//! Realtime pub/sub hub for operator consoles
//!
//! Best-effort, at-most-once fan-out: every subscriber receives every
//! broadcast (no per-topic filtering - the fleet is exactly two gates),
//! slow subscribers are dropped silently, and late joiners only get a
//! fresh status snapshot on connect, never historical events.
//!
//! The registry is an explicit table behind a single lock, keyed by a
//! monotonically assigned subscriber id and removed on disconnect.

use crate::domain::types::{
    epoch_ms, Ack, CommandKind, DeviceStatus, DispatchError, GateId, HubError, PeripheralEvent,
};
use crate::infra::metrics::Metrics;
use crate::services::dispatcher::GateCommandDispatcher;
use crate::services::monitor::ConnectionStatusMonitor;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};
use uuid::Uuid;

/// Per-subscriber buffer; a console this far behind is wedged and loses
/// events rather than blocking producers
const SUBSCRIBER_BUFFER: usize = 64;

/// Opaque subscriber handle id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
pub struct SubscriberId(pub u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events fanned out to subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// Pushed once on subscribe so new consoles are not blank
    StatusSnapshot { gates: Vec<DeviceStatus> },
    /// A gate's device status changed
    GateStatus { status: DeviceStatus },
    /// Decoded peripheral traffic (vehicle detected, gate opened, ...)
    Peripheral { event: PeripheralEvent },
    /// Outcome of a dispatch attempt, success or failure
    CommandResult {
        gate: GateId,
        command: String,
        correlation_id: Option<Uuid>,
        success: bool,
        message: String,
        ts_ms: u64,
    },
    /// A camera capture was triggered
    CaptureTriggered { gate: GateId, ts_ms: u64 },
    /// A print job was written to the peripheral
    PrintJobSent { gate: GateId, ts_ms: u64 },
    /// Operator notification, possibly targeted
    Notice {
        from: Option<String>,
        message: String,
        target: NoticeTarget,
        ts_ms: u64,
    },
}

/// Delivery scope for operator notices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "name", rename_all = "snake_case")]
pub enum NoticeTarget {
    All,
    User(String),
    Role(String),
}

struct SubscriberEntry {
    tx: mpsc::Sender<HubEvent>,
    identity: Option<String>,
    role: Option<String>,
    privileged: bool,
}

/// Handle returned to a subscriber; dropping the receiver disconnects it
pub struct SubscriberHandle {
    pub id: SubscriberId,
    pub rx: mpsc::Receiver<HubEvent>,
}

pub struct RealtimeHub {
    subscribers: Mutex<FxHashMap<u64, SubscriberEntry>>,
    next_id: AtomicU64,
    monitor: Arc<ConnectionStatusMonitor>,
    metrics: Arc<Metrics>,
}

impl RealtimeHub {
    pub fn new(monitor: Arc<ConnectionStatusMonitor>, metrics: Arc<Metrics>) -> Self {
        Self {
            subscribers: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            monitor,
            metrics,
        }
    }

    /// Register a subscriber. The current status of all gates is pushed
    /// immediately; history is not replayed.
    pub fn subscribe(
        &self,
        identity: Option<String>,
        role: Option<String>,
        privileged: bool,
    ) -> SubscriberHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        let snapshot = HubEvent::StatusSnapshot { gates: self.monitor.snapshot() };
        let _ = tx.try_send(snapshot);

        self.subscribers.lock().insert(
            id,
            SubscriberEntry { tx, identity: identity.clone(), role, privileged },
        );
        info!(subscriber = %id, identity = ?identity, privileged = %privileged, "hub_subscribed");

        SubscriberHandle { id: SubscriberId(id), rx }
    }

    /// Idempotent removal
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.subscribers.lock().remove(&id.0).is_some() {
            info!(subscriber = %id, "hub_unsubscribed");
        }
    }

    /// Broadcast to every subscriber. Never blocks: full channels drop the
    /// event, closed channels evict the subscriber.
    pub fn publish(&self, event: HubEvent) {
        self.fan_out(&event, |_| true);
    }

    fn fan_out(&self, event: &HubEvent, mut want: impl FnMut(&SubscriberEntry) -> bool) {
        let mut gone: Vec<u64> = Vec::new();
        let mut subs = self.subscribers.lock();

        for (&id, entry) in subs.iter() {
            if !want(entry) {
                continue;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => self.metrics.record_hub_delivered(),
                Err(TrySendError::Full(_)) => {
                    // Wedged consumer: drop the event, not the producer
                    self.metrics.record_hub_dropped();
                }
                Err(TrySendError::Closed(_)) => gone.push(id),
            }
        }

        for id in gone {
            subs.remove(&id);
            debug!(subscriber = %id, "hub_subscriber_gone");
        }
    }

    /// Broadcast an operator notice. Only privileged subscribers may send;
    /// delivery respects the target scope.
    pub fn notify(
        &self,
        from: SubscriberId,
        message: &str,
        target: NoticeTarget,
    ) -> Result<(), HubError> {
        let from_identity = {
            let subs = self.subscribers.lock();
            let Some(entry) = subs.get(&from.0) else {
                return Err(HubError::PermissionDenied);
            };
            if !entry.privileged {
                return Err(HubError::PermissionDenied);
            }
            entry.identity.clone()
        };

        let event = HubEvent::Notice {
            from: from_identity,
            message: message.to_string(),
            target: target.clone(),
            ts_ms: epoch_ms(),
        };
        self.fan_out(&event, |entry| match &target {
            NoticeTarget::All => true,
            NoticeTarget::User(user) => entry.identity.as_deref() == Some(user.as_str()),
            NoticeTarget::Role(role) => entry.role.as_deref() == Some(role.as_str()),
        });
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Commands a subscriber may send back through the hub
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum SubscriberCommand {
    OpenGate { gate: GateId },
    CloseGate { gate: GateId },
    Status { gate: GateId },
    TriggerCapture { gate: GateId },
    Print { gate: GateId, data: String },
    Notice { message: String, #[serde(default)] target: Option<NoticeTarget> },
}

/// Direct reply to the issuing subscriber (broadcast results still flow
/// through the hub for everyone)
#[derive(Debug, Clone, Serialize)]
pub struct RouteReply {
    pub success: bool,
    pub message: String,
}

impl RouteReply {
    fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}

/// Translates subscriber commands 1:1 into dispatcher calls and monitor
/// queries; no business logic beyond routing and the broadcast
/// authorization check.
pub struct CommandRouter {
    dispatcher: Arc<GateCommandDispatcher>,
    monitor: Arc<ConnectionStatusMonitor>,
    hub: Arc<RealtimeHub>,
}

impl CommandRouter {
    pub fn new(
        dispatcher: Arc<GateCommandDispatcher>,
        monitor: Arc<ConnectionStatusMonitor>,
        hub: Arc<RealtimeHub>,
    ) -> Self {
        Self { dispatcher, monitor, hub }
    }

    pub async fn route(&self, from: SubscriberId, cmd: SubscriberCommand) -> RouteReply {
        match cmd {
            SubscriberCommand::OpenGate { gate } => {
                self.dispatch(gate, CommandKind::OpenGate).await
            }
            SubscriberCommand::CloseGate { gate } => {
                self.dispatch(gate, CommandKind::CloseGate).await
            }
            SubscriberCommand::TriggerCapture { gate } => {
                self.dispatch(gate, CommandKind::CaptureImage).await
            }
            SubscriberCommand::Print { gate, data } => {
                self.dispatch(gate, CommandKind::Print(data)).await
            }
            SubscriberCommand::Status { gate } => {
                let status = self.monitor.get_status(gate);
                match serde_json::to_string(&status) {
                    Ok(json) => RouteReply::ok(json),
                    Err(e) => RouteReply::fail(e.to_string()),
                }
            }
            SubscriberCommand::Notice { message, target } => {
                match self.hub.notify(from, &message, target.unwrap_or(NoticeTarget::All)) {
                    Ok(()) => RouteReply::ok("notice sent"),
                    Err(e) => RouteReply::fail(e.to_string()),
                }
            }
        }
    }

    async fn dispatch(&self, gate: GateId, kind: CommandKind) -> RouteReply {
        match self.dispatcher.dispatch(gate, kind).await {
            Ok(Ack::Replied(event)) => RouteReply::ok(event.kind.as_str()),
            Ok(Ack::Sent) => RouteReply::ok("sent"),
            Err(e @ DispatchError::Timeout) => {
                // Ambiguous: surface distinctly so the console re-queries STATUS
                RouteReply::fail(e.to_string())
            }
            Err(e) => RouteReply::fail(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::Config;
    use crate::services::monitor::ProbeTarget;
    use crate::domain::types::LinkState;
    use tokio::sync::watch;

    fn test_hub() -> Arc<RealtimeHub> {
        let (_, link_rx) = watch::channel(LinkState::Connected);
        let mut targets = FxHashMap::default();
        targets.insert(
            GateId::Entry,
            ProbeTarget { camera_addr: String::new(), printer_addr: String::new(), link: link_rx },
        );
        let monitor = Arc::new(ConnectionStatusMonitor::new(&Config::default(), targets));
        Arc::new(RealtimeHub::new(monitor, Arc::new(Metrics::new())))
    }

    fn sample_event() -> HubEvent {
        HubEvent::CaptureTriggered { gate: GateId::Entry, ts_ms: epoch_ms() }
    }

    #[tokio::test]
    async fn test_subscribe_receives_snapshot_first() {
        let hub = test_hub();
        let mut handle = hub.subscribe(None, None, false);
        match handle.rx.try_recv().unwrap() {
            HubEvent::StatusSnapshot { gates } => assert_eq!(gates.len(), 2),
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let hub = test_hub();
        let mut a = hub.subscribe(None, None, false);
        let mut b = hub.subscribe(None, None, false);
        a.rx.try_recv().unwrap(); // drain snapshots
        b.rx.try_recv().unwrap();

        hub.publish(sample_event());
        assert!(matches!(a.rx.try_recv().unwrap(), HubEvent::CaptureTriggered { .. }));
        assert!(matches!(b.rx.try_recv().unwrap(), HubEvent::CaptureTriggered { .. }));
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_never_blocks_publish() {
        let hub = test_hub();
        let gone = hub.subscribe(None, None, false);
        let mut alive = hub.subscribe(None, None, false);
        alive.rx.try_recv().unwrap();

        drop(gone.rx); // subscriber disconnects mid-stream
        hub.publish(sample_event());

        // Delivery to the live subscriber still happened, and the dead
        // entry was evicted
        assert!(matches!(alive.rx.try_recv().unwrap(), HubEvent::CaptureTriggered { .. }));
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_events_silently() {
        let hub = test_hub();
        let slow = hub.subscribe(None, None, false);

        // Fill the buffer past capacity; publish must not panic or block
        for _ in 0..(SUBSCRIBER_BUFFER * 2) {
            hub.publish(sample_event());
        }
        assert_eq!(hub.subscriber_count(), 1);
        drop(slow);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let hub = test_hub();
        let handle = hub.subscribe(None, None, false);
        hub.unsubscribe(handle.id);
        hub.unsubscribe(handle.id);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_unprivileged_notice_is_denied() {
        let hub = test_hub();
        let plain = hub.subscribe(Some("bob".into()), None, false);
        let err = hub.notify(plain.id, "evacuate", NoticeTarget::All).unwrap_err();
        assert!(matches!(err, HubError::PermissionDenied));
    }

    #[tokio::test]
    async fn test_targeted_notice_only_reaches_target() {
        let hub = test_hub();
        let admin = hub.subscribe(Some("admin".into()), Some("supervisor".into()), true);
        let mut alice = hub.subscribe(Some("alice".into()), None, false);
        let mut bob = hub.subscribe(Some("bob".into()), None, false);
        alice.rx.try_recv().unwrap();
        bob.rx.try_recv().unwrap();

        hub.notify(admin.id, "shift change", NoticeTarget::User("alice".into())).unwrap();

        assert!(matches!(alice.rx.try_recv().unwrap(), HubEvent::Notice { .. }));
        assert!(bob.rx.try_recv().is_err());
    }
}
