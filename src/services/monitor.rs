//! Connection status monitoring for cameras, printers, and gate links
//!
//! Answers "is device X currently usable" without blocking callers on
//! hardware I/O: probes run on their own timer, callers read cached
//! snapshots. Link liveness is always derived from the link's live state
//! so a faulted link can never read as online between probes.

use crate::domain::types::{epoch_ms, DeviceStatus, GateId, LinkState};
use crate::infra::config::Config;
use crate::services::hub::{HubEvent, RealtimeHub};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, trace};

/// One gate's probe endpoints plus its link state feed
pub struct ProbeTarget {
    pub camera_addr: String,
    pub printer_addr: String,
    pub link: watch::Receiver<LinkState>,
}

pub struct ConnectionStatusMonitor {
    targets: FxHashMap<GateId, ProbeTarget>,
    status: RwLock<FxHashMap<GateId, DeviceStatus>>,
    probe_timeout: Duration,
    probe_interval: Duration,
}

impl ConnectionStatusMonitor {
    pub fn new(config: &Config, targets: FxHashMap<GateId, ProbeTarget>) -> Self {
        let mut status = FxHashMap::default();
        for gate in GateId::ALL {
            status.insert(gate, DeviceStatus::offline(gate));
        }
        Self {
            targets,
            status: RwLock::new(status),
            probe_timeout: config.probe_timeout(),
            probe_interval: config.probe_interval(),
        }
    }

    fn link_state(&self, gate: GateId) -> LinkState {
        self.targets
            .get(&gate)
            .map(|t| *t.link.borrow())
            .unwrap_or(LinkState::Disconnected)
    }

    /// Cached snapshot, non-blocking. The link fields are recomputed from
    /// the live link state so `link_online` can never be true while the
    /// link is faulted.
    pub fn get_status(&self, gate: GateId) -> DeviceStatus {
        let mut snapshot = self
            .status
            .read()
            .get(&gate)
            .copied()
            .unwrap_or_else(|| DeviceStatus::offline(gate));
        snapshot.link_state = self.link_state(gate);
        snapshot.link_online = snapshot.link_state == LinkState::Connected;
        snapshot
    }

    /// Status for all gates, for snapshot pushes to fresh subscribers
    pub fn snapshot(&self) -> Vec<DeviceStatus> {
        GateId::ALL.iter().map(|&g| self.get_status(g)).collect()
    }

    /// Stamp last-activity on inbound peripheral traffic
    pub fn note_activity(&self, gate: GateId) {
        if let Some(entry) = self.status.write().get_mut(&gate) {
            entry.last_activity_ms = epoch_ms();
        }
    }

    async fn probe_addr(addr: &str, timeout: Duration) -> bool {
        if addr.is_empty() {
            return false;
        }
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    /// Fresh liveness check for one gate's camera and printer; both probes
    /// run concurrently and failures only flip booleans, never escape.
    pub async fn probe(&self, gate: GateId) -> DeviceStatus {
        let Some(target) = self.targets.get(&gate) else {
            return self.get_status(gate);
        };

        let (camera_online, printer_online) = tokio::join!(
            Self::probe_addr(&target.camera_addr, self.probe_timeout),
            Self::probe_addr(&target.printer_addr, self.probe_timeout),
        );
        let link_state = *target.link.borrow();

        let mut status = self.status.write();
        let entry = status.entry(gate).or_insert_with(|| DeviceStatus::offline(gate));
        entry.camera_online = camera_online;
        entry.printer_online = printer_online;
        entry.link_state = link_state;
        entry.link_online = link_state == LinkState::Connected;
        entry.last_probe_ms = epoch_ms();
        *entry
    }

    /// Periodic probe loop. Entry and exit are probed concurrently so one
    /// slow device does not delay the other gate's status.
    pub async fn run(
        self: Arc<Self>,
        hub: Arc<RealtimeHub>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_secs = %self.probe_interval.as_secs(),
            "status_monitor_started"
        );

        let mut timer = interval(self.probe_interval);
        let mut last_reported: FxHashMap<GateId, (bool, bool, LinkState)> = FxHashMap::default();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("status_monitor_shutdown");
                        return;
                    }
                }
                _ = timer.tick() => {}
            }

            let (entry, exit) = tokio::join!(self.probe(GateId::Entry), self.probe(GateId::Exit));

            for status in [entry, exit] {
                let key = (status.camera_online, status.printer_online, status.link_state);
                if last_reported.get(&status.gate) != Some(&key) {
                    info!(
                        gate = %status.gate,
                        camera = %status.camera_online,
                        printer = %status.printer_online,
                        link = status.link_state.as_str(),
                        "device_status_changed"
                    );
                    hub.publish(HubEvent::GateStatus { status });
                    last_reported.insert(status.gate, key);
                } else {
                    trace!(gate = %status.gate, "device_status_unchanged");
                }
            }
        }
    }
}
