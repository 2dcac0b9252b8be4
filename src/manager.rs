//! The device manager actor: C4 (discovery & sensing) and C5 (command state
//! machine) fused into the single task that owns the UDP socket, the device
//! table, and the broadcast target list. Nothing outside `run` ever touches
//! this state directly - the facade only ever talks to it over a channel.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::Bytes;
use indexmap::IndexMap;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::codec::{self, Reply, Sysinfo};
use crate::config::{self, BroadcastTarget, ConfigStore, KasaDocument};
use crate::device::{DeviceKey, DeviceRecord, DeviceTable};
use crate::error::ManagerError;
use crate::event::{DeviceEvent, EventChannel};
use crate::time::now;

pub const KASA_PORT: u16 = 9999;

const BROADCAST_SWEEP_SECS: u64 = 60;
const PROBE_CADENCE_SECS: u64 = 5;
const PROBE_STALE_SECS: u64 = 35;
const SILENCE_TIMEOUT_SECS: u64 = 100;
const COMMAND_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PointStatus {
    pub state: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pulse: Option<u64>,
    pub gear: &'static str,
}

pub type Status = IndexMap<String, PointStatus>;

/// Requests the facade (C6) sends over the actor's channel. Each variant
/// carries its own reply slot so callers can `await` the outcome without the
/// actor ever exposing a lock.
pub enum Command {
    Status {
        reply: oneshot::Sender<Status>,
    },
    Set {
        point: String,
        state: bool,
        pulse: i64,
        cause: String,
        reply: oneshot::Sender<Result<Status, ManagerError>>,
    },
    GetConfig {
        reply: oneshot::Sender<KasaDocument>,
    },
    SetConfig {
        document: KasaDocument,
        reply: oneshot::Sender<()>,
    },
}

enum MismatchAction {
    Retry,
    WaitSilently,
    Timeout { had_pending: bool },
}

pub struct Manager {
    table: DeviceTable,
    targets: Vec<BroadcastTarget>,
    socket: UdpSocket,
    events: EventChannel,
    store: Box<dyn ConfigStore>,
    device_list_changed: bool,
    ticks: u64,
}

impl Manager {
    /// Binds the UDP socket, loads the persisted document, and kicks off one
    /// immediate broadcast sweep so a fresh deployment doesn't sit silent for
    /// a minute before its first probe.
    pub async fn bind(events: EventChannel, store: Box<dyn ConfigStore>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;

        let mut manager = Self {
            table: DeviceTable::new(),
            targets: vec![BroadcastTarget {
                name: None,
                addr: Ipv4Addr::BROADCAST,
            }],
            socket,
            events,
            store,
            device_list_changed: false,
            ticks: 0,
        };
        manager.reload_from_store().await?;
        manager.broadcast_pass().await;
        Ok(manager)
    }

    async fn reload_from_store(&mut self) -> anyhow::Result<()> {
        let document = match self.store.load()? {
            Some(text) => KasaDocument::from_json(&text)?,
            None => KasaDocument::default(),
        };
        self.apply_document(document).await;
        Ok(())
    }

    /// Rebuilds the table from a document alone - a re-seat, not a merge.
    async fn apply_document(&mut self, document: KasaDocument) {
        self.table.replace(config::build_table(&document));
        self.targets = config::resolve_targets(&document.kasa.net, &self.events).await;
        self.device_list_changed = false;
    }

    async fn persist(&mut self) {
        let document = config::export_document(&self.table, &self.targets);
        if let Err(err) = self.store.save(&document.to_json()) {
            tracing::warn!(error = %err, "failed to persist configuration");
        }
        self.device_list_changed = false;
    }

    /// Drives the actor until the command channel closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = [0u8; 2048];

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, SocketAddr::V4(addr))) => {
                            self.handle_datagram(addr, &buf[..len]).await;
                        }
                        Ok((_, SocketAddr::V6(_))) => {}
                        Err(err) => {
                            tracing::warn!(error = %err, "udp receive error");
                        }
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Set {
                point,
                state,
                pulse,
                cause,
                reply,
            } => {
                let outcome = self.set(&point, state, pulse, &cause).await;
                let response = match outcome {
                    Ok(()) => Ok(self.snapshot()),
                    Err(err) => Err(err),
                };
                let _ = reply.send(response);
            }
            Command::GetConfig { reply } => {
                let document = config::export_document(&self.table, &self.targets);
                let _ = reply.send(document);
            }
            Command::SetConfig { document, reply } => {
                self.apply_document(document).await;
                self.persist().await;
                let _ = reply.send(());
            }
        }
    }

    pub fn snapshot(&self) -> Status {
        self.table
            .iter()
            .map(|(_, record)| (record.name.clone(), point_status(record)))
            .collect()
    }

    /// `set(index, state, pulse, cause)` per control point. `point == "all"`
    /// fans out to every record individually; it is not atomic.
    pub async fn set(
        &mut self,
        point: &str,
        state: bool,
        pulse: i64,
        cause: &str,
    ) -> Result<(), ManagerError> {
        if pulse < 0 {
            return Err(ManagerError::InvalidPulse);
        }

        let indices: Vec<usize> = if point == "all" {
            (0..self.table.len()).collect()
        } else {
            let matches = self.table.find_by_name(point);
            if matches.is_empty() {
                return Err(ManagerError::UnknownPoint(point.to_string()));
            }
            matches
        };

        for index in indices {
            self.set_index(index, state, pulse as u64, cause).await;
        }

        Ok(())
    }

    async fn set_index(&mut self, index: usize, state: bool, pulse: u64, cause: &str) {
        let now_ts = now();
        let (name, device_id, child_id, address, detected) = {
            let Some(record) = self.table.get_mut(index) else {
                return;
            };
            record.commanded = state;
            record.pending = now_ts + COMMAND_TIMEOUT_SECS;
            record.deadline = if pulse > 0 { now_ts + pulse } else { 0 };
            (
                record.name.clone(),
                record.key.device_id.clone(),
                record.key.child_id.clone(),
                record.address,
                record.detected,
            )
        };

        if detected != 0 {
            if let Some(addr) = address {
                if let Ok(payload) = codec::encode_set_relay(&device_id, child_id.as_deref(), state)
                {
                    self.send(SocketAddr::V4(addr), payload).await;
                }
            }
        }

        let detail = if pulse > 0 {
            format!(
                "{} for {pulse}s (cause: {cause})",
                if state { "on" } else { "off" }
            )
        } else {
            format!("{} (cause: {cause})", if state { "on" } else { "off" })
        };
        self.events.emit(DeviceEvent::new("DEVICE", name, "SET", detail));
    }

    /// The 1 Hz wrapper: silence detection runs every tick; per-device
    /// probing and the command-state tick share the 5 s cadence; the
    /// broadcast sweep runs every 60 s.
    async fn tick(&mut self) {
        self.ticks += 1;
        self.silence_pass();

        if self.ticks % PROBE_CADENCE_SECS == 0 {
            self.probe_pass().await;
            self.retry_pass().await;
        }

        if self.ticks % BROADCAST_SWEEP_SECS == 0 {
            self.broadcast_pass().await;
        }

        if self.device_list_changed {
            self.persist().await;
        }
    }

    fn silence_pass(&mut self) {
        let now_ts = now();
        for index in 0..self.table.len() {
            let Some(record) = self.table.get_mut(index) else {
                continue;
            };
            if record.detected > 0 && record.detected < now_ts.saturating_sub(SILENCE_TIMEOUT_SECS)
            {
                let name = record.name.clone();
                record.reset(false);
                record.detected = 0;
                self.events
                    .emit(DeviceEvent::new("DEVICE", name, "SILENT", "no reply within liveness window"));
            }
        }
    }

    async fn probe_pass(&mut self) {
        let now_ts = now();
        let mut due: Vec<(usize, SocketAddrV4)> = Vec::new();
        for index in 0..self.table.len() {
            if let Some(record) = self.table.get(index) {
                if let Some(addr) = record.address {
                    if now_ts.saturating_sub(record.last_sense) >= PROBE_STALE_SECS {
                        due.push((index, addr));
                    }
                }
            }
        }

        for (index, addr) in due {
            if let Some(record) = self.table.get_mut(index) {
                record.last_sense = now_ts;
            }
            self.send_sense(SocketAddr::V4(addr)).await;
        }
    }

    async fn retry_pass(&mut self) {
        let now_ts = now();
        for index in 0..self.table.len() {
            self.tick_device(index, now_ts).await;
        }
    }

    /// Runs the two C5 tick steps with no early return between them - a
    /// pulse reset that lands in the same tick as a mismatch check falls
    /// straight through into it, which is why the first retransmission
    /// after a pulse expiry is labeled `RETRY`, not a separate event.
    async fn tick_device(&mut self, index: usize, now_ts: u64) {
        if let Some(record) = self.table.get_mut(index) {
            if record.deadline > 0 && now_ts >= record.deadline {
                let name = record.name.clone();
                record.commanded = false;
                record.pending = now_ts + COMMAND_TIMEOUT_SECS;
                record.deadline = 0;
                self.events
                    .emit(DeviceEvent::new("DEVICE", name, "RESET", "end of pulse"));
            }
        }

        let action = match self.table.get(index) {
            Some(record) if record.status != record.commanded => {
                if record.pending > now_ts {
                    if record.detected != 0 {
                        Some(MismatchAction::Retry)
                    } else {
                        Some(MismatchAction::WaitSilently)
                    }
                } else {
                    Some(MismatchAction::Timeout {
                        had_pending: record.pending > 0,
                    })
                }
            }
            _ => None,
        };

        match action {
            Some(MismatchAction::Retry) => {
                let (name, device_id, child_id, address, commanded) = {
                    let record = self.table.get(index).expect("index checked above");
                    (
                        record.name.clone(),
                        record.key.device_id.clone(),
                        record.key.child_id.clone(),
                        record.address,
                        record.commanded,
                    )
                };
                self.events.emit(DeviceEvent::new(
                    "DEVICE",
                    name,
                    "RETRY",
                    if commanded { "on" } else { "off" },
                ));
                if let Some(addr) = address {
                    if let Ok(payload) =
                        codec::encode_set_relay(&device_id, child_id.as_deref(), commanded)
                    {
                        self.send(SocketAddr::V4(addr), payload).await;
                    }
                }
            }
            Some(MismatchAction::WaitSilently) => {}
            Some(MismatchAction::Timeout { had_pending }) => {
                let (name, status) = {
                    let record = self.table.get(index).expect("index checked above");
                    (record.name.clone(), record.status)
                };
                if had_pending {
                    self.events
                        .emit(DeviceEvent::new("DEVICE", name, "TIMEOUT", "abandoning command"));
                }
                if let Some(record) = self.table.get_mut(index) {
                    record.reset(status);
                }
            }
            None => {}
        }
    }

    async fn broadcast_pass(&mut self) {
        for target in self.targets.clone() {
            let addr = SocketAddr::V4(SocketAddrV4::new(target.addr, KASA_PORT));
            self.send_sense(addr).await;
        }
    }

    async fn handle_datagram(&mut self, addr: SocketAddrV4, data: &[u8]) {
        match codec::decode_reply(data) {
            Ok(Reply::Sysinfo(info)) => self.handle_sysinfo(addr, info).await,
            Ok(Reply::SetRelayAck { ok }) => self.handle_set_relay_ack(addr, ok).await,
            Err(err) => {
                tracing::debug!(error = %err, %addr, "dropping malformed reply");
            }
        }
    }

    async fn handle_sysinfo(&mut self, addr: SocketAddrV4, info: Sysinfo) {
        let now_ts = now();
        if info.children.is_empty() {
            self.ingest_point(
                &info.device_id,
                None,
                info.alias.as_deref(),
                &info.model,
                addr,
                now_ts,
                info.relay_state.unwrap_or(false),
            );
        } else {
            for child in &info.children {
                self.ingest_point(
                    &info.device_id,
                    Some(child.id.as_str()),
                    child.alias.as_deref(),
                    &info.model,
                    addr,
                    now_ts,
                    child.state,
                );
            }
        }
    }

    /// Finds or creates the `(deviceId, childId)` record, refreshes its
    /// address and model, then runs `statusUpdate` against it.
    fn ingest_point(
        &mut self,
        device_id: &str,
        child_id: Option<&str>,
        alias: Option<&str>,
        model: &Option<String>,
        addr: SocketAddrV4,
        now_ts: u64,
        relay_state: bool,
    ) {
        let index = match self.table.find_by_id(device_id, child_id) {
            Some(index) => index,
            None => {
                let key = DeviceKey::new(device_id, child_id.map(|c| c.to_string()));
                let name = alias.unwrap_or(device_id).to_string();
                match self.table.add(key, name.clone(), model.clone()) {
                    Ok(index) => {
                        self.device_list_changed = true;
                        self.events.emit(DeviceEvent::new(
                            "DEVICE",
                            name,
                            "DISCOVERED",
                            format!("at {addr}"),
                        ));
                        // Pre-set `detected` so the statusUpdate call below does
                        // not also fire a DETECTED event for the same sighting.
                        if let Some(record) = self.table.get_mut(index) {
                            record.detected = now_ts;
                        }
                        index
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "device table full, dropping discovery");
                        return;
                    }
                }
            }
        };

        if let Some(record) = self.table.get_mut(index) {
            record.update_address(addr);
            record.seed_model_if_empty(model);
        }

        self.status_update(index, relay_state, now_ts);
    }

    fn status_update(&mut self, index: usize, new_status: bool, now_ts: u64) {
        let Some(record) = self.table.get_mut(index) else {
            return;
        };
        let reappeared = record.detected == 0;
        let name = record.name.clone();
        let address = record.address;

        if reappeared {
            self.events.emit(DeviceEvent::new(
                "DEVICE",
                name.clone(),
                "DETECTED",
                address.map(|a| a.to_string()).unwrap_or_default(),
            ));
        }

        if new_status != record.status {
            if record.pending != 0 && new_status == record.commanded {
                record.pending = 0;
                self.events.emit(DeviceEvent::new(
                    "DEVICE",
                    name.clone(),
                    "CONFIRMED",
                    if new_status { "on" } else { "off" },
                ));
            } else {
                let was = record.status;
                record.commanded = new_status;
                record.pending = 0;
                self.events.emit(DeviceEvent::new(
                    "DEVICE",
                    name,
                    "CHANGED",
                    format!(
                        "from {} to {}",
                        if was { "on" } else { "off" },
                        if new_status { "on" } else { "off" }
                    ),
                ));
            }
            record.status = new_status;
        }

        record.detected = now_ts;
    }

    async fn handle_set_relay_ack(&mut self, addr: SocketAddrV4, ok: bool) {
        if !ok {
            return;
        }
        if let Some(index) = self.table.find_by_address(addr) {
            if let Some(record) = self.table.get_mut(index) {
                record.last_sense = now();
            }
            self.send_sense(SocketAddr::V4(addr)).await;
        }
    }

    async fn send_sense(&self, addr: SocketAddr) {
        match codec::encode_sense() {
            Ok(payload) => self.send(addr, payload).await,
            Err(err) => tracing::warn!(error = %err, "failed to encode sense request"),
        }
    }

    async fn send(&self, addr: SocketAddr, payload: Bytes) {
        if let Err(err) = self.socket.send_to(&payload, addr).await {
            tracing::warn!(error = %err, %addr, "udp send failed");
        }
    }
}

fn point_status(record: &DeviceRecord) -> PointStatus {
    let state = if record.is_silent() {
        "silent".to_string()
    } else if record.status {
        "on".to_string()
    } else {
        "off".to_string()
    };
    PointStatus {
        state,
        command: if record.commanded { "on" } else { "off" }.to_string(),
        pulse: if record.deadline > 0 {
            Some(record.deadline)
        } else {
            None
        },
        gear: "light",
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    use super::*;

    struct MemoryStore(Mutex<Option<String>>);

    impl ConfigStore for MemoryStore {
        fn load(&self) -> std::io::Result<Option<String>> {
            Ok(self.0.lock().unwrap().clone())
        }

        fn save(&self, document: &str) -> std::io::Result<()> {
            *self.0.lock().unwrap() = Some(document.to_string());
            Ok(())
        }
    }

    async fn empty_manager() -> Manager {
        Manager::bind(EventChannel::new(), Box::new(MemoryStore(Mutex::new(None))))
            .await
            .unwrap()
    }

    fn addr(a: u8, b: u8, c: u8, d: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), KASA_PORT)
    }

    #[tokio::test]
    async fn s1_single_outlet_discovery_and_on() {
        let mut manager = empty_manager().await;
        manager.handle_sysinfo(
            addr(192, 168, 1, 10),
            Sysinfo {
                device_id: "AAA".into(),
                model: Some("HS100".into()),
                alias: Some("Lamp".into()),
                relay_state: Some(false),
                children: vec![],
            },
        ).await;

        assert_eq!(manager.table.len(), 1);
        assert!(manager.device_list_changed);
        let status = manager.snapshot();
        assert_eq!(status["Lamp"].state, "off");
        assert_eq!(status["Lamp"].command, "off");

        manager.set("Lamp", true, 0, "test").await.unwrap();
        let record = manager.table.get(0).unwrap();
        assert!(record.commanded);
        assert!(record.pending > 0);
    }

    #[tokio::test]
    async fn s2_multi_outlet_device_gets_two_records() {
        let mut manager = empty_manager().await;
        manager.handle_sysinfo(
            addr(192, 168, 1, 11),
            Sysinfo {
                device_id: "BBB".into(),
                model: None,
                alias: None,
                relay_state: None,
                children: vec![
                    codec::ChildSysinfo { id: "00".into(), alias: Some("Left".into()), state: false },
                    codec::ChildSysinfo { id: "01".into(), alias: Some("Right".into()), state: true },
                ],
            },
        ).await;

        assert_eq!(manager.table.len(), 2);
        assert!(manager.table.find_by_id("BBB", Some("00")).is_some());
        assert!(manager.table.find_by_id("BBB", Some("01")).is_some());
    }

    #[tokio::test]
    async fn s5_third_party_change_updates_commanded_without_retransmit() {
        let mut manager = empty_manager().await;
        manager.handle_sysinfo(
            addr(192, 168, 1, 10),
            Sysinfo {
                device_id: "AAA".into(),
                model: None,
                alias: Some("Lamp".into()),
                relay_state: Some(false),
                children: vec![],
            },
        ).await;

        manager.status_update(0, true, now());
        let record = manager.table.get(0).unwrap();
        assert!(record.status);
        assert!(record.commanded);
        assert_eq!(record.pending, 0);
    }

    #[tokio::test]
    async fn s6_confirmed_clears_pending_when_reply_matches_commanded() {
        let mut manager = empty_manager().await;
        manager.handle_sysinfo(
            addr(192, 168, 1, 10),
            Sysinfo {
                device_id: "AAA".into(),
                model: None,
                alias: Some("Lamp".into()),
                relay_state: Some(false),
                children: vec![],
            },
        ).await;
        manager.set("Lamp", true, 0, "test").await.unwrap();
        assert_ne!(manager.table.get(0).unwrap().pending, 0);

        manager.status_update(0, true, now());
        let record = manager.table.get(0).unwrap();
        assert_eq!(record.pending, 0);
        assert!(record.status);
        assert!(record.commanded);
    }

    #[tokio::test]
    async fn pulse_expiry_resets_commanded_and_falls_through_to_retry() {
        let mut manager = empty_manager().await;
        manager.handle_sysinfo(
            addr(192, 168, 1, 10),
            Sysinfo {
                device_id: "AAA".into(),
                model: None,
                alias: Some("Lamp".into()),
                relay_state: Some(true),
                children: vec![],
            },
        ).await;
        {
            let record = manager.table.get_mut(0).unwrap();
            record.commanded = true;
            record.status = true;
            record.deadline = now();
        }

        manager.tick_device(0, now()).await;
        let record = manager.table.get(0).unwrap();
        assert!(!record.commanded);
        assert_eq!(record.deadline, 0);
        assert!(record.pending > 0);
    }

    #[tokio::test]
    async fn unknown_point_is_rejected() {
        let mut manager = empty_manager().await;
        let err = manager.set("Nobody", true, 0, "test").await.unwrap_err();
        assert!(matches!(err, ManagerError::UnknownPoint(_)));
    }

    #[tokio::test]
    async fn negative_pulse_is_rejected() {
        let mut manager = empty_manager().await;
        let err = manager.set("all", true, -1, "test").await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidPulse));
    }

    #[tokio::test]
    async fn silence_detection_resets_and_clears_detected() {
        let mut manager = empty_manager().await;
        manager.handle_sysinfo(
            addr(192, 168, 1, 10),
            Sysinfo {
                device_id: "AAA".into(),
                model: None,
                alias: Some("Lamp".into()),
                relay_state: Some(true),
                children: vec![],
            },
        ).await;
        {
            let record = manager.table.get_mut(0).unwrap();
            record.detected = now().saturating_sub(SILENCE_TIMEOUT_SECS + 1);
        }

        manager.silence_pass();
        let status = manager.snapshot();
        assert_eq!(status["Lamp"].state, "silent");
        assert!(!manager.table.get(0).unwrap().commanded);
    }
}
