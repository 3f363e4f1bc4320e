//! Gateway: link workers, preamble demultiplexing, and the write API
//!
//! The gateway owns one worker task per configured link. Transport events
//! are routed to the owning worker over a channel, so all link state
//! (poll engine, reassembly buffers) is task-local and lock-free. Workers
//! push decoded results to the batch writer and resolve pending commands
//! through the shared command registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command::{CommandOutcome, CommandRegistry, CommandTicket};
use crate::config::ServiceConfig;
use crate::directory::DeviceDirectory;
use crate::error::{Result, TelSrvError};
use crate::model::{
    DeviceSnapshot, LinkId, LinkMode, LinkSnapshot, PeerAddr, ProtocolKind,
};
use crate::protocols::hydro::HydroDecoderRegistry;
use crate::protocols::modbus::poller::{EngineOutput, ModbusLink};
use crate::protocols::modbus::types::{plan_multi_write, plan_write, WriteOperation};
use crate::registry::ConnectionRegistry;
use crate::storage::BatchWriter;
use crate::transport::{LinkEvent, LinkTransport, TcpTransport};

/// Message delivered to a link worker
enum LinkMsg {
    Event(LinkEvent),
    Write {
        device: Arc<DeviceSnapshot>,
        ops: Vec<WriteOperation>,
        register: String,
        value: serde_json::Value,
        response_id: u64,
    },
    Command {
        device: Arc<DeviceSnapshot>,
        function: String,
        params: serde_json::Value,
        response_id: u64,
    },
    Rebuild,
}

type WorkerMap = Arc<RwLock<AHashMap<LinkId, mpsc::Sender<LinkMsg>>>>;

/// Issues writes and downlink commands against running links
#[derive(Clone)]
pub struct GatewayHandle {
    directory: Arc<DeviceDirectory>,
    commands: Arc<CommandRegistry>,
    workers: WorkerMap,
    command_timeout: Duration,
}

impl GatewayHandle {
    /// Write `value` to a named register of a device. Returns a ticket
    /// resolved by the device's acknowledgement or by timeout.
    pub async fn write_point(
        &self,
        link_id: LinkId,
        device_code: &str,
        register: &str,
        value: serde_json::Value,
    ) -> Result<CommandTicket> {
        let device = self
            .directory
            .device_by_link_and_code(link_id, device_code)
            .ok_or_else(|| {
                TelSrvError::DeviceNotFound(format!("{device_code} on link {link_id}"))
            })?;
        let worker = self
            .workers
            .read()
            .get(&link_id)
            .cloned()
            .ok_or_else(|| TelSrvError::LinkNotFound(format!("link {link_id} not running")))?;

        let ticket;
        let msg = match device.protocol {
            ProtocolKind::Modbus => {
                let def = device
                    .registers
                    .iter()
                    .find(|r| r.name == register)
                    .ok_or_else(|| {
                        TelSrvError::InvalidParameter(format!(
                            "device {device_code} has no register '{register}'"
                        ))
                    })?;
                let op = plan_write(def, device.byte_order, &value)?;
                // Validation happens before the device is marked busy
                ticket = self.commands.begin(device.key(), self.command_timeout)?;
                LinkMsg::Write {
                    device: device.clone(),
                    ops: vec![op],
                    register: register.to_string(),
                    value,
                    response_id: ticket.response_id,
                }
            }
            ProtocolKind::Hydro => {
                ticket = self.commands.begin(device.key(), self.command_timeout)?;
                LinkMsg::Command {
                    device: device.clone(),
                    function: register.to_string(),
                    params: value,
                    response_id: ticket.response_id,
                }
            }
        };
        self.deliver(worker, device, msg, ticket).await
    }

    /// Write several registers of one device as a single command.
    /// Contiguous holding registers go out as one multi-register frame;
    /// the ticket resolves after the last frame is acknowledged.
    pub async fn write_points(
        &self,
        link_id: LinkId,
        device_code: &str,
        values: &[(String, serde_json::Value)],
    ) -> Result<CommandTicket> {
        let device = self
            .directory
            .device_by_link_and_code(link_id, device_code)
            .ok_or_else(|| {
                TelSrvError::DeviceNotFound(format!("{device_code} on link {link_id}"))
            })?;
        if device.protocol != ProtocolKind::Modbus {
            return Err(TelSrvError::InvalidParameter(format!(
                "device {device_code} does not support register writes"
            )));
        }
        let worker = self
            .workers
            .read()
            .get(&link_id)
            .cloned()
            .ok_or_else(|| TelSrvError::LinkNotFound(format!("link {link_id} not running")))?;

        let mut entries = Vec::with_capacity(values.len());
        for (register, value) in values {
            let def = device
                .registers
                .iter()
                .find(|r| r.name == *register)
                .ok_or_else(|| {
                    TelSrvError::InvalidParameter(format!(
                        "device {device_code} has no register '{register}'"
                    ))
                })?;
            entries.push((def, value));
        }
        let ops = plan_multi_write(&entries, device.byte_order)?;
        if ops.is_empty() {
            return Err(TelSrvError::InvalidParameter(
                "empty write request".to_string(),
            ));
        }

        let ticket = self.commands.begin(device.key(), self.command_timeout)?;
        let names: Vec<&str> = values.iter().map(|(name, _)| name.as_str()).collect();
        let msg = LinkMsg::Write {
            device: device.clone(),
            ops,
            register: names.join(","),
            value: serde_json::Value::Object(
                values
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            ),
            response_id: ticket.response_id,
        };
        self.deliver(worker, device, msg, ticket).await
    }

    async fn deliver(
        &self,
        worker: mpsc::Sender<LinkMsg>,
        device: Arc<DeviceSnapshot>,
        msg: LinkMsg,
        ticket: CommandTicket,
    ) -> Result<CommandTicket> {
        if worker.send(msg).await.is_err() {
            self.commands.resolve(&device.key(), CommandOutcome::Failed);
            return Err(TelSrvError::LinkNotFound(format!(
                "link {} worker stopped",
                device.link_id
            )));
        }
        Ok(ticket)
    }
}

/// Top-level service wiring: transport, link workers, storage, commands
pub struct Gateway {
    config: ServiceConfig,
    directory: Arc<DeviceDirectory>,
    registry: Arc<ConnectionRegistry>,
    commands: Arc<CommandRegistry>,
    writer: BatchWriter,
    hydro: Arc<HydroDecoderRegistry>,
    transport: Arc<TcpTransport>,
    event_rx: mpsc::Receiver<LinkEvent>,
    workers: WorkerMap,
}

impl Gateway {
    pub fn new(
        config: ServiceConfig,
        directory: Arc<DeviceDirectory>,
        writer: BatchWriter,
        hydro: Arc<HydroDecoderRegistry>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            config,
            directory,
            registry: Arc::new(ConnectionRegistry::new()),
            commands: CommandRegistry::new(),
            writer,
            hydro,
            transport: Arc::new(TcpTransport::new(event_tx)),
            event_rx,
            workers: Arc::new(RwLock::new(AHashMap::new())),
        }
    }

    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            directory: self.directory.clone(),
            commands: self.commands.clone(),
            workers: self.workers.clone(),
            command_timeout: self.config.command.default_timeout(),
        }
    }

    /// Run until the transport event channel closes
    pub async fn run(mut self) -> Result<()> {
        if let Err(e) = self.directory.reload().await {
            warn!("initial directory load failed, starting empty: {e}");
        }
        let mut changes = self.directory.subscribe();
        changes.mark_unchanged();
        self.sync_links();

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.route(event).await,
                        None => break,
                    }
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    info!("directory changed, resyncing links");
                    self.sync_links();
                }
            }
        }
        self.transport.shutdown();
        Ok(())
    }

    async fn route(&self, event: LinkEvent) {
        let link_id = match &event {
            LinkEvent::Connected { link_id, .. }
            | LinkEvent::Data { link_id, .. }
            | LinkEvent::Disconnected { link_id, .. } => *link_id,
        };
        let worker = self.workers.read().get(&link_id).cloned();
        match worker {
            Some(tx) => {
                if tx.send(LinkMsg::Event(event)).await.is_err() {
                    warn!(link_id, "link worker gone, event dropped");
                }
            }
            None => debug!(link_id, "event for unknown link dropped"),
        }
    }

    /// Reconcile running links against the current directory snapshot
    fn sync_links(&self) {
        let snapshot = match self.directory.snapshot() {
            Some(s) => s,
            None => return,
        };

        let mut workers = self.workers.write();

        let stale: Vec<LinkId> = workers
            .keys()
            .filter(|id| !snapshot.links.contains_key(id))
            .copied()
            .collect();
        for link_id in stale {
            workers.remove(&link_id);
            self.transport.stop_link(link_id);
            self.registry.remove_by_link(link_id);
            info!(link_id, "link removed");
        }

        for link in snapshot.links.values() {
            if let Some(tx) = workers.get(&link.id) {
                // Known link: ask the worker to re-read its devices
                let _ = tx.try_send(LinkMsg::Rebuild);
                continue;
            }
            let tx = self.spawn_worker(link);
            workers.insert(link.id, tx);
            self.transport.start_link(link);
            info!(link_id = link.id, name = %link.name, "link started");
        }
    }

    fn spawn_worker(&self, link: &LinkSnapshot) -> mpsc::Sender<LinkMsg> {
        let (tx, rx) = mpsc::channel(256);
        let worker = LinkWorker {
            link: link.clone(),
            engine: match link.protocol {
                ProtocolKind::Modbus => LinkEngine::Modbus(ModbusLink::new(
                    link.id,
                    link.effective_frame_mode(self.config.modbus.listen_frame_mode),
                    self.config.modbus.merge_gap,
                    self.config.modbus.response_timeout(),
                )),
                ProtocolKind::Hydro => LinkEngine::Hydro {
                    decoders: self.hydro.clone(),
                },
            },
            directory: self.directory.clone(),
            registry: self.registry.clone(),
            commands: self.commands.clone(),
            writer: self.writer.clone(),
            transport: self.transport.clone(),
            poll_tick: self.config.modbus.poll_tick(),
        };
        tokio::spawn(worker.run(rx));
        tx
    }
}

enum LinkEngine {
    Modbus(ModbusLink),
    Hydro { decoders: Arc<HydroDecoderRegistry> },
}

struct LinkWorker {
    link: LinkSnapshot,
    engine: LinkEngine,
    directory: Arc<DeviceDirectory>,
    registry: Arc<ConnectionRegistry>,
    commands: Arc<CommandRegistry>,
    writer: BatchWriter,
    transport: Arc<dyn LinkTransport>,
    poll_tick: Duration,
}

impl LinkWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<LinkMsg>) {
        self.rebuild();
        let mut tick = tokio::time::interval(self.poll_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(LinkMsg::Event(event)) => self.on_event(event).await,
                        Some(LinkMsg::Write { device, ops, register, value, response_id }) => {
                            if let LinkEngine::Modbus(engine) = &mut self.engine {
                                let out = engine.push_write(
                                    device, ops, register, value, response_id, Instant::now(),
                                );
                                self.dispatch(out, None).await;
                            }
                        }
                        Some(LinkMsg::Command { device, function, params, response_id }) => {
                            self.on_hydro_command(device, &function, &params, response_id).await;
                        }
                        Some(LinkMsg::Rebuild) => self.rebuild(),
                        None => {
                            debug!(link_id = self.link.id, "link worker stopping");
                            return;
                        }
                    }
                }
                _ = tick.tick() => {
                    if let LinkEngine::Modbus(engine) = &mut self.engine {
                        let out = engine.on_tick(Instant::now());
                        self.dispatch(out, None).await;
                    }
                }
            }
        }
    }

    fn rebuild(&mut self) {
        let devices = self.directory.devices_on_link(self.link.id);
        if let LinkEngine::Modbus(engine) = &mut self.engine {
            engine.rebuild_contexts(&devices, Instant::now());
        }
    }

    async fn on_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { peer, .. } => {
                debug!(link_id = self.link.id, %peer, "peer connected");
            }
            LinkEvent::Disconnected { peer, .. } => {
                self.registry.remove_by_peer(self.link.id, peer);
                if let LinkEngine::Modbus(engine) = &mut self.engine {
                    engine.remove_peer(peer);
                }
                debug!(link_id = self.link.id, %peer, "peer disconnected");
            }
            LinkEvent::Data { peer, bytes, .. } => self.on_data(peer, &bytes).await,
        }
    }

    async fn on_data(&mut self, peer: PeerAddr, chunk: &[u8]) {
        let devices = self.directory.devices_on_link(self.link.id);
        if devices.is_empty() {
            // Data before configuration: trigger a cooled-down reload
            // and drop the chunk
            debug!(link_id = self.link.id, "data with no directory, reload requested");
            self.directory.request_reload();
            return;
        }

        let mut payload = chunk;
        if let Some((device, rest)) = match_preamble(&devices, chunk) {
            self.registry.register(device.key(), self.link.id, peer);
            debug!(
                link_id = self.link.id,
                device_id = device.id,
                %peer,
                "device preamble matched"
            );
            payload = rest;
            if payload.is_empty() {
                return;
            }
        } else if self.requires_registration(&devices)
            && !self.registry.is_registered(self.link.id, peer)
        {
            debug!(link_id = self.link.id, %peer, "unregistered peer, chunk dropped");
            return;
        }

        match &mut self.engine {
            LinkEngine::Modbus(engine) => {
                let out = engine.on_bytes(peer, payload, Instant::now());
                self.dispatch(out, Some(peer)).await;
            }
            LinkEngine::Hydro { decoders } => {
                let decoders = decoders.clone();
                self.on_hydro_data(&decoders, &devices, peer, payload).await;
            }
        }
    }

    /// Drop non-preamble traffic from unknown peers when any device on
    /// the link insists on registration
    fn requires_registration(&self, devices: &[Arc<DeviceSnapshot>]) -> bool {
        self.link.mode == LinkMode::Listen
            && devices.iter().any(|d| d.require_registration)
    }

    async fn on_hydro_data(
        &mut self,
        decoders: &HydroDecoderRegistry,
        devices: &[Arc<DeviceSnapshot>],
        peer: PeerAddr,
        payload: &[u8],
    ) {
        let device = match self.hydro_device_for_peer(devices, peer) {
            Some(d) => d,
            None => {
                debug!(link_id = self.link.id, %peer, "no hydro device for peer, dropped");
                return;
            }
        };
        let decoder = match decoders.for_device("") {
            Ok(d) => d,
            Err(e) => {
                warn!(link_id = self.link.id, "{e}");
                return;
            }
        };

        match decoder.decode(&device, payload) {
            Ok(out) => {
                self.registry.register(device.key(), self.link.id, peer);
                for result in out.results {
                    self.writer.submit(result);
                }
                // Only an explicit acknowledgement resolves a pending
                // command, and only when its correlation id matches
                for ack in out.acks {
                    let key = crate::model::DeviceKey::by_code(self.link.id, &ack.device_code);
                    let outcome = if ack.success {
                        CommandOutcome::Success
                    } else {
                        CommandOutcome::Failed
                    };
                    if self
                        .commands
                        .resolve_matching(&key, ack.response_id, outcome)
                        .is_none()
                    {
                        debug!(
                            link_id = self.link.id,
                            device = %ack.device_code,
                            function = %ack.function,
                            "ack without a matching pending command"
                        );
                    }
                }
                for reply in out.replies {
                    if let Err(e) = self.transport.send_to_peer(self.link.id, peer, &reply).await
                    {
                        debug!(link_id = self.link.id, %peer, "reply failed: {e}");
                    }
                }
            }
            Err(e) => {
                debug!(link_id = self.link.id, device_id = device.id, "hydro decode failed: {e}");
            }
        }
    }

    fn hydro_device_for_peer(
        &self,
        devices: &[Arc<DeviceSnapshot>],
        peer: PeerAddr,
    ) -> Option<Arc<DeviceSnapshot>> {
        if devices.len() == 1 {
            return Some(devices[0].clone());
        }
        devices
            .iter()
            .find(|d| {
                self.registry
                    .get(&d.key())
                    .is_some_and(|rec| rec.peer == peer)
            })
            .cloned()
    }

    async fn on_hydro_command(
        &mut self,
        device: Arc<DeviceSnapshot>,
        function: &str,
        params: &serde_json::Value,
        response_id: u64,
    ) {
        let decoders = match &self.engine {
            LinkEngine::Hydro { decoders } => decoders.clone(),
            LinkEngine::Modbus(_) => return,
        };
        let frame = decoders
            .for_device("")
            .and_then(|d| d.build_command(&device, function, params, response_id));
        match frame {
            Ok(frame) => self.send_to_device(&device.key(), &frame).await,
            Err(e) => {
                warn!(device_id = device.id, "command build failed: {e}");
                self.commands.resolve(&device.key(), CommandOutcome::Failed);
            }
        }
    }

    async fn dispatch(&mut self, out: EngineOutput, peer: Option<PeerAddr>) {
        for key in out.learned {
            if let Some(peer) = peer {
                self.registry.register(key, self.link.id, peer);
            }
        }
        for resolved in out.resolved {
            self.commands.resolve(&resolved.device, resolved.outcome);
        }
        for key in out.expired {
            // Stop directing frames at a peer that went quiet; the next
            // poll broadcasts until the device answers again
            self.registry.remove(&key);
        }
        for result in out.results {
            self.writer.submit(result);
        }
        for frame in out.send {
            self.send_to_device(&frame.device, &frame.bytes).await;
        }
    }

    /// Directed send when the device's peer is known, broadcast otherwise
    async fn send_to_device(&self, device: &crate::model::DeviceKey, bytes: &[u8]) {
        let result = match self.registry.get(device) {
            Some(rec) => {
                self.transport
                    .send_to_peer(self.link.id, rec.peer, bytes)
                    .await
            }
            None => self.transport.send_to_link(self.link.id, bytes).await,
        };
        if let Err(e) = result {
            debug!(link_id = self.link.id, %device, "send failed: {e}");
        }
    }
}

/// Match a device preamble at the chunk start. A registration sequence
/// strips as a prefix, leaving any trailing protocol bytes; a heartbeat
/// only counts when it is the whole chunk. Longest match wins.
fn match_preamble<'a>(
    devices: &[Arc<DeviceSnapshot>],
    chunk: &'a [u8],
) -> Option<(Arc<DeviceSnapshot>, &'a [u8])> {
    let mut best: Option<(Arc<DeviceSnapshot>, usize)> = None;
    for device in devices {
        let registration = &device.registration;
        if !registration.is_empty()
            && chunk.starts_with(registration)
            && best
                .as_ref()
                .is_none_or(|(_, len)| registration.len() > *len)
        {
            best = Some((device.clone(), registration.len()));
        }
        let heartbeat = &device.heartbeat;
        if !heartbeat.is_empty()
            && chunk == heartbeat.as_slice()
            && best.as_ref().is_none_or(|(_, len)| heartbeat.len() > *len)
        {
            best = Some((device.clone(), heartbeat.len()));
        }
    }
    best.map(|(device, len)| (device, &chunk[len..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::testing::StaticDirectorySource;
    use crate::model::{ByteOrder, DataType, FrameMode, RegisterDefinition, RegisterKind};
    use crate::protocols::modbus::frame::build_rtu_frame;
    use crate::storage::store::HistoryStore;
    use crate::transport::testing::RecordingTransport;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use serde_json::json;

    struct MemoryStore {
        rows: Mutex<Vec<crate::model::ParsedFrameResult>>,
    }

    #[async_trait]
    impl HistoryStore for MemoryStore {
        async fn insert_batch(&self, rows: &[crate::model::ParsedFrameResult]) -> Result<()> {
            self.rows.lock().extend(rows.iter().cloned());
            Ok(())
        }
        async fn insert_one(&self, row: &crate::model::ParsedFrameResult) -> Result<()> {
            self.rows.lock().push(row.clone());
            Ok(())
        }
    }

    fn modbus_link(require_registration: bool) -> (LinkSnapshot, Arc<DeviceSnapshot>) {
        let link = LinkSnapshot {
            id: 1,
            name: "north".to_string(),
            protocol: ProtocolKind::Modbus,
            mode: LinkMode::Listen,
            endpoint: "0.0.0.0:0".to_string(),
            frame_mode: Some(FrameMode::Checksum),
        };
        let device = Arc::new(DeviceSnapshot {
            id: 1,
            code: "STN-01".to_string(),
            link_id: 1,
            protocol: ProtocolKind::Modbus,
            heartbeat: vec![0x24, 0x24],
            registration: vec![0x24, 0x24, 0x30, 0x31],
            require_registration,
            poll_interval_secs: 3600,
            byte_order: ByteOrder::BigEndian,
            unit_id: 1,
            registers: vec![RegisterDefinition {
                id: 1,
                name: "level".to_string(),
                kind: RegisterKind::HoldingRegister,
                address: 100,
                data_type: DataType::U16,
                quantity: 1,
                decimals: None,
                unit: None,
                dictionary: None,
            }],
        });
        (link, device)
    }

    fn hydro_link() -> (LinkSnapshot, Arc<DeviceSnapshot>) {
        let link = LinkSnapshot {
            id: 1,
            name: "south".to_string(),
            protocol: ProtocolKind::Hydro,
            mode: LinkMode::Listen,
            endpoint: "0.0.0.0:0".to_string(),
            frame_mode: None,
        };
        let device = Arc::new(DeviceSnapshot {
            id: 9,
            code: "HYD-01".to_string(),
            link_id: 1,
            protocol: ProtocolKind::Hydro,
            heartbeat: Vec::new(),
            registration: Vec::new(),
            require_registration: false,
            poll_interval_secs: 3600,
            byte_order: ByteOrder::BigEndian,
            unit_id: 1,
            registers: Vec::new(),
        });
        (link, device)
    }

    fn kv_engine() -> LinkEngine {
        let mut decoders = HydroDecoderRegistry::new();
        decoders.register(Arc::new(crate::protocols::hydro::testing::KvDecoder));
        LinkEngine::Hydro {
            decoders: Arc::new(decoders),
        }
    }

    struct Rig {
        worker_tx: mpsc::Sender<LinkMsg>,
        transport: Arc<RecordingTransport>,
        store: Arc<MemoryStore>,
        registry: Arc<ConnectionRegistry>,
        commands: Arc<CommandRegistry>,
        directory: Arc<DeviceDirectory>,
    }

    async fn rig(link: LinkSnapshot, device: Arc<DeviceSnapshot>) -> Rig {
        let engine = LinkEngine::Modbus(ModbusLink::new(
            1,
            FrameMode::Checksum,
            1,
            Duration::from_secs(10),
        ));
        rig_with(link, vec![(*device).clone()], engine).await
    }

    async fn rig_with(link: LinkSnapshot, devices: Vec<DeviceSnapshot>, engine: LinkEngine) -> Rig {
        let source = Arc::new(StaticDirectorySource {
            links: vec![link.clone()],
            devices,
        });
        let directory = DeviceDirectory::new(source, Duration::from_secs(5));
        directory.reload().await.expect("reload");

        let transport = RecordingTransport::new();
        let store = Arc::new(MemoryStore {
            rows: Mutex::new(Vec::new()),
        });
        let (writer, _handle) = BatchWriter::spawn(
            store.clone(),
            None,
            1,
            Duration::from_millis(10),
            None,
        );
        let registry = Arc::new(ConnectionRegistry::new());
        let commands = CommandRegistry::new();

        let (worker_tx, worker_rx) = mpsc::channel(64);
        let worker = LinkWorker {
            link,
            engine,
            directory: directory.clone(),
            registry: registry.clone(),
            commands: commands.clone(),
            writer,
            transport: transport.clone(),
            poll_tick: Duration::from_millis(20),
        };
        tokio::spawn(worker.run(worker_rx));

        Rig {
            worker_tx,
            transport,
            store,
            registry,
            commands,
            directory,
        }
    }

    fn peer() -> PeerAddr {
        "10.1.1.1:40000".parse().expect("peer")
    }

    async fn send_data(rig: &Rig, bytes: &[u8]) {
        rig.worker_tx
            .send(LinkMsg::Event(LinkEvent::Data {
                link_id: 1,
                peer: peer(),
                bytes: Bytes::copy_from_slice(bytes),
            }))
            .await
            .expect("send");
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_registration_preamble_registers_peer() {
        let (link, device) = modbus_link(true);
        let rig = rig(link, device.clone()).await;

        assert!(rig.registry.get(&device.key()).is_none());
        send_data(&rig, &[0x24, 0x24, 0x30, 0x31]).await;
        let rec = rig.registry.get(&device.key()).expect("registered");
        assert_eq!(rec.peer, peer());
    }

    #[tokio::test]
    async fn test_unregistered_peer_chunk_dropped() {
        let (link, device) = modbus_link(true);
        let rig = rig(link, device.clone()).await;
        // Give the poll tick time to put a read on the wire
        tokio::time::sleep(Duration::from_millis(50)).await;
        rig.transport.take_sent();

        // Protocol bytes from a peer that never registered: dropped, so
        // the in-flight request stays unanswered and nothing is stored
        let response = build_rtu_frame(1, &[0x03, 0x02, 0x00, 0x2A]);
        send_data(&rig, &response).await;
        assert!(rig.store.rows.lock().is_empty());

        // After registration the same bytes complete the poll
        send_data(&rig, &[0x24, 0x24, 0x30, 0x31]).await;
        send_data(&rig, &response).await;
        let rows = rig.store.rows.lock();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].points["level"].value, json!(42));
    }

    #[tokio::test]
    async fn test_one_gated_device_gates_the_whole_link() {
        let (link, gated) = modbus_link(true);
        let mut open = (*gated).clone();
        open.id = 2;
        open.code = "STN-02".to_string();
        open.unit_id = 2;
        open.require_registration = false;
        open.heartbeat = Vec::new();
        open.registration = Vec::new();
        open.registers = Vec::new();
        let engine = LinkEngine::Modbus(ModbusLink::new(
            1,
            FrameMode::Checksum,
            1,
            Duration::from_secs(10),
        ));
        let rig = rig_with(link, vec![(*gated).clone(), open], engine).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        rig.transport.take_sent();

        // One device demanding registration gates the peer's protocol
        // traffic even though the other device does not
        let response = build_rtu_frame(1, &[0x03, 0x02, 0x00, 0x2A]);
        send_data(&rig, &response).await;
        assert!(rig.store.rows.lock().is_empty());

        // After the gated device's registration the peer is trusted
        send_data(&rig, &[0x24, 0x24, 0x30, 0x31]).await;
        send_data(&rig, &response).await;
        assert_eq!(rig.store.rows.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_poll_sent_and_result_stored() {
        let (link, device) = modbus_link(false);
        let rig = rig(link, device).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = rig.transport.take_sent();
        assert!(!sent.is_empty());
        // Unregistered device on a listen link polls by broadcast
        assert_eq!(sent[0].peer, None);
        assert_eq!(&sent[0].data[..6], &[0x01, 0x03, 0x00, 0x64, 0x00, 0x01]);

        let response = build_rtu_frame(1, &[0x03, 0x02, 0x00, 0x2A]);
        send_data(&rig, &response).await;
        let rows = rig.store.rows.lock();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].points["level"].value, json!(42));
    }

    #[tokio::test]
    async fn test_response_learns_peer_for_directed_sends() {
        let (link, device) = modbus_link(false);
        let rig = rig(link, device.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = build_rtu_frame(1, &[0x03, 0x02, 0x00, 0x2A]);
        send_data(&rig, &response).await;
        let rec = rig.registry.get(&device.key()).expect("learned");
        assert_eq!(rec.peer, peer());
    }

    #[tokio::test]
    async fn test_write_roundtrip_resolves_ticket() {
        let (link, device) = modbus_link(false);
        let rig = rig(link, device.clone()).await;
        // Drain the initial poll so the write is next on the wire
        tokio::time::sleep(Duration::from_millis(50)).await;
        let response = build_rtu_frame(1, &[0x03, 0x02, 0x00, 0x2A]);
        send_data(&rig, &response).await;
        rig.transport.take_sent();

        let handle = GatewayHandle {
            directory: rig.directory.clone(),
            commands: rig.commands.clone(),
            workers: {
                let map = Arc::new(RwLock::new(AHashMap::new()));
                map.write().insert(1, rig.worker_tx.clone());
                map
            },
            command_timeout: Duration::from_secs(5),
        };
        let ticket = handle
            .write_point(1, "STN-01", "level", json!(99))
            .await
            .expect("write");
        tokio::time::sleep(Duration::from_millis(30)).await;

        let sent = rig.transport.take_sent();
        assert!(!sent.is_empty());
        // FC06 to address 100 value 99, directed at the learned peer
        assert_eq!(&sent[0].data[..6], &[0x01, 0x06, 0x00, 0x64, 0x00, 0x63]);
        assert_eq!(sent[0].peer, Some(peer()));

        let echo = build_rtu_frame(1, &[0x06, 0x00, 0x64, 0x00, 0x63]);
        send_data(&rig, &echo).await;
        assert_eq!(ticket.wait().await, CommandOutcome::Success);
    }

    #[tokio::test]
    async fn test_multi_write_coalesces_contiguous_registers() {
        let (link, device) = modbus_link(false);
        let mut device = (*device).clone();
        device.registers = vec![
            RegisterDefinition {
                id: 1,
                name: "gate_a".to_string(),
                kind: RegisterKind::HoldingRegister,
                address: 200,
                data_type: DataType::U16,
                quantity: 1,
                decimals: None,
                unit: None,
                dictionary: None,
            },
            RegisterDefinition {
                id: 2,
                name: "gate_b".to_string(),
                kind: RegisterKind::HoldingRegister,
                address: 201,
                data_type: DataType::U16,
                quantity: 1,
                decimals: None,
                unit: None,
                dictionary: None,
            },
        ];
        let device = Arc::new(device);
        let rig = rig(link, device).await;
        // Answer the startup poll (merged read of 200..202) so the
        // write goes straight on the wire
        tokio::time::sleep(Duration::from_millis(50)).await;
        let response = build_rtu_frame(1, &[0x03, 0x04, 0x00, 0x00, 0x00, 0x00]);
        send_data(&rig, &response).await;
        rig.transport.take_sent();

        let handle = GatewayHandle {
            directory: rig.directory.clone(),
            commands: rig.commands.clone(),
            workers: {
                let map = Arc::new(RwLock::new(AHashMap::new()));
                map.write().insert(1, rig.worker_tx.clone());
                map
            },
            command_timeout: Duration::from_secs(5),
        };
        let ticket = handle
            .write_points(
                1,
                "STN-01",
                &[
                    ("gate_a".to_string(), json!(7)),
                    ("gate_b".to_string(), json!(9)),
                ],
            )
            .await
            .expect("write");
        tokio::time::sleep(Duration::from_millis(30)).await;

        let sent = rig.transport.take_sent();
        assert!(!sent.is_empty());
        // One FC16 frame covering both registers
        assert_eq!(
            &sent[0].data[..11],
            &[0x01, 0x10, 0x00, 0xC8, 0x00, 0x02, 0x04, 0x00, 0x07, 0x00, 0x09]
        );

        let echo = build_rtu_frame(1, &[0x10, 0x00, 0xC8, 0x00, 0x02]);
        send_data(&rig, &echo).await;
        assert_eq!(ticket.wait().await, CommandOutcome::Success);
    }

    #[tokio::test]
    async fn test_write_unknown_register_rejected() {
        let (link, device) = modbus_link(false);
        let rig = rig(link, device).await;
        let handle = GatewayHandle {
            directory: rig.directory.clone(),
            commands: rig.commands.clone(),
            workers: {
                let map = Arc::new(RwLock::new(AHashMap::new()));
                map.write().insert(1, rig.worker_tx.clone());
                map
            },
            command_timeout: Duration::from_secs(5),
        };
        let err = handle.write_point(1, "STN-01", "nope", json!(1)).await;
        assert!(matches!(err, Err(TelSrvError::InvalidParameter(_))));
        let err = handle.write_point(1, "GHOST", "level", json!(1)).await;
        assert!(matches!(err, Err(TelSrvError::DeviceNotFound(_))));
    }

    #[test]
    fn test_match_preamble_prefers_longest() {
        let (_, device) = modbus_link(false);
        let devices = vec![device.clone()];
        // Registration (4 bytes) wins over heartbeat (2 bytes)
        let (matched, rest) =
            match_preamble(&devices, &[0x24, 0x24, 0x30, 0x31, 0xAA]).expect("match");
        assert_eq!(matched.id, device.id);
        assert_eq!(rest, &[0xAA]);

        let (_, rest) = match_preamble(&devices, &[0x24, 0x24]).expect("heartbeat");
        assert!(rest.is_empty());
        assert!(match_preamble(&devices, &[0x7E, 0x7E]).is_none());
    }

    #[test]
    fn test_heartbeat_matches_whole_chunk_only() {
        let (_, device) = modbus_link(false);
        let devices = vec![device];
        // Heartbeat followed by protocol bytes is not a preamble; the
        // chunk must survive intact for the frame parser
        assert!(match_preamble(&devices, &[0x24, 0x24, 0xAA, 0xBB]).is_none());
        // Registration still strips as a prefix
        let (_, rest) =
            match_preamble(&devices, &[0x24, 0x24, 0x30, 0x31, 0x01]).expect("match");
        assert_eq!(rest, &[0x01]);
    }

    #[tokio::test]
    async fn test_hydro_ack_resolves_matching_command() {
        let (link, device) = hydro_link();
        let rig = rig_with(link, vec![(*device).clone()], kv_engine()).await;

        let ticket = rig
            .commands
            .begin(device.key(), Duration::from_secs(5))
            .expect("begin");
        let response_id = ticket.response_id;

        // An ack for some other command leaves the ticket pending
        send_data(&rig, format!("ACK:setpoint:{}", response_id + 10).as_bytes()).await;
        assert!(rig.commands.is_pending(&device.key()));

        send_data(&rig, format!("ACK:setpoint:{response_id}").as_bytes()).await;
        assert_eq!(ticket.wait().await, CommandOutcome::Success);
    }

    #[tokio::test]
    async fn test_hydro_report_leaves_command_pending() {
        let (link, device) = hydro_link();
        let rig = rig_with(link, vec![(*device).clone()], kv_engine()).await;

        let ticket = rig
            .commands
            .begin(device.key(), Duration::from_secs(5))
            .expect("begin");

        // An ordinary report is stored, but only an explicit ack may
        // resolve the outstanding command
        send_data(&rig, b"level=3.25").await;
        assert_eq!(rig.store.rows.lock().len(), 1);
        assert!(rig.commands.is_pending(&device.key()));
        drop(ticket);
    }
}
