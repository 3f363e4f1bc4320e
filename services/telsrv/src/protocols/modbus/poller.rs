//! Per-link Modbus engine
//!
//! One engine per link, driven by its link worker: ticks schedule polls
//! and sweep timeouts, incoming bytes complete the request in flight.
//! The engine does no I/O; it returns frames to transmit and decoded
//! results, which keeps every scheduling rule unit-testable. A link
//! carries at most one request in flight, and queued writes always run
//! before queued reads.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use tracing::{debug, warn};

use super::codec::{build_read_request, parse_response, ResponsePdu};
use super::constants::{exception_name, UNIT_MAX, UNIT_MIN};
use super::frame::{build_rtu_frame, build_tcp_frame, FrameAccumulator, ModbusAdu};
use super::group::{plan_groups, ReadGroup};
use super::types::WriteOperation;
use crate::command::CommandOutcome;
use crate::model::{
    DeviceKey, DeviceSnapshot, FrameMode, LinkId, ParsedFrameResult, PeerAddr, PointValue,
};

/// A frame the worker should transmit, addressed by device so the worker
/// can pick a peer from the connection registry
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub device: DeviceKey,
    pub bytes: Vec<u8>,
}

/// A write whose outcome is now known
#[derive(Debug, Clone)]
pub struct ResolvedWrite {
    pub device: DeviceKey,
    pub response_id: u64,
    pub outcome: CommandOutcome,
}

/// Everything one engine step produced
#[derive(Debug, Default)]
pub struct EngineOutput {
    pub send: Vec<OutboundFrame>,
    pub results: Vec<ParsedFrameResult>,
    pub resolved: Vec<ResolvedWrite>,
    /// Devices confirmed present on the peer the bytes came from
    pub learned: Vec<DeviceKey>,
    /// Devices whose request timed out; their learned peer mapping is
    /// stale and the next poll falls back to broadcast
    pub expired: Vec<DeviceKey>,
}

impl EngineOutput {
    fn merge(&mut self, other: EngineOutput) {
        self.send.extend(other.send);
        self.results.extend(other.results);
        self.resolved.extend(other.resolved);
        self.learned.extend(other.learned);
        self.expired.extend(other.expired);
    }
}

enum Request {
    Read {
        device: Arc<DeviceSnapshot>,
        group: ReadGroup,
    },
    /// One logical write command, possibly spanning several frames when
    /// the registers did not coalesce into one operation
    Write {
        device: Arc<DeviceSnapshot>,
        ops: Vec<WriteOperation>,
        index: usize,
        register: String,
        value: serde_json::Value,
        response_id: u64,
    },
}

impl Request {
    fn unit_id(&self) -> u8 {
        match self {
            Request::Read { device, .. } | Request::Write { device, .. } => device.unit_id,
        }
    }

    fn device(&self) -> &Arc<DeviceSnapshot> {
        match self {
            Request::Read { device, .. } | Request::Write { device, .. } => device,
        }
    }
}

struct InFlight {
    request: Request,
    sent_at: Instant,
    transaction_id: Option<u16>,
}

struct DeviceContext {
    device: Arc<DeviceSnapshot>,
    groups: Vec<ReadGroup>,
    next_poll: Instant,
    /// Reads of the current poll cycle still queued or on the wire.
    /// The interval restarts only when this drops back to zero.
    outstanding: usize,
}

/// Modbus master state for one link
pub struct ModbusLink {
    link_id: LinkId,
    frame_mode: FrameMode,
    merge_gap: u16,
    response_timeout: Duration,
    contexts: HashMap<u8, DeviceContext>,
    queue: VecDeque<Request>,
    in_flight: Option<InFlight>,
    accumulators: AHashMap<PeerAddr, FrameAccumulator>,
    next_transaction: u16,
}

impl ModbusLink {
    pub fn new(
        link_id: LinkId,
        frame_mode: FrameMode,
        merge_gap: u16,
        response_timeout: Duration,
    ) -> Self {
        Self {
            link_id,
            frame_mode,
            merge_gap,
            response_timeout,
            contexts: HashMap::new(),
            queue: VecDeque::new(),
            in_flight: None,
            accumulators: AHashMap::new(),
            next_transaction: 0,
        }
    }

    /// Replace the device set after a directory change. Queued and
    /// in-flight requests referencing the old snapshot are dropped.
    pub fn rebuild_contexts(&mut self, devices: &[Arc<DeviceSnapshot>], now: Instant) {
        self.contexts.clear();
        self.queue.clear();
        self.in_flight = None;

        for device in devices {
            if device.unit_id < UNIT_MIN || device.unit_id > UNIT_MAX {
                warn!(
                    link_id = self.link_id,
                    device_id = device.id,
                    unit_id = device.unit_id,
                    "unit id out of range, device skipped"
                );
                continue;
            }
            if self.contexts.contains_key(&device.unit_id) {
                warn!(
                    link_id = self.link_id,
                    unit_id = device.unit_id,
                    "duplicate unit id on link, device skipped"
                );
                continue;
            }
            let groups = plan_groups(&device.registers, self.merge_gap);
            self.contexts.insert(
                device.unit_id,
                DeviceContext {
                    device: device.clone(),
                    groups,
                    next_poll: now,
                    outstanding: 0,
                },
            );
        }
        debug!(
            link_id = self.link_id,
            devices = self.contexts.len(),
            "poll contexts rebuilt"
        );
    }

    /// Queue a write. Writes preempt queued reads but never the request
    /// already on the wire; among themselves they stay FIFO.
    pub fn push_write(
        &mut self,
        device: Arc<DeviceSnapshot>,
        ops: Vec<WriteOperation>,
        register: String,
        value: serde_json::Value,
        response_id: u64,
        now: Instant,
    ) -> EngineOutput {
        let mut out = EngineOutput::default();
        if ops.is_empty() {
            out.resolved.push(ResolvedWrite {
                device: device.key(),
                response_id,
                outcome: CommandOutcome::Failed,
            });
            return out;
        }

        let insert_at = self
            .queue
            .iter()
            .position(|r| matches!(r, Request::Read { .. }))
            .unwrap_or(self.queue.len());
        self.queue.insert(
            insert_at,
            Request::Write {
                device,
                ops,
                index: 0,
                register,
                value,
                response_id,
            },
        );

        self.try_start(now, &mut out);
        out
    }

    /// Periodic tick: sweep the in-flight timeout, schedule due polls,
    /// start the next request if the wire is idle
    pub fn on_tick(&mut self, now: Instant) -> EngineOutput {
        let mut out = EngineOutput::default();

        if let Some(in_flight) = &self.in_flight {
            if now.duration_since(in_flight.sent_at) >= self.response_timeout {
                let dropped = self.in_flight.take();
                if let Some(in_flight) = dropped {
                    let device = in_flight.request.device();
                    let unit_id = device.unit_id;
                    warn!(
                        link_id = self.link_id,
                        unit_id,
                        "request timed out"
                    );
                    // Learned peer mapping may be stale; fall back to
                    // broadcast until the device answers again
                    out.expired.push(device.key());
                    match in_flight.request {
                        Request::Write {
                            device,
                            response_id,
                            ..
                        } => {
                            out.resolved.push(ResolvedWrite {
                                device: device.key(),
                                response_id,
                                outcome: CommandOutcome::Timeout,
                            });
                        }
                        Request::Read { .. } => self.finish_read(unit_id, now),
                    }
                }
            }
        }

        for ctx in self.contexts.values_mut() {
            if now < ctx.next_poll || ctx.groups.is_empty() {
                continue;
            }
            // A slow device must not pile duplicate cycles into the
            // queue; the interval restarts when the cycle finishes
            if ctx.outstanding > 0 {
                debug!(
                    link_id = self.link_id,
                    unit_id = ctx.device.unit_id,
                    "previous poll cycle still outstanding, skipping"
                );
                continue;
            }
            ctx.outstanding = ctx.groups.len();
            for group in &ctx.groups {
                self.queue.push_back(Request::Read {
                    device: ctx.device.clone(),
                    group: group.clone(),
                });
            }
        }

        self.try_start(now, &mut out);
        out
    }

    /// Feed raw bytes received from `peer`
    pub fn on_bytes(&mut self, peer: PeerAddr, chunk: &[u8], now: Instant) -> EngineOutput {
        let mode = self.frame_mode;
        let frames = self
            .accumulators
            .entry(peer)
            .or_insert_with(|| FrameAccumulator::new(mode))
            .push(chunk);

        let mut out = EngineOutput::default();
        for adu in frames {
            out.merge(self.on_frame(adu, now));
        }
        out
    }

    /// Drop a disconnected peer's reassembly state
    pub fn remove_peer(&mut self, peer: PeerAddr) {
        self.accumulators.remove(&peer);
    }

    fn on_frame(&mut self, adu: ModbusAdu, now: Instant) -> EngineOutput {
        let mut out = EngineOutput::default();

        let matches = self.in_flight.as_ref().is_some_and(|f| {
            f.request.unit_id() == adu.unit_id
                && (f.transaction_id.is_none() || f.transaction_id == adu.transaction_id)
        });
        if !matches {
            debug!(
                link_id = self.link_id,
                unit_id = adu.unit_id,
                "unsolicited frame dropped"
            );
            return out;
        }

        let in_flight = match self.in_flight.take() {
            Some(f) => f,
            None => return out,
        };
        let read_unit = match &in_flight.request {
            Request::Read { device, .. } => Some(device.unit_id),
            Request::Write { .. } => None,
        };

        match parse_response(&adu.pdu) {
            Ok(response) => self.handle_response(in_flight.request, response, &mut out),
            Err(e) => {
                warn!(
                    link_id = self.link_id,
                    unit_id = adu.unit_id,
                    "bad response: {e}"
                );
                if let Request::Write {
                    device,
                    response_id,
                    ..
                } = in_flight.request
                {
                    out.resolved.push(ResolvedWrite {
                        device: device.key(),
                        response_id,
                        outcome: CommandOutcome::Failed,
                    });
                }
            }
        }

        if let Some(unit_id) = read_unit {
            self.finish_read(unit_id, now);
        }
        self.try_start(now, &mut out);
        out
    }

    /// A read of the current poll cycle left the wire; once the whole
    /// cycle is done, the next one is due a full interval from now
    fn finish_read(&mut self, unit_id: u8, now: Instant) {
        if let Some(ctx) = self.contexts.get_mut(&unit_id) {
            ctx.outstanding = ctx.outstanding.saturating_sub(1);
            if ctx.outstanding == 0 {
                ctx.next_poll = now + ctx.device.poll_interval();
            }
        }
    }

    fn handle_response(&mut self, request: Request, response: ResponsePdu, out: &mut EngineOutput) {
        match (request, response) {
            (
                Request::Read { device, group },
                ResponsePdu::ReadWords { function, words },
            ) if function == group.function() => {
                match group.decode_words(device.byte_order, &words) {
                    Ok(points) => {
                        out.results
                            .push(read_result(&device, function, points));
                        out.learned.push(device.key());
                    }
                    Err(e) => warn!(device_id = device.id, "decode failed: {e}"),
                }
            }
            (Request::Read { device, group }, ResponsePdu::ReadBits { function, bits })
                if function == group.function() =>
            {
                match group.decode_bits(&bits) {
                    Ok(points) => {
                        out.results
                            .push(read_result(&device, function, points));
                        out.learned.push(device.key());
                    }
                    Err(e) => warn!(device_id = device.id, "decode failed: {e}"),
                }
            }
            (Request::Read { device, .. }, ResponsePdu::Exception { function, code }) => {
                warn!(
                    device_id = device.id,
                    function,
                    "read rejected: {} ({code:#04x})",
                    exception_name(code)
                );
            }
            (
                Request::Write {
                    device,
                    ops,
                    index,
                    register,
                    value,
                    response_id,
                },
                ResponsePdu::WriteEcho { function, .. },
            ) if ops.get(index).is_some_and(|op| op.function() == function) => {
                out.learned.push(device.key());
                if index + 1 < ops.len() {
                    // More frames in this logical write; keep the
                    // command pending until the last echo
                    self.queue.push_front(Request::Write {
                        device,
                        ops,
                        index: index + 1,
                        register,
                        value,
                        response_id,
                    });
                    return;
                }
                out.resolved.push(ResolvedWrite {
                    device: device.key(),
                    response_id,
                    outcome: CommandOutcome::Success,
                });
                let mut result = ParsedFrameResult::new(&device, write_function_name(function));
                result.response_id = Some(response_id);
                result.points.insert(
                    register.clone(),
                    PointValue {
                        name: register,
                        value,
                        unit: None,
                        label: None,
                    },
                );
                out.results.push(result);
            }
            (
                Request::Write {
                    device,
                    response_id,
                    ..
                },
                ResponsePdu::Exception { function, code },
            ) => {
                warn!(
                    device_id = device.id,
                    function,
                    "write rejected: {} ({code:#04x})",
                    exception_name(code)
                );
                out.resolved.push(ResolvedWrite {
                    device: device.key(),
                    response_id,
                    outcome: CommandOutcome::Failed,
                });
            }
            (request, response) => {
                warn!(
                    link_id = self.link_id,
                    unit_id = request.unit_id(),
                    "response does not answer the request in flight: {response:?}"
                );
                if let Request::Write {
                    device,
                    response_id,
                    ..
                } = request
                {
                    out.resolved.push(ResolvedWrite {
                        device: device.key(),
                        response_id,
                        outcome: CommandOutcome::Failed,
                    });
                }
            }
        }
    }

    /// Put the next queued request on the wire if it is idle
    fn try_start(&mut self, now: Instant, out: &mut EngineOutput) {
        if self.in_flight.is_some() {
            return;
        }
        let request = match self.queue.pop_front() {
            Some(r) => r,
            None => return,
        };

        let pdu = match &request {
            Request::Read { group, .. } => {
                build_read_request(group.function(), group.start, group.quantity)
            }
            Request::Write { ops, index, .. } => match ops.get(*index) {
                Some(op) => op.build_pdu(),
                None => Err(crate::error::TelSrvError::InternalError(
                    "write frame index out of range".to_string(),
                )),
            },
        };
        let pdu = match pdu {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!(link_id = self.link_id, "request build failed: {e}");
                match request {
                    Request::Write {
                        device,
                        response_id,
                        ..
                    } => {
                        out.resolved.push(ResolvedWrite {
                            device: device.key(),
                            response_id,
                            outcome: CommandOutcome::Failed,
                        });
                    }
                    Request::Read { device, .. } => self.finish_read(device.unit_id, now),
                }
                // Skip to the next queued request
                self.try_start(now, out);
                return;
            }
        };

        let device = request.device().clone();
        let (bytes, transaction_id) = match self.frame_mode {
            FrameMode::Checksum => (build_rtu_frame(device.unit_id, &pdu), None),
            FrameMode::LengthPrefixed => {
                self.next_transaction = self.next_transaction.wrapping_add(1);
                (
                    build_tcp_frame(self.next_transaction, device.unit_id, &pdu),
                    Some(self.next_transaction),
                )
            }
        };

        out.send.push(OutboundFrame {
            device: device.key(),
            bytes,
        });
        self.in_flight = Some(InFlight {
            request,
            sent_at: now,
            transaction_id,
        });
    }
}

fn read_result(
    device: &DeviceSnapshot,
    function: u8,
    points: Vec<PointValue>,
) -> ParsedFrameResult {
    let mut result = ParsedFrameResult::new(device, read_function_name(function));
    for point in points {
        result.points.insert(point.name.clone(), point);
    }
    result
}

fn read_function_name(function: u8) -> &'static str {
    match function {
        0x01 => "read_coils",
        0x02 => "read_discrete_inputs",
        0x03 => "read_holding_registers",
        0x04 => "read_input_registers",
        _ => "read",
    }
}

fn write_function_name(function: u8) -> &'static str {
    match function {
        0x05 => "write_single_coil",
        0x06 => "write_single_register",
        0x0F => "write_multiple_coils",
        0x10 => "write_multiple_registers",
        _ => "write",
    }
}
