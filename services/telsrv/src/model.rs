//! Static configuration model and normalized decode output
//!
//! These types form the read-mostly directory snapshot (devices, links,
//! register maps) and the normalized [`ParsedFrameResult`] unit that every
//! decoder hands to the batch writer. Snapshots are immutable; a directory
//! refresh replaces them wholesale.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TelSrvError};

/// Logical link identifier (one configured TCP endpoint)
pub type LinkId = u32;

/// Device identifier from the directory
pub type DeviceId = u32;

/// Peer address of a connected/dialed remote
pub type PeerAddr = SocketAddr;

/// Wire protocol carried by a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// Modbus master (TCP-framed or RTU-over-stream, per frame mode)
    Modbus,
    /// Proprietary hydrological telemetry protocol (pluggable decoder)
    Hydro,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Modbus => "modbus",
            ProtocolKind::Hydro => "hydro",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "modbus" | "modbus_tcp" | "modbus_rtu" => Some(ProtocolKind::Modbus),
            "hydro" | "hydrology" => Some(ProtocolKind::Hydro),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a frame carries an explicit length header or relies on a
/// trailing checksum (serial-bridge compatible)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameMode {
    /// MBAP-style header declares the payload length (Modbus TCP)
    LengthPrefixed,
    /// Length implied by the function code, CRC16 trailer (Modbus RTU)
    Checksum,
}

impl FrameMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "length_prefixed" | "mbap" => Some(FrameMode::LengthPrefixed),
            "rtu" | "checksum" | "crc" => Some(FrameMode::Checksum),
            _ => None,
        }
    }
}

/// How a link reaches its remote side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// We bind and accept; devices dial in (serial bridges, GPRS modems)
    Listen,
    /// We dial out to a fixed endpoint
    Dial,
}

/// Static link configuration from the directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub id: LinkId,
    pub name: String,
    pub protocol: ProtocolKind,
    pub mode: LinkMode,
    /// Bind address (listen) or remote address (dial)
    pub endpoint: String,
    /// Explicit frame mode; `None` falls back to the mode default
    /// (dial: length-prefixed, listen: checksum)
    pub frame_mode: Option<FrameMode>,
}

impl LinkSnapshot {
    /// Effective frame mode after applying the listen/dial defaults.
    /// The listen default is configurable service-wide because the
    /// serial-bridge heuristic is easy to get backwards per deployment.
    pub fn effective_frame_mode(&self, listen_default: FrameMode) -> FrameMode {
        if let Some(mode) = self.frame_mode {
            return mode;
        }
        match self.mode {
            LinkMode::Dial => FrameMode::LengthPrefixed,
            LinkMode::Listen => listen_default,
        }
    }
}

/// Byte order for multi-register values.
///
/// Letters name byte positions of the big-endian representation, so
/// `Abcd` is plain big-endian and `Cdab` swaps the 16-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ByteOrder {
    /// ABCD - big-endian (the Modbus default)
    #[default]
    #[serde(rename = "ABCD")]
    BigEndian,
    /// DCBA - little-endian
    #[serde(rename = "DCBA")]
    LittleEndian,
    /// CDAB - big-endian with 16-bit words swapped
    #[serde(rename = "CDAB")]
    BigEndianSwap,
    /// BADC - little-endian with 16-bit words swapped
    #[serde(rename = "BADC")]
    LittleEndianSwap,
}

impl ByteOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ABCD" | "AB" | "BE" | "BIG" => Some(ByteOrder::BigEndian),
            "DCBA" | "BA" | "LE" | "LITTLE" => Some(ByteOrder::LittleEndian),
            "CDAB" => Some(ByteOrder::BigEndianSwap),
            "BADC" => Some(ByteOrder::LittleEndianSwap),
            _ => None,
        }
    }
}

/// Modbus register table kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl RegisterKind {
    /// Function code used to read this kind
    pub fn read_function(&self) -> u8 {
        match self {
            RegisterKind::Coil => 0x01,
            RegisterKind::DiscreteInput => 0x02,
            RegisterKind::HoldingRegister => 0x03,
            RegisterKind::InputRegister => 0x04,
        }
    }

    /// Bit-addressed kinds (coils and discrete inputs)
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::DiscreteInput)
    }

    /// Only coils and holding registers accept writes
    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::HoldingRegister)
    }
}

/// Register value data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl DataType {
    /// Number of 16-bit registers one value of this type occupies
    pub fn register_count(&self) -> u16 {
        match self {
            DataType::Bool | DataType::U16 | DataType::I16 => 1,
            DataType::U32 | DataType::I32 | DataType::F32 => 2,
            DataType::U64 | DataType::I64 | DataType::F64 => 4,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Some(DataType::Bool),
            "uint16" | "u16" | "word" => Some(DataType::U16),
            "int16" | "i16" | "short" => Some(DataType::I16),
            "uint32" | "u32" | "dword" => Some(DataType::U32),
            "int32" | "i32" | "long" => Some(DataType::I32),
            "uint64" | "u64" | "qword" => Some(DataType::U64),
            "int64" | "i64" => Some(DataType::I64),
            "float32" | "f32" | "float" | "real" => Some(DataType::F32),
            "float64" | "f64" | "double" | "lreal" => Some(DataType::F64),
            _ => None,
        }
    }
}

/// One register (or register run) in a device's point map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDefinition {
    pub id: u32,
    pub name: String,
    pub kind: RegisterKind,
    pub address: u16,
    pub data_type: DataType,
    /// Number of consecutive values of `data_type` (1 for scalars)
    pub quantity: u16,
    /// Round decoded floats to this many decimal places
    pub decimals: Option<u32>,
    /// Engineering unit label carried through to the normalized output
    pub unit: Option<String>,
    /// Optional enumeration: raw integer value -> label
    pub dictionary: Option<BTreeMap<String, String>>,
}

impl RegisterDefinition {
    /// Span in protocol address units: bits for bit kinds, 16-bit
    /// registers for word kinds.
    pub fn span(&self) -> u16 {
        if self.kind.is_bit() {
            self.quantity.max(1)
        } else {
            self.quantity.max(1) * self.data_type.register_count()
        }
    }

    /// First address past this definition
    pub fn end_address(&self) -> u32 {
        u32::from(self.address) + u32::from(self.span())
    }
}

/// Static device configuration from the directory.
///
/// Immutable once built; a directory refresh replaces the whole snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: DeviceId,
    /// Logical device code; empty for address-only protocols
    pub code: String,
    pub link_id: LinkId,
    pub protocol: ProtocolKind,
    /// Heartbeat preamble bytes (empty = none configured)
    #[serde(default)]
    pub heartbeat: Vec<u8>,
    /// Registration preamble bytes (empty = none configured)
    #[serde(default)]
    pub registration: Vec<u8>,
    /// Drop protocol traffic from peers that never registered
    #[serde(default)]
    pub require_registration: bool,
    /// Seconds between poll cycles
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// Modbus slave/unit address
    pub unit_id: u8,
    #[serde(default)]
    pub registers: Vec<RegisterDefinition>,
}

impl DeviceSnapshot {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn key(&self) -> DeviceKey {
        if self.code.is_empty() {
            DeviceKey::by_unit(self.link_id, self.unit_id)
        } else {
            DeviceKey::by_code(self.link_id, &self.code)
        }
    }
}

/// Stable identity of a logical device across connections.
///
/// Devices with a logical code are keyed by it; address-only Modbus
/// devices fall back to their unit address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    pub link_id: LinkId,
    ident: String,
}

impl DeviceKey {
    pub fn by_code(link_id: LinkId, code: &str) -> Self {
        Self {
            link_id,
            ident: code.to_string(),
        }
    }

    pub fn by_unit(link_id: LinkId, unit_id: u8) -> Self {
        Self {
            link_id,
            ident: format!("unit#{unit_id}"),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.link_id, self.ident)
    }
}

/// One decoded point inside a [`ParsedFrameResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointValue {
    pub name: String,
    pub value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Dictionary label for enumerated registers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Normalized decode output; the unit flowing into the batch writer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedFrameResult {
    pub device_id: DeviceId,
    pub link_id: LinkId,
    pub protocol: ProtocolKind,
    /// Read tag, e.g. `read_holding_register` or a hydro function code
    pub function: String,
    /// Point key -> decoded value
    pub points: BTreeMap<String, PointValue>,
    pub timestamp: DateTime<Utc>,
    /// Correlation id when this frame answers an outbound command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<u64>,
}

impl ParsedFrameResult {
    pub fn new(device: &DeviceSnapshot, function: impl Into<String>) -> Self {
        Self {
            device_id: device.id,
            link_id: device.link_id,
            protocol: device.protocol,
            function: function.into(),
            points: BTreeMap::new(),
            timestamp: Utc::now(),
            response_id: None,
        }
    }

    pub fn payload_json(&self) -> Result<String> {
        serde_json::to_string(&self.points)
            .map_err(|e| TelSrvError::SerializationError(e.to_string()))
    }
}

/// Complete directory snapshot: links plus devices, with lookup indices
#[derive(Debug, Default)]
pub struct DirectorySnapshot {
    pub links: ahash::AHashMap<LinkId, LinkSnapshot>,
    pub devices: Vec<Arc<DeviceSnapshot>>,
    by_link: ahash::AHashMap<LinkId, Vec<usize>>,
    by_link_code: ahash::AHashMap<(LinkId, String), usize>,
}

impl DirectorySnapshot {
    pub fn new(links: Vec<LinkSnapshot>, devices: Vec<DeviceSnapshot>) -> Self {
        let links = links.into_iter().map(|l| (l.id, l)).collect();
        let devices: Vec<Arc<DeviceSnapshot>> = devices.into_iter().map(Arc::new).collect();

        let mut by_link: ahash::AHashMap<LinkId, Vec<usize>> = ahash::AHashMap::new();
        let mut by_link_code = ahash::AHashMap::new();
        for (idx, dev) in devices.iter().enumerate() {
            by_link.entry(dev.link_id).or_default().push(idx);
            if !dev.code.is_empty() {
                by_link_code.insert((dev.link_id, dev.code.clone()), idx);
            }
        }

        Self {
            links,
            devices,
            by_link,
            by_link_code,
        }
    }

    pub fn devices_on_link(&self, link_id: LinkId) -> Vec<Arc<DeviceSnapshot>> {
        self.by_link
            .get(&link_id)
            .map(|idxs| idxs.iter().map(|&i| self.devices[i].clone()).collect())
            .unwrap_or_default()
    }

    pub fn device_by_link_and_code(
        &self,
        link_id: LinkId,
        code: &str,
    ) -> Option<Arc<DeviceSnapshot>> {
        self.by_link_code
            .get(&(link_id, code.to_string()))
            .map(|&i| self.devices[i].clone())
    }

    pub fn link(&self, link_id: LinkId) -> Option<&LinkSnapshot> {
        self.links.get(&link_id)
    }

    pub fn protocol_of_link(&self, link_id: LinkId) -> Option<ProtocolKind> {
        self.links.get(&link_id).map(|l| l.protocol)
    }
}
