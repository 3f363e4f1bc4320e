//! Device directory: read-mostly snapshot of static configuration
//!
//! The gateway never mutates configuration; it holds an [`Arc`] snapshot
//! swapped wholesale on reload. Lookups are lock-cheap (one `RwLock` read
//! around an `Arc` clone) and reloads happen off the hot path with a
//! cooldown so a missing snapshot cannot trigger a tight retry loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sqlx::{Row, SqlitePool};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Result, TelSrvError};
use crate::model::{
    ByteOrder, DataType, DeviceSnapshot, DirectorySnapshot, FrameMode, LinkId, LinkMode,
    LinkSnapshot, ProtocolKind, RegisterDefinition, RegisterKind,
};

/// Source of directory snapshots (external configuration store)
#[async_trait]
pub trait DirectorySource: Send + Sync {
    async fn load(&self) -> Result<DirectorySnapshot>;
}

struct ReloadState {
    last_attempt: Option<Instant>,
    in_flight: bool,
}

/// Shared, periodically refreshed view of device/link configuration
pub struct DeviceDirectory {
    source: Arc<dyn DirectorySource>,
    snapshot: RwLock<Option<Arc<DirectorySnapshot>>>,
    /// Generation counter bumped on every successful reload
    changed_tx: watch::Sender<u64>,
    reload: Mutex<ReloadState>,
    cooldown: Duration,
}

impl DeviceDirectory {
    pub fn new(source: Arc<dyn DirectorySource>, cooldown: Duration) -> Arc<Self> {
        let (changed_tx, _) = watch::channel(0);
        Arc::new(Self {
            source,
            snapshot: RwLock::new(None),
            changed_tx,
            reload: Mutex::new(ReloadState {
                last_attempt: None,
                in_flight: false,
            }),
            cooldown,
        })
    }

    /// Current snapshot, if one has been loaded
    pub fn snapshot(&self) -> Option<Arc<DirectorySnapshot>> {
        self.snapshot.read().clone()
    }

    pub fn devices_on_link(&self, link_id: LinkId) -> Vec<Arc<DeviceSnapshot>> {
        self.snapshot()
            .map(|s| s.devices_on_link(link_id))
            .unwrap_or_default()
    }

    pub fn device_by_link_and_code(
        &self,
        link_id: LinkId,
        code: &str,
    ) -> Option<Arc<DeviceSnapshot>> {
        self.snapshot()?.device_by_link_and_code(link_id, code)
    }

    pub fn protocol_of_link(&self, link_id: LinkId) -> Option<ProtocolKind> {
        self.snapshot()?.protocol_of_link(link_id)
    }

    pub fn link(&self, link_id: LinkId) -> Option<LinkSnapshot> {
        self.snapshot()?.link(link_id).cloned()
    }

    /// Subscribe to configuration-change notifications; the value is a
    /// generation counter, receivers rebuild contexts on every change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed_tx.subscribe()
    }

    /// Load a fresh snapshot and notify subscribers
    pub async fn reload(&self) -> Result<()> {
        let snapshot = self.source.load().await?;
        let devices = snapshot.devices.len();
        let links = snapshot.links.len();
        *self.snapshot.write() = Some(Arc::new(snapshot));
        self.changed_tx.send_modify(|gen| *gen += 1);
        info!(links, devices, "directory snapshot loaded");
        Ok(())
    }

    /// Request an asynchronous reload, coalescing requests inside the
    /// cooldown window. Used by the ingestion path when data arrives
    /// before any snapshot exists; the triggering chunk is dropped.
    pub fn request_reload(self: &Arc<Self>) {
        {
            let mut state = self.reload.lock();
            if state.in_flight {
                return;
            }
            if let Some(last) = state.last_attempt {
                if last.elapsed() < self.cooldown {
                    return;
                }
            }
            state.in_flight = true;
            state.last_attempt = Some(Instant::now());
        }

        let directory = self.clone();
        tokio::spawn(async move {
            if let Err(e) = directory.reload().await {
                warn!("directory reload failed: {e}");
            }
            directory.reload.lock().in_flight = false;
        });
    }
}

/// Directory source backed by the service SQLite database.
///
/// Expects `links`, `devices` and `registers` tables (see
/// [`SqliteDirectorySource::ensure_schema`]).
pub struct SqliteDirectorySource {
    pool: SqlitePool,
}

impl SqliteDirectorySource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the directory tables when they do not exist yet
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS links (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                protocol TEXT NOT NULL,
                mode TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                frame_mode TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS devices (
                id INTEGER PRIMARY KEY,
                code TEXT NOT NULL DEFAULT '',
                link_id INTEGER NOT NULL,
                protocol TEXT NOT NULL,
                heartbeat TEXT NOT NULL DEFAULT '',
                registration TEXT NOT NULL DEFAULT '',
                require_registration INTEGER NOT NULL DEFAULT 0,
                poll_interval_secs INTEGER NOT NULL DEFAULT 60,
                byte_order TEXT NOT NULL DEFAULT 'ABCD',
                unit_id INTEGER NOT NULL DEFAULT 1
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS registers (
                id INTEGER PRIMARY KEY,
                device_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                address INTEGER NOT NULL,
                data_type TEXT NOT NULL,
                quantity INTEGER NOT NULL DEFAULT 1,
                decimals INTEGER,
                unit TEXT,
                dictionary TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn parse_preamble(hex: &str) -> Vec<u8> {
        // Preambles are stored as hex strings ("24 24 30 31" or "24243031")
        let cleaned: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
        if cleaned.is_empty() || cleaned.len() % 2 != 0 {
            return Vec::new();
        }
        (0..cleaned.len())
            .step_by(2)
            .filter_map(|i| u8::from_str_radix(&cleaned[i..i + 2], 16).ok())
            .collect()
    }

    fn register_kind(kind: &str) -> Option<RegisterKind> {
        match kind {
            "coil" => Some(RegisterKind::Coil),
            "discrete_input" => Some(RegisterKind::DiscreteInput),
            "holding_register" => Some(RegisterKind::HoldingRegister),
            "input_register" => Some(RegisterKind::InputRegister),
            _ => None,
        }
    }
}

#[async_trait]
impl DirectorySource for SqliteDirectorySource {
    async fn load(&self) -> Result<DirectorySnapshot> {
        let link_rows = sqlx::query(
            "SELECT id, name, protocol, mode, endpoint, frame_mode FROM links",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut links = Vec::with_capacity(link_rows.len());
        for row in link_rows {
            let protocol: String = row.get("protocol");
            let mode: String = row.get("mode");
            let frame_mode: Option<String> = row.get("frame_mode");
            links.push(LinkSnapshot {
                id: row.get::<i64, _>("id") as LinkId,
                name: row.get("name"),
                protocol: ProtocolKind::parse(&protocol).ok_or_else(|| {
                    TelSrvError::DirectoryError(format!("unknown link protocol: {protocol}"))
                })?,
                mode: match mode.as_str() {
                    "listen" => LinkMode::Listen,
                    "dial" => LinkMode::Dial,
                    other => {
                        return Err(TelSrvError::DirectoryError(format!(
                            "unknown link mode: {other}"
                        )))
                    }
                },
                endpoint: row.get("endpoint"),
                frame_mode: frame_mode.as_deref().and_then(FrameMode::parse),
            });
        }

        let device_rows = sqlx::query(
            "SELECT id, code, link_id, protocol, heartbeat, registration, \
             require_registration, poll_interval_secs, byte_order, unit_id FROM devices",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut devices = Vec::with_capacity(device_rows.len());
        for row in device_rows {
            let protocol: String = row.get("protocol");
            let heartbeat: String = row.get("heartbeat");
            let registration: String = row.get("registration");
            let byte_order: String = row.get("byte_order");
            devices.push(DeviceSnapshot {
                id: row.get::<i64, _>("id") as u32,
                code: row.get("code"),
                link_id: row.get::<i64, _>("link_id") as LinkId,
                protocol: ProtocolKind::parse(&protocol).ok_or_else(|| {
                    TelSrvError::DirectoryError(format!("unknown device protocol: {protocol}"))
                })?,
                heartbeat: Self::parse_preamble(&heartbeat),
                registration: Self::parse_preamble(&registration),
                require_registration: row.get::<i64, _>("require_registration") != 0,
                poll_interval_secs: row.get::<i64, _>("poll_interval_secs") as u64,
                byte_order: ByteOrder::parse(&byte_order).unwrap_or_default(),
                unit_id: row.get::<i64, _>("unit_id") as u8,
                registers: Vec::new(),
            });
        }

        let register_rows = sqlx::query(
            "SELECT id, device_id, name, kind, address, data_type, quantity, \
             decimals, unit, dictionary FROM registers ORDER BY address",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in register_rows {
            let device_id = row.get::<i64, _>("device_id") as u32;
            let kind: String = row.get("kind");
            let data_type: String = row.get("data_type");
            let dictionary: Option<String> = row.get("dictionary");
            let definition = RegisterDefinition {
                id: row.get::<i64, _>("id") as u32,
                name: row.get("name"),
                kind: Self::register_kind(&kind).ok_or_else(|| {
                    TelSrvError::DirectoryError(format!("unknown register kind: {kind}"))
                })?,
                address: row.get::<i64, _>("address") as u16,
                data_type: DataType::parse(&data_type).ok_or_else(|| {
                    TelSrvError::DirectoryError(format!("unknown data type: {data_type}"))
                })?,
                quantity: row.get::<i64, _>("quantity") as u16,
                decimals: row.get::<Option<i64>, _>("decimals").map(|d| d as u32),
                unit: row.get("unit"),
                dictionary: dictionary
                    .as_deref()
                    .and_then(|s| serde_json::from_str(s).ok()),
            };
            if let Some(device) = devices.iter_mut().find(|d| d.id == device_id) {
                device.registers.push(definition);
            } else {
                warn!(device_id, "register row references unknown device");
            }
        }

        Ok(DirectorySnapshot::new(links, devices))
    }
}
