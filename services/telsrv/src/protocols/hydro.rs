//! Pluggable hydrological telemetry decoders
//!
//! Proprietary station protocols vary per vendor, so they plug in behind
//! [`HydroDecoder`]. The gateway identifies the device by its configured
//! preambles and hands the remaining bytes to the decoder registered for
//! the device's protocol variant; the decoder returns normalized results
//! plus any acknowledgement frames to transmit back.

use std::sync::Arc;

use ahash::AHashMap;
use tracing::warn;

use crate::error::{Result, TelSrvError};
use crate::model::{DeviceSnapshot, ParsedFrameResult};

/// A command acknowledgement recognized inside an uplink frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HydroAck {
    pub device_code: String,
    /// Function the station is acknowledging
    pub function: String,
    pub success: bool,
    /// Correlation id echoed by the station; `None` for protocol
    /// variants whose acks carry no id
    pub response_id: Option<u64>,
}

/// Everything one decoded uplink frame produced
#[derive(Debug, Default)]
pub struct HydroOutput {
    pub results: Vec<ParsedFrameResult>,
    /// Raw frames to send back to the station (protocol-level ACKs)
    pub replies: Vec<Vec<u8>>,
    pub acks: Vec<HydroAck>,
}

/// One vendor protocol variant
pub trait HydroDecoder: Send + Sync {
    /// Variant name matched against the device directory
    fn name(&self) -> &'static str;

    /// Decode an uplink frame from `device`
    fn decode(&self, device: &DeviceSnapshot, frame: &[u8]) -> Result<HydroOutput>;

    /// Build a downlink command frame. `response_id` is the correlation
    /// id the station is expected to echo in its acknowledgement.
    fn build_command(
        &self,
        device: &DeviceSnapshot,
        function: &str,
        params: &serde_json::Value,
        response_id: u64,
    ) -> Result<Vec<u8>>;
}

/// Registered decoders, looked up by variant name
#[derive(Default)]
pub struct HydroDecoderRegistry {
    decoders: AHashMap<String, Arc<dyn HydroDecoder>>,
}

impl HydroDecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, decoder: Arc<dyn HydroDecoder>) {
        let name = decoder.name().to_string();
        if self.decoders.insert(name.clone(), decoder).is_some() {
            warn!(variant = %name, "hydro decoder replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn HydroDecoder>> {
        self.decoders.get(name).cloned()
    }

    /// Decoder for a device, falling back to the sole registered variant
    /// when the directory does not name one
    pub fn for_device(&self, variant: &str) -> Result<Arc<dyn HydroDecoder>> {
        if let Some(decoder) = self.get(variant) {
            return Ok(decoder);
        }
        if variant.is_empty() && self.decoders.len() == 1 {
            if let Some(decoder) = self.decoders.values().next() {
                return Ok(decoder.clone());
            }
        }
        Err(TelSrvError::ProtocolError(format!(
            "no hydro decoder registered for variant '{variant}'"
        )))
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::KvDecoder;
    use super::*;
    use crate::model::{ByteOrder, ProtocolKind};
    use serde_json::json;

    fn device() -> DeviceSnapshot {
        DeviceSnapshot {
            id: 1,
            code: "HYD-01".to_string(),
            link_id: 1,
            protocol: ProtocolKind::Hydro,
            heartbeat: Vec::new(),
            registration: Vec::new(),
            require_registration: false,
            poll_interval_secs: 60,
            byte_order: ByteOrder::BigEndian,
            unit_id: 1,
            registers: Vec::new(),
        }
    }

    #[test]
    fn test_registry_lookup_and_fallback() {
        let mut registry = HydroDecoderRegistry::new();
        assert!(registry.for_device("kv").is_err());

        registry.register(Arc::new(KvDecoder));
        assert!(registry.for_device("kv").is_ok());
        // Single registered variant answers the unnamed case
        assert!(registry.for_device("").is_ok());
        assert!(registry.for_device("other").is_err());
    }

    #[test]
    fn test_kv_decode_roundtrip() {
        let decoder = KvDecoder;
        let out = decoder
            .decode(&device(), b"level=3.25,flow=12.5")
            .expect("decode");
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0].points["level"].value, json!(3.25));
        assert_eq!(out.results[0].points["flow"].value, json!(12.5));
        assert_eq!(out.replies, vec![b"ACK".to_vec()]);
    }

    #[test]
    fn test_ack_frame_carries_correlation_id() {
        let decoder = KvDecoder;
        let out = decoder.decode(&device(), b"ACK:setpoint:7").expect("decode");
        assert!(out.results.is_empty());
        assert_eq!(
            out.acks,
            vec![HydroAck {
                device_code: "HYD-01".to_string(),
                function: "setpoint".to_string(),
                success: true,
                response_id: Some(7),
            }]
        );

        let out = decoder.decode(&device(), b"NAK:setpoint:8").expect("decode");
        assert!(!out.acks[0].success);
        assert_eq!(out.acks[0].response_id, Some(8));
    }

    #[test]
    fn test_malformed_frame_is_error() {
        let decoder = KvDecoder;
        assert!(decoder.decode(&device(), b"no pairs here").is_err());
    }
}
