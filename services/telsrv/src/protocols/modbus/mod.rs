//! Modbus master: framing, codec, read-group planning, and the per-link
//! polling engine

pub mod codec;
pub mod constants;
pub mod frame;
pub mod group;
pub mod poller;
pub mod types;

pub use frame::{FrameAccumulator, ModbusAdu};
pub use group::{plan_groups, ReadGroup};
pub use poller::{EngineOutput, ModbusLink, OutboundFrame, ResolvedWrite};
pub use types::{plan_write, WriteOperation};
