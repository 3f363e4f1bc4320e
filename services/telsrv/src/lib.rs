//! Hydrological telemetry gateway
//!
//! Terminates TCP links from field stations and serial bridges,
//! demultiplexes devices by preamble, polls Modbus devices through merged
//! read groups, decodes proprietary hydro protocols through pluggable
//! decoders, and persists normalized results in batches.

pub mod command;
pub mod config;
pub mod directory;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod protocols;
pub mod registry;
pub mod storage;
pub mod transport;

pub use command::{CommandOutcome, CommandRegistry, CommandTicket};
pub use config::ServiceConfig;
pub use directory::{DeviceDirectory, DirectorySource, SqliteDirectorySource};
pub use error::{Result, TelSrvError};
pub use ingest::{Gateway, GatewayHandle};
pub use model::{DeviceSnapshot, DirectorySnapshot, LinkSnapshot, ParsedFrameResult};
pub use registry::ConnectionRegistry;
pub use storage::{BatchWriter, HistoryStore, SqliteHistoryStore, ValueCache};
