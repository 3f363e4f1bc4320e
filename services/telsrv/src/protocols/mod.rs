//! Wire protocol implementations

pub mod hydro;
pub mod modbus;
