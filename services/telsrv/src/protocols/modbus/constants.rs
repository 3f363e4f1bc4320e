//! Modbus protocol constants

/// Read coils (0x01)
pub const FC_READ_COILS: u8 = 0x01;
/// Read discrete inputs (0x02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
/// Read holding registers (0x03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
/// Read input registers (0x04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
/// Write single coil (0x05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
/// Write single register (0x06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
/// Write multiple coils (0x0F)
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
/// Write multiple registers (0x10)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Exception responses set the high bit of the function code
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Maximum registers in one read request
pub const MAX_READ_REGISTERS: u16 = 125;
/// Maximum registers in one multiple-register write
pub const MAX_WRITE_REGISTERS: u16 = 123;
/// Maximum bits in one read request
pub const MAX_READ_BITS: u16 = 2000;
/// Maximum bits in one multiple-coil write
pub const MAX_WRITE_BITS: u16 = 1968;

/// MBAP header: transaction id, protocol id, length, unit id
pub const MBAP_HEADER_LEN: usize = 7;
/// Protocol identifier field of a valid MBAP header
pub const MBAP_PROTOCOL_ID: u16 = 0;
/// MBAP length field covers unit id + PDU; PDU tops out at 253 bytes
pub const MBAP_MAX_LENGTH: u16 = 254;

/// CRC16 trailer size on checksum-framed ADUs
pub const CRC_LEN: usize = 2;

/// Valid slave/unit address range for addressed requests
pub const UNIT_MIN: u8 = 1;
pub const UNIT_MAX: u8 = 247;

/// Reassembly buffer cap per connection; exceeding it drops the oldest
/// bytes
pub const REASSEMBLY_BUF_CAP: usize = 1024;

/// Human-readable name for a Modbus exception code
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown exception",
    }
}
