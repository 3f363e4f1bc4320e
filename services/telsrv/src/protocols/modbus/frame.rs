//! ADU framing: CRC16, frame assembly, and stream reassembly
//!
//! TCP chunk boundaries are arbitrary, so every connection owns a
//! [`FrameAccumulator`] that buffers partial frames and re-synchronizes
//! on garbage by discarding one byte at a time. Parsing decisions depend
//! only on bytes actually buffered; feeding the same stream in different
//! chunkings yields the same frames.

use tracing::{debug, trace};

use super::constants::*;
use crate::model::FrameMode;

/// Modbus CRC16 (polynomial 0xA001), transmitted low byte first
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Build a checksum-framed ADU: unit + PDU + CRC16 trailer
pub fn build_rtu_frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + pdu.len() + CRC_LEN);
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    let crc = crc16(&frame);
    frame.push((crc & 0xFF) as u8);
    frame.push((crc >> 8) as u8);
    frame
}

/// Build a length-prefixed ADU: MBAP header + unit + PDU
pub fn build_tcp_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&MBAP_PROTOCOL_ID.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

/// One reassembled application data unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusAdu {
    pub unit_id: u8,
    /// MBAP transaction id; `None` on checksum-framed links
    pub transaction_id: Option<u16>,
    /// Function code plus data
    pub pdu: Vec<u8>,
}

enum Scan {
    /// A frame spans `consumed` buffered bytes
    Complete(ModbusAdu, usize),
    /// Not enough bytes to decide yet
    Incomplete,
    /// The buffer cannot start a valid frame
    Corrupt,
}

/// Per-connection stream reassembler
pub struct FrameAccumulator {
    mode: FrameMode,
    buf: Vec<u8>,
    /// Bytes discarded while re-synchronizing
    discarded: u64,
}

impl FrameAccumulator {
    pub fn new(mode: FrameMode) -> Self {
        Self {
            mode,
            buf: Vec::new(),
            discarded: 0,
        }
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append a chunk and extract every complete frame it yields
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ModbusAdu> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            match self.scan() {
                Scan::Complete(adu, consumed) => {
                    self.buf.drain(..consumed);
                    frames.push(adu);
                }
                Scan::Incomplete => break,
                Scan::Corrupt => {
                    // Resynchronize one byte at a time
                    self.buf.remove(0);
                    self.discarded += 1;
                }
            }
        }

        if self.buf.len() > REASSEMBLY_BUF_CAP {
            let dropped = self.buf.len();
            debug!(dropped, "reassembly buffer over cap, cleared");
            self.discarded += dropped as u64;
            self.buf.clear();
        }

        frames
    }

    fn scan(&self) -> Scan {
        match self.mode {
            FrameMode::LengthPrefixed => self.scan_length_prefixed(),
            FrameMode::Checksum => self.scan_checksum(),
        }
    }

    fn scan_length_prefixed(&self) -> Scan {
        let buf = &self.buf;
        if buf.len() >= 4 {
            let protocol = u16::from_be_bytes([buf[2], buf[3]]);
            if protocol != MBAP_PROTOCOL_ID {
                return Scan::Corrupt;
            }
        }
        if buf.len() >= 6 {
            let length = u16::from_be_bytes([buf[4], buf[5]]);
            if length < 2 || length > MBAP_MAX_LENGTH {
                return Scan::Corrupt;
            }
            let total = 6 + length as usize;
            if buf.len() < total {
                return Scan::Incomplete;
            }
            let adu = ModbusAdu {
                unit_id: buf[6],
                transaction_id: Some(u16::from_be_bytes([buf[0], buf[1]])),
                pdu: buf[7..total].to_vec(),
            };
            return Scan::Complete(adu, total);
        }
        Scan::Incomplete
    }

    /// Response length on checksum links is implied by the function code
    fn scan_checksum(&self) -> Scan {
        let buf = &self.buf;
        if buf.is_empty() {
            return Scan::Incomplete;
        }
        if buf[0] < UNIT_MIN || buf[0] > UNIT_MAX {
            return Scan::Corrupt;
        }
        if buf.len() < 2 {
            return Scan::Incomplete;
        }

        let function = buf[1];
        let total = if function & EXCEPTION_FLAG != 0 {
            // unit + function + exception code + CRC
            5
        } else {
            match function {
                FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_READ_HOLDING_REGISTERS
                | FC_READ_INPUT_REGISTERS => {
                    if buf.len() < 3 {
                        return Scan::Incomplete;
                    }
                    let byte_count = buf[2] as usize;
                    if byte_count == 0 || byte_count > 250 {
                        return Scan::Corrupt;
                    }
                    3 + byte_count + CRC_LEN
                }
                FC_WRITE_SINGLE_COIL | FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_COILS
                | FC_WRITE_MULTIPLE_REGISTERS => 8,
                _ => return Scan::Corrupt,
            }
        };

        if buf.len() < total {
            return Scan::Incomplete;
        }

        let expected = crc16(&buf[..total - CRC_LEN]);
        let actual = u16::from_le_bytes([buf[total - 2], buf[total - 1]]);
        if expected != actual {
            trace!(
                expected = format_args!("{expected:#06x}"),
                actual = format_args!("{actual:#06x}"),
                "CRC mismatch"
            );
            return Scan::Corrupt;
        }

        let adu = ModbusAdu {
            unit_id: buf[0],
            transaction_id: None,
            pdu: buf[1..total - CRC_LEN].to_vec(),
        };
        Scan::Complete(adu, total)
    }
}
