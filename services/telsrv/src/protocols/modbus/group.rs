//! Read-group planning
//!
//! A device's register map is merged into the fewest read requests that
//! stay inside the protocol caps: registers of the same kind whose
//! addresses are adjacent or separated by at most the configured gap
//! share one request, up to 125 registers or 2000 bits per group.

use tracing::warn;

use super::codec::{decode_bit_point, decode_point};
use super::constants::{MAX_READ_BITS, MAX_READ_REGISTERS};
use crate::error::Result;
use crate::model::{ByteOrder, PointValue, RegisterDefinition, RegisterKind};

/// One merged read request covering a run of register definitions
#[derive(Debug, Clone, PartialEq)]
pub struct ReadGroup {
    pub kind: RegisterKind,
    pub start: u16,
    pub quantity: u16,
    /// Definitions covered, sorted by address
    pub registers: Vec<RegisterDefinition>,
}

impl ReadGroup {
    pub fn function(&self) -> u8 {
        self.kind.read_function()
    }

    fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.quantity)
    }

    /// Decode every covered definition from the group's response words
    pub fn decode_words(&self, order: ByteOrder, words: &[u16]) -> Result<Vec<PointValue>> {
        let mut points = Vec::with_capacity(self.registers.len());
        for def in &self.registers {
            let offset = (def.address - self.start) as usize;
            let span = def.span() as usize;
            let slice = words.get(offset..offset + span).ok_or_else(|| {
                crate::error::TelSrvError::InvalidData(format!(
                    "response too short for register {}",
                    def.name
                ))
            })?;
            points.push(decode_point(def, order, slice)?);
        }
        Ok(points)
    }

    /// Decode every covered definition from the group's response bits
    pub fn decode_bits(&self, bits: &[bool]) -> Result<Vec<PointValue>> {
        let mut points = Vec::with_capacity(self.registers.len());
        for def in &self.registers {
            let offset = (def.address - self.start) as usize;
            let slice = bits.get(offset..).unwrap_or(&[]);
            points.push(decode_bit_point(def, slice)?);
        }
        Ok(points)
    }
}

fn cap_for(kind: RegisterKind) -> u16 {
    if kind.is_bit() {
        MAX_READ_BITS
    } else {
        MAX_READ_REGISTERS
    }
}

/// Merge a device's register definitions into read groups.
///
/// `merge_gap` is the largest address hole bridged by one request;
/// bridged addresses are read and discarded. Merging never reorders
/// registers of different kinds into one request.
pub fn plan_groups(registers: &[RegisterDefinition], merge_gap: u16) -> Vec<ReadGroup> {
    let mut groups: Vec<ReadGroup> = Vec::new();

    for kind in [
        RegisterKind::Coil,
        RegisterKind::DiscreteInput,
        RegisterKind::HoldingRegister,
        RegisterKind::InputRegister,
    ] {
        let mut defs: Vec<&RegisterDefinition> =
            registers.iter().filter(|d| d.kind == kind).collect();
        defs.sort_by_key(|d| d.address);
        let cap = cap_for(kind);

        let mut current: Option<ReadGroup> = None;
        for def in defs {
            let span = def.span();
            if span > cap {
                warn!(
                    register = %def.name,
                    span,
                    cap,
                    "register span exceeds read cap, skipped"
                );
                continue;
            }
            if def.end_address() > u32::from(u16::MAX) + 1 {
                warn!(register = %def.name, address = def.address, "register run past address space, skipped");
                continue;
            }

            let fits = |g: &ReadGroup| {
                let gap_ok = u32::from(def.address) <= g.end() + u32::from(merge_gap);
                let cap_ok = def.end_address() - u32::from(g.start) <= u32::from(cap);
                gap_ok && cap_ok
            };

            match current.as_mut() {
                Some(g) if fits(g) => {
                    g.quantity =
                        (def.end_address() - u32::from(g.start)).max(u32::from(g.quantity)) as u16;
                    g.registers.push(def.clone());
                }
                _ => {
                    if let Some(done) = current.take() {
                        groups.push(done);
                    }
                    current = Some(ReadGroup {
                        kind,
                        start: def.address,
                        quantity: span,
                        registers: vec![def.clone()],
                    });
                }
            }
        }
        if let Some(done) = current.take() {
            groups.push(done);
        }
    }

    groups
}
