//! Write planning: from a register definition and a JSON value to a
//! concrete write operation

use super::codec::{
    build_write_multiple_coils, build_write_multiple_registers, build_write_single_coil,
    build_write_single_register, encode_value,
};
use super::constants::{
    FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL,
    FC_WRITE_SINGLE_REGISTER, MAX_WRITE_REGISTERS,
};
use crate::error::{Result, TelSrvError};
use crate::model::{ByteOrder, RegisterDefinition, RegisterKind};

/// A validated, encodable write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOperation {
    SingleCoil { address: u16, on: bool },
    SingleRegister { address: u16, value: u16 },
    MultipleRegisters { address: u16, words: Vec<u16> },
    MultipleCoils { address: u16, bits: Vec<bool> },
}

impl WriteOperation {
    pub fn function(&self) -> u8 {
        match self {
            WriteOperation::SingleCoil { .. } => FC_WRITE_SINGLE_COIL,
            WriteOperation::SingleRegister { .. } => FC_WRITE_SINGLE_REGISTER,
            WriteOperation::MultipleRegisters { .. } => FC_WRITE_MULTIPLE_REGISTERS,
            WriteOperation::MultipleCoils { .. } => FC_WRITE_MULTIPLE_COILS,
        }
    }

    pub fn address(&self) -> u16 {
        match self {
            WriteOperation::SingleCoil { address, .. }
            | WriteOperation::SingleRegister { address, .. }
            | WriteOperation::MultipleRegisters { address, .. }
            | WriteOperation::MultipleCoils { address, .. } => *address,
        }
    }

    pub fn build_pdu(&self) -> Result<Vec<u8>> {
        match self {
            WriteOperation::SingleCoil { address, on } => {
                Ok(build_write_single_coil(*address, *on))
            }
            WriteOperation::SingleRegister { address, value } => {
                Ok(build_write_single_register(*address, *value))
            }
            WriteOperation::MultipleRegisters { address, words } => {
                build_write_multiple_registers(*address, words)
            }
            WriteOperation::MultipleCoils { address, bits } => {
                build_write_multiple_coils(*address, bits)
            }
        }
    }
}

fn as_bool(value: &serde_json::Value) -> Result<bool> {
    value
        .as_bool()
        .or_else(|| value.as_i64().map(|v| v != 0))
        .ok_or_else(|| TelSrvError::InvalidParameter(format!("expected a boolean, got {value}")))
}

/// Validate `value` against `def` and produce the write operation.
///
/// Single-register values use 0x05/0x06; anything spanning more than one
/// register or bit goes through the multiple variants.
pub fn plan_write(
    def: &RegisterDefinition,
    order: ByteOrder,
    value: &serde_json::Value,
) -> Result<WriteOperation> {
    if !def.kind.is_writable() {
        return Err(TelSrvError::InvalidParameter(format!(
            "register {} is read-only ({:?})",
            def.name, def.kind
        )));
    }

    match def.kind {
        RegisterKind::Coil => {
            if def.quantity.max(1) == 1 {
                Ok(WriteOperation::SingleCoil {
                    address: def.address,
                    on: as_bool(value)?,
                })
            } else {
                let items = value.as_array().ok_or_else(|| {
                    TelSrvError::InvalidParameter(format!(
                        "register {} expects an array of {} booleans",
                        def.name, def.quantity
                    ))
                })?;
                if items.len() != def.quantity as usize {
                    return Err(TelSrvError::InvalidParameter(format!(
                        "register {} expects {} values, got {}",
                        def.name,
                        def.quantity,
                        items.len()
                    )));
                }
                let bits = items.iter().map(as_bool).collect::<Result<Vec<bool>>>()?;
                Ok(WriteOperation::MultipleCoils {
                    address: def.address,
                    bits,
                })
            }
        }
        RegisterKind::HoldingRegister => {
            let mut words = Vec::new();
            if def.quantity.max(1) == 1 {
                words.extend(encode_value(value, def.data_type, order)?);
            } else {
                let items = value.as_array().ok_or_else(|| {
                    TelSrvError::InvalidParameter(format!(
                        "register {} expects an array of {} values",
                        def.name, def.quantity
                    ))
                })?;
                if items.len() != def.quantity as usize {
                    return Err(TelSrvError::InvalidParameter(format!(
                        "register {} expects {} values, got {}",
                        def.name,
                        def.quantity,
                        items.len()
                    )));
                }
                for item in items {
                    words.extend(encode_value(item, def.data_type, order)?);
                }
            }
            if words.len() > MAX_WRITE_REGISTERS as usize {
                return Err(TelSrvError::InvalidParameter(format!(
                    "write to {} spans {} registers, cap is {MAX_WRITE_REGISTERS}",
                    def.name,
                    words.len()
                )));
            }
            if words.len() == 1 {
                Ok(WriteOperation::SingleRegister {
                    address: def.address,
                    value: words[0],
                })
            } else {
                Ok(WriteOperation::MultipleRegisters {
                    address: def.address,
                    words,
                })
            }
        }
        // Unreachable past the is_writable check above
        RegisterKind::DiscreteInput | RegisterKind::InputRegister => {
            Err(TelSrvError::InvalidParameter(format!(
                "register {} is read-only ({:?})",
                def.name, def.kind
            )))
        }
    }
}

/// Plan a multi-register write across several definitions of one device.
///
/// Holding-register values at strictly contiguous addresses coalesce into
/// one multiple-register frame (split at the protocol cap); coil writes
/// stay individual. Address holes are never bridged, a filler word would
/// clobber whatever lives there.
pub fn plan_multi_write(
    entries: &[(&RegisterDefinition, &serde_json::Value)],
    order: ByteOrder,
) -> Result<Vec<WriteOperation>> {
    let mut ops = Vec::new();

    let mut words_runs: Vec<(u16, Vec<u16>)> = Vec::new();
    let mut holding: Vec<(&RegisterDefinition, &serde_json::Value)> = Vec::new();
    for (def, value) in entries {
        match def.kind {
            RegisterKind::Coil => ops.push(plan_write(def, order, value)?),
            RegisterKind::HoldingRegister => holding.push((def, value)),
            _ => {
                return Err(TelSrvError::InvalidParameter(format!(
                    "register {} is read-only ({:?})",
                    def.name, def.kind
                )))
            }
        }
    }
    holding.sort_by_key(|(def, _)| def.address);

    for (def, value) in holding {
        let mut words = Vec::new();
        match plan_write(def, order, value)? {
            WriteOperation::SingleRegister { value, .. } => words.push(value),
            WriteOperation::MultipleRegisters { words: w, .. } => words = w,
            other => {
                return Err(TelSrvError::InternalError(format!(
                    "unexpected write operation: {other:?}"
                )))
            }
        }
        match words_runs.last_mut() {
            Some((start, run))
                if u32::from(*start) + run.len() as u32 == u32::from(def.address)
                    && run.len() + words.len() <= MAX_WRITE_REGISTERS as usize =>
            {
                run.extend(words);
            }
            _ => words_runs.push((def.address, words)),
        }
    }

    for (start, words) in words_runs {
        if words.len() == 1 {
            ops.push(WriteOperation::SingleRegister {
                address: start,
                value: words[0],
            });
        } else {
            ops.push(WriteOperation::MultipleRegisters {
                address: start,
                words,
            });
        }
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataType;
    use serde_json::json;

    fn def(kind: RegisterKind, data_type: DataType, quantity: u16) -> RegisterDefinition {
        RegisterDefinition {
            id: 1,
            name: "setpoint".to_string(),
            kind,
            address: 100,
            data_type,
            quantity,
            decimals: None,
            unit: None,
            dictionary: None,
        }
    }

    #[test]
    fn test_coil_write() {
        let op = plan_write(
            &def(RegisterKind::Coil, DataType::Bool, 1),
            ByteOrder::BigEndian,
            &json!(true),
        )
        .expect("plan");
        assert_eq!(
            op,
            WriteOperation::SingleCoil {
                address: 100,
                on: true
            }
        );
        assert_eq!(
            op.build_pdu().expect("pdu"),
            vec![0x05, 0x00, 0x64, 0xFF, 0x00]
        );
    }

    #[test]
    fn test_u16_write_uses_single_register() {
        let op = plan_write(
            &def(RegisterKind::HoldingRegister, DataType::U16, 1),
            ByteOrder::BigEndian,
            &json!(42),
        )
        .expect("plan");
        assert_eq!(op.function(), FC_WRITE_SINGLE_REGISTER);
        assert_eq!(
            op,
            WriteOperation::SingleRegister {
                address: 100,
                value: 42
            }
        );
    }

    #[test]
    fn test_f32_write_uses_multiple_registers() {
        let op = plan_write(
            &def(RegisterKind::HoldingRegister, DataType::F32, 1),
            ByteOrder::BigEndianSwap,
            &json!(123.456),
        )
        .expect("plan");
        assert_eq!(op.function(), FC_WRITE_MULTIPLE_REGISTERS);
        assert_eq!(
            op,
            WriteOperation::MultipleRegisters {
                address: 100,
                words: vec![0xE979, 0x42F6]
            }
        );
    }

    #[test]
    fn test_read_only_register_rejected() {
        let err = plan_write(
            &def(RegisterKind::InputRegister, DataType::U16, 1),
            ByteOrder::BigEndian,
            &json!(1),
        );
        assert!(matches!(err, Err(TelSrvError::InvalidParameter(_))));
    }

    #[test]
    fn test_array_length_must_match() {
        let err = plan_write(
            &def(RegisterKind::HoldingRegister, DataType::U16, 3),
            ByteOrder::BigEndian,
            &json!([1, 2]),
        );
        assert!(matches!(err, Err(TelSrvError::InvalidParameter(_))));
    }

    #[test]
    fn test_value_out_of_range_rejected() {
        let err = plan_write(
            &def(RegisterKind::HoldingRegister, DataType::U16, 1),
            ByteOrder::BigEndian,
            &json!(70000),
        );
        assert!(matches!(err, Err(TelSrvError::InvalidParameter(_))));
    }

    #[test]
    fn test_multi_write_coalesces_contiguous() {
        let mut a = def(RegisterKind::HoldingRegister, DataType::U16, 1);
        a.address = 100;
        let mut b = def(RegisterKind::HoldingRegister, DataType::F32, 1);
        b.address = 101;
        let (va, vb) = (json!(7), json!(1.0));

        let ops = plan_multi_write(&[(&a, &va), (&b, &vb)], ByteOrder::BigEndian).expect("plan");
        assert_eq!(ops.len(), 1);
        assert_eq!(
            ops[0],
            WriteOperation::MultipleRegisters {
                address: 100,
                words: vec![7, 0x3F80, 0x0000]
            }
        );
    }

    #[test]
    fn test_multi_write_never_bridges_holes() {
        let mut a = def(RegisterKind::HoldingRegister, DataType::U16, 1);
        a.address = 100;
        let mut b = def(RegisterKind::HoldingRegister, DataType::U16, 1);
        b.address = 102;
        let (va, vb) = (json!(1), json!(2));

        let ops = plan_multi_write(&[(&a, &va), (&b, &vb)], ByteOrder::BigEndian).expect("plan");
        assert_eq!(ops.len(), 2);
        assert_eq!(
            ops[0],
            WriteOperation::SingleRegister {
                address: 100,
                value: 1
            }
        );
        assert_eq!(
            ops[1],
            WriteOperation::SingleRegister {
                address: 102,
                value: 2
            }
        );
    }

    #[test]
    fn test_multi_write_mixed_kinds() {
        let coil = def(RegisterKind::Coil, DataType::Bool, 1);
        let mut reg = def(RegisterKind::HoldingRegister, DataType::U16, 1);
        reg.address = 10;
        let (vc, vr) = (json!(true), json!(5));

        let ops =
            plan_multi_write(&[(&coil, &vc), (&reg, &vr)], ByteOrder::BigEndian).expect("plan");
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], WriteOperation::SingleCoil { .. }));
        assert!(matches!(ops[1], WriteOperation::SingleRegister { .. }));
    }

    #[test]
    fn test_multi_coil_write() {
        let op = plan_write(
            &def(RegisterKind::Coil, DataType::Bool, 3),
            ByteOrder::BigEndian,
            &json!([true, false, true]),
        )
        .expect("plan");
        assert_eq!(
            op,
            WriteOperation::MultipleCoils {
                address: 100,
                bits: vec![true, false, true]
            }
        );
    }
}
