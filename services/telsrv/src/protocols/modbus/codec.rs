//! PDU codec: request builders, response parsing, and typed value coding
//!
//! Multi-register values are normalized through a big-endian byte string;
//! the four supported byte orders are involutions, so the same permutation
//! maps wire words to normalized bytes and back.

use serde_json::json;

use super::constants::*;
use crate::error::{Result, TelSrvError};
use crate::model::{ByteOrder, DataType, PointValue, RegisterDefinition};

/// Build a read request PDU (function codes 0x01 through 0x04)
pub fn build_read_request(function: u8, address: u16, quantity: u16) -> Result<Vec<u8>> {
    let cap = match function {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS => MAX_READ_BITS,
        FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => MAX_READ_REGISTERS,
        _ => {
            return Err(TelSrvError::InvalidParameter(format!(
                "not a read function: {function:#04x}"
            )))
        }
    };
    if quantity == 0 || quantity > cap {
        return Err(TelSrvError::InvalidParameter(format!(
            "read quantity {quantity} out of range for function {function:#04x}"
        )));
    }
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    Ok(pdu)
}

/// Coil write: 0xFF00 for on, 0x0000 for off
pub fn build_write_single_coil(address: u16, on: bool) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FC_WRITE_SINGLE_COIL);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(if on { &[0xFF, 0x00] } else { &[0x00, 0x00] });
    pdu
}

pub fn build_write_single_register(address: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FC_WRITE_SINGLE_REGISTER);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

pub fn build_write_multiple_registers(address: u16, words: &[u16]) -> Result<Vec<u8>> {
    let quantity = words.len() as u16;
    if quantity == 0 || quantity > MAX_WRITE_REGISTERS {
        return Err(TelSrvError::InvalidParameter(format!(
            "write quantity {quantity} out of range"
        )));
    }
    let mut pdu = Vec::with_capacity(6 + words.len() * 2);
    pdu.push(FC_WRITE_MULTIPLE_REGISTERS);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    pdu.push((words.len() * 2) as u8);
    for word in words {
        pdu.extend_from_slice(&word.to_be_bytes());
    }
    Ok(pdu)
}

pub fn build_write_multiple_coils(address: u16, bits: &[bool]) -> Result<Vec<u8>> {
    let quantity = bits.len() as u16;
    if quantity == 0 || quantity > MAX_WRITE_BITS {
        return Err(TelSrvError::InvalidParameter(format!(
            "coil write quantity {quantity} out of range"
        )));
    }
    let byte_count = bits.len().div_ceil(8);
    let mut pdu = Vec::with_capacity(6 + byte_count);
    pdu.push(FC_WRITE_MULTIPLE_COILS);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    pdu.push(byte_count as u8);
    let mut packed = vec![0u8; byte_count];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    pdu.extend_from_slice(&packed);
    Ok(pdu)
}

/// Decoded response PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePdu {
    /// Coil or discrete-input read; bits are LSB-first, byte-rounded
    ReadBits { function: u8, bits: Vec<bool> },
    /// Holding or input register read
    ReadWords { function: u8, words: Vec<u16> },
    /// Echo of a successful write
    WriteEcho { function: u8, address: u16 },
    /// Device-reported exception; function has the high bit cleared
    Exception { function: u8, code: u8 },
}

pub fn parse_response(pdu: &[u8]) -> Result<ResponsePdu> {
    if pdu.is_empty() {
        return Err(TelSrvError::ModbusError("empty PDU".to_string()));
    }
    let function = pdu[0];

    if function & EXCEPTION_FLAG != 0 {
        if pdu.len() < 2 {
            return Err(TelSrvError::ModbusError("truncated exception".to_string()));
        }
        return Ok(ResponsePdu::Exception {
            function: function & !EXCEPTION_FLAG,
            code: pdu[1],
        });
    }

    match function {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS => {
            let byte_count = *pdu
                .get(1)
                .ok_or_else(|| TelSrvError::ModbusError("truncated bit read".to_string()))?
                as usize;
            let data = pdu
                .get(2..2 + byte_count)
                .ok_or_else(|| TelSrvError::ModbusError("short bit payload".to_string()))?;
            let mut bits = Vec::with_capacity(byte_count * 8);
            for byte in data {
                for i in 0..8 {
                    bits.push(byte & (1 << i) != 0);
                }
            }
            Ok(ResponsePdu::ReadBits { function, bits })
        }
        FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => {
            let byte_count = *pdu
                .get(1)
                .ok_or_else(|| TelSrvError::ModbusError("truncated word read".to_string()))?
                as usize;
            if byte_count % 2 != 0 {
                return Err(TelSrvError::ModbusError(format!(
                    "odd register byte count: {byte_count}"
                )));
            }
            let data = pdu
                .get(2..2 + byte_count)
                .ok_or_else(|| TelSrvError::ModbusError("short word payload".to_string()))?;
            let words = data
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            Ok(ResponsePdu::ReadWords { function, words })
        }
        FC_WRITE_SINGLE_COIL | FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_COILS
        | FC_WRITE_MULTIPLE_REGISTERS => {
            let address = pdu
                .get(1..3)
                .map(|a| u16::from_be_bytes([a[0], a[1]]))
                .ok_or_else(|| TelSrvError::ModbusError("truncated write echo".to_string()))?;
            Ok(ResponsePdu::WriteEcho { function, address })
        }
        other => Err(TelSrvError::ModbusError(format!(
            "unsupported function: {other:#04x}"
        ))),
    }
}

/// Permute a big-endian byte string to wire order, or back. Each order is
/// its own inverse.
fn apply_order(bytes: &mut [u8], order: ByteOrder) {
    match order {
        ByteOrder::BigEndian => {}
        ByteOrder::LittleEndian => bytes.reverse(),
        ByteOrder::BigEndianSwap => {
            // Reverse 16-bit word order, bytes within a word untouched
            let words = bytes.len() / 2;
            for i in 0..words / 2 {
                let j = words - 1 - i;
                bytes.swap(i * 2, j * 2);
                bytes.swap(i * 2 + 1, j * 2 + 1);
            }
        }
        ByteOrder::LittleEndianSwap => {
            for chunk in bytes.chunks_exact_mut(2) {
                chunk.swap(0, 1);
            }
        }
    }
}

fn words_to_normalized(words: &[u16], order: ByteOrder) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for word in words {
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    apply_order(&mut bytes, order);
    bytes
}

fn normalized_to_words(mut bytes: Vec<u8>, order: ByteOrder) -> Vec<u16> {
    apply_order(&mut bytes, order);
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect()
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Decode one value of `data_type` from its wire words.
///
/// `decimals` rounds floats and scales integers (raw / 10^decimals), the
/// usual fixed-point convention for telemetry registers.
pub fn decode_value(
    words: &[u16],
    data_type: DataType,
    order: ByteOrder,
    decimals: Option<u32>,
) -> Result<serde_json::Value> {
    let need = data_type.register_count() as usize;
    if words.len() < need {
        return Err(TelSrvError::InvalidData(format!(
            "{} registers given, {need} required",
            words.len()
        )));
    }
    let bytes = words_to_normalized(&words[..need], order);

    let scaled_int = |raw: i128| -> serde_json::Value {
        match decimals {
            Some(d) if d > 0 => json!(round_to(raw as f64 / 10f64.powi(d as i32), d)),
            _ => json!(raw as i64),
        }
    };

    Ok(match data_type {
        DataType::Bool => json!(bytes != [0, 0]),
        DataType::U16 => scaled_int(i128::from(u16::from_be_bytes([bytes[0], bytes[1]]))),
        DataType::I16 => scaled_int(i128::from(i16::from_be_bytes([bytes[0], bytes[1]]))),
        DataType::U32 => scaled_int(i128::from(u32::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        DataType::I32 => scaled_int(i128::from(i32::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        DataType::U64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[..8]);
            scaled_int(i128::from(u64::from_be_bytes(b)))
        }
        DataType::I64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[..8]);
            scaled_int(i128::from(i64::from_be_bytes(b)))
        }
        DataType::F32 => {
            let raw = f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let v = match decimals {
                Some(d) => round_to(f64::from(raw), d),
                None => f64::from(raw),
            };
            json!(v)
        }
        DataType::F64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[..8]);
            let raw = f64::from_be_bytes(b);
            let v = match decimals {
                Some(d) => round_to(raw, d),
                None => raw,
            };
            json!(v)
        }
    })
}

/// Encode a value into wire words for a register write
pub fn encode_value(
    value: &serde_json::Value,
    data_type: DataType,
    order: ByteOrder,
) -> Result<Vec<u16>> {
    let out_of_range =
        |v: &serde_json::Value| TelSrvError::InvalidParameter(format!("value out of range: {v}"));

    let bytes: Vec<u8> = match data_type {
        DataType::Bool => {
            let b = value
                .as_bool()
                .or_else(|| value.as_i64().map(|v| v != 0))
                .ok_or_else(|| out_of_range(value))?;
            vec![0x00, u8::from(b)]
        }
        DataType::U16 => {
            let v = value
                .as_u64()
                .and_then(|v| u16::try_from(v).ok())
                .ok_or_else(|| out_of_range(value))?;
            v.to_be_bytes().to_vec()
        }
        DataType::I16 => {
            let v = value
                .as_i64()
                .and_then(|v| i16::try_from(v).ok())
                .ok_or_else(|| out_of_range(value))?;
            v.to_be_bytes().to_vec()
        }
        DataType::U32 => {
            let v = value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| out_of_range(value))?;
            v.to_be_bytes().to_vec()
        }
        DataType::I32 => {
            let v = value
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| out_of_range(value))?;
            v.to_be_bytes().to_vec()
        }
        DataType::U64 => value
            .as_u64()
            .ok_or_else(|| out_of_range(value))?
            .to_be_bytes()
            .to_vec(),
        DataType::I64 => value
            .as_i64()
            .ok_or_else(|| out_of_range(value))?
            .to_be_bytes()
            .to_vec(),
        DataType::F32 => {
            let v = value.as_f64().ok_or_else(|| out_of_range(value))?;
            (v as f32).to_be_bytes().to_vec()
        }
        DataType::F64 => value
            .as_f64()
            .ok_or_else(|| out_of_range(value))?
            .to_be_bytes()
            .to_vec(),
    };

    Ok(normalized_to_words(bytes, order))
}

/// Decode a word-kind register definition from group words (already
/// sliced to the definition's span)
pub fn decode_point(
    def: &RegisterDefinition,
    order: ByteOrder,
    words: &[u16],
) -> Result<PointValue> {
    let per_value = def.data_type.register_count() as usize;
    let count = def.quantity.max(1) as usize;

    let value = if count == 1 {
        decode_value(words, def.data_type, order, def.decimals)?
    } else {
        let mut items = Vec::with_capacity(count);
        for i in 0..count {
            let slice = words.get(i * per_value..(i + 1) * per_value).ok_or_else(|| {
                TelSrvError::InvalidData(format!("short data for register {}", def.name))
            })?;
            items.push(decode_value(slice, def.data_type, order, def.decimals)?);
        }
        json!(items)
    };

    Ok(PointValue {
        name: def.name.clone(),
        label: dictionary_label(def, &value),
        value,
        unit: def.unit.clone(),
    })
}

/// Decode a bit-kind register definition from group bits
pub fn decode_bit_point(def: &RegisterDefinition, bits: &[bool]) -> Result<PointValue> {
    let count = def.quantity.max(1) as usize;
    let slice = bits.get(..count).ok_or_else(|| {
        TelSrvError::InvalidData(format!("short bit data for register {}", def.name))
    })?;
    let value = if count == 1 {
        json!(slice[0])
    } else {
        json!(slice)
    };
    Ok(PointValue {
        name: def.name.clone(),
        label: dictionary_label(def, &value),
        value,
        unit: def.unit.clone(),
    })
}

fn dictionary_label(def: &RegisterDefinition, value: &serde_json::Value) -> Option<String> {
    let dict = def.dictionary.as_ref()?;
    let key = match value {
        serde_json::Value::Bool(b) => u64::from(*b).to_string(),
        serde_json::Value::Number(n) => n.as_i64()?.to_string(),
        _ => return None,
    };
    dict.get(&key).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RegisterKind;
    use std::collections::BTreeMap;

    #[test]
    fn test_build_read_request() {
        let pdu = build_read_request(FC_READ_HOLDING_REGISTERS, 100, 2).expect("pdu");
        assert_eq!(pdu, vec![0x03, 0x00, 0x64, 0x00, 0x02]);
        assert!(build_read_request(FC_READ_HOLDING_REGISTERS, 0, 126).is_err());
        assert!(build_read_request(FC_READ_COILS, 0, 2000).is_ok());
        assert!(build_read_request(FC_READ_COILS, 0, 2001).is_err());
    }

    #[test]
    fn test_write_single_coil_on_pattern() {
        assert_eq!(
            build_write_single_coil(5, true),
            vec![0x05, 0x00, 0x05, 0xFF, 0x00]
        );
        assert_eq!(
            build_write_single_coil(5, false),
            vec![0x05, 0x00, 0x05, 0x00, 0x00]
        );
    }

    #[test]
    fn test_write_multiple_registers_pdu() {
        let pdu = build_write_multiple_registers(10, &[0x0102, 0x0304]).expect("pdu");
        assert_eq!(
            pdu,
            vec![0x10, 0x00, 0x0A, 0x00, 0x02, 0x04, 0x01, 0x02, 0x03, 0x04]
        );
        assert!(build_write_multiple_registers(0, &[0u16; 124]).is_err());
    }

    #[test]
    fn test_write_multiple_coils_packing() {
        let bits = [true, false, true, true, false, false, false, false, true];
        let pdu = build_write_multiple_coils(0, &bits).expect("pdu");
        // 9 coils -> 2 data bytes, first = 0b00001101
        assert_eq!(pdu, vec![0x0F, 0x00, 0x00, 0x00, 0x09, 0x02, 0x0D, 0x01]);
    }

    #[test]
    fn test_parse_word_read_response() {
        let parsed = parse_response(&[0x03, 0x04, 0x01, 0x02, 0x03, 0x04]).expect("parse");
        assert_eq!(
            parsed,
            ResponsePdu::ReadWords {
                function: 0x03,
                words: vec![0x0102, 0x0304]
            }
        );
    }

    #[test]
    fn test_parse_bit_read_response() {
        let parsed = parse_response(&[0x01, 0x01, 0b0000_0101]).expect("parse");
        match parsed {
            ResponsePdu::ReadBits { bits, .. } => {
                assert_eq!(&bits[..4], &[true, false, true, false]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_exception() {
        let parsed = parse_response(&[0x86, 0x02]).expect("parse");
        assert_eq!(
            parsed,
            ResponsePdu::Exception {
                function: 0x06,
                code: 0x02
            }
        );
    }

    #[test]
    fn test_parse_truncated_fails() {
        assert!(parse_response(&[]).is_err());
        assert!(parse_response(&[0x03, 0x04, 0x01]).is_err());
        assert!(parse_response(&[0x03, 0x03, 0x01, 0x02, 0x03]).is_err());
    }

    #[test]
    fn test_byte_orders_for_f32() {
        // 123.456f32 = 0x42F6E979
        let be = vec![0x42F6, 0xE979];
        let cases = [
            (ByteOrder::BigEndian, vec![0x42F6, 0xE979]),
            (ByteOrder::BigEndianSwap, vec![0xE979, 0x42F6]),
            (ByteOrder::LittleEndian, vec![0x79E9, 0xF642]),
            (ByteOrder::LittleEndianSwap, vec![0xF642, 0x79E9]),
        ];
        for (order, wire) in cases {
            let value = decode_value(&wire, DataType::F32, order, Some(3)).expect("decode");
            assert_eq!(value, json!(123.456), "{order:?}");
            let encoded =
                encode_value(&json!(123.456), DataType::F32, order).expect("encode");
            assert_eq!(encoded, wire, "{order:?}");
        }
        // Sanity: the normalized form really is the BE wire form
        assert_eq!(
            decode_value(&be, DataType::F32, ByteOrder::BigEndian, Some(3)).expect("decode"),
            json!(123.456)
        );
    }

    #[test]
    fn test_byte_order_roundtrip_every_word_type() {
        let orders = [
            ByteOrder::BigEndian,
            ByteOrder::LittleEndian,
            ByteOrder::BigEndianSwap,
            ByteOrder::LittleEndianSwap,
        ];
        let cases: &[(DataType, serde_json::Value, Option<u32>)] = &[
            (DataType::U16, json!(48879), None),
            (DataType::I16, json!(-1234), None),
            (DataType::U32, json!(0x1234_5678u32), None),
            (DataType::I32, json!(-559_038_737), None),
            (DataType::U64, json!(81_985_529_216_486_895u64), None),
            (DataType::I64, json!(-3_000_000_000i64), None),
            (DataType::F32, json!(123.456), Some(3)),
            (DataType::F64, json!(-98765.4321), None),
        ];

        for (data_type, value, decimals) in cases {
            for order in orders {
                let wire = encode_value(value, *data_type, order)
                    .unwrap_or_else(|e| panic!("encode {data_type:?} {order:?}: {e}"));
                assert_eq!(wire.len(), usize::from(data_type.register_count()));
                let decoded = decode_value(&wire, *data_type, order, *decimals)
                    .unwrap_or_else(|e| panic!("decode {data_type:?} {order:?}: {e}"));
                assert_eq!(&decoded, value, "{data_type:?} {order:?}");
            }
        }

        // The orders really permute the wire for multi-word values
        let wires: Vec<Vec<u16>> = orders
            .iter()
            .map(|&order| encode_value(&json!(0x1234_5678u32), DataType::U32, order).expect("encode"))
            .collect();
        for (i, a) in wires.iter().enumerate() {
            for b in wires.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_integer_decimal_scaling() {
        let value = decode_value(&[1234], DataType::U16, ByteOrder::BigEndian, Some(1))
            .expect("decode");
        assert_eq!(value, json!(123.4));

        let value = decode_value(&[1234], DataType::U16, ByteOrder::BigEndian, None)
            .expect("decode");
        assert_eq!(value, json!(1234));
    }

    #[test]
    fn test_signed_decode() {
        let value = decode_value(&[0xFFFE], DataType::I16, ByteOrder::BigEndian, None)
            .expect("decode");
        assert_eq!(value, json!(-2));
    }

    #[test]
    fn test_encode_range_checks() {
        assert!(encode_value(&json!(70000), DataType::U16, ByteOrder::BigEndian).is_err());
        assert!(encode_value(&json!(-1), DataType::U16, ByteOrder::BigEndian).is_err());
        assert_eq!(
            encode_value(&json!(65535), DataType::U16, ByteOrder::BigEndian).expect("encode"),
            vec![0xFFFF]
        );
    }

    fn def(data_type: DataType, quantity: u16) -> RegisterDefinition {
        RegisterDefinition {
            id: 1,
            name: "p".to_string(),
            kind: RegisterKind::HoldingRegister,
            address: 0,
            data_type,
            quantity,
            decimals: None,
            unit: None,
            dictionary: None,
        }
    }

    #[test]
    fn test_decode_point_array() {
        let point = decode_point(
            &def(DataType::U16, 3),
            ByteOrder::BigEndian,
            &[1, 2, 3],
        )
        .expect("decode");
        assert_eq!(point.value, json!([1, 2, 3]));
    }

    #[test]
    fn test_dictionary_label() {
        let mut d = def(DataType::U16, 1);
        let mut dict = BTreeMap::new();
        dict.insert("0".to_string(), "stopped".to_string());
        dict.insert("1".to_string(), "running".to_string());
        d.dictionary = Some(dict);

        let point = decode_point(&d, ByteOrder::BigEndian, &[1]).expect("decode");
        assert_eq!(point.label.as_deref(), Some("running"));
        let point = decode_point(&d, ByteOrder::BigEndian, &[9]).expect("decode");
        assert_eq!(point.label, None);
    }
}
