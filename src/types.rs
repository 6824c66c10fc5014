// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Logical and physical column types, cell values, and key encoding.

use bytes::{Buf, BufMut, Bytes};

/// Microsecond-resolution logical timestamp assigned by the replica's
/// clock. Orders mutations within a row's history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);
}

/// Identifier of a replicated log operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId {
    pub term: i64,
    pub index: i64,
}

/// Logical column type. Decimal and varchar types carry their
/// attributes so that two columns of the same kind but different
/// attributes compare unequal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    Bool,
    String,
    Binary,
    VarChar(u32),
    TimestampMicros,
    Date,
    Decimal32 { precision: u8, scale: u8 },
    Decimal64 { precision: u8, scale: u8 },
    Decimal128 { precision: u8, scale: u8 },
    /// Virtual column type: whether the row is deleted as of the read
    /// snapshot. Never materialized on disk.
    IsDeleted,
}

/// The representation a logical type stores and scans with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhysicalType {
    I8,
    I16,
    I32,
    I64,
    I128,
    F32,
    F64,
    Bool,
    Binary,
}

pub struct TypeInfo {
    pub physical: PhysicalType,
    pub name: &'static str,
    /// `None` for variable-width (binary) types.
    pub width: Option<usize>,
}

static TYPE_INFOS: &[TypeInfo] = &[
    TypeInfo { physical: PhysicalType::I8, name: "int8", width: Some(1) },
    TypeInfo { physical: PhysicalType::I16, name: "int16", width: Some(2) },
    TypeInfo { physical: PhysicalType::I32, name: "int32", width: Some(4) },
    TypeInfo { physical: PhysicalType::I64, name: "int64", width: Some(8) },
    TypeInfo { physical: PhysicalType::I128, name: "int128", width: Some(16) },
    TypeInfo { physical: PhysicalType::F32, name: "float", width: Some(4) },
    TypeInfo { physical: PhysicalType::F64, name: "double", width: Some(8) },
    TypeInfo { physical: PhysicalType::Bool, name: "bool", width: Some(1) },
    TypeInfo { physical: PhysicalType::Binary, name: "binary", width: None },
];

impl PhysicalType {
    pub fn info(self) -> &'static TypeInfo {
        let idx = match self {
            PhysicalType::I8 => 0,
            PhysicalType::I16 => 1,
            PhysicalType::I32 => 2,
            PhysicalType::I64 => 3,
            PhysicalType::I128 => 4,
            PhysicalType::F32 => 5,
            PhysicalType::F64 => 6,
            PhysicalType::Bool => 7,
            PhysicalType::Binary => 8,
        };
        &TYPE_INFOS[idx]
    }

    pub fn width(self) -> Option<usize> {
        self.info().width
    }
}

impl DataType {
    pub fn physical_type(self) -> PhysicalType {
        match self {
            DataType::Int8 => PhysicalType::I8,
            DataType::Int16 => PhysicalType::I16,
            DataType::Int32 | DataType::Date | DataType::Decimal32 { .. } => PhysicalType::I32,
            DataType::Int64 | DataType::TimestampMicros | DataType::Decimal64 { .. } => {
                PhysicalType::I64
            }
            DataType::Decimal128 { .. } => PhysicalType::I128,
            DataType::Float => PhysicalType::F32,
            DataType::Double => PhysicalType::F64,
            DataType::Bool | DataType::IsDeleted => PhysicalType::Bool,
            DataType::String | DataType::Binary | DataType::VarChar(_) => PhysicalType::Binary,
        }
    }

    pub fn is_fixed_width(self) -> bool {
        self.physical_type().width().is_some()
    }

    pub fn is_virtual(self) -> bool {
        matches!(self, DataType::IsDeleted)
    }
}

/// A single cell value. Binary cells hold [`Bytes`] so decoded values
/// can point into a shared block (e.g. the dictionary block) without
/// copying.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Null,
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    I128(i128),
    F32(f32),
    F64(f64),
    Bool(bool),
    #[serde(with = "bytes_serde")]
    Binary(Bytes),
}

mod bytes_serde {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(b: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(b)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let v: Vec<u8> = Vec::deserialize(d)?;
        Ok(Bytes::from(v))
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn from_str_slice(s: &str) -> Value {
        Value::Binary(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Encodes the value in the fixed little-endian layout used by data
    /// blocks. Panics on `Null`: callers strip nulls via the bitmap.
    pub fn put_le(&self, buf: &mut impl BufMut) {
        match self {
            Value::Null => panic!("cannot encode a null cell"),
            Value::I8(v) => buf.put_i8(*v),
            Value::I16(v) => buf.put_i16_le(*v),
            Value::I32(v) => buf.put_i32_le(*v),
            Value::I64(v) => buf.put_i64_le(*v),
            Value::I128(v) => buf.put_i128_le(*v),
            Value::F32(v) => buf.put_f32_le(*v),
            Value::F64(v) => buf.put_f64_le(*v),
            Value::Bool(v) => buf.put_u8(*v as u8),
            Value::Binary(v) => buf.put_slice(v),
        }
    }

    pub fn get_le(physical: PhysicalType, buf: &mut impl Buf) -> Value {
        match physical {
            PhysicalType::I8 => Value::I8(buf.get_i8()),
            PhysicalType::I16 => Value::I16(buf.get_i16_le()),
            PhysicalType::I32 => Value::I32(buf.get_i32_le()),
            PhysicalType::I64 => Value::I64(buf.get_i64_le()),
            PhysicalType::I128 => Value::I128(buf.get_i128_le()),
            PhysicalType::F32 => Value::F32(buf.get_f32_le()),
            PhysicalType::F64 => Value::F64(buf.get_f64_le()),
            PhysicalType::Bool => Value::Bool(buf.get_u8() != 0),
            PhysicalType::Binary => panic!("binary cells are not fixed-width"),
        }
    }
}

/// Column-major cell storage for one column of a row block.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnVec {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    I128(Vec<i128>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
    Binary(Vec<Bytes>),
}

impl ColumnVec {
    pub fn new(physical: PhysicalType) -> ColumnVec {
        match physical {
            PhysicalType::I8 => ColumnVec::I8(vec![]),
            PhysicalType::I16 => ColumnVec::I16(vec![]),
            PhysicalType::I32 => ColumnVec::I32(vec![]),
            PhysicalType::I64 => ColumnVec::I64(vec![]),
            PhysicalType::I128 => ColumnVec::I128(vec![]),
            PhysicalType::F32 => ColumnVec::F32(vec![]),
            PhysicalType::F64 => ColumnVec::F64(vec![]),
            PhysicalType::Bool => ColumnVec::Bool(vec![]),
            PhysicalType::Binary => ColumnVec::Binary(vec![]),
        }
    }

    pub fn physical_type(&self) -> PhysicalType {
        match self {
            ColumnVec::I8(_) => PhysicalType::I8,
            ColumnVec::I16(_) => PhysicalType::I16,
            ColumnVec::I32(_) => PhysicalType::I32,
            ColumnVec::I64(_) => PhysicalType::I64,
            ColumnVec::I128(_) => PhysicalType::I128,
            ColumnVec::F32(_) => PhysicalType::F32,
            ColumnVec::F64(_) => PhysicalType::F64,
            ColumnVec::Bool(_) => PhysicalType::Bool,
            ColumnVec::Binary(_) => PhysicalType::Binary,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnVec::I8(v) => v.len(),
            ColumnVec::I16(v) => v.len(),
            ColumnVec::I32(v) => v.len(),
            ColumnVec::I64(v) => v.len(),
            ColumnVec::I128(v) => v.len(),
            ColumnVec::F32(v) => v.len(),
            ColumnVec::F64(v) => v.len(),
            ColumnVec::Bool(v) => v.len(),
            ColumnVec::Binary(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a non-null cell. The cell's variant must match the
    /// column's physical type.
    pub fn push(&mut self, value: Value) {
        match (self, value) {
            (ColumnVec::I8(v), Value::I8(x)) => v.push(x),
            (ColumnVec::I16(v), Value::I16(x)) => v.push(x),
            (ColumnVec::I32(v), Value::I32(x)) => v.push(x),
            (ColumnVec::I64(v), Value::I64(x)) => v.push(x),
            (ColumnVec::I128(v), Value::I128(x)) => v.push(x),
            (ColumnVec::F32(v), Value::F32(x)) => v.push(x),
            (ColumnVec::F64(v), Value::F64(x)) => v.push(x),
            (ColumnVec::Bool(v), Value::Bool(x)) => v.push(x),
            (ColumnVec::Binary(v), Value::Binary(x)) => v.push(x),
            (col, value) => panic!(
                "cell type mismatch: column is {:?}, cell is {:?}",
                col.physical_type(),
                value
            ),
        }
    }

    pub fn get(&self, i: usize) -> Value {
        match self {
            ColumnVec::I8(v) => Value::I8(v[i]),
            ColumnVec::I16(v) => Value::I16(v[i]),
            ColumnVec::I32(v) => Value::I32(v[i]),
            ColumnVec::I64(v) => Value::I64(v[i]),
            ColumnVec::I128(v) => Value::I128(v[i]),
            ColumnVec::F32(v) => Value::F32(v[i]),
            ColumnVec::F64(v) => Value::F64(v[i]),
            ColumnVec::Bool(v) => Value::Bool(v[i]),
            ColumnVec::Binary(v) => Value::Binary(v[i].clone()),
        }
    }
}

/// Appends the memcomparable encoding of `value` to `buf`.
///
/// Integer kinds get their sign bit flipped and are written big-endian;
/// floats get the usual order-preserving bit transform. Binary cells in
/// a non-terminal key position escape `0x00` as `0x00 0x01` and close
/// with `0x00 0x00` so that composite keys stay prefix-comparable.
pub fn encode_key_part(value: &Value, is_last: bool, buf: &mut Vec<u8>) {
    match value {
        Value::Null => panic!("key columns are non-nullable"),
        Value::I8(v) => buf.put_u8((*v as u8) ^ 0x80),
        Value::I16(v) => buf.put_u16((*v as u16) ^ (1 << 15)),
        Value::I32(v) => buf.put_u32((*v as u32) ^ (1 << 31)),
        Value::I64(v) => buf.put_u64((*v as u64) ^ (1 << 63)),
        Value::I128(v) => buf.put_u128((*v as u128) ^ (1 << 127)),
        Value::F32(v) => {
            let bits = v.to_bits();
            let ordered = if bits & (1 << 31) != 0 { !bits } else { bits | (1 << 31) };
            buf.put_u32(ordered);
        }
        Value::F64(v) => {
            let bits = v.to_bits();
            let ordered = if bits & (1 << 63) != 0 { !bits } else { bits | (1 << 63) };
            buf.put_u64(ordered);
        }
        Value::Bool(v) => buf.put_u8(*v as u8),
        Value::Binary(v) => {
            if is_last {
                buf.put_slice(v);
            } else {
                for &b in v.iter() {
                    buf.put_u8(b);
                    if b == 0 {
                        buf.put_u8(1);
                    }
                }
                buf.put_u8(0);
                buf.put_u8(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_of(values: &[Value]) -> Vec<u8> {
        let mut buf = vec![];
        for (i, v) in values.iter().enumerate() {
            encode_key_part(v, i + 1 == values.len(), &mut buf);
        }
        buf
    }

    #[test]
    fn test_int_key_ordering() {
        let keys: Vec<_> = [-5i32, -1, 0, 1, 1000]
            .iter()
            .map(|&v| key_of(&[Value::I32(v)]))
            .collect();
        for w in keys.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn test_float_key_ordering() {
        let keys: Vec<_> = [-3.5f64, -0.0, 0.0, 0.25, 7e9]
            .iter()
            .map(|&v| key_of(&[Value::F64(v)]))
            .collect();
        for w in keys.windows(2) {
            assert!(w[0] <= w[1]);
        }
    }

    #[test]
    fn test_composite_binary_key_escaping() {
        // ("a\0b", 1) must sort before ("a\0b", 2) and after ("a", 9).
        let k1 = key_of(&[Value::Binary(Bytes::from_static(b"a")), Value::I32(9)]);
        let k2 = key_of(&[Value::Binary(Bytes::from_static(b"a\0b")), Value::I32(1)]);
        let k3 = key_of(&[Value::Binary(Bytes::from_static(b"a\0b")), Value::I32(2)]);
        assert!(k1 < k2);
        assert!(k2 < k3);
    }

    #[test]
    fn test_column_vec_push_get() {
        let mut col = ColumnVec::new(PhysicalType::Binary);
        col.push(Value::from_str_slice("x"));
        col.push(Value::from_str_slice("y"));
        assert_eq!(col.len(), 2);
        assert_eq!(col.get(1), Value::from_str_slice("y"));
    }

    #[test]
    fn test_value_fixed_roundtrip() {
        let vals = [
            Value::I8(-3),
            Value::I64(1 << 40),
            Value::F64(2.5),
            Value::Bool(true),
        ];
        for v in &vals {
            let mut buf = vec![];
            v.put_le(&mut buf);
            let physical = match v {
                Value::I8(_) => PhysicalType::I8,
                Value::I64(_) => PhysicalType::I64,
                Value::F64(_) => PhysicalType::F64,
                Value::Bool(_) => PhysicalType::Bool,
                _ => unreachable!(),
            };
            assert_eq!(&Value::get_le(physical, &mut &buf[..]), v);
        }
    }
}
