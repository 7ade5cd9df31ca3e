//! Primitive types and field tables

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::Error;

/// A field table. Keys are kept sorted so encoding is deterministic.
pub type FieldTable = BTreeMap<String, FieldValue>;

/// Value stored in a [`FieldTable`]
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// `t`
    Boolean(bool),
    /// `b`
    ShortShortInt(i8),
    /// `s`
    ShortInt(i16),
    /// `I`
    LongInt(i32),
    /// `l`
    LongLongInt(i64),
    /// `f`
    Float(f32),
    /// `d`
    Double(f64),
    /// `D`
    Decimal {
        /// Number of decimal digits
        scale: u8,
        /// Unscaled value
        value: u32,
    },
    /// `S`
    LongString(String),
    /// `x`
    Bytes(Bytes),
    /// `A`
    Array(Vec<FieldValue>),
    /// `T`
    Timestamp(u64),
    /// `F`
    Table(FieldTable),
    /// `V`
    Void,
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::LongString(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::LongString(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::LongInt(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::LongLongInt(value)
    }
}

impl From<FieldTable> for FieldValue {
    fn from(value: FieldTable) -> Self {
        Self::Table(value)
    }
}

fn ensure(src: &Bytes, len: usize) -> Result<(), Error> {
    if src.remaining() < len {
        return Err(Error::decode(format!(
            "expected {} more bytes, found {}",
            len,
            src.remaining()
        )));
    }
    Ok(())
}

/* --------------------------------- Reading -------------------------------- */

pub(crate) fn read_u8(src: &mut Bytes) -> Result<u8, Error> {
    ensure(src, 1)?;
    Ok(src.get_u8())
}

pub(crate) fn read_u16(src: &mut Bytes) -> Result<u16, Error> {
    ensure(src, 2)?;
    Ok(src.get_u16())
}

pub(crate) fn read_u32(src: &mut Bytes) -> Result<u32, Error> {
    ensure(src, 4)?;
    Ok(src.get_u32())
}

pub(crate) fn read_u64(src: &mut Bytes) -> Result<u64, Error> {
    ensure(src, 8)?;
    Ok(src.get_u64())
}

pub(crate) fn read_short_str(src: &mut Bytes) -> Result<String, Error> {
    let len = read_u8(src)? as usize;
    ensure(src, len)?;
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| Error::decode(e.to_string()))
}

pub(crate) fn read_long_bytes(src: &mut Bytes) -> Result<Bytes, Error> {
    let len = read_u32(src)? as usize;
    ensure(src, len)?;
    Ok(src.split_to(len))
}

pub(crate) fn read_long_str(src: &mut Bytes) -> Result<String, Error> {
    let raw = read_long_bytes(src)?;
    String::from_utf8(raw.to_vec()).map_err(|e| Error::decode(e.to_string()))
}

pub(crate) fn read_table(src: &mut Bytes) -> Result<FieldTable, Error> {
    let mut table_src = read_long_bytes(src)?;
    let mut table = FieldTable::new();
    while table_src.has_remaining() {
        let key = read_short_str(&mut table_src)?;
        let value = read_field_value(&mut table_src)?;
        table.insert(key, value);
    }
    Ok(table)
}

fn read_array(src: &mut Bytes) -> Result<Vec<FieldValue>, Error> {
    let mut array_src = read_long_bytes(src)?;
    let mut values = Vec::new();
    while array_src.has_remaining() {
        values.push(read_field_value(&mut array_src)?);
    }
    Ok(values)
}

fn read_field_value(src: &mut Bytes) -> Result<FieldValue, Error> {
    let tag = read_u8(src)?;
    let value = match tag {
        b't' => FieldValue::Boolean(read_u8(src)? != 0),
        b'b' => FieldValue::ShortShortInt(read_u8(src)? as i8),
        b's' => FieldValue::ShortInt(read_u16(src)? as i16),
        b'I' => FieldValue::LongInt(read_u32(src)? as i32),
        b'l' => FieldValue::LongLongInt(read_u64(src)? as i64),
        b'f' => FieldValue::Float(f32::from_bits(read_u32(src)?)),
        b'd' => FieldValue::Double(f64::from_bits(read_u64(src)?)),
        b'D' => {
            let scale = read_u8(src)?;
            let value = read_u32(src)?;
            FieldValue::Decimal { scale, value }
        }
        b'S' => FieldValue::LongString(read_long_str(src)?),
        b'x' => FieldValue::Bytes(read_long_bytes(src)?),
        b'A' => FieldValue::Array(read_array(src)?),
        b'T' => FieldValue::Timestamp(read_u64(src)?),
        b'F' => FieldValue::Table(read_table(src)?),
        b'V' => FieldValue::Void,
        other => {
            return Err(Error::decode(format!(
                "unknown field type {:?}",
                other as char
            )))
        }
    };
    Ok(value)
}

/* --------------------------------- Writing -------------------------------- */

pub(crate) fn write_short_str(dst: &mut BytesMut, value: &str) -> Result<(), Error> {
    let len = u8::try_from(value.len())
        .map_err(|_| Error::EncodeError(format!("short string of {} bytes", value.len())))?;
    dst.put_u8(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn write_long_bytes(dst: &mut BytesMut, value: &[u8]) -> Result<(), Error> {
    let len = u32::try_from(value.len())
        .map_err(|_| Error::EncodeError(format!("long string of {} bytes", value.len())))?;
    dst.put_u32(len);
    dst.put_slice(value);
    Ok(())
}

pub(crate) fn write_table(dst: &mut BytesMut, table: &FieldTable) -> Result<(), Error> {
    let mut buf = BytesMut::new();
    for (key, value) in table {
        write_short_str(&mut buf, key)?;
        write_field_value(&mut buf, value)?;
    }
    write_long_bytes(dst, &buf)
}

fn write_field_value(dst: &mut BytesMut, value: &FieldValue) -> Result<(), Error> {
    match value {
        FieldValue::Boolean(v) => {
            dst.put_u8(b't');
            dst.put_u8(*v as u8);
        }
        FieldValue::ShortShortInt(v) => {
            dst.put_u8(b'b');
            dst.put_i8(*v);
        }
        FieldValue::ShortInt(v) => {
            dst.put_u8(b's');
            dst.put_i16(*v);
        }
        FieldValue::LongInt(v) => {
            dst.put_u8(b'I');
            dst.put_i32(*v);
        }
        FieldValue::LongLongInt(v) => {
            dst.put_u8(b'l');
            dst.put_i64(*v);
        }
        FieldValue::Float(v) => {
            dst.put_u8(b'f');
            dst.put_f32(*v);
        }
        FieldValue::Double(v) => {
            dst.put_u8(b'd');
            dst.put_f64(*v);
        }
        FieldValue::Decimal { scale, value } => {
            dst.put_u8(b'D');
            dst.put_u8(*scale);
            dst.put_u32(*value);
        }
        FieldValue::LongString(v) => {
            dst.put_u8(b'S');
            write_long_bytes(dst, v.as_bytes())?;
        }
        FieldValue::Bytes(v) => {
            dst.put_u8(b'x');
            write_long_bytes(dst, v)?;
        }
        FieldValue::Array(values) => {
            dst.put_u8(b'A');
            let mut buf = BytesMut::new();
            for v in values {
                write_field_value(&mut buf, v)?;
            }
            write_long_bytes(dst, &buf)?;
        }
        FieldValue::Timestamp(v) => {
            dst.put_u8(b'T');
            dst.put_u64(*v);
        }
        FieldValue::Table(table) => {
            dst.put_u8(b'F');
            write_table(dst, table)?;
        }
        FieldValue::Void => dst.put_u8(b'V'),
    }
    Ok(())
}

/// Packs consecutive bit arguments into one octet, first bit lowest
pub(crate) fn pack_bits(bits: &[bool]) -> u8 {
    bits.iter()
        .enumerate()
        .fold(0u8, |acc, (i, bit)| acc | ((*bit as u8) << i))
}

pub(crate) fn bit(octet: u8, index: u8) -> bool {
    octet & (1 << index) != 0
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::*;

    #[test]
    fn table_with_nested_values_survives_the_wire() {
        let mut nested = FieldTable::new();
        nested.insert("publisher_confirms".into(), FieldValue::Boolean(true));

        let mut table = FieldTable::new();
        table.insert("capabilities".into(), FieldValue::Table(nested));
        table.insert("product".into(), "amqp-classic".into());
        table.insert(
            "ports".into(),
            FieldValue::Array(vec![FieldValue::LongInt(5672), FieldValue::Void]),
        );
        table.insert("weight".into(), FieldValue::Double(0.5));

        let mut buf = BytesMut::new();
        write_table(&mut buf, &table).unwrap();
        let mut src = buf.freeze();
        let decoded = read_table(&mut src).unwrap();
        assert_eq!(decoded, table);
        assert!(src.is_empty());
    }

    #[test]
    fn truncated_short_string_is_a_decode_error() {
        let mut src = Bytes::from_static(&[5, b'a', b'b']);
        assert!(matches!(read_short_str(&mut src), Err(Error::DecodeError(_))));
    }

    #[test]
    fn overlong_short_string_is_rejected() {
        let long = "x".repeat(256);
        let mut buf = BytesMut::new();
        assert!(matches!(
            write_short_str(&mut buf, &long),
            Err(Error::EncodeError(_))
        ));
    }

    #[test]
    fn bits_pack_lowest_first() {
        let octet = pack_bits(&[true, false, true]);
        assert_eq!(octet, 0b101);
        assert!(bit(octet, 0));
        assert!(!bit(octet, 1));
        assert!(bit(octet, 2));
    }
}
