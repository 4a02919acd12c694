//! Tagged-value serialization for the shared payload
//!
//! Layout of an encoded list:
//!
//! ```text
//! [count: u8][tag: u8; count][value 0][value 1]...
//! ```
//!
//! Numbers and 64-bit integers take 8 bytes, booleans 4 bytes, strings a
//! 4-byte length prefix followed by UTF-8. Fixed-width values use the byte
//! order agreed during the handshake.

use super::config::ByteOrder;
use super::metrics::Metrics;
use crate::error::{BridgeError, Result};
use std::time::Instant;

const TAG_NUMBER: u8 = 1;
const TAG_BIGINT: u8 = 2;
const TAG_BOOLEAN: u8 = 3;
const TAG_STRING: u8 = 4;

/// A value that can cross the bridge
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    F64(f64),
    I64(i64),
    Bool(bool),
    Str(String),
}

impl Value {
    fn tag(&self) -> u8 {
        match self {
            Value::F64(_) => TAG_NUMBER,
            Value::I64(_) => TAG_BIGINT,
            Value::Bool(_) => TAG_BOOLEAN,
            Value::Str(_) => TAG_STRING,
        }
    }

    /// Integer view; numbers are accepted when they carry no fraction
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            Value::F64(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            Value::I64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::F64(v as f64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Encoder/decoder bound to a byte order
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    order: ByteOrder,
}

impl Codec {
    pub fn new(order: ByteOrder) -> Self {
        Codec { order }
    }

    /// Encode `values` at the start of `region`
    ///
    /// An empty slice writes a zero count, which decodes as "no value".
    pub fn serialize(&self, region: &mut [u8], values: &[Value]) -> Result<()> {
        if region.is_empty() {
            return Err(BridgeError::Codec("serialization region is empty".into()));
        }
        if values.len() > u8::MAX as usize {
            return Err(BridgeError::Codec(format!(
                "cannot serialize {} values (limit {})",
                values.len(),
                u8::MAX
            )));
        }

        let mut w = Writer {
            buf: region,
            pos: 0,
        };
        w.put(&[values.len() as u8])?;
        for v in values {
            w.put(&[v.tag()])?;
        }
        for v in values {
            match v {
                Value::F64(n) => w.put(&self.order.put_f64(*n))?,
                Value::I64(n) => w.put(&self.order.put_i64(*n))?,
                Value::Bool(b) => w.put(&self.order.put_i32(*b as i32))?,
                Value::Str(s) => {
                    let len = i32::try_from(s.len()).map_err(|_| {
                        BridgeError::Codec(format!("string of {} bytes is too long", s.len()))
                    })?;
                    w.put(&self.order.put_i32(len))?;
                    w.put(s.as_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Decode the list at the start of `region`
    ///
    /// Returns `None` for a zero count. With `clear`, the count byte is zeroed
    /// after decoding so the same payload is never read twice.
    pub fn deserialize(&self, region: &mut [u8], clear: bool) -> Result<Option<Vec<Value>>> {
        let decoded = self.decode(region);
        if clear && !region.is_empty() {
            region[0] = 0;
        }
        decoded
    }

    fn decode(&self, region: &[u8]) -> Result<Option<Vec<Value>>> {
        let mut r = Reader { buf: region, pos: 0 };
        let count = r.take::<1>()?[0] as usize;
        if count == 0 {
            return Ok(None);
        }

        let tags = r.slice(count)?.to_vec();
        let mut out = Vec::with_capacity(count);
        for tag in tags {
            let value = match tag {
                TAG_NUMBER => Value::F64(self.order.get_f64(r.take()?)),
                TAG_BIGINT => Value::I64(self.order.get_i64(r.take()?)),
                TAG_BOOLEAN => Value::Bool(self.order.get_i32(r.take()?) != 0),
                TAG_STRING => {
                    let len = self.order.get_i32(r.take()?);
                    if len < 0 {
                        return Err(BridgeError::Codec(format!("negative string length {}", len)));
                    }
                    let bytes = r.slice(len as usize)?;
                    let s = std::str::from_utf8(bytes)
                        .map_err(|e| BridgeError::Codec(format!("invalid UTF-8: {}", e)))?;
                    Value::Str(s.to_string())
                }
                other => {
                    return Err(BridgeError::Codec(format!("unknown type tag {}", other)));
                }
            };
            out.push(value);
        }
        Ok(Some(out))
    }

    /// [`Codec::serialize`] with timing recorded in `metrics`
    pub fn serialize_timed(
        &self,
        metrics: &mut Metrics,
        region: &mut [u8],
        values: &[Value],
    ) -> Result<()> {
        let started = Instant::now();
        let result = self.serialize(region, values);
        metrics.record_serialize(started.elapsed());
        result
    }

    /// [`Codec::deserialize`] with timing recorded in `metrics`
    pub fn deserialize_timed(
        &self,
        metrics: &mut Metrics,
        region: &mut [u8],
        clear: bool,
    ) -> Result<Option<Vec<Value>>> {
        let started = Instant::now();
        let result = self.deserialize(region, clear);
        metrics.record_deserialize(started.elapsed());
        result
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(BridgeError::Codec(format!(
                "payload of at least {} bytes exceeds the {}-byte serialization region",
                end,
                self.buf.len()
            )));
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|e| *e <= self.buf.len());
        match end {
            Some(end) => {
                let s = &self.buf[self.pos..end];
                self.pos = end;
                Ok(s)
            }
            None => Err(BridgeError::Codec(format!(
                "truncated payload: wanted {} bytes at offset {}",
                len, self.pos
            ))),
        }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(N)?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Codec {
        Codec::new(ByteOrder::native())
    }

    #[test]
    fn test_mixed_values_round_trip() {
        let mut region = vec![0u8; 256];
        let values = vec![
            Value::from(3),
            Value::I64(1 << 40),
            Value::Bool(true),
            Value::from("/dir/file.db"),
            Value::F64(-0.5),
        ];
        codec().serialize(&mut region, &values).unwrap();
        assert_eq!(codec().deserialize(&mut region, false).unwrap(), Some(values));
    }

    #[test]
    fn test_empty_list_is_no_value() {
        let mut region = vec![0xFFu8; 16];
        codec().serialize(&mut region, &[]).unwrap();
        assert_eq!(codec().deserialize(&mut region, false).unwrap(), None);
    }

    #[test]
    fn test_clear_zeroes_count() {
        let mut region = vec![0u8; 64];
        codec().serialize(&mut region, &[Value::from("stale")]).unwrap();
        assert!(codec().deserialize(&mut region, true).unwrap().is_some());
        assert_eq!(region[0], 0);
        assert_eq!(codec().deserialize(&mut region, false).unwrap(), None);
    }

    #[test]
    fn test_overflow_fails_loudly() {
        let mut region = vec![0u8; 16];
        let long = "x".repeat(64);
        let err = codec().serialize(&mut region, &[Value::from(long)]).unwrap_err();
        assert!(matches!(err, BridgeError::Codec(_)));
    }

    #[test]
    fn test_too_many_values_rejected() {
        let mut region = vec![0u8; 4096];
        let values = vec![Value::Bool(false); 256];
        assert!(codec().serialize(&mut region, &values).is_err());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut region = vec![0u8; 16];
        region[0] = 1;
        region[1] = 9;
        assert!(codec().deserialize(&mut region, false).is_err());
    }

    #[test]
    fn test_truncated_string_rejected() {
        let mut region = vec![0u8; 12];
        region[0] = 1;
        region[1] = TAG_STRING;
        region[2..6].copy_from_slice(&ByteOrder::native().put_i32(100));
        assert!(codec().deserialize(&mut region, false).is_err());
    }

    #[test]
    fn test_big_endian_layout() {
        let c = Codec::new(ByteOrder::Big);
        let mut region = vec![0u8; 32];
        c.serialize(&mut region, &[Value::I64(1)]).unwrap();
        assert_eq!(&region[..2], &[1, TAG_BIGINT]);
        assert_eq!(&region[2..10], &[0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::F64(4.0).as_i64(), Some(4));
        assert_eq!(Value::F64(4.5).as_i64(), None);
        assert_eq!(Value::I64(2).as_f64(), Some(2.0));
        assert_eq!(Value::from("a").as_str(), Some("a"));
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Bool(true).as_i64(), None);
    }
}
