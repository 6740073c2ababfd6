//! Builtin formatters and wire helpers.
//!
//! All integers are little-endian. Strings and byte blobs carry an `i32` length
//! prefix, collections an `i32` element count, options a one-byte tag.

use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};
use crate::formatter::Formatter;
use crate::utils::buffer_pool::PooledBuffer;

/// Read `N` bytes into an array
#[inline]
pub fn read_array<const N: usize>(buf: &mut PooledBuffer) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(buf.read_exact(N)?);
    Ok(out)
}

/// Write a length or count as an `i32`
#[inline]
pub fn write_len(buf: &mut PooledBuffer, len: usize) -> Result<()> {
    let len = i32::try_from(len)
        .map_err(|_| ProtocolError::InvalidData(format!("length {len} exceeds i32")))?;
    buf.write_slice(&len.to_le_bytes());
    Ok(())
}

/// Read an `i32` length or count, rejecting negatives
#[inline]
pub fn read_len(buf: &mut PooledBuffer) -> Result<usize> {
    let len = i32::from_le_bytes(read_array(buf)?);
    usize::try_from(len).map_err(|_| ProtocolError::InvalidData(format!("negative length {len}")))
}

/// Write a length-prefixed byte blob
pub fn write_blob(buf: &mut PooledBuffer, bytes: &[u8]) -> Result<()> {
    write_len(buf, bytes.len())?;
    buf.write_slice(bytes);
    Ok(())
}

/// Read a length-prefixed byte blob
pub fn read_blob<'a>(buf: &'a mut PooledBuffer) -> Result<&'a [u8]> {
    let len = read_len(buf)?;
    buf.read_exact(len)
}

/// Fixed-width little-endian numbers
#[derive(Debug, Clone, Copy, Default)]
pub struct NumberFormatter;

macro_rules! number_formatter {
    ($($t:ty),* $(,)?) => {
        $(
            impl Formatter<$t> for NumberFormatter {
                #[inline]
                fn serialize(&self, value: &$t, buf: &mut PooledBuffer) -> Result<()> {
                    buf.write_slice(&value.to_le_bytes());
                    Ok(())
                }

                #[inline]
                fn deserialize(&self, buf: &mut PooledBuffer) -> Result<$t> {
                    Ok(<$t>::from_le_bytes(read_array(buf)?))
                }
            }
        )*
    };
}

number_formatter!(u8, i8, u16, i16, u32, i32, u64, i64, u128, i128, f32, f64);

#[derive(Debug, Clone, Copy, Default)]
pub struct BoolFormatter;

impl Formatter<bool> for BoolFormatter {
    fn serialize(&self, value: &bool, buf: &mut PooledBuffer) -> Result<()> {
        buf.write_slice(&[u8::from(*value)]);
        Ok(())
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<bool> {
        match read_array::<1>(buf)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::InvalidData(format!("bool tag {other}"))),
        }
    }
}

/// UTF-8 strings
#[derive(Debug, Clone, Copy, Default)]
pub struct StringFormatter;

impl Formatter<String> for StringFormatter {
    fn serialize(&self, value: &String, buf: &mut PooledBuffer) -> Result<()> {
        write_blob(buf, value.as_bytes())
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<String> {
        let bytes = read_blob(buf)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| ProtocolError::InvalidData(e.to_string()))
    }
}

/// Opaque byte blobs
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesFormatter;

impl Formatter<Vec<u8>> for BytesFormatter {
    fn serialize(&self, value: &Vec<u8>, buf: &mut PooledBuffer) -> Result<()> {
        write_blob(buf, value)
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<Vec<u8>> {
        Ok(read_blob(buf)?.to_vec())
    }
}

impl Formatter<Bytes> for BytesFormatter {
    fn serialize(&self, value: &Bytes, buf: &mut PooledBuffer) -> Result<()> {
        write_blob(buf, value)
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(read_blob(buf)?))
    }
}

/// `Vec<T>` through the element formatter
pub struct VecFormatter<T> {
    element: Arc<dyn Formatter<T>>,
}

impl<T> VecFormatter<T> {
    pub fn new(element: Arc<dyn Formatter<T>>) -> Self {
        Self { element }
    }
}

impl<T: Send + Sync + 'static> Formatter<Vec<T>> for VecFormatter<T> {
    fn serialize(&self, value: &Vec<T>, buf: &mut PooledBuffer) -> Result<()> {
        write_len(buf, value.len())?;
        value
            .iter()
            .try_for_each(|item| self.element.serialize(item, buf))
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<Vec<T>> {
        let count = read_len(buf)?;
        // Each element takes at least one byte unless it is zero-sized
        let mut out = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            out.push(self.element.deserialize(buf)?);
        }
        Ok(out)
    }
}

/// `Option<T>` with a one-byte presence tag
pub struct OptionFormatter<T> {
    inner: Arc<dyn Formatter<T>>,
}

impl<T> OptionFormatter<T> {
    pub fn new(inner: Arc<dyn Formatter<T>>) -> Self {
        Self { inner }
    }
}

impl<T: Send + Sync + 'static> Formatter<Option<T>> for OptionFormatter<T> {
    fn serialize(&self, value: &Option<T>, buf: &mut PooledBuffer) -> Result<()> {
        match value {
            None => {
                buf.write_slice(&[0]);
                Ok(())
            }
            Some(inner) => {
                buf.write_slice(&[1]);
                self.inner.serialize(inner, buf)
            }
        }
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<Option<T>> {
        match read_array::<1>(buf)?[0] {
            0 => Ok(None),
            1 => self.inner.deserialize(buf).map(Some),
            other => Err(ProtocolError::InvalidData(format!("option tag {other}"))),
        }
    }
}

/// `HashMap<K, V>` as a counted sequence of key/value pairs
pub struct MapFormatter<K, V> {
    key: Arc<dyn Formatter<K>>,
    value: Arc<dyn Formatter<V>>,
}

impl<K, V> MapFormatter<K, V> {
    pub fn new(key: Arc<dyn Formatter<K>>, value: Arc<dyn Formatter<V>>) -> Self {
        Self { key, value }
    }
}

impl<K, V> Formatter<HashMap<K, V>> for MapFormatter<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn serialize(&self, map: &HashMap<K, V>, buf: &mut PooledBuffer) -> Result<()> {
        write_len(buf, map.len())?;
        for (k, v) in map {
            self.key.serialize(k, buf)?;
            self.value.serialize(v, buf)?;
        }
        Ok(())
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<HashMap<K, V>> {
        let count = read_len(buf)?;
        let mut map = HashMap::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            let k = self.key.deserialize(buf)?;
            let v = self.value.deserialize(buf)?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

/// Any serde type as a length-prefixed bincode blob
pub struct SerdeFormatter<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeFormatter<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeFormatter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Formatter<T> for SerdeFormatter<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn serialize(&self, value: &T, buf: &mut PooledBuffer) -> Result<()> {
        let encoded = bincode::serialize(value)?;
        write_blob(buf, &encoded)
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<T> {
        Ok(bincode::deserialize(read_blob(buf)?)?)
    }
}
