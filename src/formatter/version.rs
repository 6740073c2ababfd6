//! Versioned payloads.
//!
//! Wire layout: `version(u32) | length(i32) | payload(length)`.
//!
//! The reader picks the highest registered version that does not exceed the
//! tag in the stream. Any payload bytes that version does not understand are
//! skipped using the length, so newer writers stay readable by older readers.
//! The selected formatter only sees the declared payload, and once the length
//! is read the cursor always ends up past that payload, even on error.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::error::{ProtocolError, Result};
use crate::formatter::builtin::{read_array, read_len, write_len};
use crate::formatter::Formatter;
use crate::utils::buffer_pool::PooledBuffer;

/// A value tagged with the formatter version it was written with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionData<T> {
    pub version: u32,
    pub value: T,
}

impl<T> VersionData<T> {
    pub fn new(version: u32, value: T) -> Self {
        Self { version, value }
    }
}

pub(crate) struct VersionedFormatter<T> {
    versions: BTreeMap<u32, Arc<dyn Formatter<T>>>,
}

impl<T> VersionedFormatter<T> {
    pub(crate) fn new(versions: BTreeMap<u32, Arc<dyn Formatter<T>>>) -> Self {
        Self { versions }
    }

    /// Highest registered version at or below `tag`
    fn select(&self, tag: u32) -> Result<(u32, &Arc<dyn Formatter<T>>)> {
        self.versions
            .range(..=tag)
            .next_back()
            .map(|(version, formatter)| (*version, formatter))
            .ok_or(ProtocolError::UnsupportedVersion(tag))
    }
}

impl<T: Send + Sync + 'static> Formatter<VersionData<T>> for VersionedFormatter<T> {
    fn serialize(&self, data: &VersionData<T>, buf: &mut PooledBuffer) -> Result<()> {
        let (version, formatter) = self.select(data.version)?;

        let mut body = PooledBuffer::detached(64);
        formatter.serialize(&data.value, &mut body)?;

        buf.write_slice(&version.to_le_bytes());
        write_len(buf, body.remaining())?;
        buf.write_slice(body.unread());
        Ok(())
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<VersionData<T>> {
        let tag = u32::from_le_bytes(read_array(buf)?);
        let len = read_len(buf)?;
        if len > buf.remaining() {
            return Err(ProtocolError::BufferUnderflow {
                needed: len,
                available: buf.remaining(),
            });
        }

        let mut body = PooledBuffer::detached(len);
        body.write_slice(buf.read_exact(len)?);

        let (version, formatter) = self.select(tag)?;
        let value = formatter.deserialize(&mut body)?;
        if !body.is_empty() {
            trace!(tag, version, skipped = body.remaining(), "Skipping newer payload fields");
        }
        Ok(VersionData { version, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::builtin::NumberFormatter;
    use crate::formatter::ResolverBuilder;

    /// v1 carries one number
    struct V1;
    impl Formatter<(u32, u32)> for V1 {
        fn serialize(&self, value: &(u32, u32), buf: &mut PooledBuffer) -> Result<()> {
            NumberFormatter.serialize(&value.0, buf)
        }
        fn deserialize(&self, buf: &mut PooledBuffer) -> Result<(u32, u32)> {
            Ok((NumberFormatter.deserialize(buf)?, 0))
        }
    }

    /// v3 appends a second number
    struct V3;
    impl Formatter<(u32, u32)> for V3 {
        fn serialize(&self, value: &(u32, u32), buf: &mut PooledBuffer) -> Result<()> {
            NumberFormatter.serialize(&value.0, buf)?;
            NumberFormatter.serialize(&value.1, buf)
        }
        fn deserialize(&self, buf: &mut PooledBuffer) -> Result<(u32, u32)> {
            Ok((NumberFormatter.deserialize(buf)?, NumberFormatter.deserialize(buf)?))
        }
    }

    fn resolver(with_v3: bool) -> crate::formatter::FormatterResolver {
        let mut builder = ResolverBuilder::new();
        builder.register_version::<(u32, u32), _>(1, V1).unwrap();
        if with_v3 {
            builder.register_version::<(u32, u32), _>(3, V3).unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_highest_version_at_or_below_tag() {
        let resolver = resolver(true);
        let mut buf = PooledBuffer::detached(32);
        // No v2 exists; v1 is the best match, not v0 and not v3
        resolver
            .serialize(&VersionData::new(2, (7u32, 9u32)), &mut buf)
            .unwrap();
        let back = resolver.deserialize::<VersionData<(u32, u32)>>(&mut buf).unwrap();
        assert_eq!(back, VersionData::new(1, (7, 0)));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_newer_tag_read_by_older_reader() {
        let writer = resolver(true);
        let reader = resolver(false);

        let mut buf = PooledBuffer::detached(32);
        writer
            .serialize(&VersionData::new(5, (7u32, 9u32)), &mut buf)
            .unwrap();
        buf.write_slice(&[0xEE]);

        let back = reader.deserialize::<VersionData<(u32, u32)>>(&mut buf).unwrap();
        assert_eq!(back, VersionData::new(1, (7, 0)));
        // The unknown v3 field was skipped, the next byte is intact
        assert_eq!(buf.unread(), &[0xEE]);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_tag_below_all_versions_unsupported() {
        let resolver = resolver(true);
        let mut buf = PooledBuffer::detached(16);
        buf.write_slice(&0u32.to_le_bytes());
        buf.write_slice(&0i32.to_le_bytes());
        assert!(matches!(
            resolver.deserialize::<VersionData<(u32, u32)>>(&mut buf),
            Err(ProtocolError::UnsupportedVersion(0))
        ));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_overreading_version_stops_at_payload_end() {
        let resolver = resolver(true);
        let mut body = PooledBuffer::detached(8);
        NumberFormatter.serialize(&7u32, &mut body).unwrap();

        // Tagged v3 but carrying only the v1 field
        let mut buf = PooledBuffer::detached(32);
        buf.write_slice(&3u32.to_le_bytes());
        write_len(&mut buf, body.remaining()).unwrap();
        buf.write_slice(body.unread());
        buf.write_slice(&[0xEE; 4]);

        assert!(resolver.deserialize::<VersionData<(u32, u32)>>(&mut buf).is_err());
        assert_eq!(buf.unread(), &[0xEE; 4]);
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let mut builder = ResolverBuilder::new();
        assert!(builder.register_version::<(u32, u32), _>(1, V1).is_ok());
        assert!(matches!(
            builder.register_version::<(u32, u32), _>(1, V3),
            Err(ProtocolError::DuplicateFormatter(_))
        ));
    }
}
