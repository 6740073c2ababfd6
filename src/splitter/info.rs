use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::formatter::builtin::read_array;
use crate::formatter::Formatter;
use crate::protocol::message::Message;
use crate::utils::buffer_pool::PooledBuffer;

/// Shape of one transfer, derived from the payload size.
///
/// `chunk_count == max(1, ceil(total_length / chunk_size))`: an empty payload
/// still travels as one empty chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitterInfo {
    pub total_length: i64,
    pub chunk_size: i32,
    pub chunk_count: u32,
}

impl SplitterInfo {
    pub fn new(total_length: u64, chunk_size: usize) -> Result<Self> {
        let chunk_size = i32::try_from(chunk_size)
            .ok()
            .filter(|&size| size > 0)
            .ok_or_else(|| ProtocolError::InvalidChunk(format!("chunk size {chunk_size}")))?;
        let total = i64::try_from(total_length)
            .map_err(|_| ProtocolError::InvalidChunk(format!("total length {total_length}")))?;
        let count = total_length.div_ceil(chunk_size as u64).max(1);
        let chunk_count = u32::try_from(count)
            .map_err(|_| ProtocolError::InvalidChunk(format!("{count} chunks")))?;

        Ok(Self {
            total_length: total,
            chunk_size,
            chunk_count,
        })
    }

    /// Check a descriptor received from a peer
    pub fn validate(&self) -> Result<()> {
        let total = u64::try_from(self.total_length)
            .map_err(|_| ProtocolError::InvalidChunk(format!("total length {}", self.total_length)))?;
        let size = usize::try_from(self.chunk_size)
            .ok()
            .filter(|&size| size > 0)
            .ok_or_else(|| ProtocolError::InvalidChunk(format!("chunk size {}", self.chunk_size)))?;
        let expected = Self::new(total, size)?;
        if expected.chunk_count != self.chunk_count {
            return Err(ProtocolError::InvalidChunk(format!(
                "{} chunks declared, {} expected",
                self.chunk_count, expected.chunk_count
            )));
        }
        Ok(())
    }

    /// Check an announced shape against the receiver's limits
    pub fn check_limits(&self, max_total: u64, max_chunks: u32) -> Result<()> {
        if self.total_length.max(0) as u64 > max_total {
            return Err(ProtocolError::InvalidChunk(format!(
                "transfer of {} bytes exceeds {max_total}",
                self.total_length
            )));
        }
        if self.chunk_count > max_chunks {
            return Err(ProtocolError::InvalidChunk(format!(
                "{} chunks exceed {max_chunks}",
                self.chunk_count
            )));
        }
        Ok(())
    }

    /// Whether the payload travels as a single chunk
    pub fn is_single_chunk(&self) -> bool {
        self.chunk_count == 1
    }

    pub fn offset(&self, index: u32) -> u64 {
        u64::from(index) * self.chunk_size as u64
    }

    /// Byte range of chunk `index` within the payload
    pub fn chunk_range(&self, index: u32) -> Result<Range<u64>> {
        if index >= self.chunk_count {
            return Err(ProtocolError::InvalidChunk(format!(
                "index {index} out of {}",
                self.chunk_count
            )));
        }
        let total = self.total_length.max(0) as u64;
        let start = self.offset(index).min(total);
        let end = (start + self.chunk_size as u64).min(total);
        Ok(start..end)
    }

    pub fn chunk_len(&self, index: u32) -> Result<usize> {
        let range = self.chunk_range(index)?;
        Ok((range.end - range.start) as usize)
    }
}

/// One indexed chunk.
///
/// Wire layout: `chunk_index(u32) | length(i32) | bytes(length)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitterDto {
    pub chunk_index: u32,
    pub length: i32,
    pub bytes: Bytes,
}

impl SplitterDto {
    pub fn new(chunk_index: u32, bytes: Bytes) -> Result<Self> {
        let length = i32::try_from(bytes.len())
            .map_err(|_| ProtocolError::OversizedPacket(bytes.len()))?;
        Ok(Self {
            chunk_index,
            length,
            bytes,
        })
    }

    /// Check index and length against the transfer descriptor
    pub fn validate(&self, info: &SplitterInfo) -> Result<()> {
        let expected = info.chunk_len(self.chunk_index)?;
        if usize::try_from(self.length).ok() != Some(self.bytes.len()) {
            return Err(ProtocolError::InvalidChunk(format!(
                "chunk {} declares {} bytes, carries {}",
                self.chunk_index,
                self.length,
                self.bytes.len()
            )));
        }
        if self.bytes.len() != expected {
            return Err(ProtocolError::InvalidChunk(format!(
                "chunk {} has {} bytes, expected {expected}",
                self.chunk_index,
                self.bytes.len()
            )));
        }
        Ok(())
    }
}

impl Message for SplitterDto {
    const TYPE_NAME: &'static str = "linkwire.splitter.SplitterDto";
}

/// Sent before the chunks of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitterAnnounce {
    pub file_name: String,
    pub info: SplitterInfo,
}

impl Message for SplitterAnnounce {
    const TYPE_NAME: &'static str = "linkwire.splitter.SplitterAnnounce";
}

/// Receiver's acknowledgement once every chunk has been written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitterComplete {
    pub file_name: String,
    pub chunk_count: u32,
}

impl Message for SplitterComplete {
    const TYPE_NAME: &'static str = "linkwire.splitter.SplitterComplete";
}

/// Chunking of in-memory payloads
pub struct Splitter;

impl Splitter {
    /// Cut `payload` into chunks. The chunks share `payload`'s storage.
    pub fn split_bytes(payload: &Bytes, chunk_size: usize) -> Result<(SplitterInfo, Vec<SplitterDto>)> {
        let info = SplitterInfo::new(payload.len() as u64, chunk_size)?;
        let chunks = (0..info.chunk_count)
            .map(|index| {
                let range = info.chunk_range(index)?;
                SplitterDto::new(index, payload.slice(range.start as usize..range.end as usize))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((info, chunks))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SplitterInfoFormatter;

impl Formatter<SplitterInfo> for SplitterInfoFormatter {
    fn serialize(&self, value: &SplitterInfo, buf: &mut PooledBuffer) -> Result<()> {
        buf.write_slice(&value.total_length.to_le_bytes());
        buf.write_slice(&value.chunk_size.to_le_bytes());
        buf.write_slice(&value.chunk_count.to_le_bytes());
        Ok(())
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<SplitterInfo> {
        Ok(SplitterInfo {
            total_length: i64::from_le_bytes(read_array(buf)?),
            chunk_size: i32::from_le_bytes(read_array(buf)?),
            chunk_count: u32::from_le_bytes(read_array(buf)?),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SplitterDtoFormatter;

impl Formatter<SplitterDto> for SplitterDtoFormatter {
    fn serialize(&self, value: &SplitterDto, buf: &mut PooledBuffer) -> Result<()> {
        buf.write_slice(&value.chunk_index.to_le_bytes());
        buf.write_slice(&value.length.to_le_bytes());
        buf.write_slice(&value.bytes);
        Ok(())
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<SplitterDto> {
        let chunk_index = u32::from_le_bytes(read_array(buf)?);
        let length = i32::from_le_bytes(read_array(buf)?);
        let len = usize::try_from(length)
            .map_err(|_| ProtocolError::InvalidData(format!("negative chunk length {length}")))?;
        let bytes = Bytes::copy_from_slice(buf.read_exact(len)?);
        Ok(SplitterDto {
            chunk_index,
            length,
            bytes,
        })
    }
}

/// Formatter for the messages carrying a file name
pub struct AnnounceFormatter {
    name: Arc<dyn Formatter<String>>,
    info: Arc<dyn Formatter<SplitterInfo>>,
}

impl AnnounceFormatter {
    pub fn new(name: Arc<dyn Formatter<String>>, info: Arc<dyn Formatter<SplitterInfo>>) -> Self {
        Self { name, info }
    }
}

impl Formatter<SplitterAnnounce> for AnnounceFormatter {
    fn serialize(&self, value: &SplitterAnnounce, buf: &mut PooledBuffer) -> Result<()> {
        self.name.serialize(&value.file_name, buf)?;
        self.info.serialize(&value.info, buf)
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<SplitterAnnounce> {
        Ok(SplitterAnnounce {
            file_name: self.name.deserialize(buf)?,
            info: self.info.deserialize(buf)?,
        })
    }
}

pub struct CompleteFormatter {
    name: Arc<dyn Formatter<String>>,
}

impl CompleteFormatter {
    pub fn new(name: Arc<dyn Formatter<String>>) -> Self {
        Self { name }
    }
}

impl Formatter<SplitterComplete> for CompleteFormatter {
    fn serialize(&self, value: &SplitterComplete, buf: &mut PooledBuffer) -> Result<()> {
        self.name.serialize(&value.file_name, buf)?;
        buf.write_slice(&value.chunk_count.to_le_bytes());
        Ok(())
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<SplitterComplete> {
        Ok(SplitterComplete {
            file_name: self.name.deserialize(buf)?,
            chunk_count: u32::from_le_bytes(read_array(buf)?),
        })
    }
}
