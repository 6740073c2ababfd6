//! File handles for [`ConcurrentOperate`](crate::utils::concurrent::ConcurrentOperate).

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::debug;

use crate::error::Result;
use crate::utils::concurrent::OperationPolicy;

/// Opens source files read-only
#[derive(Debug, Clone, Copy, Default)]
pub struct FileReadPolicy;

impl OperationPolicy for FileReadPolicy {
    type Key = PathBuf;
    type Data = ();
    type Resource = File;

    fn create(&self, path: &PathBuf, _: &()) -> Result<File> {
        Ok(File::open(path)?)
    }

    fn try_reset(&self, file: &mut File) -> bool {
        file.rewind().is_ok()
    }
}

/// Opens destinations read/write, pre-sized to the transfer length.
///
/// An idle destination is never reused: it is sized for the transfer that
/// opened it.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileWritePolicy;

impl OperationPolicy for FileWritePolicy {
    type Key = PathBuf;
    /// Final file length
    type Data = u64;
    type Resource = File;

    fn create(&self, path: &PathBuf, length: &u64) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() != *length {
            file.set_len(*length)?;
        }
        debug!(path = %path.display(), length, "Opened destination");
        Ok(file)
    }

    fn try_reset(&self, _file: &mut File) -> bool {
        false
    }
}

pub fn write_at(file: &mut File, offset: u64, bytes: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    Ok(())
}

pub fn read_at(file: &mut File, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut bytes)?;
    Ok(bytes)
}
