use std::path::{Path, PathBuf};

use crate::error::{ProtocolError, Result};

/// Supplies the destination for a received file
pub trait PathResolver: Send + Sync + 'static {
    fn resolve(&self, file_name: &str) -> Result<PathBuf>;
}

/// Places every received file directly under one directory
#[derive(Debug, Clone)]
pub struct DirectoryPathResolver {
    root: PathBuf,
}

impl DirectoryPathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PathResolver for DirectoryPathResolver {
    fn resolve(&self, file_name: &str) -> Result<PathBuf> {
        Ok(self.root.join(sanitize_file_name(file_name)?))
    }
}

/// Final path component of a peer-supplied name, with either separator
pub fn sanitize_file_name(name: &str) -> Result<&str> {
    let last = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    match last {
        "" | "." | ".." => Err(ProtocolError::InvalidData(format!(
            "unusable file name {name:?}"
        ))),
        _ if last.contains('\0') => Err(ProtocolError::InvalidData(format!(
            "unusable file name {name:?}"
        ))),
        _ => Ok(last),
    }
}
