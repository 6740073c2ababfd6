//! # Splitter
//!
//! Chunked transfer of large payloads over a [`Linker`](crate::transport::Linker).
//!
//! A transfer is one [`SplitterAnnounce`] followed by `chunk_count`
//! [`SplitterDto`] frames in increasing index order. Payloads no larger than
//! one chunk travel as a single chunk with index 0. The receiver answers with
//! [`SplitterComplete`] once every index has been written.
//!
//! ## Components
//! - **Info**: transfer descriptor, chunk messages and their formatters
//! - **FileSegmenter**: sending side, one read lease per transfer
//! - **FileAssembler**: receiving side, one shared write lease per destination
//! - **Paths**: destination resolution for received files

pub mod assembler;
pub mod file_ops;
pub mod info;
pub mod paths;
pub mod segmenter;

pub use assembler::{FileAssembler, TransferHandle, TransferOutcome};
pub use info::{Splitter, SplitterAnnounce, SplitterComplete, SplitterDto, SplitterInfo};
pub use paths::{DirectoryPathResolver, PathResolver};
pub use segmenter::FileSegmenter;

use std::sync::Arc;

use crate::error::Result;
use crate::formatter::{Formatter, ResolverBuilder};

/// Register formatters for the transfer messages
pub fn register_formatters(builder: &mut ResolverBuilder) -> Result<()> {
    builder
        .register_formatter::<SplitterInfo, _>(info::SplitterInfoFormatter)?
        .register_formatter::<SplitterDto, _>(info::SplitterDtoFormatter)?;

    builder
        .register::<SplitterAnnounce>()
        .depends_on::<String>()
        .depends_on::<SplitterInfo>()
        .build_with(|ctx| {
            let formatter: Arc<dyn Formatter<SplitterAnnounce>> = Arc::new(
                info::AnnounceFormatter::new(ctx.get::<String>()?, ctx.get::<SplitterInfo>()?),
            );
            Ok(formatter)
        })?;

    builder
        .register::<SplitterComplete>()
        .depends_on::<String>()
        .build_with(|ctx| {
            let formatter: Arc<dyn Formatter<SplitterComplete>> =
                Arc::new(info::CompleteFormatter::new(ctx.get::<String>()?));
            Ok(formatter)
        })?;
    Ok(())
}
