//! # Utility Modules
//!
//! Supporting pieces shared by the codec, the transport and the splitter.
//!
//! ## Components
//! - **Object pool / buffer pool**: bounded reuse of instances and byte storage
//! - **Concurrent operate**: exclusive, keyed access to pooled OS resources
//! - **Compression**: LZ4 and Zstd with size limits and entropy gating
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//! - **Timeout**: Async timeout wrappers

pub mod buffer_pool;
pub mod compression;
pub mod concurrent;
pub mod logging;
pub mod metrics;
pub mod object_pool;
pub mod timeout;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use concurrent::{ConcurrentOperate, ConcurrentOperation, OperationPolicy};
pub use object_pool::{ObjectPool, PooledObjectPolicy};
