//! # Transport Layer
//!
//! Framed links over TCP and UDP.
//!
//! ## Components
//! - **LinkContext**: resolver, dispatcher, pipeline, pool and metrics shared by all links
//! - **Linker**: one connection with its writer, reader, dispatcher and heartbeat tasks
//! - **LinkerListener**: TCP accept loop with connection limits and graceful shutdown

pub mod context;
pub mod linker;
pub mod listener;

pub use context::{LinkContext, LinkContextBuilder};
pub use linker::{Linker, LinkerState, Transport};
pub use listener::LinkerListener;
