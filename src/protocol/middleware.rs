//! Chain-of-responsibility over frame payloads.
//!
//! Outbound frames pass through the middlewares in registration order, inbound
//! frames in reverse order, so layered transforms unwrap symmetrically. Each
//! middleware receives the mutable [`MiddlewareContext`] and a [`Next`]
//! continuation. Not calling `next`, or setting the termination flag, stops the
//! chain.

use std::any::Any;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::utils::compression::{decode_tagged, encode_tagged, CompressionKind};

/// Which way a frame is travelling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// State shared by the middlewares handling one frame
pub struct MiddlewareContext {
    pub direction: Direction,
    pub type_code: i32,
    /// Payload as it entered the pipeline
    pub input: Bytes,
    /// Replacement payload produced by a middleware
    pub output: Option<BytesMut>,
    /// Free slot for middlewares to hand values down the chain
    pub business: Option<Box<dyn Any + Send>>,
    terminated: bool,
    error: Option<ProtocolError>,
}

impl MiddlewareContext {
    pub fn new(direction: Direction, type_code: i32, input: Bytes) -> Self {
        Self {
            direction,
            type_code,
            input,
            output: None,
            business: None,
            terminated: false,
            error: None,
        }
    }

    /// Current payload: the latest output, else the input
    pub fn payload(&self) -> &[u8] {
        match &self.output {
            Some(output) => output,
            None => &self.input,
        }
    }

    pub fn set_output(&mut self, output: impl Into<BytesMut>) {
        self.output = Some(output.into());
    }

    /// Stop the chain and drop the frame
    pub fn terminate(&mut self) {
        self.terminated = true;
    }

    /// Stop the chain and fail the frame with `error`
    pub fn terminate_with(&mut self, error: ProtocolError) {
        self.terminated = true;
        self.error = Some(error);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn error(&self) -> Option<&ProtocolError> {
        self.error.as_ref()
    }

    fn into_payload(self) -> Bytes {
        match self.output {
            Some(output) => output.freeze(),
            None => self.input,
        }
    }
}

/// One link in the pipeline
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<()>;
}

/// Continuation running the rest of the chain
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
}

impl Next<'_> {
    pub fn run(self, ctx: &mut MiddlewareContext) -> Result<()> {
        if ctx.terminated {
            return Ok(());
        }
        match self.rest.split_first() {
            Some((head, tail)) => head.handle(ctx, Next { rest: tail }),
            None => Ok(()),
        }
    }
}

/// Ordered middleware chain, fixed once the link context is built
#[derive(Clone, Default)]
pub struct Pipeline {
    outbound: Vec<Arc<dyn Middleware>>,
    inbound: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.outbound.push(Arc::clone(&middleware));
        self.inbound.insert(0, middleware);
    }

    pub fn with(mut self, middleware: impl Middleware) -> Self {
        self.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty()
    }

    /// Run the chain over `payload`.
    ///
    /// Returns `Ok(None)` when a middleware terminated the chain without an error.
    pub fn process(&self, direction: Direction, type_code: i32, payload: Bytes) -> Result<Option<Bytes>> {
        let chain = match direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        };
        let mut ctx = MiddlewareContext::new(direction, type_code, payload);
        Next { rest: chain }.run(&mut ctx)?;

        if let Some(error) = ctx.error.take() {
            return Err(error);
        }
        if ctx.terminated {
            debug!(type_code, ?direction, "Frame stopped by middleware");
            return Ok(None);
        }
        Ok(Some(ctx.into_payload()))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.outbound.iter().map(|m| m.name()).collect();
        f.debug_struct("Pipeline").field("middlewares", &names).finish()
    }
}

/// Logs every frame passing through
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

impl Middleware for TracingMiddleware {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<()> {
        debug!(
            direction = ?ctx.direction,
            type_code = ctx.type_code,
            bytes = ctx.payload().len(),
            "Frame"
        );
        next.run(ctx)
    }
}

/// Compresses outbound payloads above a size threshold
#[derive(Debug, Clone, Copy)]
pub struct CompressionMiddleware {
    kind: CompressionKind,
    threshold_bytes: usize,
}

impl CompressionMiddleware {
    pub fn new(kind: CompressionKind, threshold_bytes: usize) -> Self {
        Self {
            kind,
            threshold_bytes,
        }
    }
}

impl Default for CompressionMiddleware {
    fn default() -> Self {
        Self::new(CompressionKind::Lz4, 512)
    }
}

impl Middleware for CompressionMiddleware {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<()> {
        match ctx.direction {
            Direction::Outbound => {
                let encoded = encode_tagged(ctx.payload(), self.kind, self.threshold_bytes)?;
                ctx.set_output(&encoded[..]);
            }
            Direction::Inbound => match decode_tagged(ctx.payload()) {
                Ok(decoded) => ctx.set_output(&decoded[..]),
                Err(e) => {
                    ctx.terminate_with(e);
                    return Ok(());
                }
            },
        }
        next.run(ctx)
    }
}
