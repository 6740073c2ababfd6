//! Shared state for every link created from one configuration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::NetworkConfig;
use crate::error::Result;
use crate::formatter::{FormatterResolver, ResolverBuilder};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::middleware::{Middleware, Pipeline};
use crate::protocol::parser::BinaryParser;
use crate::utils::buffer_pool::BufferPool;
use crate::utils::metrics::Metrics;

type FormatterSetup = Box<dyn FnOnce(&mut ResolverBuilder) -> Result<()> + Send>;

/// Resolver, dispatcher, pipeline, pools and metrics shared by linkers.
///
/// Built once at startup and handed to each [`Linker`](super::Linker) by `Arc`.
#[derive(Debug)]
pub struct LinkContext {
    config: NetworkConfig,
    parser: BinaryParser,
    dispatcher: Dispatcher,
    pipeline: Pipeline,
    metrics: Metrics,
    next_linker_id: AtomicU64,
}

impl LinkContext {
    pub fn builder(config: NetworkConfig) -> LinkContextBuilder {
        LinkContextBuilder {
            config,
            formatters: Vec::new(),
            pipeline: Pipeline::new(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn parser(&self) -> &BinaryParser {
        &self.parser
    }

    pub fn resolver(&self) -> &FormatterResolver {
        self.parser.resolver()
    }

    pub fn pool(&self) -> &BufferPool {
        self.parser.pool()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn next_linker_id(&self) -> u64 {
        self.next_linker_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Collects formatter registrations and middlewares for a [`LinkContext`]
pub struct LinkContextBuilder {
    config: NetworkConfig,
    formatters: Vec<FormatterSetup>,
    pipeline: Pipeline,
}

impl LinkContextBuilder {
    /// Register application formatters on top of the builtin ones
    pub fn formatters<F>(mut self, setup: F) -> Self
    where
        F: FnOnce(&mut ResolverBuilder) -> Result<()> + Send + 'static,
    {
        self.formatters.push(Box::new(setup));
        self
    }

    /// Append a middleware to the pipeline
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.pipeline.push(Arc::new(middleware));
        self
    }

    /// Validate the configuration and build every formatter
    pub fn build(self) -> Result<Arc<LinkContext>> {
        self.config.validate_strict()?;

        let mut resolver = ResolverBuilder::with_builtins()?;
        crate::protocol::register_formatters(&mut resolver)?;
        crate::splitter::register_formatters(&mut resolver)?;
        for setup in self.formatters {
            setup(&mut resolver)?;
        }
        let resolver = Arc::new(resolver.build()?);

        let pool = BufferPool::new(&self.config.pool);
        info!(
            formatters = resolver.len(),
            middlewares = self.pipeline.len(),
            max_retained = pool.max_retained(),
            "Link context ready"
        );

        Ok(Arc::new(LinkContext {
            config: self.config,
            parser: BinaryParser::new(resolver, pool),
            dispatcher: Dispatcher::new(),
            pipeline: self.pipeline,
            metrics: Metrics::new(),
            next_linker_id: AtomicU64::new(1),
        }))
    }
}
