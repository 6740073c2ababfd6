use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::transport::context::LinkContext;
use crate::transport::linker::Linker;

/// Accepts TCP connections and wraps each in a [`Linker`].
///
/// Links returned by [`accept`](Self::accept) belong to the caller and close
/// when the caller drops them. Links handed out by
/// [`serve_with_shutdown`](Self::serve_with_shutdown) are kept open by the
/// listener until they disconnect.
pub struct LinkerListener {
    context: Arc<LinkContext>,
    listener: TcpListener,
    local_addr: SocketAddr,
    active: Arc<Mutex<HashMap<u64, Linker>>>,
}

impl LinkerListener {
    #[instrument(skip(context))]
    pub async fn bind(context: Arc<LinkContext>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Listening");
        Ok(Self {
            context,
            listener,
            local_addr,
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<LinkContext> {
        &self.context
    }

    /// Number of accepted links still connected
    pub async fn active_connections(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Wait for the next connection.
    ///
    /// Connections beyond `max_connections` are dropped as soon as they are accepted.
    pub async fn accept(&self) -> Result<Linker> {
        let max_connections = self.context.config().server.max_connections;
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let active = self.active.lock().await.len();
            if active >= max_connections {
                warn!(%peer, active, max_connections, "Connection limit reached, dropping");
                drop(stream);
                continue;
            }

            let linker = Linker::accepted(Arc::clone(&self.context), stream)?;
            debug!(%peer, linker = linker.id(), "Accepted connection");
            self.track(linker.detached()).await;
            return Ok(linker);
        }
    }

    /// Endless stream of accepted links
    pub fn incoming(&self) -> impl Stream<Item = Result<Linker>> + '_ {
        futures::stream::unfold(self, |listener| async move {
            Some((listener.accept().await, listener))
        })
    }

    /// Accept until Ctrl+C, handing each link to `on_link`
    pub async fn serve<F>(self, on_link: F) -> Result<()>
    where
        F: Fn(Linker) + Send + Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL+C signal, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
        });
        self.serve_with_shutdown(shutdown_rx, on_link).await
    }

    /// Accept until `shutdown_rx` fires, then drain.
    ///
    /// Open links get `shutdown_timeout` to disconnect on their own before
    /// they are closed.
    #[instrument(skip(self, shutdown_rx, on_link), fields(address = %self.local_addr))]
    pub async fn serve_with_shutdown<F>(
        self,
        mut shutdown_rx: mpsc::Receiver<()>,
        on_link: F,
    ) -> Result<()>
    where
        F: Fn(Linker) + Send + Sync + 'static,
    {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutting down listener. Waiting for connections to close...");
                    self.drain().await;
                    return Ok(());
                }
                accepted = self.accept() => match accepted {
                    Ok(linker) => {
                        if let Some(slot) = self.active.lock().await.get_mut(&linker.id()) {
                            *slot = linker.clone();
                        }
                        on_link(linker);
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                        self.context.metrics().connection_error();
                    }
                }
            }
        }
    }

    async fn track(&self, linker: Linker) {
        let id = linker.id();
        self.active.lock().await.insert(id, linker.clone());

        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            linker.disconnected().await;
            active.lock().await.remove(&id);
        });
    }

    async fn drain(&self) {
        let grace = self.context.config().server.shutdown_timeout;
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("Shutdown timeout reached, closing remaining links");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    let connections = self.active.lock().await.len();
                    info!(connections, "Waiting for connections to close");
                    if connections == 0 {
                        info!("All connections closed, shutting down");
                        return;
                    }
                }
            }
        }

        let remaining: Vec<Linker> = self.active.lock().await.drain().map(|(_, l)| l).collect();
        for linker in remaining {
            linker.close().await;
        }
    }
}

impl std::fmt::Debug for LinkerListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkerListener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
