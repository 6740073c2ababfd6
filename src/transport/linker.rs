//! # Linker
//!
//! A framed, pipelined endpoint over TCP or UDP.
//!
//! Each connection runs four tasks:
//! - a **writer** that drains the outbound queue, so frames from concurrent
//!   senders never interleave on the wire;
//! - a **reader** that cuts frames with [`FrameCodec`] and answers control frames;
//! - a **dispatcher** that runs handlers on blocking worker threads, in arrival order;
//! - a **heartbeat** that emits keep-alive frames once negotiated.
//!
//! ## State machine
//! ```text
//! Unconnected -> Connecting -> Connected -> Closing -> Closed
//!                                  |
//!                                  +-> Unconnected (remote close / failure)
//! ```
//!
//! The background tasks do not keep the link alive. Dropping the last
//! [`Linker`] handle closes it as [`Linker::close`] would.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::udp::UdpFramed;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::HEADER_LEN;
use crate::core::codec::FrameCodec;
use crate::core::packet::{Frame, HEARTBEAT_TYPE_CODE, NEGOTIATE_TYPE_CODE};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{Message, Negotiate};
use crate::protocol::middleware::Direction;
use crate::protocol::parser::BinaryParser;
use crate::transport::context::LinkContext;
use crate::utils::timeout::with_timeout_error;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkerState {
    Unconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl LinkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkerState::Unconnected => "unconnected",
            LinkerState::Connecting => "connecting",
            LinkerState::Connected => "connected",
            LinkerState::Closing => "closing",
            LinkerState::Closed => "closed",
        }
    }
}

impl fmt::Display for LinkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Socket kind backing a linker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

struct Session {
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    writer: Option<JoinHandle<()>>,
}

/// Negotiated keep-alive settings
struct Heartbeat {
    enabled: AtomicBool,
    interval_ms: AtomicU64,
    timeout_ms: AtomicU64,
    changed: Notify,
}

struct Inner {
    id: u64,
    transport: Transport,
    dialer: bool,
    target: Option<SocketAddr>,
    context: Arc<LinkContext>,
    state: watch::Sender<LinkerState>,
    remote: Mutex<Option<SocketAddr>>,
    local: Mutex<Option<SocketAddr>>,
    session: Mutex<Option<Session>>,
    heartbeat: Heartbeat,
    owner: Weak<Owner>,
}

/// Shared by every user-facing handle; closes the link when the last one goes
struct Owner {
    inner: Arc<Inner>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        let linker = Linker {
            inner: Arc::clone(&self.inner),
            owner: None,
        };
        if matches!(linker.state(), LinkerState::Closing | LinkerState::Closed) {
            return;
        }
        debug!(linker = linker.id(), "Last handle dropped, closing");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { linker.close().await });
            }
            Err(_) => linker.close_now(),
        }
    }
}

/// Handle to one link. Clones share the connection.
#[derive(Clone)]
pub struct Linker {
    inner: Arc<Inner>,
    /// `None` for the copies held by the link's own tasks
    owner: Option<Arc<Owner>>,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| ProtocolError::TransportError(format!("No address for {addr}")))
}

impl Linker {
    fn new(
        context: Arc<LinkContext>,
        transport: Transport,
        dialer: bool,
        target: Option<SocketAddr>,
    ) -> Self {
        let cfg = &context.config().linker;
        let heartbeat = Heartbeat {
            enabled: AtomicBool::new(cfg.need_heartbeat),
            interval_ms: AtomicU64::new(millis(cfg.heartbeat_interval)),
            timeout_ms: AtomicU64::new(millis(cfg.heartbeat_timeout)),
            changed: Notify::new(),
        };
        let owner = Arc::new_cyclic(|owner| Owner {
            inner: Arc::new(Inner {
                id: context.next_linker_id(),
                transport,
                dialer,
                target,
                state: watch::Sender::new(LinkerState::Unconnected),
                remote: Mutex::new(None),
                local: Mutex::new(None),
                session: Mutex::new(None),
                heartbeat,
                owner: owner.clone(),
                context,
            }),
        });
        Self {
            inner: Arc::clone(&owner.inner),
            owner: Some(owner),
        }
    }

    /// Copy that does not keep the link open
    pub(crate) fn detached(&self) -> Linker {
        Linker {
            inner: Arc::clone(&self.inner),
            owner: None,
        }
    }

    /// Full handle, while any user handle is still alive
    fn attached(&self) -> Option<Linker> {
        self.inner.owner.upgrade().map(|owner| Linker {
            inner: Arc::clone(&self.inner),
            owner: Some(owner),
        })
    }

    /// Dial a TCP peer
    #[instrument(skip(context))]
    pub async fn connect(context: Arc<LinkContext>, addr: &str) -> Result<Linker> {
        let target = resolve(addr).await?;
        let linker = Self::new(context, Transport::Tcp, true, Some(target));
        linker.dial().await?;
        Ok(linker)
    }

    /// Open a UDP link to `remote` from an ephemeral local port
    #[instrument(skip(context))]
    pub async fn connect_udp(context: Arc<LinkContext>, remote: &str) -> Result<Linker> {
        let remote = resolve(remote).await?;
        let bind = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        Self::from_udp_socket(context, socket, remote)
    }

    /// Open a UDP link over an already bound socket.
    ///
    /// Datagrams from any address other than `remote` are ignored.
    pub fn from_udp_socket(
        context: Arc<LinkContext>,
        socket: UdpSocket,
        remote: SocketAddr,
    ) -> Result<Linker> {
        let linker = Self::new(context, Transport::Udp, true, Some(remote));
        linker.set_state(LinkerState::Connecting);
        if let Err(e) = linker.attach_udp(socket, remote) {
            linker.set_state(LinkerState::Unconnected);
            return Err(e);
        }
        linker.send_negotiate()?;
        Ok(linker)
    }

    /// Wrap a stream accepted by a listener
    pub(crate) fn accepted(context: Arc<LinkContext>, stream: TcpStream) -> Result<Linker> {
        let linker = Self::new(context, Transport::Tcp, false, None);
        linker.set_state(LinkerState::Connecting);
        if let Err(e) = linker.attach_tcp(stream) {
            linker.set_state(LinkerState::Unconnected);
            return Err(e);
        }
        Ok(linker)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn transport(&self) -> Transport {
        self.inner.transport
    }

    pub fn state(&self) -> LinkerState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkerState::Connected
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<LinkerState> {
        self.inner.state.subscribe()
    }

    /// Resolves once the link is no longer connecting or connected
    pub async fn disconnected(&self) {
        let mut states = self.subscribe();
        let _ = states
            .wait_for(|s| !matches!(s, LinkerState::Connecting | LinkerState::Connected))
            .await;
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote.lock().ok().and_then(|addr| *addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local.lock().ok().and_then(|addr| *addr)
    }

    pub fn context(&self) -> &Arc<LinkContext> {
        &self.inner.context
    }

    pub fn parser(&self) -> &BinaryParser {
        self.inner.context.parser()
    }

    /// Whether keep-alive frames are currently exchanged
    pub fn heartbeat_enabled(&self) -> bool {
        self.inner.heartbeat.enabled.load(Ordering::Relaxed)
    }

    /// Queue `value` for sending.
    ///
    /// Completes once the frame is queued on the connection's writer, waiting
    /// while the queue is full.
    #[instrument(skip(self, value), fields(linker = self.id(), type_code = T::TYPE_CODE))]
    pub async fn send<T: Message>(&self, value: &T) -> Result<()> {
        let Some(frame) = self.encode_outbound(value)? else {
            return Ok(());
        };
        let outbound = self.outbound()?;
        outbound
            .send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Like [`send`](Self::send), abandoning the wait when `cancel` fires.
    ///
    /// A frame that was not queued is dropped and its buffer returned to the pool.
    #[instrument(skip(self, value, cancel), fields(linker = self.id(), type_code = T::TYPE_CODE))]
    pub async fn send_with_cancel<T: Message>(
        &self,
        value: &T,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }
        let Some(frame) = self.encode_outbound(value)? else {
            return Ok(());
        };
        let outbound = self.outbound()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
            sent = outbound.send(frame) => sent.map_err(|_| ProtocolError::ConnectionClosed),
        }
    }

    /// Queue `value` without waiting; fails with [`ProtocolError::ResourceBusy`] when the queue is full
    pub fn try_send<T: Message>(&self, value: &T) -> Result<()> {
        match self.encode_outbound(value)? {
            Some(frame) => self.enqueue(frame),
            None => Ok(()),
        }
    }

    /// Queue `value` from a synchronous context, blocking while the queue is full.
    ///
    /// Intended for handlers, which run on blocking worker threads.
    ///
    /// # Panics
    /// When called from within an asynchronous execution context.
    pub fn send_blocking<T: Message>(&self, value: &T) -> Result<()> {
        let Some(frame) = self.encode_outbound(value)? else {
            return Ok(());
        };
        self.outbound()?
            .blocking_send(frame)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Redial a dropped TCP link.
    ///
    /// With `auto_reconnect` enabled, retries up to `max_reconnect_attempts` times.
    #[instrument(skip(self), fields(linker = self.id()))]
    pub async fn reconnect(&self) -> Result<()> {
        match self.state() {
            LinkerState::Unconnected => {}
            LinkerState::Closing | LinkerState::Closed => {
                return Err(ProtocolError::Disposed(constants::ERR_LINKER_CLOSED))
            }
            other => {
                return Err(ProtocolError::InvalidState {
                    expected: LinkerState::Unconnected.as_str(),
                    actual: other.as_str(),
                })
            }
        }
        if !self.inner.dialer || self.inner.transport != Transport::Tcp {
            return Err(ProtocolError::TransportError(
                "only dialing TCP links can reconnect".to_string(),
            ));
        }

        let client = &self.context().config().client;
        let attempts = if client.auto_reconnect {
            client.max_reconnect_attempts.max(1)
        } else {
            1
        };

        let mut last_error = ProtocolError::ConnectionClosed;
        for attempt in 1..=attempts {
            match self.dial().await {
                Ok(()) => {
                    info!(attempt, "Reconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    last_error = e;
                }
            }
            if matches!(self.state(), LinkerState::Closing | LinkerState::Closed) {
                return Err(ProtocolError::Disposed(constants::ERR_LINKER_CLOSED));
            }
            if attempt < attempts {
                tokio::time::sleep(client.reconnect_delay).await;
            }
        }
        Err(last_error)
    }

    /// Flush queued frames and close the link. Later sends fail as disposed.
    #[instrument(skip(self), fields(linker = self.id()))]
    pub async fn close(&self) {
        let mut was_connected = false;
        let proceed = self.inner.state.send_if_modified(|state| match *state {
            LinkerState::Closing | LinkerState::Closed => false,
            other => {
                was_connected = other == LinkerState::Connected;
                *state = LinkerState::Closing;
                true
            }
        });
        if !proceed {
            return;
        }

        if let Some(Session {
            outbound,
            cancel,
            writer,
        }) = self.take_session()
        {
            // Closing the queue lets the writer drain what is already there
            drop(outbound);
            if let Some(writer) = writer {
                let abort = writer.abort_handle();
                let grace = self.context().config().server.shutdown_timeout;
                if tokio::time::timeout(grace, writer).await.is_err() {
                    warn!("Outbound queue did not drain in time");
                    abort.abort();
                }
            }
            cancel.cancel();
        }

        if was_connected {
            self.context().metrics().connection_closed();
        }
        self.set_state(LinkerState::Closed);
        info!("Link closed");
    }

    /// Close without draining the outbound queue
    fn close_now(&self) {
        let mut was_connected = false;
        let proceed = self.inner.state.send_if_modified(|state| match *state {
            LinkerState::Closing | LinkerState::Closed => false,
            other => {
                was_connected = other == LinkerState::Connected;
                *state = LinkerState::Closed;
                true
            }
        });
        if !proceed {
            return;
        }
        if let Some(session) = self.take_session() {
            session.cancel.cancel();
        }
        if was_connected {
            self.context().metrics().connection_closed();
        }
        info!(linker = self.id(), "Link closed");
    }

    fn set_state(&self, state: LinkerState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(linker = self.id(), from = %previous, to = %state, "State changed");
        }
    }

    fn take_session(&self) -> Option<Session> {
        self.inner
            .session
            .lock()
            .ok()
            .and_then(|mut session| session.take())
    }

    fn outbound(&self) -> Result<mpsc::Sender<Frame>> {
        match self.state() {
            LinkerState::Connected => {}
            LinkerState::Closing | LinkerState::Closed => {
                return Err(ProtocolError::Disposed(constants::ERR_LINKER_CLOSED))
            }
            other => {
                return Err(ProtocolError::InvalidState {
                    expected: LinkerState::Connected.as_str(),
                    actual: other.as_str(),
                })
            }
        }
        self.inner
            .session
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?
            .as_ref()
            .map(|session| session.outbound.clone())
            .ok_or(ProtocolError::ConnectionClosed)
    }

    /// Queue a ready frame without waiting
    pub(crate) fn enqueue(&self, frame: Frame) -> Result<()> {
        match self.outbound()?.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(ProtocolError::ResourceBusy("send queue".to_string()))
            }
            Err(TrySendError::Closed(_)) => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Serialize, run the outbound pipeline and check the frame limits.
    ///
    /// `None` means a middleware dropped the frame.
    fn encode_outbound<T: Message>(&self, value: &T) -> Result<Option<Frame>> {
        let context = self.context();
        let mut frame = context.parser().to_frame(value)?;

        let pipeline = context.pipeline();
        if !pipeline.is_empty() {
            match pipeline.process(Direction::Outbound, T::TYPE_CODE, frame.payload.unread_bytes())? {
                Some(bytes) => frame = Frame::new(T::TYPE_CODE, context.pool().rent_from(&bytes)),
                None => {
                    context.metrics().short_circuited();
                    return Ok(None);
                }
            }
        }

        let cfg = &context.config().linker;
        let len = frame.payload.remaining();
        if len > cfg.max_frame_size {
            return Err(ProtocolError::OversizedPacket(len));
        }
        if self.inner.transport == Transport::Udp && frame.wire_len() > cfg.udp_max_datagram {
            return Err(ProtocolError::OversizedPacket(frame.wire_len()));
        }
        Ok(Some(frame))
    }

    /// Inbound pipeline and handler dispatch; runs on a blocking worker
    fn process_inbound(&self, frame: Frame) -> Result<()> {
        let context = self.context();
        let pipeline = context.pipeline();
        let frame = if pipeline.is_empty() {
            frame
        } else {
            let type_code = frame.type_code;
            let payload = frame.payload.unread_bytes();
            drop(frame);
            match pipeline.process(Direction::Inbound, type_code, payload)? {
                Some(bytes) => Frame::new(type_code, context.pool().rent_from(&bytes)),
                None => {
                    context.metrics().short_circuited();
                    return Ok(());
                }
            }
        };
        context.dispatcher().dispatch(frame, self)
    }

    async fn dial(&self) -> Result<()> {
        let target = self.inner.target.ok_or(ProtocolError::InvalidState {
            expected: "dialing link",
            actual: "accepted link",
        })?;

        let started = self.inner.state.send_if_modified(|state| {
            if *state == LinkerState::Unconnected {
                *state = LinkerState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ProtocolError::InvalidState {
                expected: LinkerState::Unconnected.as_str(),
                actual: self.state().as_str(),
            });
        }

        let timeout = self.context().config().client.connection_timeout;
        let connected = with_timeout_error(
            async { TcpStream::connect(target).await.map_err(ProtocolError::from) },
            timeout,
        )
        .await
        .map_err(|e| match e {
            ProtocolError::Timeout => ProtocolError::ConnectionTimeout,
            other => other,
        })
        .and_then(|stream| self.attach_tcp(stream));

        if let Err(e) = connected {
            self.context().metrics().connection_error();
            self.set_state(LinkerState::Unconnected);
            return Err(e);
        }
        self.send_negotiate()
    }

    fn attach_tcp(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;

        let codec = FrameCodec::new(
            self.context().pool().clone(),
            self.context().config().linker.max_frame_size,
        );
        let (sink, stream) = StreamExt::split::<Frame>(Framed::new(stream, codec));
        self.start_session(sink, stream, remote, local);
        Ok(())
    }

    fn attach_udp(&self, socket: UdpSocket, remote: SocketAddr) -> Result<()> {
        let local = socket.local_addr()?;
        let cfg = &self.context().config().linker;
        let max_payload = cfg
            .max_frame_size
            .min(cfg.udp_max_datagram.saturating_sub(HEADER_LEN));

        let codec = FrameCodec::new(self.context().pool().clone(), max_payload);
        let (sink, stream) =
            StreamExt::split::<(Frame, SocketAddr)>(UdpFramed::new(socket, codec));
        let sink = sink.with(move |frame: Frame| future::ready(Ok::<_, ProtocolError>((frame, remote))));
        let context = Arc::clone(self.context());
        let stream = stream.filter_map(move |item| {
            future::ready(match item {
                Ok((frame, from)) if from == remote => Some(Ok(frame)),
                Ok((_, from)) => {
                    trace!(%from, "Ignoring datagram from unknown peer");
                    None
                }
                Err(ProtocolError::Io(e)) => Some(Err(ProtocolError::Io(e))),
                Err(e) => {
                    // The codec discarded the datagram; the next one decodes on its own
                    context.metrics().protocol_error();
                    warn!(error = %e, "Dropping malformed datagram");
                    None
                }
            })
        });
        self.start_session(sink, stream, remote, local);
        Ok(())
    }

    fn start_session<Si, St>(&self, sink: Si, stream: St, remote: SocketAddr, local: SocketAddr)
    where
        Si: Sink<Frame, Error = ProtocolError> + Send + 'static,
        St: Stream<Item = Result<Frame>> + Send + 'static,
    {
        let cfg = &self.context().config().linker;
        let hb = &self.inner.heartbeat;
        hb.enabled.store(cfg.need_heartbeat, Ordering::Relaxed);
        hb.interval_ms
            .store(millis(cfg.heartbeat_interval), Ordering::Relaxed);
        hb.timeout_ms
            .store(millis(cfg.heartbeat_timeout), Ordering::Relaxed);

        let (outbound, queued) = mpsc::channel(cfg.send_queue_depth);
        let (inbound, received) = mpsc::channel(cfg.send_queue_depth);
        let cancel = CancellationToken::new();

        let writer = tokio::spawn(write_loop(self.detached(), sink, queued, cancel.clone()));
        if let Ok(mut addr) = self.inner.remote.lock() {
            *addr = Some(remote);
        }
        if let Ok(mut addr) = self.inner.local.lock() {
            *addr = Some(local);
        }
        if let Ok(mut session) = self.inner.session.lock() {
            *session = Some(Session {
                outbound,
                cancel: cancel.clone(),
                writer: Some(writer),
            });
        }
        self.set_state(LinkerState::Connected);
        self.context().metrics().connection_established();
        info!(
            linker = self.id(),
            %remote,
            %local,
            transport = ?self.inner.transport,
            "Link connected"
        );

        tokio::spawn(read_loop(self.detached(), stream, inbound, cancel.clone()));
        tokio::spawn(dispatch_loop(self.detached(), received));
        tokio::spawn(heartbeat_loop(self.detached(), cancel));
    }

    /// Tear down after a failure or remote close. No-op unless connected.
    fn connection_lost(&self, reason: Option<ProtocolError>) {
        let dropped = self.inner.state.send_if_modified(|state| {
            if *state == LinkerState::Connected {
                *state = LinkerState::Unconnected;
                true
            } else {
                false
            }
        });
        if !dropped {
            return;
        }

        if let Some(session) = self.take_session() {
            session.cancel.cancel();
        }
        let metrics = self.context().metrics();
        metrics.connection_closed();
        match reason {
            Some(e) => {
                metrics.connection_error();
                warn!(linker = self.id(), error = %e, "Connection lost");
            }
            None => info!(linker = self.id(), "Remote closed the connection"),
        }

        if self.inner.dialer
            && self.inner.transport == Transport::Tcp
            && self.context().config().client.auto_reconnect
        {
            let linker = self.detached();
            tokio::spawn(async move {
                if let Err(e) = linker.reconnect().await {
                    warn!(linker = linker.id(), error = %e, "Giving up on reconnect");
                }
            });
        }
    }

    fn send_negotiate(&self) -> Result<()> {
        let cfg = &self.context().config().linker;
        let negotiate = Negotiate {
            need_heartbeat: cfg.need_heartbeat,
            heartbeat_interval_ms: u32::try_from(millis(cfg.heartbeat_interval))
                .unwrap_or(u32::MAX),
        };
        let frame = self.parser().to_frame(&negotiate)?;
        self.enqueue(frame)
    }

    /// Heartbeating is on when either side asks; the shorter interval wins.
    fn on_negotiate(&self, mut frame: Frame) -> Result<()> {
        let remote: Negotiate = self.parser().from_frame(&mut frame)?;
        if remote.need_heartbeat {
            let hb = &self.inner.heartbeat;
            let requested = u64::from(remote.heartbeat_interval_ms).max(10);
            let interval = if hb.enabled.load(Ordering::Relaxed) {
                hb.interval_ms.load(Ordering::Relaxed).min(requested)
            } else {
                requested
            };
            let floor = millis(self.context().config().linker.heartbeat_timeout);
            hb.interval_ms.store(interval, Ordering::Relaxed);
            hb.timeout_ms
                .store(floor.max(interval.saturating_mul(3)), Ordering::Relaxed);
            hb.enabled.store(true, Ordering::Relaxed);
            hb.changed.notify_one();
        }
        debug!(
            linker = self.id(),
            remote_heartbeat = remote.need_heartbeat,
            heartbeat = self.heartbeat_enabled(),
            "Negotiated"
        );

        if !self.inner.dialer {
            self.send_negotiate()?;
        }
        Ok(())
    }

    /// Longest silence tolerated before the connection is declared dead
    fn read_deadline(&self) -> Option<Duration> {
        let hb = &self.inner.heartbeat;
        hb.enabled
            .load(Ordering::Relaxed)
            .then(|| Duration::from_millis(hb.timeout_ms.load(Ordering::Relaxed)))
    }
}

impl fmt::Debug for Linker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Linker")
            .field("id", &self.inner.id)
            .field("transport", &self.inner.transport)
            .field("state", &self.state())
            .field("remote", &self.remote_addr())
            .finish()
    }
}

async fn write_loop<Si>(
    linker: Linker,
    sink: Si,
    mut queued: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) where
    Si: Sink<Frame, Error = ProtocolError> + Send + 'static,
{
    let mut sink = Box::pin(sink);
    let metrics = linker.context().metrics();
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = queued.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // Feed everything already queued, then flush once
        let mut batch = Some(frame);
        while let Some(frame) = batch.take().or_else(|| queued.try_recv().ok()) {
            let bytes = frame.wire_len() as u64;
            if let Err(e) = sink.feed(frame).await {
                linker.connection_lost(Some(e));
                return;
            }
            metrics.frame_sent(bytes);
        }
        if let Err(e) = sink.flush().await {
            linker.connection_lost(Some(e));
            return;
        }
    }

    if let Err(e) = sink.close().await {
        debug!(linker = linker.id(), error = %e, "Error closing sink");
    }
}

async fn next_frame<St>(stream: &mut St, silence: Option<Duration>) -> Result<Option<Frame>>
where
    St: Stream<Item = Result<Frame>> + Unpin,
{
    match silence {
        Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
            Ok(item) => item.transpose(),
            Err(_) => Err(ProtocolError::ConnectionTimeout),
        },
        None => stream.next().await.transpose(),
    }
}

async fn read_loop<St>(
    linker: Linker,
    stream: St,
    inbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) where
    St: Stream<Item = Result<Frame>> + Send + 'static,
{
    let mut stream = Box::pin(stream);
    let metrics = linker.context().metrics();
    loop {
        let silence = linker.read_deadline();
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = next_frame(&mut stream, silence) => next,
        };

        match next {
            Ok(Some(frame)) => {
                metrics.frame_received(frame.wire_len() as u64);
                match frame.type_code {
                    HEARTBEAT_TYPE_CODE => trace!(linker = linker.id(), "Heartbeat received"),
                    NEGOTIATE_TYPE_CODE => {
                        if let Err(e) = linker.on_negotiate(frame) {
                            metrics.protocol_error();
                            warn!(linker = linker.id(), error = %e, "Bad negotiation frame");
                        }
                    }
                    _ => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            sent = inbound.send(frame) => if sent.is_err() { return },
                        }
                    }
                }
            }
            Ok(None) => {
                linker.connection_lost(None);
                return;
            }
            Err(e) => {
                if !matches!(e, ProtocolError::Io(_) | ProtocolError::ConnectionTimeout) {
                    metrics.protocol_error();
                }
                linker.connection_lost(Some(e));
                return;
            }
        }
    }
}

async fn dispatch_loop(linker: Linker, mut received: mpsc::Receiver<Frame>) {
    while let Some(frame) = received.recv().await {
        let type_code = frame.type_code;
        // Handlers get a full handle so they can keep the link open
        let Some(worker) = linker.attached() else {
            trace!(linker = linker.id(), type_code, "No handle left, frame dropped");
            continue;
        };
        match tokio::task::spawn_blocking(move || worker.process_inbound(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                linker.context().metrics().dispatch_failure();
                warn!(linker = linker.id(), type_code, error = %e, "Inbound frame rejected");
            }
            Err(e) => {
                linker.context().metrics().dispatch_failure();
                warn!(linker = linker.id(), type_code, error = %e, "Handler panicked");
            }
        }
    }
}

async fn heartbeat_loop(linker: Linker, cancel: CancellationToken) {
    let hb = &linker.inner.heartbeat;
    loop {
        let interval = Duration::from_millis(hb.interval_ms.load(Ordering::Relaxed));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            // Restart the wait with the negotiated interval
            _ = hb.changed.notified() => continue,
            _ = tokio::time::sleep(interval) => {}
        }
        if !hb.enabled.load(Ordering::Relaxed) {
            continue;
        }
        match linker.enqueue(Frame::empty(HEARTBEAT_TYPE_CODE)) {
            Ok(()) => linker.context().metrics().heartbeat_sent(),
            Err(ProtocolError::ResourceBusy(_)) => {
                trace!(linker = linker.id(), "Send queue full, heartbeat skipped")
            }
            Err(_) => return,
        }
    }
}
