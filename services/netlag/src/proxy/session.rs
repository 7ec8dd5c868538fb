//! Proxied client sessions.
//!
//! A [`Session`] pairs one accepted client connection with its own upstream
//! connection to the target and runs two independent forwarding loops:
//!
//! ```text
//! client --read--> [Delay] -> [Processor] --> target
//! client <-write-- [Processor] <- [Delay] <-- target
//! ```
//!
//! Each loop reads chunks of at most `chunk_size` bytes into a reused buffer.
//! Every chunk is copied out at its actual length before it waits on its
//! direction's delay and goes through its direction's processor on the way
//! to the destination. Chunks of one direction are forwarded strictly in read order.
//! Whatever ends a loop (end of stream, error or cancellation), the
//! destination's write side is shut down before the loop returns.
//!
//! In buffered mode a loop hands chunks to a writer task and reads on
//! without waiting for the write to complete. Unbuffered loops write inline,
//! so a slow reader on one end slows the sender on the other.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument, Span};

use super::delay::Delay;
use super::direction::{Direction, PerDirection};
use super::listener::ProxyStats;
use super::processor::{Processor, ProcessorSlot};
use crate::error::{ProxyError, Result};

/// Identifier of a session within its proxy.
pub type SessionId = u64;

/// Invoked once when a session finishes closing.
pub(crate) type CloseHook = Box<dyn FnOnce(SessionId) + Send>;

/// Settings a session is seeded with at creation.
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub delays: PerDirection<Duration>,
    pub processors: PerDirection<Processor>,
    pub buffered: bool,
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Forwarding,
    Closing,
}

/// One client connection paired with its upstream connection.
pub struct Session {
    id: SessionId,
    client_addr: SocketAddr,
    upstream_addr: OnceLock<SocketAddr>,
    buffered: bool,
    chunk_size: usize,
    delays: PerDirection<Delay>,
    processors: PerDirection<ProcessorSlot>,
    bytes: PerDirection<AtomicU64>,
    phase: Mutex<Phase>,
    cancel: CancellationToken,
    finished: CancellationToken,
    closed: OnceCell<()>,
    on_close: Mutex<Option<CloseHook>>,
    stats: Arc<ProxyStats>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        client_addr: SocketAddr,
        settings: SessionSettings,
        stats: Arc<ProxyStats>,
        on_close: CloseHook,
    ) -> Arc<Self> {
        let SessionSettings {
            delays,
            processors,
            buffered,
            chunk_size,
        } = settings;

        Arc::new(Self {
            id,
            client_addr,
            upstream_addr: OnceLock::new(),
            buffered,
            chunk_size: chunk_size.max(1),
            delays: delays.map(Delay::with_timeout),
            processors: processors.map(ProcessorSlot::inherited),
            bytes: PerDirection::default(),
            phase: Mutex::new(Phase::Connecting),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            closed: OnceCell::new(),
            on_close: Mutex::new(Some(on_close)),
            stats,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Peer address of the proxied client.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Peer address of the upstream connection, once connected.
    pub fn upstream_addr(&self) -> Option<SocketAddr> {
        self.upstream_addr.get().copied()
    }

    /// The delay applied to chunks travelling in `direction`.
    pub fn delay(&self, direction: Direction) -> &Delay {
        &self.delays[direction]
    }

    /// The processor currently applied in `direction`.
    pub fn processor(&self, direction: Direction) -> Processor {
        self.processors[direction].get()
    }

    /// Override the processor for `direction` on this session only.
    ///
    /// Later proxy-wide processor changes do not replace an override.
    pub fn set_processor(&self, direction: Direction, processor: Processor) {
        debug!(session = %self, direction = %direction, "Overriding session processor");
        self.processors[direction].set_override(processor);
    }

    pub fn has_processor_override(&self, direction: Direction) -> bool {
        self.processors[direction].is_overridden()
    }

    /// Bytes read from the source side of `direction`.
    pub fn bytes_forwarded(&self, direction: Direction) -> u64 {
        self.bytes[direction].load(Ordering::Relaxed)
    }

    /// Whether the close sequence has completed.
    pub fn is_closed(&self) -> bool {
        self.closed.initialized()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn apply_delays(&self, delays: &PerDirection<Duration>) {
        for direction in Direction::ALL {
            self.delays[direction].set_timeout(delays[direction]);
        }
    }

    pub(crate) fn apply_processors(&self, processors: &PerDirection<Processor>) {
        for direction in Direction::ALL {
            if !self.processors[direction].apply_default(&processors[direction]) {
                debug!(
                    session = %self,
                    direction = %direction,
                    "Session processor override kept"
                );
            }
        }
    }

    /// Request cancellation without waiting for the loops to finish.
    pub(crate) fn abort(&self) {
        self.cancel.cancel();
    }

    /// Open the upstream connection and start forwarding.
    ///
    /// Fails with [`ProxyError::Connect`] if the target cannot be reached and
    /// with [`ProxyError::Io`] if the connected sockets cannot be set up. On
    /// failure the client stream is dropped, closing it.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        client: TcpStream,
        target_host: &str,
        target_port: u16,
    ) -> Result<()> {
        let target = format!("{}:{}", target_host, target_port);
        debug!(session = %self, upstream = %target, "Establishing upstream connection");

        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "session closed before upstream connected",
            )),
            result = TcpStream::connect((target_host, target_port)) => result,
        };
        let upstream = connected.map_err(|source| ProxyError::Connect {
            addr: target,
            source,
        })?;

        for (side, stream) in [("client", &client), ("upstream", &upstream)] {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(session = %self, side, error = %e, "Failed to set TCP_NODELAY");
            }
        }
        let _ = self.upstream_addr.set(upstream.peer_addr()?);

        self.spawn_forwarding(client, upstream);
        Ok(())
    }

    fn spawn_forwarding(self: &Arc<Self>, client: TcpStream, upstream: TcpStream) {
        {
            let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
            if *phase == Phase::Closing {
                debug!(session = %self, "Session closed while connecting");
                return;
            }
            *phase = Phase::Forwarding;
        }

        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let span = Span::current();
        let read = tokio::spawn(
            Arc::clone(self)
                .forward(Direction::Read, client_read, upstream_write)
                .instrument(span.clone()),
        );
        let write = tokio::spawn(
            Arc::clone(self)
                .forward(Direction::Write, upstream_read, client_write)
                .instrument(span.clone()),
        );

        let session = Arc::clone(self);
        tokio::spawn(
            async move {
                let (read, write) = tokio::join!(read, write);
                session.report(Direction::Read, read);
                session.report(Direction::Write, write);

                session.finished.cancel();
                session.close().await;
            }
            .instrument(span),
        );

        debug!(session = %self, "Session established");
    }

    fn report(&self, direction: Direction, outcome: std::result::Result<io::Result<()>, JoinError>) {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                session = %self,
                direction = %direction,
                error = %e,
                "Forwarding loop failed"
            ),
            Err(e) => error!(
                session = %self,
                direction = %direction,
                error = %e,
                "Forwarding loop aborted"
            ),
        }
    }

    /// Cancel both forwarding loops and wait for them to finish.
    ///
    /// Idempotent; concurrent callers all return once the single close
    /// sequence has completed.
    pub async fn close(&self) {
        self.closed
            .get_or_init(|| async {
                debug!(session = %self, "Closing session");

                let previous = {
                    let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
                    std::mem::replace(&mut *phase, Phase::Closing)
                };

                self.cancel.cancel();
                if previous == Phase::Forwarding {
                    self.finished.cancelled().await;
                }

                self.stats.sessions_closed.fetch_add(1, Ordering::Relaxed);

                let hook = self
                    .on_close
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(hook) = hook {
                    hook(self.id);
                }

                debug!(
                    session = %self,
                    bytes_read = self.bytes_forwarded(Direction::Read),
                    bytes_written = self.bytes_forwarded(Direction::Write),
                    "Session closed"
                );
            })
            .await;
    }

    /// Run one forwarding loop until end of stream, error or cancellation.
    pub(crate) async fn forward<R, W>(
        self: Arc<Self>,
        direction: Direction,
        mut reader: R,
        writer: W,
    ) -> io::Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut sink = ChunkSink::new(writer, self.buffered, self.cancel.clone());

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(()),
            result = self.pump(direction, &mut reader, &mut sink) => result,
        };

        let closed = sink.close().await;
        debug!(session = %self, direction = %direction, "Forwarding loop finished");
        result.and(closed)
    }

    async fn pump<R, W>(
        &self,
        direction: Direction,
        reader: &mut R,
        sink: &mut ChunkSink<W>,
    ) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let delay = &self.delays[direction];
        let slot = &self.processors[direction];
        let mut buf = BytesMut::with_capacity(self.chunk_size);

        loop {
            buf.clear();
            let n = reader.read_buf(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }

            self.bytes[direction].fetch_add(n as u64, Ordering::Relaxed);
            self.stats.record_bytes(direction, n as u64);

            let timeout = delay.timeout();
            if !timeout.is_zero() {
                debug!(
                    session = %self,
                    direction = %direction,
                    timeout = ?timeout,
                    "Delaying chunk"
                );
                delay.wait().await;
            }

            let chunk = slot.get().process(Bytes::copy_from_slice(&buf[..n])).await;
            sink.send(chunk).await?;
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{} {} => ", self.id, self.client_addr)?;
        match self.upstream_addr() {
            Some(addr) => write!(f, "{}", addr),
            None => f.write_str("(unconnected)"),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client_addr", &self.client_addr)
            .field("upstream_addr", &self.upstream_addr())
            .field("buffered", &self.buffered)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Destination side of a forwarding loop.
enum ChunkSink<W> {
    /// Writes complete before the next read.
    Direct(W),
    /// Writes are queued to a writer task.
    Queued {
        queue: mpsc::UnboundedSender<Bytes>,
        writer: JoinHandle<io::Result<()>>,
    },
}

impl<W> ChunkSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn new(writer: W, buffered: bool, cancel: CancellationToken) -> Self {
        if !buffered {
            return ChunkSink::Direct(writer);
        }

        let (queue, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(drain_queue(writer, rx, cancel).instrument(Span::current()));
        ChunkSink::Queued { queue, writer }
    }

    async fn send(&mut self, chunk: Bytes) -> io::Result<()> {
        match self {
            ChunkSink::Direct(writer) => {
                writer.write_all(&chunk).await?;
                writer.flush().await
            }
            ChunkSink::Queued { queue, .. } => queue
                .send(chunk)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "destination writer closed")),
        }
    }

    /// Shut down the destination's write side.
    async fn close(self) -> io::Result<()> {
        match self {
            ChunkSink::Direct(mut writer) => writer.shutdown().await,
            ChunkSink::Queued { queue, writer } => {
                drop(queue);
                writer.await.map_err(io::Error::other)?
            }
        }
    }
}

async fn drain_queue<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(()),
        result = write_queued(&mut writer, &mut rx) => result,
    };

    let shutdown = writer.shutdown().await;
    result.and(shutdown)
}

async fn write_queued<W>(writer: &mut W, rx: &mut mpsc::UnboundedReceiver<Bytes>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = rx.recv().await {
        writer.write_all(&chunk).await?;
    }
    writer.flush().await
}
