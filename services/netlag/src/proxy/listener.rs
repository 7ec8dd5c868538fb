//! Proxy listener and session registry.
//!
//! [`TcpProxy`] accepts client connections, pairs each one with a fresh
//! upstream connection to a single target, and keeps the set of active
//! [`Session`]s. Delay and processor defaults are copied into every new
//! session and pushed to every active session when they change.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures_util::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::delay::duration_from_secs;
use super::direction::{Direction, PerDirection};
use super::processor::Processor;
use super::session::{CloseHook, Session, SessionId, SessionSettings};
use super::socket::bind_listener;
use crate::error::{ProxyError, Result};

/// Default listen host.
pub const DEFAULT_LISTEN_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Default maximum chunk size read per forwarding step.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Bound used by [`TcpProxy::open`] for starting.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Upstream host every session connects to.
    pub target_host: String,
    /// Upstream port.
    pub target_port: u16,
    /// Host to listen on.
    pub listen_host: IpAddr,
    /// Port to listen on. An ephemeral port is used when unset.
    pub listen_port: Option<u16>,
    /// Queue writes instead of waiting for each one to drain.
    pub buffered: bool,
    /// Maximum bytes read per chunk.
    pub chunk_size: usize,
    /// Initial client to target delay.
    pub read_delay: Duration,
    /// Initial target to client delay.
    pub write_delay: Duration,
}

impl ProxyConfig {
    /// Create a configuration for the given target with default settings.
    pub fn new(target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
            listen_host: DEFAULT_LISTEN_HOST,
            listen_port: None,
            buffered: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_delay: Duration::ZERO,
            write_delay: Duration::ZERO,
        }
    }

    pub fn with_listen_host(mut self, host: IpAddr) -> Self {
        self.listen_host = host;
        self
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    pub fn with_buffered(mut self, buffered: bool) -> Self {
        self.buffered = buffered;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_delay(mut self, read: Duration, write: Duration) -> Self {
        self.read_delay = read;
        self.write_delay = write;
        self
    }
}

/// Statistics for a proxy.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total client connections accepted.
    pub sessions_accepted: AtomicU64,
    /// Total sessions that completed their close sequence.
    pub sessions_closed: AtomicU64,
    /// Upstream connection failures.
    pub upstream_failures: AtomicU64,
    /// Bytes read from clients.
    pub bytes_read: AtomicU64,
    /// Bytes read from the target.
    pub bytes_written: AtomicU64,
}

impl ProxyStats {
    pub(crate) fn record_bytes(&self, direction: Direction, n: u64) {
        let counter = match direction {
            Direction::Read => &self.bytes_read,
            Direction::Write => &self.bytes_written,
        };
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Outcomes of closing every session, one per session.
pub type DisconnectHandle = JoinHandle<Vec<std::result::Result<(), JoinError>>>;

/// Defaults and active sessions. Changed together under one lock so a
/// session is either seeded with a new default or receives it live.
struct ProxyState {
    delays: PerDirection<Duration>,
    processors: PerDirection<Processor>,
    sessions: HashMap<SessionId, Arc<Session>>,
}

struct ProxyShared {
    target_host: String,
    target_port: u16,
    buffered: bool,
    chunk_size: usize,
    state: Mutex<ProxyState>,
    next_session_id: AtomicU64,
    stats: Arc<ProxyStats>,
}

impl ProxyShared {
    fn state(&self) -> MutexGuard<'_, ProxyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a session seeded with the current defaults and register it.
    fn register_session(self: &Arc<Self>, client_addr: SocketAddr) -> Arc<Session> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        let registry: Weak<ProxyShared> = Arc::downgrade(self);
        let on_close: CloseHook = Box::new(move |id| {
            if let Some(shared) = registry.upgrade() {
                shared.remove_session(id);
            }
        });

        let mut state = self.state();
        let settings = SessionSettings {
            delays: state.delays,
            processors: state.processors.clone(),
            buffered: self.buffered,
            chunk_size: self.chunk_size,
        };
        let session = Session::new(id, client_addr, settings, Arc::clone(&self.stats), on_close);
        state.sessions.insert(id, Arc::clone(&session));

        self.stats.sessions_accepted.fetch_add(1, Ordering::Relaxed);
        session
    }

    fn remove_session(&self, id: SessionId) {
        let mut state = self.state();
        state.sessions.remove(&id);
        debug!(session_id = id, active = state.sessions.len(), "Session removed");
    }

    async fn connect_session(self: Arc<Self>, session: Arc<Session>, client: TcpStream) {
        if let Err(e) = session
            .connect(client, &self.target_host, self.target_port)
            .await
        {
            self.record_connect_error(&session, &e);
            session.close().await;
        }
    }

    /// Log a failed session start. Only unreachable targets count as
    /// upstream failures.
    fn record_connect_error(&self, session: &Session, err: &ProxyError) {
        if session.is_cancelled() {
            debug!(session = %session, error = %err, "Session closed before upstream connected");
        } else if err.is_connect() {
            self.stats.upstream_failures.fetch_add(1, Ordering::Relaxed);
            warn!(session = %session, error = %err, "Upstream connection failed, dropping client");
        } else {
            warn!(session = %session, error = %err, "Session setup failed, dropping client");
        }
    }
}

async fn accept_loop(
    shared: Arc<ProxyShared>,
    listener: TcpListener,
    shutdown: CancellationToken,
    ready: oneshot::Sender<()>,
) {
    let _ = ready.send(());

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let session = shared.register_session(peer_addr);
                    debug!(session = %session, "Accepted client");

                    let span = tracing::info_span!("session", id = session.id(), peer = %peer_addr);
                    tokio::spawn(
                        Arc::clone(&shared)
                            .connect_session(session, stream)
                            .instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
            }
        }
    }

    debug!("Listener stopped");
}

struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ListenerSlot {
    port: Option<u16>,
    handle: Option<ListenerHandle>,
}

/// A man-in-the-middle TCP proxy in front of one target.
///
/// Dropping the proxy cancels its listener and every session without waiting;
/// use [`TcpProxy::close`] for an orderly shutdown.
pub struct TcpProxy {
    shared: Arc<ProxyShared>,
    listen_host: IpAddr,
    listener: tokio::sync::Mutex<ListenerSlot>,
    bound: ArcSwapOption<SocketAddr>,
}

impl TcpProxy {
    /// Create a proxy. Nothing is bound until [`TcpProxy::start`].
    pub fn new(config: ProxyConfig) -> Self {
        let ProxyConfig {
            target_host,
            target_port,
            listen_host,
            listen_port,
            buffered,
            chunk_size,
            read_delay,
            write_delay,
        } = config;

        Self {
            shared: Arc::new(ProxyShared {
                target_host,
                target_port,
                buffered,
                chunk_size,
                state: Mutex::new(ProxyState {
                    delays: PerDirection::new(read_delay, write_delay),
                    processors: PerDirection::default(),
                    sessions: HashMap::new(),
                }),
                next_session_id: AtomicU64::new(1),
                stats: Arc::new(ProxyStats::default()),
            }),
            listen_host,
            listener: tokio::sync::Mutex::new(ListenerSlot {
                port: listen_port,
                handle: None,
            }),
            bound: ArcSwapOption::empty(),
        }
    }

    /// Create and start a proxy, bounded by [`DEFAULT_TIMEOUT`].
    pub async fn open(config: ProxyConfig) -> Result<Self> {
        let proxy = Self::new(config);
        proxy.start(Some(DEFAULT_TIMEOUT)).await?;
        Ok(proxy)
    }

    /// Bind the listening socket and start accepting clients.
    ///
    /// Returns the bound address. Does nothing if already started. A proxy
    /// restarted after [`TcpProxy::close`] listens on the same port again.
    pub async fn start(&self, timeout: Option<Duration>) -> Result<SocketAddr> {
        let mut slot = self.listener.lock().await;
        if let Some(handle) = &slot.handle {
            return Ok(handle.local_addr);
        }

        let bind_addr = SocketAddr::new(self.listen_host, slot.port.unwrap_or(0));
        let handle = with_timeout("start", timeout, self.spawn_listener(bind_addr)).await?;
        let local_addr = handle.local_addr;

        slot.port = Some(local_addr.port());
        slot.handle = Some(handle);
        self.bound.store(Some(Arc::new(local_addr)));

        info!(
            listen_addr = %local_addr,
            upstream = %format_args!("{}:{}", self.shared.target_host, self.shared.target_port),
            "Proxy started"
        );
        Ok(local_addr)
    }

    async fn spawn_listener(&self, bind_addr: SocketAddr) -> Result<ListenerHandle> {
        let listener = bind_listener(bind_addr).map_err(|source| ProxyError::Bind {
            addr: bind_addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        // Stops the accept loop again if start is abandoned before it returns.
        let abandon = shutdown.clone().drop_guard();

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(
            accept_loop(
                Arc::clone(&self.shared),
                listener,
                shutdown.clone(),
                ready_tx,
            )
            .instrument(tracing::info_span!("proxy", listen = %local_addr)),
        );

        if ready_rx.await.is_err() {
            return Err(ProxyError::Io(std::io::Error::other(
                "accept loop exited before becoming ready",
            )));
        }

        abandon.disarm();
        Ok(ListenerHandle {
            local_addr,
            shutdown,
            task,
        })
    }

    /// Close every session, then stop the listener and release its socket.
    ///
    /// Safe to call repeatedly.
    pub async fn close(&self, timeout: Option<Duration>) -> Result<()> {
        with_timeout("close", timeout, async {
            log_disconnect_failures(self.disconnect_all().await);

            let handle = self.listener.lock().await.handle.take();
            if let Some(handle) = handle {
                self.bound.store(None);
                handle.shutdown.cancel();
                if let Err(e) = handle.task.await {
                    error!(error = %e, "Listener task failed");
                }
                info!(listen_addr = %handle.local_addr, "Proxy closed");
            }

            // Clients accepted while the first sweep ran.
            if self.session_count() > 0 {
                log_disconnect_failures(self.disconnect_all().await);
            }
            Ok(())
        })
        .await
    }

    /// Close every active session concurrently.
    ///
    /// Closing continues even if the returned handle is dropped. A failure
    /// closing one session does not stop the others.
    pub fn disconnect_all(&self) -> DisconnectHandle {
        let sessions = self.sessions();
        debug!(count = sessions.len(), proxy = %self, "Disconnecting all sessions");

        tokio::spawn(async move {
            let closing = sessions
                .into_iter()
                .map(|session| tokio::spawn(async move { session.close().await }));
            join_all(closing).await
        })
    }

    /// Open a client connection through the proxy.
    pub async fn create_client(&self) -> Result<TcpStream> {
        let addr = self.local_addr().ok_or(ProxyError::NotStarted)?;
        debug!(proxy = %self, "Creating client");
        TcpStream::connect(addr)
            .await
            .map_err(|source| ProxyError::Connect {
                addr: addr.to_string(),
                source,
            })
    }

    /// Set the default delays and apply them to every active session.
    pub fn set_delay(&self, read: Duration, write: Duration) {
        debug!(read = ?read, write = ?write, "Setting delay");

        let mut state = self.shared.state();
        state.delays = PerDirection::new(read, write);
        for session in state.sessions.values() {
            debug!(session = %session, read = ?read, write = ?write, "Applying delay");
            session.apply_delays(&state.delays);
        }
    }

    /// Like [`TcpProxy::set_delay`], in seconds. Nothing changes unless both
    /// values are valid.
    pub fn set_delay_secs(&self, read: f64, write: f64) -> Result<()> {
        let read = duration_from_secs(read)?;
        let write = duration_from_secs(write)?;
        self.set_delay(read, write);
        Ok(())
    }

    /// Set the default processors and apply them to every active session
    /// without a per-session override. `None` means pass-through.
    pub fn set_content_processors(&self, read: Option<Processor>, write: Option<Processor>) {
        let processors = PerDirection::new(Processor::from(read), Processor::from(write));
        debug!(
            proxy = %self,
            read = ?processors.read,
            write = ?processors.write,
            "Setting content processors"
        );

        let mut state = self.shared.state();
        for session in state.sessions.values() {
            session.apply_processors(&processors);
        }
        state.processors = processors;
    }

    /// Raise the delays until the returned guard is dropped.
    ///
    /// The delays in effect before the call are restored on drop, including
    /// when unwinding.
    pub fn slowdown(&self, read: Duration, write: Duration) -> SlowdownGuard<'_> {
        let previous = self.shared.state().delays;
        self.set_delay(read, write);
        SlowdownGuard {
            proxy: self,
            previous,
        }
    }

    /// Current default client to target delay.
    pub fn read_delay(&self) -> Duration {
        self.shared.state().delays.read
    }

    /// Current default target to client delay.
    pub fn write_delay(&self) -> Duration {
        self.shared.state().delays.write
    }

    /// Current default processor for `direction`.
    pub fn processor(&self, direction: Direction) -> Processor {
        self.shared.state().processors[direction].clone()
    }

    /// Snapshot of the active sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.shared.state().sessions.values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.shared.state().sessions.len()
    }

    /// Address the listener is bound to, while started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.load_full().map(|addr| *addr)
    }

    pub fn is_started(&self) -> bool {
        self.bound.load().is_some()
    }

    pub fn target(&self) -> (&str, u16) {
        (&self.shared.target_host, self.shared.target_port)
    }

    pub fn is_buffered(&self) -> bool {
        self.shared.buffered
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.shared.stats
    }
}

impl fmt::Display for TcpProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local_addr() {
            Some(addr) => write!(f, "tcp://{}", addr)?,
            None => write!(f, "tcp://{}:-", self.listen_host)?,
        }
        write!(
            f,
            " => tcp://{}:{}",
            self.shared.target_host, self.shared.target_port
        )
    }
}

impl fmt::Debug for TcpProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpProxy")
            .field("listen_addr", &self.local_addr())
            .field("target_host", &self.shared.target_host)
            .field("target_port", &self.shared.target_port)
            .field("buffered", &self.shared.buffered)
            .field("sessions", &self.session_count())
            .finish()
    }
}

impl Drop for TcpProxy {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().handle.take() {
            handle.shutdown.cancel();
        }
        for session in self.shared.state().sessions.values() {
            session.abort();
        }
    }
}

/// Restores the previous proxy delays when dropped.
#[must_use = "the slowdown ends when the guard is dropped"]
pub struct SlowdownGuard<'a> {
    proxy: &'a TcpProxy,
    previous: PerDirection<Duration>,
}

impl Drop for SlowdownGuard<'_> {
    fn drop(&mut self) {
        self.proxy.set_delay(self.previous.read, self.previous.write);
    }
}

async fn with_timeout<T, F>(operation: &'static str, timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| ProxyError::Timeout { operation, timeout })?,
        None => fut.await,
    }
}

fn log_disconnect_failures(
    outcome: std::result::Result<Vec<std::result::Result<(), JoinError>>, JoinError>,
) {
    match outcome {
        Ok(results) => {
            for e in results.into_iter().filter_map(|r| r.err()) {
                warn!(error = %e, "Session close failed");
            }
        }
        Err(e) => warn!(error = %e, "Disconnect task failed"),
    }
}
