//! Listening socket preparation and free-port allocation.
//!
//! Socket option support differs per platform. Port reservations use the
//! option set chosen once by [`socket_prep`]. Proxy listeners only ever set
//! SO_REUSEADDR, so binding a port another listener holds fails instead of
//! splitting its connections.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::{TcpListener, TcpSocket};
use tracing::debug;

/// Listen backlog for proxy sockets.
pub const LISTEN_BACKLOG: u32 = 1024;

/// Socket options applied before binding a listening socket.
pub trait ListenSocketPrep: fmt::Debug + Send + Sync {
    /// Apply options to an unbound socket.
    fn prepare(&self, socket: &TcpSocket) -> io::Result<()>;

    /// Whether a reservation socket prepared by this implementation can stay
    /// bound while a proxy listener binds the same port.
    fn shares_port(&self) -> bool;
}

/// SO_REUSEADDR plus SO_REUSEPORT.
#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReuseAddrPort;

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
impl ListenSocketPrep for ReuseAddrPort {
    fn prepare(&self, socket: &TcpSocket) -> io::Result<()> {
        socket.set_reuseaddr(true)?;
        socket.set_reuseport(true)?;
        Ok(())
    }

    fn shares_port(&self) -> bool {
        // Linux lets SO_REUSEADDR sockets share a port while none of them listens.
        cfg!(any(target_os = "linux", target_os = "android"))
    }
}

/// SO_REUSEADDR only.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReuseAddrOnly;

impl ListenSocketPrep for ReuseAddrOnly {
    fn prepare(&self, socket: &TcpSocket) -> io::Result<()> {
        socket.set_reuseaddr(true)
    }

    fn shares_port(&self) -> bool {
        false
    }
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
static PLATFORM_PREP: ReuseAddrPort = ReuseAddrPort;

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
static PLATFORM_PREP: ReuseAddrOnly = ReuseAddrOnly;

static LISTENER_PREP: ReuseAddrOnly = ReuseAddrOnly;

/// The socket preparation used for port reservations on this platform.
pub fn socket_prep() -> &'static dyn ListenSocketPrep {
    &PLATFORM_PREP
}

/// The socket preparation used for proxy listeners.
pub fn listener_prep() -> &'static dyn ListenSocketPrep {
    &LISTENER_PREP
}

fn new_socket(addr: &SocketAddr) -> io::Result<TcpSocket> {
    if addr.is_ipv6() {
        TcpSocket::new_v6()
    } else {
        TcpSocket::new_v4()
    }
}

/// Bind a listening socket.
///
/// Fails with `AddrInUse` if another socket already listens on `addr`.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = new_socket(&addr)?;
    listener_prep().prepare(&socket)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// A port held for later use by a listener.
///
/// Where the platform allows it the reservation keeps its socket bound until
/// dropped, so no other process can grab the port in between. Elsewhere the
/// port is only probed and released immediately.
#[derive(Debug)]
pub struct PortReservation {
    addr: SocketAddr,
    _socket: Option<TcpSocket>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Reserve a free TCP port on `host`.
pub fn reserve_port(host: IpAddr) -> io::Result<PortReservation> {
    let prep = socket_prep();
    let bind_addr = SocketAddr::new(host, 0);
    let socket = new_socket(&bind_addr)?;
    prep.prepare(&socket)?;
    socket.bind(bind_addr)?;
    let addr = socket.local_addr()?;

    debug!(addr = %addr, shared = prep.shares_port(), "Reserved port");

    Ok(PortReservation {
        addr,
        _socket: prep.shares_port().then_some(socket),
    })
}

/// Find a free TCP port on `host`.
pub fn unused_port(host: IpAddr) -> io::Result<u16> {
    let socket = std::net::TcpListener::bind(SocketAddr::new(host, 0))?;
    Ok(socket.local_addr()?.port())
}

/// The loopback address available on this host, preferring IPv4.
pub fn localhost() -> io::Result<IpAddr> {
    for candidate in [
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(Ipv6Addr::LOCALHOST),
    ] {
        if std::net::TcpListener::bind(SocketAddr::new(candidate, 0)).is_ok() {
            return Ok(candidate);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        "no loopback address available",
    ))
}
