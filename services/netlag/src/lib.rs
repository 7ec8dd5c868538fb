pub mod error;
pub mod proxy;

pub use error::{ProxyError, Result};
pub use proxy::{
    Delay, DelayOutcome, Direction, DisconnectHandle, PerDirection, Processor, ProxyConfig,
    ProxyStats, Session, SessionId, SlowdownGuard, TcpProxy, DEFAULT_CHUNK_SIZE,
    DEFAULT_LISTEN_HOST, DEFAULT_TIMEOUT,
};
