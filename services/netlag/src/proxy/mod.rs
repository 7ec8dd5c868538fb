//! Man-in-the-middle TCP proxy for simulating adverse network conditions.
//!
//! This module provides:
//! - A listener that pairs every client with its own upstream connection
//! - Per-direction latency injection with live reconfiguration
//! - Per-direction chunk rewriting hooks
//! - Coordinated teardown of all in-flight sessions
//!
//! ## Architecture
//!
//! ```text
//! Client -> TcpProxy -> Session --read--> Delay -> Processor --> Target
//!                              <-write--- Processor <- Delay <--
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use netlag::{Processor, ProxyConfig, TcpProxy};
//!
//! let proxy = TcpProxy::open(ProxyConfig::new("127.0.0.1", 5432)).await?;
//! proxy.set_delay(Duration::from_millis(100), Duration::ZERO);
//! proxy.set_content_processors(None, Some(Processor::from_fn(|chunk| chunk)));
//!
//! let client = proxy.create_client().await?;
//! // ...
//! proxy.close(Some(Duration::from_secs(5))).await?;
//! ```

mod delay;
mod direction;
mod listener;
mod processor;
mod session;
pub mod socket;

pub use delay::{duration_from_secs, Delay, DelayOutcome};
pub use direction::{Direction, PerDirection};
pub use listener::{
    DisconnectHandle, ProxyConfig, ProxyStats, SlowdownGuard, TcpProxy, DEFAULT_CHUNK_SIZE,
    DEFAULT_LISTEN_HOST, DEFAULT_TIMEOUT,
};
pub use processor::{Processor, ProcessorSlot};
pub use session::{Session, SessionId};
