//! Per-direction chunk transforms.
//!
//! A [`Processor`] maps each forwarded chunk to the chunk written onward.
//! It is always awaited, whether or not the wrapped function suspends.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use futures_util::future::{self, BoxFuture, FutureExt};

type ProcessFn = dyn Fn(Bytes) -> BoxFuture<'static, Bytes> + Send + Sync;

/// Cloneable handle to a chunk transform.
#[derive(Clone)]
pub struct Processor {
    inner: Option<Arc<ProcessFn>>,
}

impl Processor {
    /// The pass-through processor.
    pub fn identity() -> Self {
        Self { inner: None }
    }

    /// Wrap an asynchronous transform.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Bytes> + Send + 'static,
    {
        Self {
            inner: Some(Arc::new(move |chunk: Bytes| f(chunk).boxed())),
        }
    }

    /// Wrap a synchronous transform.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Bytes) -> Bytes + Send + Sync + 'static,
    {
        Self {
            inner: Some(Arc::new(move |chunk: Bytes| future::ready(f(chunk)).boxed())),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.inner.is_none()
    }

    /// Transform one chunk.
    pub fn process(&self, chunk: Bytes) -> BoxFuture<'static, Bytes> {
        match &self.inner {
            Some(f) => f(chunk),
            None => future::ready(chunk).boxed(),
        }
    }

    /// Whether both handles wrap the same transform.
    pub fn ptr_eq(&self, other: &Processor) -> bool {
        match (&self.inner, &other.inner) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Default for Processor {
    fn default() -> Self {
        Self::identity()
    }
}

impl From<Option<Processor>> for Processor {
    fn from(processor: Option<Processor>) -> Self {
        processor.unwrap_or_default()
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            None => f.write_str("Processor(identity)"),
            Some(_) => f.write_str("Processor(custom)"),
        }
    }
}

#[derive(Debug)]
struct SlotState {
    processor: Processor,
    overridden: bool,
}

/// A session's processor for one direction.
///
/// Holds either the proxy default (inherited) or an explicit per-session
/// override. Proxy-level updates only replace inherited processors.
#[derive(Debug)]
pub struct ProcessorSlot {
    state: ArcSwap<SlotState>,
}

impl ProcessorSlot {
    /// Create a slot inheriting the given default.
    pub fn inherited(processor: Processor) -> Self {
        Self {
            state: ArcSwap::from_pointee(SlotState {
                processor,
                overridden: false,
            }),
        }
    }

    /// Current processor.
    pub fn get(&self) -> Processor {
        self.state.load().processor.clone()
    }

    pub fn is_overridden(&self) -> bool {
        self.state.load().overridden
    }

    /// Install a per-session override.
    pub fn set_override(&self, processor: Processor) {
        self.state.store(Arc::new(SlotState {
            processor,
            overridden: true,
        }));
    }

    /// Apply a proxy-level default. Returns false if an override won.
    pub fn apply_default(&self, processor: &Processor) -> bool {
        let previous = self.state.rcu(|current| {
            if current.overridden {
                Arc::clone(current)
            } else {
                Arc::new(SlotState {
                    processor: processor.clone(),
                    overridden: false,
                })
            }
        });
        !previous.overridden
    }
}
