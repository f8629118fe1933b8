//! Isolation backends: where a sandbox's plugin code actually runs.

use super::{ContentPolicy, SandboxKind};
use crate::error::HostResult;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Both directions of a launched isolate's message channel.
pub struct Conduit {
    /// Frames from the plugin.
    pub reader: BoxedReader,
    /// Frames to the plugin.
    pub writer: BoxedWriter,
}

/// What a sandbox asks its backend for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolateRequest {
    pub plugin_id: String,
    pub kind: SandboxKind,
    /// Set for UI-capable sandboxes only.
    pub policy: Option<ContentPolicy>,
}

/// Allocates isolated execution contexts.
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reserves an isolate. Fails with `SandboxCreation` when the backend
    /// is out of capacity or cannot set one up.
    fn allocate(&self, request: &IsolateRequest) -> HostResult<Box<dyn Isolate>>;
}

/// One allocated execution context.
pub trait Isolate: Send {
    /// Starts `entry_point` inside the isolate and hands back its channel.
    fn launch(&mut self, entry_point: &str) -> HostResult<Conduit>;

    /// Tears the isolate down immediately. Must not block.
    fn terminate(&mut self);
}

/// Caps the number of live isolates a backend hands out.
#[derive(Debug, Clone)]
pub(crate) struct InstanceLimiter {
    live: Arc<AtomicUsize>,
    max: usize,
}

impl InstanceLimiter {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            live: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    pub(crate) fn acquire(&self) -> Option<InstanceSlot> {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max).then_some(n + 1)
            })
            .ok()
            .map(|_| InstanceSlot {
                live: Arc::clone(&self.live),
            })
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn max(&self) -> usize {
        self.max
    }
}

/// Held by an isolate for its lifetime; releases capacity on drop.
#[derive(Debug)]
pub(crate) struct InstanceSlot {
    live: Arc<AtomicUsize>,
}

impl Drop for InstanceSlot {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_caps_and_releases() {
        let limiter = InstanceLimiter::new(2);
        let a = limiter.acquire().unwrap();
        let _b = limiter.acquire().unwrap();
        assert!(limiter.acquire().is_none());
        assert_eq!(limiter.live(), 2);

        drop(a);
        assert_eq!(limiter.live(), 1);
        assert!(limiter.acquire().is_some());
    }
}
