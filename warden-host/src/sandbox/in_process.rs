//! In-process isolation: guests registered by entry-point name run as
//! tokio tasks connected to the host through an in-memory pipe.
//!
//! Nothing stops a guest from touching host memory, so this backend is for
//! trusted first-party plugins and for tests.

use super::isolate::{Conduit, InstanceLimiter, InstanceSlot, Isolate, IsolateRequest, IsolationBackend};
use super::{ContentPolicy, SandboxKind};
use crate::error::{HostResult, PluginHostError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

const PIPE_CAPACITY: usize = 64 * 1024;
const DEFAULT_MAX_INSTANCES: usize = 256;

/// The guest's end of the channel plus what it was launched with.
pub struct GuestIo {
    /// Frames from the host.
    pub reader: ReadHalf<DuplexStream>,
    /// Frames to the host.
    pub writer: WriteHalf<DuplexStream>,
    pub plugin_id: String,
    pub kind: SandboxKind,
    pub policy: Option<ContentPolicy>,
}

type GuestFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type GuestFn = Arc<dyn Fn(GuestIo) -> GuestFuture + Send + Sync>;
type GuestMap = Arc<RwLock<HashMap<String, GuestFn>>>;

pub struct InProcessBackend {
    guests: GuestMap,
    limiter: InstanceLimiter,
    allocations: AtomicUsize,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self::with_max_instances(DEFAULT_MAX_INSTANCES)
    }

    pub fn with_max_instances(max_instances: usize) -> Self {
        Self {
            guests: Arc::new(RwLock::new(HashMap::new())),
            limiter: InstanceLimiter::new(max_instances),
            allocations: AtomicUsize::new(0),
        }
    }

    /// Registers the guest started when a sandbox loads `entry_point`.
    pub fn register<F, Fut>(&self, entry_point: &str, guest: F)
    where
        F: Fn(GuestIo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let guest: GuestFn = Arc::new(move |io| Box::pin(guest(io)));
        self.guests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry_point.to_string(), guest);
    }

    /// Isolates allocated since creation, including released ones.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    /// Isolates currently allocated.
    pub fn live_instances(&self) -> usize {
        self.limiter.live()
    }
}

impl Default for InProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl IsolationBackend for InProcessBackend {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn allocate(&self, request: &IsolateRequest) -> HostResult<Box<dyn Isolate>> {
        let slot = self
            .limiter
            .acquire()
            .ok_or_else(|| PluginHostError::SandboxCreation {
                plugin_id: request.plugin_id.clone(),
                reason: format!("instance limit of {} reached", self.limiter.max()),
            })?;
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TaskIsolate {
            request: request.clone(),
            guests: Arc::clone(&self.guests),
            task: None,
            _slot: slot,
        }))
    }
}

struct TaskIsolate {
    request: IsolateRequest,
    guests: GuestMap,
    task: Option<JoinHandle<()>>,
    _slot: InstanceSlot,
}

impl Isolate for TaskIsolate {
    fn launch(&mut self, entry_point: &str) -> HostResult<Conduit> {
        if self.task.is_some() {
            return Err(PluginHostError::SandboxCreation {
                plugin_id: self.request.plugin_id.clone(),
                reason: "guest already launched".into(),
            });
        }
        let guest = self
            .guests
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entry_point)
            .cloned()
            .ok_or_else(|| PluginHostError::SandboxCreation {
                plugin_id: self.request.plugin_id.clone(),
                reason: format!("no guest registered for '{entry_point}'"),
            })?;

        let (host_end, guest_end) = tokio::io::duplex(PIPE_CAPACITY);
        let (host_reader, host_writer) = tokio::io::split(host_end);
        let (guest_reader, guest_writer) = tokio::io::split(guest_end);

        let io = GuestIo {
            reader: guest_reader,
            writer: guest_writer,
            plugin_id: self.request.plugin_id.clone(),
            kind: self.request.kind,
            policy: self.request.policy.clone(),
        };
        self.task = Some(tokio::spawn(guest(io)));

        Ok(Conduit {
            reader: Box::new(host_reader),
            writer: Box::new(host_writer),
        })
    }

    fn terminate(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TaskIsolate {
    fn drop(&mut self) {
        self.terminate();
    }
}
