//! The cross-context message channel shared by both sandbox variants.
//!
//! Outbound calls register a pending entry keyed by correlation id. An
//! entry leaves the table exactly once: on its response, on timeout, when
//! the caller stops waiting, or when the channel closes. The call deadline
//! covers writing the frame as well as waiting for the answer; a frame cut
//! off mid-write leaves the channel unusable, so it is abandoned. A reader
//! task dispatches everything the plugin sends.

use super::isolate::{BoxedReader, BoxedWriter, Conduit};
use crate::boundary::ErrorBoundary;
use crate::bridge::PluginApi;
use crate::error::{HostResult, PluginHostError};
use crate::events::{EventBus, HostEvent};
use crate::notice::{Notice, NoticeSender};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use warden_protocol::{CallId, Envelope, read_envelope, response_outcome, write_envelope};

type SharedWriter = Arc<tokio::sync::Mutex<BoxedWriter>>;

const DEFAULT_INBOUND_LIMIT: usize = 32;

/// Host-side collaborators a sandbox routes inbound traffic to.
#[derive(Clone)]
pub struct InboundRouter {
    api: PluginApi,
    boundary: Arc<ErrorBoundary>,
    events: EventBus,
    notices: NoticeSender,
    /// Bounds the plugin calls being answered at once.
    inbound: Arc<Semaphore>,
}

impl InboundRouter {
    pub fn new(
        api: PluginApi,
        boundary: Arc<ErrorBoundary>,
        events: EventBus,
        notices: NoticeSender,
    ) -> Self {
        Self {
            api,
            boundary,
            events,
            notices,
            inbound: Arc::new(Semaphore::new(DEFAULT_INBOUND_LIMIT)),
        }
    }

    /// Caps how many plugin calls are answered concurrently. The reader
    /// stops taking frames from the plugin while the cap is reached.
    pub fn with_call_limit(mut self, limit: usize) -> Self {
        self.inbound = Arc::new(Semaphore::new(limit.max(1)));
        self
    }
}

struct PendingCall {
    method: String,
    tx: oneshot::Sender<HostResult<Value>>,
}

pub(crate) struct PendingCalls {
    plugin_id: Arc<str>,
    entries: Mutex<HashMap<CallId, PendingCall>>,
}

impl PendingCalls {
    fn new(plugin_id: Arc<str>) -> Self {
        Self {
            plugin_id,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<CallId, PendingCall>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: CallId, method: &str) -> oneshot::Receiver<HostResult<Value>> {
        let (tx, rx) = oneshot::channel();
        self.entries().insert(
            id,
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );
        rx
    }

    fn remove(&self, id: &CallId) -> bool {
        self.entries().remove(id).is_some()
    }

    /// Settles the entry for `id`. Returns `false` for unknown or already
    /// settled ids.
    fn resolve(&self, id: &CallId, outcome: Result<Value, String>) -> bool {
        let Some(pending) = self.entries().remove(id) else {
            return false;
        };
        let result = outcome.map_err(|message| PluginHostError::PluginCallFailed {
            plugin_id: self.plugin_id.to_string(),
            method: pending.method,
            message,
        });
        // The caller may already have stopped waiting
        let _ = pending.tx.send(result);
        true
    }

    /// Rejects every entry with `SandboxDestroyed`.
    fn reject_all(&self) -> usize {
        let drained: Vec<PendingCall> = self.entries().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.tx.send(Err(PluginHostError::SandboxDestroyed {
                plugin_id: self.plugin_id.to_string(),
            }));
        }
        count
    }

    fn len(&self) -> usize {
        self.entries().len()
    }
}

/// Removes a pending entry when its caller stops waiting.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: CallId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Abandons the channel if dropped before the frame is fully written.
struct FrameInFlight<'a> {
    channel: &'a Channel,
    method: &'a str,
    finished: bool,
}

impl FrameInFlight<'_> {
    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for FrameInFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.channel.abandon(format!(
                "plugin stopped reading its channel during '{}'",
                self.method
            ));
        }
    }
}

pub(crate) struct Channel {
    plugin_id: Arc<str>,
    instance: u64,
    writer: SharedWriter,
    pending: Arc<PendingCalls>,
    closed: Arc<AtomicBool>,
    notices: NoticeSender,
    reader: JoinHandle<()>,
}

impl Channel {
    /// Starts the reader task. The returned receiver completes on the
    /// plugin's first `ready`, or errors if the channel ends before it.
    pub(crate) fn open(
        plugin_id: &str,
        instance: u64,
        conduit: Conduit,
        router: InboundRouter,
    ) -> (Self, oneshot::Receiver<()>) {
        let plugin_id: Arc<str> = Arc::from(plugin_id);
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(conduit.writer));
        let pending = Arc::new(PendingCalls::new(Arc::clone(&plugin_id)));
        let closed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let notices = router.notices.clone();

        let reader = Reader {
            plugin_id: Arc::clone(&plugin_id),
            instance,
            router,
            writer: Arc::clone(&writer),
            pending: Arc::clone(&pending),
            closed: Arc::clone(&closed),
            ready: Some(ready_tx),
        };
        let reader = tokio::spawn(reader.run(conduit.reader));

        let channel = Self {
            plugin_id,
            instance,
            writer,
            pending,
            closed,
            notices,
            reader,
        };
        (channel, ready_rx)
    }

    fn destroyed(&self) -> PluginHostError {
        PluginHostError::SandboxDestroyed {
            plugin_id: self.plugin_id.to_string(),
        }
    }

    /// Sends a call and waits up to `timeout` for its response. The
    /// deadline includes time spent queued behind other writers.
    pub(crate) async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> HostResult<Value> {
        if self.is_closed() {
            return Err(self.destroyed());
        }

        let (id, envelope) = Envelope::call(method, args);
        let rx = self.pending.register(id.clone(), method);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };
        // Closed between the check and the registration
        if self.is_closed() {
            return Err(self.destroyed());
        }

        let exchange = async {
            {
                let mut writer = self.writer.lock().await;
                if self.is_closed() {
                    return Err(self.destroyed());
                }
                let frame = FrameInFlight {
                    channel: self,
                    method,
                    finished: false,
                };
                let written = write_envelope(&mut *writer, &envelope).await;
                frame.finish();
                if let Err(e) = written {
                    if self.is_closed() {
                        return Err(self.destroyed());
                    }
                    return Err(PluginHostError::Channel {
                        plugin_id: self.plugin_id.to_string(),
                        message: e.to_string(),
                    });
                }
            }
            debug!(plugin_id = %self.plugin_id, method = %method, call_id = %id, "call sent");
            rx.await.unwrap_or_else(|_| Err(self.destroyed()))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                self.pending.remove(&id);
                Err(PluginHostError::MessageTimeout {
                    plugin_id: self.plugin_id.to_string(),
                    method: method.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops the reader and rejects every pending call. Idempotent.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reader.abort();
        let rejected = self.pending.reject_all();
        if rejected > 0 {
            debug!(plugin_id = %self.plugin_id, rejected, "rejected pending calls on close");
        }
    }

    /// Closes the channel from the host side and reports the sandbox as
    /// terminated, since the plugin can no longer be talked to.
    fn abandon(&self, reason: String) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reader.abort();
        self.pending.reject_all();
        warn!(plugin_id = %self.plugin_id, reason = %reason, "abandoning plugin channel");
        let _ = self.notices.send(Notice::Terminated {
            plugin_id: self.plugin_id.to_string(),
            instance: self.instance,
            reason,
        });
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

struct Reader {
    plugin_id: Arc<str>,
    instance: u64,
    router: InboundRouter,
    writer: SharedWriter,
    pending: Arc<PendingCalls>,
    closed: Arc<AtomicBool>,
    ready: Option<oneshot::Sender<()>>,
}

impl Reader {
    async fn run(mut self, mut reader: BoxedReader) {
        let reason = loop {
            match read_envelope(&mut reader).await {
                Ok(envelope) => self.handle(envelope).await,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break "channel closed by plugin".to_string();
                }
                Err(e) => break format!("unreadable channel: {e}"),
            }
        };

        let host_closed = self.closed.swap(true, Ordering::SeqCst);
        self.pending.reject_all();
        if !host_closed {
            warn!(plugin_id = %self.plugin_id, reason = %reason, "plugin sandbox terminated");
            let _ = self.router.notices.send(Notice::Terminated {
                plugin_id: self.plugin_id.to_string(),
                instance: self.instance,
                reason,
            });
        }
    }

    async fn handle(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Ready => match self.ready.take() {
                Some(tx) => {
                    let _ = tx.send(());
                }
                None => debug!(plugin_id = %self.plugin_id, "ignoring repeated ready"),
            },
            Envelope::Response { id, result, error } => {
                if !self.pending.resolve(&id, response_outcome(result, error)) {
                    debug!(plugin_id = %self.plugin_id, call_id = %id, "ignoring response for unknown call");
                }
            }
            Envelope::Event { event, data } => {
                if event == "error" {
                    let message = match &data {
                        Value::String(s) => s.clone(),
                        other => other
                            .get("message")
                            .and_then(Value::as_str)
                            .map_or_else(|| other.to_string(), str::to_string),
                    };
                    self.router
                        .boundary
                        .record_failure(&self.plugin_id, None, "PluginReported", &message)
                        .await;
                }
                self.router
                    .events
                    .emit(HostEvent::plugin(&self.plugin_id, &event, data));
            }
            Envelope::Call { id, method, args } => self.dispatch(id, method, args).await,
        }
    }

    /// Answers a plugin call on its own task so slow capabilities do not
    /// stall the channel. Waits for a slot once the call limit is reached.
    async fn dispatch(&self, id: CallId, method: String, args: Vec<Value>) {
        let Ok(permit) = Arc::clone(&self.router.inbound).acquire_owned().await else {
            return;
        };
        let plugin_id = Arc::clone(&self.plugin_id);
        let api = self.router.api.clone();
        let boundary = Arc::clone(&self.router.boundary);
        let writer = Arc::clone(&self.writer);
        let closed = Arc::clone(&self.closed);

        tokio::spawn(async move {
            let _permit = permit;
            let outcome = boundary
                .wrap(&plugin_id, &method, api.call(&method, args))
                .await
                .map_err(|e| e.to_string());
            let reply = Envelope::reply(id, outcome);
            let mut writer = writer.lock().await;
            if closed.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = write_envelope(&mut *writer, &reply).await {
                debug!(plugin_id = %plugin_id, method = %method, error = %e, "failed to deliver response");
            }
        });
    }
}
