use crate::SdkError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;
use warden_protocol::{CallId, Envelope, write_envelope};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Waiter = oneshot::Sender<Result<Value, String>>;

/// The plugin's handle on the host: capability calls and events.
///
/// Cheap to clone. Every clone shares the same channel.
#[derive(Clone)]
pub struct HostHandle {
    inner: Arc<Inner>,
}

struct Inner {
    writer: tokio::sync::Mutex<Writer>,
    pending: Mutex<HashMap<CallId, Waiter>>,
    closed: AtomicBool,
}

impl HostHandle {
    pub(crate) fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                writer: tokio::sync::Mutex::new(Box::new(writer)),
                pending: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Calls a host capability such as `storage.get` and waits for the
    /// result. Calls outside the plugin's grants fail with
    /// [`SdkError::Host`].
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, SdkError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SdkError::ChannelClosed);
        }

        let (id, envelope) = Envelope::call(method, args);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id.clone(), tx);

        if let Err(e) = self.send(&envelope).await {
            self.pending().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(SdkError::Host(message)),
            Err(_) => Err(SdkError::ChannelClosed),
        }
    }

    /// Emits `event` to the host, which re-broadcasts it as
    /// `plugin:<id>:<event>`.
    pub async fn emit(&self, event: &str, data: Value) -> Result<(), SdkError> {
        self.send(&Envelope::event(event, data)).await
    }

    /// Reports a failure to the host's error boundary.
    pub async fn report_error(&self, message: &str) -> Result<(), SdkError> {
        self.emit("error", Value::String(message.to_string())).await
    }

    pub(crate) async fn send(&self, envelope: &Envelope) -> Result<(), SdkError> {
        let mut writer = self.inner.writer.lock().await;
        write_envelope(&mut *writer, envelope).await?;
        Ok(())
    }

    /// Completes a waiting call. Returns `false` for unknown ids.
    pub(crate) fn resolve(&self, id: &CallId, outcome: Result<Value, String>) -> bool {
        match self.pending().remove(id) {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Fails every waiting call with [`SdkError::ChannelClosed`].
    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.pending().clear();
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<CallId, Waiter>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
