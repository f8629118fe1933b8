use crate::{HostHandle, Plugin, SdkError};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use warden_protocol::{CallId, Envelope, lifecycle, read_envelope, response_outcome};

/// Runs `plugin` over stdin/stdout until the host closes the channel.
pub async fn serve_stdio<P: Plugin>(plugin: P) -> Result<(), SdkError> {
    serve(plugin, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Runs `plugin` over an arbitrary byte stream.
///
/// Signals `ready`, then answers host calls until the host side closes.
/// Each call runs on its own task, so a plugin can call back into the host
/// while handling a call. Returns `Ok(())` on a clean close.
pub async fn serve<P, R, W>(plugin: P, mut reader: R, writer: W) -> Result<(), SdkError>
where
    P: Plugin,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let plugin = Arc::new(plugin);
    let host = HostHandle::new(writer);
    host.send(&Envelope::Ready).await?;

    let result = loop {
        let envelope = match read_envelope(&mut reader).await {
            Ok(envelope) => envelope,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break Ok(()),
            Err(e) => break Err(SdkError::Io(e)),
        };

        match envelope {
            Envelope::Call { id, method, args } => {
                tokio::spawn(answer(Arc::clone(&plugin), host.clone(), id, method, args));
            }
            Envelope::Response { id, result, error } => {
                if !host.resolve(&id, response_outcome(result, error)) {
                    debug!(call_id = %id, "ignoring response for unknown call");
                }
            }
            other => debug!(kind = other.kind(), "ignoring unexpected message from host"),
        }
    };

    host.close();
    result
}

async fn answer<P: Plugin>(
    plugin: Arc<P>,
    host: HostHandle,
    id: CallId,
    method: String,
    args: Vec<Value>,
) {
    let outcome = dispatch(plugin.as_ref(), &host, &method, args).await;
    if let Err(e) = host.send(&Envelope::reply(id, outcome)).await {
        debug!(method = %method, error = %e, "failed to deliver response");
    }
}

async fn dispatch<P: Plugin>(
    plugin: &P,
    host: &HostHandle,
    method: &str,
    args: Vec<Value>,
) -> Result<Value, String> {
    let mut args = args.into_iter();
    match method {
        lifecycle::INITIALIZE => {
            let config = args.next().unwrap_or(Value::Null);
            let permissions = args
                .next()
                .and_then(|v| serde_json::from_value::<Vec<String>>(v).ok())
                .unwrap_or_default();
            plugin.initialize(host, config, permissions).await
        }
        lifecycle::ACTIVATE => plugin.activate(host).await,
        lifecycle::DEACTIVATE => plugin.deactivate(host).await,
        lifecycle::UPDATE_CONFIG => {
            plugin
                .update_config(host, args.next().unwrap_or(Value::Null))
                .await
        }
        lifecycle::CLEANUP => plugin.cleanup(host).await,
        _ => plugin.handle_call(host, method, args.collect()).await,
    }
}
