//! User consent for sensitive capabilities.
//!
//! The Permission Manager decides *whether* consent is needed; a
//! [`ConsentProvider`] supplied by the host decides *what the user said*.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

/// Capabilities a plugin wants that require the user's approval.
#[derive(Debug, Clone, Serialize)]
pub struct ConsentRequest {
    pub plugin_id: String,
    pub plugin_name: String,
    pub capabilities: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

/// Asks the user whether to grant sensitive capabilities.
#[async_trait]
pub trait ConsentProvider: Send + Sync {
    async fn request_consent(&self, request: ConsentRequest) -> bool;
}

/// A provider that answers every request the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticConsent {
    AllowAll,
    DenyAll,
}

#[async_trait]
impl ConsentProvider for StaticConsent {
    async fn request_consent(&self, _request: ConsentRequest) -> bool {
        matches!(self, Self::AllowAll)
    }
}

/// Adapts a synchronous closure into a [`ConsentProvider`].
pub struct ConsentFn<F>(pub F);

#[async_trait]
impl<F> ConsentProvider for ConsentFn<F>
where
    F: Fn(&ConsentRequest) -> bool + Send + Sync,
{
    async fn request_consent(&self, request: ConsentRequest) -> bool {
        (self.0)(&request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentDecision {
    Granted,
    Denied,
    TimedOut,
}

pub type ConsentPrompt = (ConsentRequest, oneshot::Sender<ConsentDecision>);

/// Forwards consent requests to whichever layer renders prompts (a UI, a
/// terminal) and waits for the answer. Unanswered requests are denied.
pub struct ConsentGate {
    request_tx: mpsc::Sender<ConsentPrompt>,
    request_rx: Option<mpsc::Receiver<ConsentPrompt>>,
    timeout: Duration,
}

impl ConsentGate {
    pub fn new(timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            request_tx: tx,
            request_rx: Some(rx),
            timeout,
        }
    }

    /// Take the receiver (used by the prompting layer to answer requests).
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<ConsentPrompt>> {
        self.request_rx.take()
    }

    /// Sends `request` to the prompting layer and waits for its decision.
    pub async fn ask(&self, request: ConsentRequest) -> ConsentDecision {
        info!(
            plugin_id = %request.plugin_id,
            capabilities = ?request.capabilities,
            "requesting user consent"
        );

        let (response_tx, response_rx) = oneshot::channel();
        if self.request_tx.send((request, response_tx)).await.is_err() {
            // No one listening
            return ConsentDecision::Denied;
        }

        match tokio::time::timeout(self.timeout, response_rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => ConsentDecision::Denied,
            Err(_) => {
                info!("consent request timed out");
                ConsentDecision::TimedOut
            }
        }
    }
}

#[async_trait]
impl ConsentProvider for ConsentGate {
    async fn request_consent(&self, request: ConsentRequest) -> bool {
        self.ask(request).await == ConsentDecision::Granted
    }
}
