use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use thermolink_common::{CommandReply, TelemetryMessage};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("transport rejected the device: {0}")]
    Fatal(String),
    #[error("operation timed out")]
    Timeout,
}

impl TransportError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Runs a transport call under `deadline`; expiry becomes
/// [`TransportError::Timeout`].
pub async fn within<T>(
    deadline: Duration,
    call: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(deadline, call)
        .await
        .unwrap_or(Err(TransportError::Timeout))
}

/// Link status pushed by the transport, independent of any call in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Lost { fatal: bool, reason: String },
    Closed,
}

/// Receives named remote procedures from the broker.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, name: &str, payload: &[u8]) -> CommandReply;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolves once the broker has accepted the session.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Resolves once the broker has acknowledged the message.
    async fn send(&self, message: &TelemetryMessage) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    fn set_command_handler(&self, handler: Arc<dyn CommandHandler>);

    fn subscribe_status(&self) -> broadcast::Receiver<LinkEvent>;
}
