use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("unknown subordinate {0}")]
    UnknownDevice(String),
    #[error("subordinate disconnected")]
    Disconnected,
    #[error("timeout")]
    Timeout,
    #[error("subordinate rejected {command}: {reason}")]
    Remote { command: String, reason: String },
    #[error("io error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One push notification, or the error the subscription reported instead.
pub type SignalUpdate = Result<serde_json::Value, TransportError>;

/// Reaches the subordinate peers.
///
/// `call` resolves once the subordinate reports completion of the command; its
/// success value is the subordinate's message, if any. `subscribe` yields
/// updates until the subscription ends, at which point the receiver closes.
#[async_trait]
pub trait TransportAdapter: Send + Sync + 'static {
    async fn call(
        &self,
        device_id: &str,
        command: &str,
        payload: serde_json::Value,
    ) -> Result<Option<String>, TransportError>;

    async fn subscribe(
        &self,
        device_id: &str,
        signal: &str,
    ) -> Result<mpsc::Receiver<SignalUpdate>, TransportError>;

    async fn ping(&self, device_id: &str) -> Result<(), TransportError>;
}
