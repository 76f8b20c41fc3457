use async_trait::async_trait;
use peercall_protocol::CallSignalingMessage;
use tokio::sync::mpsc;

use crate::error::CallError;

/// Outbound half of the signaling channel.
#[async_trait]
pub trait SignalingSink: Send + Sync {
    async fn send(&self, message: CallSignalingMessage) -> Result<(), CallError>;
}

/// In-process signaling, e.g. for wiring two managers together.
#[async_trait]
impl SignalingSink for mpsc::UnboundedSender<CallSignalingMessage> {
    async fn send(&self, message: CallSignalingMessage) -> Result<(), CallError> {
        mpsc::UnboundedSender::send(self, message)
            .map_err(|_| CallError::Signaling("signaling channel closed".into()))
    }
}
