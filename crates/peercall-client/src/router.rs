//! Dispatch of inbound call signals to the call manager.

use std::sync::Arc;

use peercall_protocol::{CallPayload, CallSignalingMessage, UNSTAMPED_USER_ID};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::CallError;
use crate::manager::CallManager;

pub struct SignalRouter {
    manager: Arc<CallManager>,
}

impl SignalRouter {
    pub fn new(manager: Arc<CallManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<CallManager> {
        &self.manager
    }

    /// Handle one inbound signal. The sender id is the one stamped by the relay.
    pub async fn handle(&self, message: CallSignalingMessage) -> Result<(), CallError> {
        let from = message.from_user_id;
        if from == UNSTAMPED_USER_ID {
            warn!(kind = message.kind(), "signal without a stamped sender dropped");
            return Err(CallError::Signaling(format!(
                "{} arrived without a sender id",
                message.kind()
            )));
        }
        debug!(from, kind = message.kind(), "inbound signal");

        let manager = &self.manager;
        match message.payload {
            CallPayload::Invite(invite) => manager.on_invite(from, invite).await,
            CallPayload::Accept => manager.on_remote_accepted(from).await,
            CallPayload::Reject => {
                info!(from, "call rejected");
                manager.on_remote_ended(from).await
            }
            CallPayload::End => manager.on_remote_ended(from).await,
            CallPayload::Offer(offer) => manager.on_offer(from, offer).await,
            CallPayload::Answer(answer) => manager.on_answer(from, answer).await,
            CallPayload::IceCandidate(candidate) => manager.on_remote_candidate(from, candidate).await,
            CallPayload::SessionKey(wrapped) => {
                manager
                    .on_session_key(from, wrapped, message.session_key_hash)
                    .await
            }
            CallPayload::VideoToggle(enabled) => manager.on_remote_video_toggle(from, enabled).await,
            CallPayload::ScreenShareToggle(active) => {
                manager.on_remote_screen_share_toggle(from, active).await
            }
        }
    }

    /// Handle signals in arrival order until the channel closes.
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<CallSignalingMessage>) {
        while let Some(message) = inbound.recv().await {
            let from = message.from_user_id;
            let kind = message.kind();
            if let Err(e) = self.handle(message).await {
                warn!(from, kind, "signal handling failed: {e}");
            }
        }
        info!("signaling channel closed, ending all calls");
        self.manager.end_all().await;
    }
}
