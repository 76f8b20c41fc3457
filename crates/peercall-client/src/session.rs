//! Per-call state owned by the registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use peercall_crypto::SessionKeyMaterial;
use peercall_protocol::{IceCandidate, UserId};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::events::CallState;
use crate::media::MediaStream;
use crate::routing::TrackRouter;
use crate::transport::PeerTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Placed the call: sends offers, generates and rotates keys.
    Initiator,
    Responder,
}

/// A spawned task that is aborted when the handle is dropped.
#[derive(Debug)]
pub struct ScopedTask(JoinHandle<()>);

impl ScopedTask {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for ScopedTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct PeerSession {
    pub remote_user_id: UserId,
    pub remote_username: String,
    pub role: Role,
    /// Chosen by the initiator and carried in the invite; bound into frames.
    pub session_id: String,
    pub state: CallState,

    pub transport: Arc<dyn PeerTransport>,

    // ── Media ──
    pub local_stream: Option<MediaStream>,
    pub local_video_stream: Option<MediaStream>,
    pub screen_share_stream: Option<MediaStream>,
    /// A camera or screen capture is being acquired; further enables are no-ops.
    pub camera_pending: bool,
    pub screen_pending: bool,
    /// Owned by the transport; never stopped by the session.
    pub remote_stream: Option<MediaStream>,
    pub routing: TrackRouter,

    // ── Negotiation ──
    pub negotiation_in_flight: bool,
    /// Set once the first offer/answer round has completed.
    pub initial_negotiation_done: bool,
    pub has_remote_description: bool,
    /// Remote candidates waiting for the remote description.
    pub pending_candidates: Vec<IceCandidate>,

    // ── E2E Encryption ──
    pub session_key: Option<SessionKeyMaterial>,
    pub key_established_at: Option<Instant>,
    /// Incremented on every key installation.
    pub key_epoch: u64,
    pub key_exchange_started: bool,
    /// Epoch of the transform currently attached per sender/receiver track.
    pub bound_senders: HashMap<String, u64>,
    pub bound_receivers: HashMap<String, u64>,

    pub rotation: Option<ScopedTask>,
    pub key_watchdog: Option<ScopedTask>,

    pub is_ending: bool,
}

impl PeerSession {
    pub fn new(
        remote_user_id: UserId,
        remote_username: String,
        role: Role,
        session_id: String,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            remote_user_id,
            remote_username,
            role,
            session_id,
            state: CallState::Idle,
            transport,
            local_stream: None,
            local_video_stream: None,
            screen_share_stream: None,
            camera_pending: false,
            screen_pending: false,
            remote_stream: None,
            routing: TrackRouter::new(),
            negotiation_in_flight: false,
            initial_negotiation_done: false,
            has_remote_description: false,
            pending_candidates: Vec::new(),
            session_key: None,
            key_established_at: None,
            key_epoch: 0,
            key_exchange_started: false,
            bound_senders: HashMap::new(),
            bound_receivers: HashMap::new(),
            rotation: None,
            key_watchdog: None,
            is_ending: false,
        }
    }

    /// Move to `next` if it is later than the current state.
    pub fn advance(&mut self, next: CallState) -> bool {
        if next <= self.state {
            debug!(
                user_id = self.remote_user_id,
                from = ?self.state,
                to = ?next,
                "ignoring backward state transition"
            );
            return false;
        }
        self.state = next;
        true
    }

    /// Detach every locally owned stream so it can be stopped exactly once.
    pub fn take_owned_streams(&mut self) -> Vec<MediaStream> {
        [
            self.local_stream.take(),
            self.local_video_stream.take(),
            self.screen_share_stream.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}
