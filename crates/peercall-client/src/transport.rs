//! The peer-to-peer media transport seen through the call layer.
//!
//! A transport is created per call by a [`TransportFactory`] and reports
//! asynchronous happenings (gathered candidates, connectivity, remote tracks)
//! on an event channel that the call manager drains.

use std::sync::Arc;

use async_trait::async_trait;
use peercall_crypto::FrameTransform;
use peercall_protocol::{IceCandidate, IceServer, SessionDescription};
use tokio::sync::mpsc;

use crate::error::CallError;
use crate::media::{MediaStream, MediaTrack, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// One sender or receiver of the transport, addressed by its track id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEndpoint {
    pub track_id: String,
    pub kind: TrackKind,
}

#[derive(Debug)]
pub enum TransportEvent {
    /// A local candidate to trickle to the peer.
    IceCandidate(IceCandidate),
    ConnectionStateChanged(ConnectionState),
    /// Local tracks changed and a fresh offer is needed.
    NegotiationNeeded,
    /// The peer started sending a track.
    Track {
        track: Arc<dyn MediaTrack>,
        stream: MediaStream,
    },
    /// A receiver dropped an inbound frame.
    FrameRejected {
        track_id: String,
        reason: String,
        consecutive_failures: u32,
    },
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;

    /// Start sending `track`; returns the sender's track id.
    fn add_track(&self, track: Arc<dyn MediaTrack>, stream: &MediaStream) -> Result<String, CallError>;
    fn remove_track(&self, track_id: &str) -> Result<(), CallError>;

    fn senders(&self) -> Vec<MediaEndpoint>;
    fn receivers(&self) -> Vec<MediaEndpoint>;

    /// Install `transform` on the sender (encrypt) or receiver (decrypt) for
    /// `track_id`, replacing any previous one.
    fn attach_transform(&self, track_id: &str, transform: FrameTransform) -> Result<(), CallError>;

    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> ConnectionState;

    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), CallError>;
}
