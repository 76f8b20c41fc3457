//! In-process transport pair.
//!
//! Two [`LoopbackTransport`]s created from a [`LoopbackFactory::pair`] behave
//! like a minimal peer connection: the session description lists the sending
//! tracks, applying the peer's description surfaces its tracks as receivers,
//! and a completed offer/answer round connects. Frames pushed with
//! [`LoopbackTransport::send_frame`] run through the sender's transform and the
//! peer receiver's transform exactly as real media would. Endpoints without a
//! transform drop frames.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use peercall_crypto::{FrameTransform, TransformDirection};
use peercall_protocol::{IceCandidate, IceServer, SdpType, SessionDescription};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::CallError;
use crate::media::{LocalTrack, MediaDevices, MediaStream, MediaTrack, TrackKind};
use crate::transport::{
    ConnectionState, MediaEndpoint, PeerTransport, SignalingState, TransportEvent, TransportEvents,
    TransportFactory,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A track received from the peer. Stopping it only flips the local flag.
#[derive(Debug)]
struct RemoteTrack {
    id: String,
    kind: TrackKind,
    live: AtomicBool,
}

impl MediaTrack for RemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

struct Sender {
    track: Arc<dyn MediaTrack>,
    stream_id: String,
    transform: Option<FrameTransform>,
}

struct Receiver {
    track_id: String,
    kind: TrackKind,
    transform: Option<FrameTransform>,
    delivered: Vec<Vec<u8>>,
}

struct State {
    signaling: SignalingState,
    connection: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: Vec<Sender>,
    receivers: Vec<Receiver>,
    remote_candidates: Vec<IceCandidate>,
    gathered: bool,
    /// Senders changed since the last local description.
    needs_negotiation: bool,
}

pub struct LoopbackTransport {
    ice_servers: Vec<IceServer>,
    state: Mutex<State>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    peer: Mutex<Weak<LoopbackTransport>>,
}

fn describe(senders: &[Sender]) -> String {
    let mut sdp = String::from("v=0\r\ns=peercall-loopback\r\n");
    for sender in senders {
        sdp.push_str(&format!(
            "a=track:{} {} {}\r\n",
            sender.track.id(),
            sender.track.kind().as_str(),
            sender.stream_id
        ));
    }
    sdp
}

/// `(track_id, kind, stream_id)` for each track line.
fn parse_tracks(sdp: &str) -> Result<Vec<(String, TrackKind, String)>, CallError> {
    let mut tracks = Vec::new();
    for line in sdp.lines() {
        let Some(rest) = line.strip_prefix("a=track:") else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let (Some(id), Some(kind), Some(stream)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(CallError::Negotiation(format!("malformed track line: {line}")));
        };
        let kind = TrackKind::parse(kind)
            .ok_or_else(|| CallError::Negotiation(format!("unknown track kind: {kind}")))?;
        tracks.push((id.to_string(), kind, stream.to_string()));
    }
    Ok(tracks)
}

impl LoopbackTransport {
    fn new(ice_servers: Vec<IceServer>) -> (Arc<Self>, TransportEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            ice_servers,
            state: Mutex::new(State {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                local: None,
                remote: None,
                senders: Vec::new(),
                receivers: Vec::new(),
                remote_candidates: Vec::new(),
                gathered: false,
                needs_negotiation: false,
            }),
            events: Mutex::new(Some(tx)),
            peer: Mutex::new(Weak::new()),
        });
        (transport, rx)
    }

    /// A transport with no peer.
    pub fn standalone() -> (Arc<Self>, TransportEvents) {
        Self::new(vec![IceServer::stun("stun:127.0.0.1:3478")])
    }

    fn link(&self, peer: &Arc<LoopbackTransport>) {
        *lock(&self.peer) = Arc::downgrade(peer);
    }

    fn peer(&self) -> Option<Arc<LoopbackTransport>> {
        lock(&self.peer).upgrade()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Candidates applied from the peer.
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state().remote_candidates.clone()
    }

    /// Force a connection state change, e.g. to simulate a network failure.
    pub fn set_connection_state(&self, connection: ConnectionState) {
        self.state().connection = connection;
        self.emit(TransportEvent::ConnectionStateChanged(connection));
    }

    /// Encrypt one frame on the local sender of `track_id`.
    pub fn seal_frame(&self, track_id: &str, payload: &[u8], now_ms: u64) -> Result<Vec<u8>, CallError> {
        let mut state = self.state();
        let sender = state
            .senders
            .iter_mut()
            .find(|s| s.track.id() == track_id)
            .ok_or_else(|| CallError::Transport(format!("no sender for track {track_id}")))?;
        match sender.transform.as_mut() {
            Some(transform) => Ok(transform.process(payload, now_ms)?),
            None => Err(CallError::Transport(format!(
                "no transform on sender {track_id}, frame dropped"
            ))),
        }
    }

    /// Run an encrypted frame through the local receiver of `track_id`.
    pub fn receive_frame(&self, track_id: &str, frame: &[u8]) -> Result<Vec<u8>, CallError> {
        let mut state = self.state();
        let receiver = state
            .receivers
            .iter_mut()
            .find(|r| r.track_id == track_id)
            .ok_or_else(|| CallError::Transport(format!("no receiver for track {track_id}")))?;
        let Some(transform) = receiver.transform.as_mut() else {
            return Err(CallError::Transport(format!(
                "no transform on receiver {track_id}, frame dropped"
            )));
        };

        match transform.process(frame, 0) {
            Ok(payload) => {
                receiver.delivered.push(payload.clone());
                Ok(payload)
            }
            Err(e) => {
                let consecutive_failures = transform.consecutive_failures();
                drop(state);
                self.emit(TransportEvent::FrameRejected {
                    track_id: track_id.to_string(),
                    reason: e.to_string(),
                    consecutive_failures,
                });
                Err(e.into())
            }
        }
    }

    /// Encrypt a frame locally and deliver it to the peer's receiver.
    pub fn send_frame(&self, track_id: &str, payload: &[u8], now_ms: u64) -> Result<Vec<u8>, CallError> {
        let frame = self.seal_frame(track_id, payload, now_ms)?;
        let peer = self
            .peer()
            .ok_or_else(|| CallError::Transport("no peer transport".into()))?;
        peer.receive_frame(track_id, &frame)
    }

    /// Payloads successfully decrypted by the receiver of `track_id`.
    pub fn delivered(&self, track_id: &str) -> Vec<Vec<u8>> {
        self.state()
            .receivers
            .iter()
            .find(|r| r.track_id == track_id)
            .map(|r| r.delivered.clone())
            .unwrap_or_default()
    }

    fn gather_once(&self) {
        let first = {
            let mut state = self.state();
            !std::mem::replace(&mut state.gathered, true)
        };
        if first {
            self.emit(TransportEvent::IceCandidate(IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            }));
        }
    }

    fn connect_if_ready(&self) {
        let ready = {
            let mut state = self.state();
            if state.connection == ConnectionState::New
                && state.local.is_some()
                && state.remote.is_some()
                && state.signaling == SignalingState::Stable
            {
                state.connection = ConnectionState::Connected;
                true
            } else {
                false
            }
        };
        if ready {
            self.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connecting));
            self.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connected));
        }
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let state = self.state();
        if state.signaling == SignalingState::Closed {
            return Err(CallError::Transport("transport closed".into()));
        }
        Ok(SessionDescription::offer(describe(&state.senders)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let state = self.state();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(CallError::Negotiation(format!(
                "cannot answer in state {:?}",
                state.signaling
            )));
        }
        Ok(SessionDescription::answer(describe(&state.senders)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        {
            let mut state = self.state();
            state.signaling = match (desc.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (sdp_type, current) => {
                    return Err(CallError::Negotiation(format!(
                        "cannot apply local {sdp_type:?} in state {current:?}"
                    )))
                }
            };
            // The description lists every current sender.
            state.needs_negotiation = false;
            state.local = Some(desc);
        }
        self.gather_once();
        self.connect_if_ready();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let tracks = parse_tracks(&desc.sdp)?;
        let mut added = Vec::new();
        let renegotiate = {
            let mut state = self.state();
            state.signaling = match (desc.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (sdp_type, current) => {
                    return Err(CallError::Negotiation(format!(
                        "cannot apply remote {sdp_type:?} in state {current:?}"
                    )))
                }
            };

            state
                .receivers
                .retain(|r| tracks.iter().any(|(id, _, _)| id == &r.track_id));
            for (id, kind, stream_id) in tracks {
                if state.receivers.iter().any(|r| r.track_id == id) {
                    continue;
                }
                state.receivers.push(Receiver {
                    track_id: id.clone(),
                    kind,
                    transform: None,
                    delivered: Vec::new(),
                });
                let track: Arc<dyn MediaTrack> = Arc::new(RemoteTrack {
                    id,
                    kind,
                    live: AtomicBool::new(true),
                });
                let stream = MediaStream::new(stream_id, vec![track.clone()]);
                added.push(TransportEvent::Track { track, stream });
            }
            state.remote = Some(desc);
            state.signaling == SignalingState::Stable && state.needs_negotiation
        };

        for event in added {
            self.emit(event);
        }
        self.connect_if_ready();
        if renegotiate {
            self.emit(TransportEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let mut state = self.state();
        if state.remote.is_none() {
            return Err(CallError::Transport("remote description not set".into()));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    fn add_track(&self, track: Arc<dyn MediaTrack>, stream: &MediaStream) -> Result<String, CallError> {
        let id = track.id().to_string();
        {
            let mut state = self.state();
            if state.senders.iter().any(|s| s.track.id() == id) {
                return Err(CallError::Transport(format!("track {id} already added")));
            }
            state.senders.push(Sender {
                track,
                stream_id: stream.id().to_string(),
                transform: None,
            });
            state.needs_negotiation = true;
        }
        self.emit(TransportEvent::NegotiationNeeded);
        Ok(id)
    }

    fn remove_track(&self, track_id: &str) -> Result<(), CallError> {
        {
            let mut state = self.state();
            let before = state.senders.len();
            state.senders.retain(|s| s.track.id() != track_id);
            if state.senders.len() == before {
                return Err(CallError::Transport(format!("no sender for track {track_id}")));
            }
            state.needs_negotiation = true;
        }
        self.emit(TransportEvent::NegotiationNeeded);
        Ok(())
    }

    fn senders(&self) -> Vec<MediaEndpoint> {
        self.state()
            .senders
            .iter()
            .map(|s| MediaEndpoint {
                track_id: s.track.id().to_string(),
                kind: s.track.kind(),
            })
            .collect()
    }

    fn receivers(&self) -> Vec<MediaEndpoint> {
        self.state()
            .receivers
            .iter()
            .map(|r| MediaEndpoint {
                track_id: r.track_id.clone(),
                kind: r.kind,
            })
            .collect()
    }

    fn attach_transform(&self, track_id: &str, transform: FrameTransform) -> Result<(), CallError> {
        let mut state = self.state();
        let slot = match transform.direction() {
            TransformDirection::Encrypt => state
                .senders
                .iter_mut()
                .find(|s| s.track.id() == track_id)
                .map(|s| &mut s.transform),
            TransformDirection::Decrypt => state
                .receivers
                .iter_mut()
                .find(|r| r.track_id == track_id)
                .map(|r| &mut r.transform),
        };
        let slot = slot.ok_or_else(|| CallError::Transport(format!("no endpoint for track {track_id}")))?;
        *slot = Some(transform);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state().connection
    }

    async fn close(&self) {
        {
            let mut state = self.state();
            if state.signaling == SignalingState::Closed {
                return;
            }
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
            state.senders.clear();
            state.receivers.clear();
        }
        self.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Closed));
        lock(&self.events).take();
        debug!("loopback transport closed");
    }
}

/// Slots for the two ends of a loopback link.
#[derive(Default)]
struct Link {
    ends: [Weak<LoopbackTransport>; 2],
}

/// Creates transports that connect to whatever the paired factory created last.
pub struct LoopbackFactory {
    link: Arc<Mutex<Link>>,
    side: usize,
    created: Mutex<Vec<Arc<LoopbackTransport>>>,
}

impl LoopbackFactory {
    pub fn pair() -> (Self, Self) {
        let link = Arc::new(Mutex::new(Link::default()));
        (
            Self {
                link: link.clone(),
                side: 0,
                created: Mutex::new(Vec::new()),
            },
            Self {
                link,
                side: 1,
                created: Mutex::new(Vec::new()),
            },
        )
    }

    /// The most recently created transport.
    pub fn last(&self) -> Option<Arc<LoopbackTransport>> {
        lock(&self.created).last().cloned()
    }

    pub fn created_count(&self) -> usize {
        lock(&self.created).len()
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), CallError> {
        if ice_servers.is_empty() {
            return Err(CallError::Transport("no ICE servers".into()));
        }
        let (transport, events) = LoopbackTransport::new(ice_servers.to_vec());
        {
            let mut link = lock(&self.link);
            link.ends[self.side] = Arc::downgrade(&transport);
            if let Some(peer) = link.ends[1 - self.side].upgrade() {
                transport.link(&peer);
                peer.link(&transport);
            }
        }
        lock(&self.created).push(transport.clone());
        Ok((transport as Arc<dyn PeerTransport>, events))
    }
}

/// Media devices handing out [`LocalTrack`]s.
#[derive(Default)]
pub struct LoopbackMedia {
    fail: AtomicBool,
    delay_ms: AtomicU64,
    issued: Mutex<Vec<Arc<LocalTrack>>>,
}

impl LoopbackMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following acquisition fail, as if permission was denied.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Hold every following acquisition for `delay`, like a slow permission prompt.
    pub fn set_acquire_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn issued(&self) -> Vec<Arc<LocalTrack>> {
        lock(&self.issued).clone()
    }

    async fn stream(&self, kind: TrackKind, what: &str) -> Result<MediaStream, CallError> {
        let delay_ms = self.delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(CallError::MediaAcquisition(format!("{what} unavailable")));
        }
        let track = LocalTrack::new(kind);
        lock(&self.issued).push(track.clone());
        Ok(MediaStream::new(
            uuid::Uuid::new_v4().to_string(),
            vec![track as Arc<dyn MediaTrack>],
        ))
    }
}

#[async_trait]
impl MediaDevices for LoopbackMedia {
    async fn acquire_audio(&self) -> Result<MediaStream, CallError> {
        self.stream(TrackKind::Audio, "microphone").await
    }

    async fn acquire_video(&self) -> Result<MediaStream, CallError> {
        self.stream(TrackKind::Video, "camera").await
    }

    async fn acquire_screen(&self) -> Result<MediaStream, CallError> {
        self.stream(TrackKind::Video, "screen capture").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peercall_crypto::{FrameDecryptor, FrameEncryptor, SessionKeyMaterial};

    async fn linked() -> (Arc<LoopbackTransport>, TransportEvents, Arc<LoopbackTransport>, TransportEvents) {
        let (fa, fb) = LoopbackFactory::pair();
        let servers = [IceServer::stun("stun:127.0.0.1:3478")];
        let (_, ea) = fa.create(&servers).await.unwrap();
        let (_, eb) = fb.create(&servers).await.unwrap();
        (fa.last().unwrap(), ea, fb.last().unwrap(), eb)
    }

    #[test]
    fn sdp_lists_tracks() {
        let track = LocalTrack::new(TrackKind::Video);
        let sender = Sender {
            track: track.clone(),
            stream_id: "cam".into(),
            transform: None,
        };
        let sdp = describe(&[sender]);
        let parsed = parse_tracks(&sdp).unwrap();
        assert_eq!(parsed, vec![(track.id().to_string(), TrackKind::Video, "cam".to_string())]);
        assert!(parse_tracks("a=track:only-id\r\n").is_err());
    }

    #[tokio::test]
    async fn offer_answer_connects_and_surfaces_tracks() {
        let (a, mut ea, b, mut eb) = linked().await;
        let audio = LocalTrack::new(TrackKind::Audio);
        let stream = MediaStream::new("mic", vec![audio.clone() as Arc<dyn MediaTrack>]);
        a.add_track(audio.clone(), &stream).unwrap();
        assert!(matches!(ea.recv().await, Some(TransportEvent::NegotiationNeeded)));

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);
        assert!(matches!(ea.recv().await, Some(TransportEvent::IceCandidate(_))));

        b.set_remote_description(offer).await.unwrap();
        match eb.recv().await {
            Some(TransportEvent::Track { track, .. }) => assert_eq!(track.id(), audio.id()),
            other => panic!("expected track event, got {other:?}"),
        }
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);
        assert_eq!(b.receivers().len(), 1);
    }

    #[tokio::test]
    async fn track_added_mid_offer_renegotiates_after_answer() {
        let (a, mut ea, b, _eb) = linked().await;
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();

        let video = LocalTrack::new(TrackKind::Video);
        let stream = MediaStream::new("cam", vec![video.clone() as Arc<dyn MediaTrack>]);
        a.add_track(video, &stream).unwrap();

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let mut needed = 0;
        while let Ok(event) = ea.try_recv() {
            if matches!(event, TransportEvent::NegotiationNeeded) {
                needed += 1;
            }
        }
        // Once for the add, once more on returning to stable.
        assert_eq!(needed, 2);
    }

    #[tokio::test]
    async fn answer_carries_tracks_added_before_it() {
        let (a, _ea, b, mut eb) = linked().await;
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();

        let video = LocalTrack::new(TrackKind::Video);
        let stream = MediaStream::new("cam", vec![video.clone() as Arc<dyn MediaTrack>]);
        b.add_track(video.clone(), &stream).unwrap();

        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let mut needed = 0;
        while let Ok(event) = eb.try_recv() {
            if matches!(event, TransportEvent::NegotiationNeeded) {
                needed += 1;
            }
        }
        assert_eq!(needed, 1);
        assert!(a.receivers().iter().any(|r| r.track_id == video.id()));
    }

    #[tokio::test]
    async fn frames_need_transforms_on_both_ends() {
        let (a, _ea, b, _eb) = linked().await;
        let audio = LocalTrack::new(TrackKind::Audio);
        let stream = MediaStream::new("mic", vec![audio.clone() as Arc<dyn MediaTrack>]);
        a.add_track(audio.clone(), &stream).unwrap();
        let offer = a.create_offer().await.unwrap();
        b.set_remote_description(offer).await.unwrap();

        // No transform: dropped.
        assert!(a.send_frame(audio.id(), b"x", 0).is_err());

        let key = SessionKeyMaterial::generate().unwrap();
        a.attach_transform(audio.id(), FrameTransform::Encrypt(FrameEncryptor::new(&key, "s").unwrap()))
            .unwrap();
        assert!(a.send_frame(audio.id(), b"x", 0).is_err());

        b.attach_transform(audio.id(), FrameTransform::Decrypt(FrameDecryptor::new(&key, "s").unwrap()))
            .unwrap();
        assert_eq!(a.send_frame(audio.id(), b"hello", 10).unwrap(), b"hello");
        assert_eq!(b.delivered(audio.id()), vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn rejected_frames_are_reported() {
        let (a, _ea, b, mut eb) = linked().await;
        let audio = LocalTrack::new(TrackKind::Audio);
        let stream = MediaStream::new("mic", vec![audio.clone() as Arc<dyn MediaTrack>]);
        a.add_track(audio.clone(), &stream).unwrap();
        b.set_remote_description(a.create_offer().await.unwrap()).await.unwrap();
        let _track = eb.recv().await;

        let sender_key = SessionKeyMaterial::generate().unwrap();
        let other_key = SessionKeyMaterial::generate().unwrap();
        a.attach_transform(audio.id(), FrameTransform::Encrypt(FrameEncryptor::new(&sender_key, "s").unwrap()))
            .unwrap();
        b.attach_transform(audio.id(), FrameTransform::Decrypt(FrameDecryptor::new(&other_key, "s").unwrap()))
            .unwrap();

        assert!(matches!(a.send_frame(audio.id(), b"x", 0), Err(CallError::FrameAuthentication(_))));
        match eb.recv().await {
            Some(TransportEvent::FrameRejected { consecutive_failures, .. }) => {
                assert_eq!(consecutive_failures, 1)
            }
            other => panic!("expected frame rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn candidates_require_remote_description() {
        let (transport, _events) = LoopbackTransport::standalone();
        let candidate = IceCandidate {
            candidate: "candidate:2".into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        };
        assert!(transport.add_ice_candidate(candidate.clone()).await.is_err());
        transport
            .set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();
        transport.add_ice_candidate(candidate).await.unwrap();
        assert_eq!(transport.remote_candidates().len(), 1);
    }

    #[tokio::test]
    async fn answer_in_wrong_state_rejected() {
        let (transport, _events) = LoopbackTransport::standalone();
        assert!(transport.create_answer().await.is_err());
        assert!(transport
            .set_remote_description(SessionDescription::answer("v=0\r\n"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_events() {
        let (transport, mut events) = LoopbackTransport::standalone();
        transport.close().await;
        transport.close().await;
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::ConnectionStateChanged(ConnectionState::Closed))
        ));
        assert!(events.recv().await.is_none());
        assert!(transport.create_offer().await.is_err());
    }

    #[tokio::test]
    async fn failing_media() {
        let media = LoopbackMedia::new();
        assert!(media.acquire_audio().await.is_ok());
        media.set_failing(true);
        assert!(matches!(media.acquire_video().await, Err(CallError::MediaAcquisition(_))));
        assert_eq!(media.issued().len(), 1);
    }
}
