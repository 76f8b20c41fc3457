//! Call lifecycle: session creation, offer/answer, key exchange scheduling,
//! transform attachment and teardown.
//!
//! Every operation locks the target [`SessionSlot`] and re-checks that it is
//! still the registered live call after any await that ran without the lock.
//! Work that outlives a call (delayed offer, key fetch) discards its result
//! when the call is gone.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use peercall_crypto::{FrameDecryptor, FrameEncryptor, FrameTransform, IdentityKeyPair, SessionKeyMaterial};
use peercall_protocol::{
    CallPayload, CallSignalingMessage, IceCandidate, IceServer, InviteData, SessionDescription, UserId,
    WrappedKey,
};
use tracing::{debug, error, info, warn};

use crate::config::CallConfig;
use crate::directory::Directory;
use crate::error::CallError;
use crate::events::{CallEvent, CallState, EventSink};
use crate::keys::{with_timeout, KeyManager};
use crate::media::{MediaDevices, MediaStream, MediaTrack, TrackKind};
use crate::registry::{SessionRegistry, SessionSlot};
use crate::routing::VideoRoute;
use crate::session::{PeerSession, Role, ScopedTask};
use crate::signaling::SignalingSink;
use crate::transport::{
    ConnectionState, PeerTransport, SignalingState, TransportEvent, TransportEvents, TransportFactory,
};

/// Early candidates kept per unknown user when buffering is enabled.
const MAX_EARLY_CANDIDATES: usize = 64;

/// External services a [`CallManager`] talks to.
#[derive(Clone)]
pub struct CallBackends {
    pub signaling: Arc<dyn SignalingSink>,
    pub directory: Arc<dyn Directory>,
    pub media: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
}

#[derive(Debug, Clone, Copy)]
enum KeyExchangeKind {
    Initial,
    Rotation,
}

#[derive(Debug, Clone, Copy)]
enum MediaKind {
    Audio,
    Camera,
    Screen,
}

/// The two locally captured video sources.
#[derive(Debug, Clone, Copy)]
enum LocalVideo {
    Camera,
    Screen,
}

impl LocalVideo {
    fn toggle(self, on: bool) -> CallPayload {
        match self {
            Self::Camera => CallPayload::VideoToggle(on),
            Self::Screen => CallPayload::ScreenShareToggle(on),
        }
    }

    fn media(self) -> MediaKind {
        match self {
            Self::Camera => MediaKind::Camera,
            Self::Screen => MediaKind::Screen,
        }
    }

    fn stream(self, session: &mut PeerSession) -> &mut Option<MediaStream> {
        match self {
            Self::Camera => &mut session.local_video_stream,
            Self::Screen => &mut session.screen_share_stream,
        }
    }

    fn pending(self, session: &mut PeerSession) -> &mut bool {
        match self {
            Self::Camera => &mut session.camera_pending,
            Self::Screen => &mut session.screen_pending,
        }
    }

    fn event(self, user_id: UserId, stream: Option<MediaStream>) -> CallEvent {
        match self {
            Self::Camera => CallEvent::LocalVideoStream { user_id, stream },
            Self::Screen => CallEvent::LocalScreenShare { user_id, stream },
        }
    }
}

fn add_stream(transport: &dyn PeerTransport, stream: &MediaStream) -> Result<(), CallError> {
    for track in stream.tracks() {
        transport.add_track(track.clone(), stream)?;
    }
    Ok(())
}

pub struct CallManager {
    config: CallConfig,
    local_username: String,
    registry: SessionRegistry,
    keys: KeyManager,
    signaling: Arc<dyn SignalingSink>,
    directory: Arc<dyn Directory>,
    media: Arc<dyn MediaDevices>,
    transports: Arc<dyn TransportFactory>,
    events: EventSink,
    /// ICE candidates for users without a call, when buffering is enabled.
    early_candidates: DashMap<UserId, Vec<IceCandidate>>,
    this: Weak<CallManager>,
}

impl CallManager {
    pub fn new(
        config: CallConfig,
        identity: IdentityKeyPair,
        local_username: impl Into<String>,
        backends: CallBackends,
        events: EventSink,
    ) -> Arc<Self> {
        let keys = KeyManager::new(
            identity,
            backends.directory.clone(),
            config.public_key_timeout(),
        );
        Arc::new_cyclic(|this| Self {
            config,
            local_username: local_username.into(),
            registry: SessionRegistry::new(),
            keys,
            signaling: backends.signaling,
            directory: backends.directory,
            media: backends.media,
            transports: backends.transports,
            events,
            early_candidates: DashMap::new(),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn public_key(&self) -> peercall_crypto::PublicKeyBytes {
        self.keys.public_key()
    }

    pub async fn call_state(&self, user_id: UserId) -> Option<CallState> {
        let slot = self.registry.get(user_id)?;
        let state = slot.lock().await.state;
        Some(state)
    }

    /// Hex fingerprint of the installed session key.
    pub async fn key_fingerprint(&self, user_id: UserId) -> Option<String> {
        let slot = self.registry.live(user_id)?;
        let session = slot.lock().await;
        session.session_key.as_ref().map(SessionKeyMaterial::fingerprint_hex)
    }

    pub async fn key_epoch(&self, user_id: UserId) -> Option<u64> {
        let slot = self.registry.live(user_id)?;
        let epoch = slot.lock().await.key_epoch;
        Some(epoch)
    }

    /// How long the current key has been in use.
    pub async fn key_age(&self, user_id: UserId) -> Option<Duration> {
        let slot = self.registry.live(user_id)?;
        let established = slot.lock().await.key_established_at?;
        Some(established.elapsed())
    }

    pub async fn transport(&self, user_id: UserId) -> Option<Arc<dyn PeerTransport>> {
        let slot = self.registry.live(user_id)?;
        let transport = slot.lock().await.transport.clone();
        Some(transport)
    }

    fn live_slot(&self, user_id: UserId) -> Result<Arc<SessionSlot>, CallError> {
        self.registry.live(user_id).ok_or(CallError::NoSession(user_id))
    }

    async fn send(&self, to: UserId, payload: CallPayload) -> Result<(), CallError> {
        let message = CallSignalingMessage::outbound(to, payload);
        debug!(to, kind = message.kind(), "sending call signal");
        self.signaling.send(message).await
    }

    /// Advance the call state and publish the change.
    fn set_state(&self, session: &mut PeerSession, state: CallState) {
        if session.advance(state) {
            self.events.emit(CallEvent::CallStateChanged {
                user_id: session.remote_user_id,
                state,
            });
        }
    }

    async fn acquire(&self, kind: MediaKind) -> Result<MediaStream, CallError> {
        let limit = self.config.media_timeout();
        match kind {
            MediaKind::Audio => with_timeout(limit, "audio acquisition", self.media.acquire_audio()).await,
            MediaKind::Camera => with_timeout(limit, "camera acquisition", self.media.acquire_video()).await,
            MediaKind::Screen => with_timeout(limit, "screen acquisition", self.media.acquire_screen()).await,
        }
    }

    // ── Session creation ──

    /// Create the transport for a new call and register it.
    pub async fn create_session(
        &self,
        user_id: UserId,
        username: &str,
        role: Role,
        session_id: String,
    ) -> Result<Arc<SessionSlot>, CallError> {
        if self.registry.live(user_id).is_some() {
            return Err(CallError::SessionExists(user_id));
        }

        let ice_servers = match self.directory.fetch_ice_servers().await {
            Ok(servers) if !servers.is_empty() => servers,
            Ok(_) => {
                warn!(user_id, "empty ICE server list, using fallback STUN server");
                vec![IceServer::stun(self.config.fallback_stun_url.clone())]
            }
            Err(e) => {
                warn!(user_id, "ICE server fetch failed, using fallback STUN server: {e}");
                vec![IceServer::stun(self.config.fallback_stun_url.clone())]
            }
        };

        let (transport, events) = self.transports.create(&ice_servers).await?;
        let mut session = PeerSession::new(user_id, username.to_string(), role, session_id, transport.clone());
        if let Some((_, early)) = self.early_candidates.remove(&user_id) {
            debug!(user_id, count = early.len(), "adopting early ICE candidates");
            session.pending_candidates = early;
        }

        let slot = match self.registry.insert(session) {
            Ok(slot) => slot,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };
        self.spawn_event_pump(slot.clone(), events);
        info!(user_id, ?role, session_id = slot.session_id(), "call session created");
        Ok(slot)
    }

    fn spawn_event_pump(&self, slot: Arc<SessionSlot>, mut events: TransportEvents) {
        let manager = self.this.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if slot.is_ended() {
                    break;
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_transport_event(&slot, event).await;
            }
            debug!(user_id = slot.user_id(), "transport event pump stopped");
        });
    }

    // ── Outgoing call ──

    /// Place a call: acquire audio, then ring the remote user.
    pub async fn initiate(&self, user_id: UserId, username: &str) -> Result<(), CallError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let slot = self
            .create_session(user_id, username, Role::Initiator, session_id)
            .await?;

        if let Err(e) = self.ring(&slot).await {
            warn!(user_id, "failed to place call: {e}");
            self.events.emit(CallEvent::CallFailed {
                user_id,
                reason: e.to_string(),
            });
            self.teardown_slot(&slot).await;
            return Err(e);
        }
        Ok(())
    }

    async fn ring(&self, slot: &Arc<SessionSlot>) -> Result<(), CallError> {
        let user_id = slot.user_id();
        let audio = self.acquire(MediaKind::Audio).await?;

        let mut session = slot.lock().await;
        if !self.registry.is_current(user_id, slot) {
            audio.stop_all();
            return Err(CallError::NoSession(user_id));
        }
        session.local_stream = Some(audio.clone());
        add_stream(&*session.transport, &audio)?;
        self.set_state(&mut session, CallState::Inviting);

        let invite = InviteData {
            username: self.local_username.clone(),
            session_id: session.session_id.clone(),
            video: false,
        };
        self.send(user_id, CallPayload::Invite(invite)).await
    }

    /// The callee picked up: send the first offer after a short delay.
    pub async fn on_remote_accepted(&self, user_id: UserId) -> Result<(), CallError> {
        let slot = self.live_slot(user_id)?;
        {
            let mut session = slot.lock().await;
            if session.role != Role::Initiator || session.state != CallState::Inviting {
                return Err(CallError::InvalidState {
                    user_id,
                    state: session.state,
                    operation: "handle accept",
                });
            }
            self.set_state(&mut session, CallState::Connecting);
        }

        let manager = self.this.clone();
        let delay = self.config.accept_offer_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.send_initial_offer(&slot).await;
            }
        });
        Ok(())
    }

    async fn send_initial_offer(&self, slot: &Arc<SessionSlot>) {
        let user_id = slot.user_id();
        let mut session = slot.lock().await;
        if !self.registry.is_current(user_id, slot) {
            debug!(user_id, "call ended before the first offer");
            return;
        }
        if let Err(e) = self.send_offer(&mut session).await {
            drop(session);
            error!(user_id, "failed to send offer: {e}");
            self.fail_call(slot, e.to_string()).await;
        }
    }

    async fn send_offer(&self, session: &mut PeerSession) -> Result<(), CallError> {
        session.negotiation_in_flight = true;
        let result = self.create_and_send_offer(session).await;
        if result.is_err() {
            session.negotiation_in_flight = false;
        }
        result
    }

    async fn create_and_send_offer(&self, session: &PeerSession) -> Result<(), CallError> {
        let offer = session.transport.create_offer().await?;
        session.transport.set_local_description(offer.clone()).await?;
        self.send(session.remote_user_id, CallPayload::Offer(offer)).await
    }

    // ── Incoming call ──

    pub async fn on_invite(&self, user_id: UserId, invite: InviteData) -> Result<(), CallError> {
        if let Some(existing) = self.registry.live(user_id) {
            if existing.session_id() == invite.session_id {
                debug!(user_id, "duplicate invite ignored");
                return Ok(());
            }
            warn!(user_id, "invite while a call with this user is in progress");
            return Err(CallError::SessionExists(user_id));
        }

        let slot = self
            .create_session(user_id, &invite.username, Role::Responder, invite.session_id)
            .await?;
        {
            let mut session = slot.lock().await;
            self.set_state(&mut session, CallState::Ringing);
        }
        info!(user_id, username = %invite.username, "incoming call");
        self.events.emit(CallEvent::IncomingCall {
            user_id,
            username: invite.username,
            video: invite.video,
        });
        Ok(())
    }

    /// Pick up a ringing call. The caller sends the offer once it sees the accept.
    pub async fn accept(&self, user_id: UserId) -> Result<(), CallError> {
        let slot = self.live_slot(user_id)?;
        let needs_audio = {
            let session = slot.lock().await;
            if session.role != Role::Responder || session.state != CallState::Ringing {
                return Err(CallError::InvalidState {
                    user_id,
                    state: session.state,
                    operation: "accept",
                });
            }
            session.local_stream.is_none()
        };

        let result = self.pick_up(&slot, needs_audio).await;
        if let Err(e) = &result {
            warn!(user_id, "failed to accept call: {e}");
            self.fail_call(&slot, e.to_string()).await;
        }
        result
    }

    async fn pick_up(&self, slot: &Arc<SessionSlot>, needs_audio: bool) -> Result<(), CallError> {
        let user_id = slot.user_id();
        let audio = if needs_audio {
            Some(self.acquire(MediaKind::Audio).await?)
        } else {
            None
        };

        let mut session = slot.lock().await;
        if !self.registry.is_current(user_id, slot) {
            if let Some(audio) = audio {
                audio.stop_all();
            }
            return Err(CallError::NoSession(user_id));
        }
        if let Some(audio) = audio {
            session.local_stream = Some(audio.clone());
            add_stream(&*session.transport, &audio)?;
        }
        self.set_state(&mut session, CallState::Connecting);
        self.send(user_id, CallPayload::Accept).await
    }

    pub async fn reject(&self, user_id: UserId) -> Result<(), CallError> {
        let slot = self.live_slot(user_id)?;
        {
            let mut session = slot.lock().await;
            session.is_ending = true;
            self.set_state(&mut session, CallState::Ending);
        }
        let sent = self.send(user_id, CallPayload::Reject).await;
        self.teardown_slot(&slot).await;
        sent
    }

    /// The remote side rejected or hung up.
    pub async fn on_remote_ended(&self, user_id: UserId) -> Result<(), CallError> {
        let Some(slot) = self.registry.live(user_id) else {
            debug!(user_id, "end for unknown call ignored");
            return Ok(());
        };
        {
            let mut session = slot.lock().await;
            session.is_ending = true;
            self.set_state(&mut session, CallState::Ending);
        }
        info!(user_id, "remote side ended the call");
        self.teardown_slot(&slot).await;
        Ok(())
    }

    // ── Offer / answer ──

    pub async fn on_offer(&self, user_id: UserId, offer: SessionDescription) -> Result<(), CallError> {
        let slot = self.live_slot(user_id)?;
        let mut session = slot.lock().await;
        if session.state < CallState::Connecting {
            return Err(CallError::InvalidState {
                user_id,
                state: session.state,
                operation: "answer an offer",
            });
        }

        let signaling = session.transport.signaling_state();
        let result = if signaling != SignalingState::Stable {
            Err(CallError::Negotiation(format!(
                "offer received in signaling state {signaling:?}"
            )))
        } else {
            self.answer_offer(&slot, &mut session, offer).await
        };
        drop(session);

        if let Err(e) = &result {
            error!(user_id, "negotiation failed: {e}");
            self.fail_call(&slot, e.to_string()).await;
        }
        result
    }

    async fn answer_offer(
        &self,
        slot: &Arc<SessionSlot>,
        session: &mut PeerSession,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        session.transport.set_remote_description(offer).await?;
        session.has_remote_description = true;
        self.flush_pending_candidates(session).await;

        let answer = session.transport.create_answer().await?;
        session.transport.set_local_description(answer.clone()).await?;
        session.initial_negotiation_done = true;
        self.attach_transforms(session)?;
        debug!(user_id = slot.user_id(), "answering offer");
        self.send(session.remote_user_id, CallPayload::Answer(answer)).await
    }

    pub async fn on_answer(&self, user_id: UserId, answer: SessionDescription) -> Result<(), CallError> {
        let slot = self.live_slot(user_id)?;
        let mut session = slot.lock().await;
        if session.transport.signaling_state() != SignalingState::HaveLocalOffer {
            warn!(user_id, "answer without a pending offer ignored");
            return Err(CallError::Negotiation("unexpected answer".into()));
        }

        let result = self.apply_answer(&mut session, answer).await;
        session.negotiation_in_flight = false;
        if let Err(e) = result {
            drop(session);
            error!(user_id, "failed to apply answer: {e}");
            self.fail_call(&slot, e.to_string()).await;
            return Err(e);
        }

        let start_exchange = session.role == Role::Initiator
            && session.session_key.is_none()
            && !session.key_exchange_started;
        if start_exchange {
            session.key_exchange_started = true;
        }
        drop(session);

        if start_exchange {
            self.spawn_key_exchange(slot, KeyExchangeKind::Initial);
        }
        Ok(())
    }

    async fn apply_answer(&self, session: &mut PeerSession, answer: SessionDescription) -> Result<(), CallError> {
        session.transport.set_remote_description(answer).await?;
        session.has_remote_description = true;
        session.initial_negotiation_done = true;
        self.flush_pending_candidates(session).await;
        self.attach_transforms(session)
    }

    /// Send a fresh offer after tracks changed. Only the initiator offers.
    ///
    /// Returns `Ok(false)` without doing anything on the responder, while a
    /// negotiation is in flight, the signaling state is not stable, or the
    /// first offer/answer round has not completed.
    pub async fn renegotiate(&self, user_id: UserId) -> Result<bool, CallError> {
        let slot = self.live_slot(user_id)?;
        let mut session = slot.lock().await;
        if session.role == Role::Responder {
            debug!(user_id, "responder waits for the initiator's next offer");
            return Ok(false);
        }
        let signaling = session.transport.signaling_state();
        if session.negotiation_in_flight
            || !session.initial_negotiation_done
            || signaling != SignalingState::Stable
            || !session.state.is_live()
        {
            debug!(
                user_id,
                in_flight = session.negotiation_in_flight,
                initial_done = session.initial_negotiation_done,
                ?signaling,
                "skipping renegotiation"
            );
            return Ok(false);
        }
        info!(user_id, "renegotiating");
        self.send_offer(&mut session).await?;
        Ok(true)
    }

    // ── ICE ──

    pub async fn on_remote_candidate(&self, user_id: UserId, candidate: IceCandidate) -> Result<(), CallError> {
        let Some(slot) = self.registry.live(user_id) else {
            if self.config.buffer_early_candidates {
                let mut early = self.early_candidates.entry(user_id).or_default();
                if early.len() < MAX_EARLY_CANDIDATES {
                    early.push(candidate);
                }
                debug!(user_id, buffered = early.len(), "buffered ICE candidate for unknown call");
            } else {
                debug!(user_id, "dropping ICE candidate for unknown call");
            }
            return Ok(());
        };

        let mut session = slot.lock().await;
        if !session.has_remote_description {
            session.pending_candidates.push(candidate);
            return Ok(());
        }
        if let Err(e) = session.transport.add_ice_candidate(candidate).await {
            warn!(user_id, "failed to add ICE candidate: {e}");
        }
        Ok(())
    }

    async fn flush_pending_candidates(&self, session: &mut PeerSession) {
        for candidate in std::mem::take(&mut session.pending_candidates) {
            if let Err(e) = session.transport.add_ice_candidate(candidate).await {
                warn!(user_id = session.remote_user_id, "failed to add queued ICE candidate: {e}");
            }
        }
    }

    // ── Video and screen share ──

    pub async fn set_video(&self, user_id: UserId, on: bool) -> Result<(), CallError> {
        self.set_local_video(user_id, LocalVideo::Camera, on).await
    }

    pub async fn set_screen_share(&self, user_id: UserId, on: bool) -> Result<(), CallError> {
        self.set_local_video(user_id, LocalVideo::Screen, on).await
    }

    async fn set_local_video(&self, user_id: UserId, source: LocalVideo, on: bool) -> Result<(), CallError> {
        let slot = self.live_slot(user_id)?;
        {
            let mut session = slot.lock().await;
            if session.state < CallState::Connecting || !session.state.is_live() {
                return Err(CallError::InvalidState {
                    user_id,
                    state: session.state,
                    operation: "toggle video",
                });
            }
            let pending = *source.pending(&mut session);
            if pending && !on {
                return Err(CallError::InvalidState {
                    user_id,
                    state: session.state,
                    operation: "disable video while it is being enabled",
                });
            }
            if pending || source.stream(&mut session).is_some() == on {
                return Ok(());
            }

            if !on {
                // The receiver classifies tracks by this announcement.
                self.send(user_id, source.toggle(false)).await?;
                if let Some(stream) = source.stream(&mut session).take() {
                    for track in stream.tracks() {
                        if let Err(e) = session.transport.remove_track(track.id()) {
                            warn!(user_id, track_id = track.id(), "failed to remove track: {e}");
                        }
                        session.bound_senders.remove(track.id());
                    }
                    stream.stop_all();
                }
                drop(session);
                self.events.emit(source.event(user_id, None));
                return Ok(());
            }
            *source.pending(&mut session) = true;
        }

        let acquired = self.acquire(source.media()).await;

        let mut session = slot.lock().await;
        *source.pending(&mut session) = false;
        let stream = acquired?;
        if !self.registry.is_current(user_id, &slot) {
            stream.stop_all();
            return Err(CallError::NoSession(user_id));
        }
        if let Err(e) = self.send(user_id, source.toggle(true)).await {
            stream.stop_all();
            return Err(e);
        }
        *source.stream(&mut session) = Some(stream.clone());
        add_stream(&*session.transport, &stream)?;
        self.attach_transforms(&mut session)?;
        drop(session);
        self.events.emit(source.event(user_id, Some(stream)));
        Ok(())
    }

    pub async fn on_remote_video_toggle(&self, user_id: UserId, enabled: bool) -> Result<(), CallError> {
        let slot = self.live_slot(user_id)?;
        let role = {
            let mut session = slot.lock().await;
            session.routing.set_remote_camera(enabled);
            session.role
        };
        self.events.emit(CallEvent::RemoteVideoStateChanged { user_id, enabled });
        if !enabled {
            self.events.emit(CallEvent::RemoteVideoStream { user_id, stream: None });
        }
        if role == Role::Initiator {
            self.schedule_renegotiation(slot);
        }
        Ok(())
    }

    pub async fn on_remote_screen_share_toggle(&self, user_id: UserId, active: bool) -> Result<(), CallError> {
        let slot = self.live_slot(user_id)?;
        let role = {
            let mut session = slot.lock().await;
            session.routing.set_remote_screen(active);
            session.role
        };
        self.events.emit(CallEvent::ScreenShareStateChanged { user_id, active });
        if !active {
            self.events.emit(CallEvent::RemoteScreenShare { user_id, stream: None });
        }
        if role == Role::Initiator {
            self.schedule_renegotiation(slot);
        }
        Ok(())
    }

    /// The responder changes tracks right after announcing them but never
    /// offers, so the initiator picks the change up with a fresh offer.
    fn schedule_renegotiation(&self, slot: Arc<SessionSlot>) {
        let manager = self.this.clone();
        let delay = self.config.accept_offer_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let user_id = slot.user_id();
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if !manager.registry.is_current(user_id, &slot) {
                return;
            }
            if let Err(e) = manager.renegotiate(user_id).await {
                warn!(user_id, "renegotiation after remote toggle failed: {e}");
            }
        });
    }

    // ── E2E Encryption ──

    fn spawn_key_exchange(&self, slot: Arc<SessionSlot>, kind: KeyExchangeKind) {
        let manager = self.this.clone();
        tokio::spawn(async move {
            if let Some(manager) = manager.upgrade() {
                manager.run_key_exchange(&slot, kind).await;
            }
        });
    }

    async fn run_key_exchange(&self, slot: &Arc<SessionSlot>, kind: KeyExchangeKind) {
        let user_id = slot.user_id();
        if let Err(e) = self.exchange_key(slot).await {
            match kind {
                KeyExchangeKind::Initial => {
                    error!(user_id, "key exchange failed: {e}");
                    self.fail_call(slot, e.to_string()).await;
                }
                KeyExchangeKind::Rotation => {
                    warn!(user_id, "key rotation failed, keeping current key: {e}");
                }
            }
        }
    }

    /// Generate a fresh key, send it wrapped to the peer, then install it.
    async fn exchange_key(&self, slot: &Arc<SessionSlot>) -> Result<(), CallError> {
        let user_id = slot.user_id();
        let peer_key = self.keys.peer_key(user_id).await?;
        let key = self.keys.generate()?;
        let payload = self.keys.seal(&peer_key, &key, slot.session_id())?;

        let mut session = slot.lock().await;
        if !self.registry.is_current(user_id, slot) {
            debug!(user_id, "call ended during key exchange, discarding key");
            return Ok(());
        }
        let mut message = CallSignalingMessage::outbound(user_id, CallPayload::SessionKey(payload));
        message.session_key_hash = Some(key.fingerprint_hex());
        self.signaling.send(message).await?;
        self.install_key(slot, &mut session, key)
    }

    /// Rotate the key of an active call now. Initiator only.
    pub async fn rotate_key(&self, user_id: UserId) -> Result<(), CallError> {
        let slot = self.live_slot(user_id)?;
        {
            let session = slot.lock().await;
            if session.role != Role::Initiator || session.state != CallState::Active {
                return Err(CallError::InvalidState {
                    user_id,
                    state: session.state,
                    operation: "rotate the session key",
                });
            }
        }
        self.exchange_key(&slot).await
    }

    pub async fn on_session_key(
        &self,
        user_id: UserId,
        payload: WrappedKey,
        key_hash: Option<String>,
    ) -> Result<(), CallError> {
        let slot = self.live_slot(user_id)?;
        let had_key = {
            let session = slot.lock().await;
            if session.role == Role::Initiator {
                warn!(user_id, "session key from the responder ignored");
                return Err(CallError::KeyExchange("unexpected session key from responder".into()));
            }
            session.session_key.is_some()
        };

        let result = self.receive_key(&slot, &payload, key_hash.as_deref()).await;
        if let Err(e) = &result {
            if had_key {
                warn!(user_id, "rejected rotated key, keeping current key: {e}");
            } else {
                error!(user_id, "key exchange failed: {e}");
                self.fail_call(&slot, e.to_string()).await;
            }
        }
        result
    }

    async fn receive_key(
        &self,
        slot: &Arc<SessionSlot>,
        payload: &WrappedKey,
        key_hash: Option<&str>,
    ) -> Result<(), CallError> {
        let user_id = slot.user_id();
        let peer_key = self.keys.peer_key(user_id).await?;
        let key = self.keys.open(&peer_key, payload, slot.session_id(), key_hash)?;

        let mut session = slot.lock().await;
        if !self.registry.is_current(user_id, slot) {
            debug!(user_id, "call ended during key exchange, discarding key");
            return Ok(());
        }
        if session
            .session_key
            .as_ref()
            .is_some_and(|current| current.key_bytes() == key.key_bytes())
        {
            debug!(user_id, "replayed session key ignored");
            return Ok(());
        }
        self.install_key(slot, &mut session, key)
    }

    fn install_key(
        &self,
        slot: &Arc<SessionSlot>,
        session: &mut PeerSession,
        key: SessionKeyMaterial,
    ) -> Result<(), CallError> {
        let user_id = session.remote_user_id;
        let fingerprint = key.fingerprint_emoji();
        info!(user_id, fingerprint = %key.fingerprint_hex(), "session key installed");

        session.session_key = Some(key);
        session.key_epoch += 1;
        session.key_established_at = Some(tokio::time::Instant::now());
        session.key_watchdog = None;
        self.attach_transforms(session)?;

        if session.role == Role::Initiator && session.rotation.is_none() {
            session.rotation = Some(self.spawn_rotation(slot.clone()));
        }

        self.events.emit(CallEvent::KeyInstalled {
            user_id,
            fingerprint,
            epoch: session.key_epoch,
        });
        Ok(())
    }

    /// Bind a transform for the current key to every sender and receiver that
    /// does not have one for the current epoch yet.
    fn attach_transforms(&self, session: &mut PeerSession) -> Result<(), CallError> {
        let Some(key) = session.session_key.as_ref() else {
            return Ok(());
        };
        let epoch = session.key_epoch;
        let transport = session.transport.clone();

        let senders = transport.senders();
        session
            .bound_senders
            .retain(|id, _| senders.iter().any(|s| &s.track_id == id));
        for sender in &senders {
            if session.bound_senders.get(&sender.track_id) == Some(&epoch) {
                continue;
            }
            let encryptor = FrameEncryptor::new(key, session.session_id.clone())?;
            transport.attach_transform(&sender.track_id, FrameTransform::Encrypt(encryptor))?;
            session.bound_senders.insert(sender.track_id.clone(), epoch);
        }

        let receivers = transport.receivers();
        session
            .bound_receivers
            .retain(|id, _| receivers.iter().any(|r| &r.track_id == id));
        for receiver in &receivers {
            if session.bound_receivers.get(&receiver.track_id) == Some(&epoch) {
                continue;
            }
            let decryptor = FrameDecryptor::new(key, session.session_id.clone())?
                .with_replay_window(self.config.replay_window_ms);
            transport.attach_transform(&receiver.track_id, FrameTransform::Decrypt(decryptor))?;
            session.bound_receivers.insert(receiver.track_id.clone(), epoch);
        }

        debug!(
            user_id = session.remote_user_id,
            epoch,
            senders = senders.len(),
            receivers = receivers.len(),
            "frame transforms attached"
        );
        Ok(())
    }

    fn spawn_rotation(&self, slot: Arc<SessionSlot>) -> ScopedTask {
        let manager = self.this.clone();
        let interval = self.config.rotation_interval();
        ScopedTask::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.rotation_tick(&slot).await;
            }
        })
    }

    async fn rotation_tick(&self, slot: &Arc<SessionSlot>) {
        let user_id = slot.user_id();
        let active = {
            let session = slot.lock().await;
            self.registry.is_current(user_id, slot) && session.state == CallState::Active
        };
        if !active {
            debug!(user_id, "call not active, skipping key rotation");
            return;
        }
        info!(user_id, "rotating session key");
        self.run_key_exchange(slot, KeyExchangeKind::Rotation).await;
    }

    fn spawn_key_watchdog(&self, slot: Arc<SessionSlot>, limit: Duration) -> ScopedTask {
        let manager = self.this.clone();
        ScopedTask::spawn(async move {
            tokio::time::sleep(limit).await;
            // Ending the call drops this handle, so finish on a detached task.
            tokio::spawn(async move {
                if let Some(manager) = manager.upgrade() {
                    manager.expire_key_exchange(&slot).await;
                }
            });
        })
    }

    async fn expire_key_exchange(&self, slot: &Arc<SessionSlot>) {
        let user_id = slot.user_id();
        {
            let session = slot.lock().await;
            if !self.registry.is_current(user_id, slot) || session.session_key.is_some() {
                return;
            }
        }
        warn!(user_id, "no session key installed in time, ending call");
        self.fail_call(slot, CallError::Timeout("key exchange").to_string())
            .await;
    }

    // ── Transport events ──

    async fn handle_transport_event(&self, slot: &Arc<SessionSlot>, event: TransportEvent) {
        let user_id = slot.user_id();
        match event {
            TransportEvent::IceCandidate(candidate) => {
                if let Err(e) = self.send(user_id, CallPayload::IceCandidate(candidate)).await {
                    warn!(user_id, "failed to send ICE candidate: {e}");
                }
            }
            TransportEvent::ConnectionStateChanged(state) => {
                self.on_connection_state(slot, state).await;
            }
            TransportEvent::NegotiationNeeded => {
                if let Err(e) = self.renegotiate(user_id).await {
                    warn!(user_id, "renegotiation failed: {e}");
                }
            }
            TransportEvent::Track { track, stream } => {
                self.on_remote_track(slot, track, stream).await;
            }
            TransportEvent::FrameRejected {
                track_id,
                reason,
                consecutive_failures,
            } => {
                debug!(user_id, track_id = %track_id, consecutive_failures, "inbound frame dropped: {reason}");
                if let Some(threshold) = self.config.frame_failure_threshold {
                    if consecutive_failures >= threshold {
                        error!(user_id, track_id = %track_id, consecutive_failures, "too many rejected frames, ending call");
                        self.fail_call(
                            slot,
                            format!("{consecutive_failures} consecutive frames rejected: {reason}"),
                        )
                        .await;
                    }
                }
            }
        }
    }

    async fn on_connection_state(&self, slot: &Arc<SessionSlot>, state: ConnectionState) {
        let user_id = slot.user_id();
        match state {
            ConnectionState::Connected => {
                let mut session = slot.lock().await;
                if !self.registry.is_current(user_id, slot) {
                    return;
                }
                self.set_state(&mut session, CallState::Active);
                info!(user_id, "call connected");
                if session.session_key.is_none() && session.key_watchdog.is_none() {
                    if let Some(limit) = self.config.key_exchange_timeout() {
                        session.key_watchdog = Some(self.spawn_key_watchdog(slot.clone(), limit));
                    }
                }
            }
            ConnectionState::Disconnected => {
                info!(user_id, "transport disconnected, waiting for recovery");
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                warn!(user_id, ?state, "transport lost, ending call");
                self.end_slot(slot).await;
            }
            ConnectionState::New | ConnectionState::Connecting => {
                debug!(user_id, ?state, "transport state changed");
            }
        }
    }

    async fn on_remote_track(&self, slot: &Arc<SessionSlot>, track: Arc<dyn MediaTrack>, stream: MediaStream) {
        let user_id = slot.user_id();
        let mut session = slot.lock().await;
        if !self.registry.is_current(user_id, slot) {
            return;
        }

        match track.kind() {
            TrackKind::Audio => {
                session.remote_stream = Some(stream.clone());
                self.events.emit(CallEvent::RemoteStream {
                    user_id,
                    stream: Some(stream),
                });
            }
            TrackKind::Video => match session.routing.classify() {
                VideoRoute::Camera => self.events.emit(CallEvent::RemoteVideoStream {
                    user_id,
                    stream: Some(stream),
                }),
                VideoRoute::ScreenShare => self.events.emit(CallEvent::RemoteScreenShare {
                    user_id,
                    stream: Some(stream),
                }),
            },
        }

        if let Err(e) = self.attach_transforms(&mut session) {
            warn!(user_id, track_id = track.id(), "failed to attach receiver transform: {e}");
        }
    }

    // ── Ending ──

    /// Hang up: notify the peer, then tear the call down.
    pub async fn end_call(&self, user_id: UserId) -> Result<(), CallError> {
        let slot = self.live_slot(user_id)?;
        self.end_slot(&slot).await;
        Ok(())
    }

    /// End every live call, e.g. when the relay connection is lost.
    pub async fn end_all(&self) {
        for user_id in self.registry.user_ids() {
            if let Some(slot) = self.registry.live(user_id) {
                self.end_slot(&slot).await;
            }
        }
    }

    async fn fail_call(&self, slot: &Arc<SessionSlot>, reason: String) {
        self.events.emit(CallEvent::CallFailed {
            user_id: slot.user_id(),
            reason,
        });
        self.end_slot(slot).await;
    }

    /// Send exactly one `call_end` per call, then tear down.
    async fn end_slot(&self, slot: &Arc<SessionSlot>) {
        let user_id = slot.user_id();
        let notify = {
            let mut session = slot.lock().await;
            if slot.is_ended() || session.is_ending {
                false
            } else {
                session.is_ending = true;
                self.set_state(&mut session, CallState::Ending);
                true
            }
        };
        if notify {
            if let Err(e) = self.send(user_id, CallPayload::End).await {
                warn!(user_id, "failed to send call end: {e}");
            }
        }
        self.teardown_slot(slot).await;
    }

    /// Release everything the call holds. Safe to call more than once.
    pub async fn teardown(&self, user_id: UserId) {
        if let Some(slot) = self.registry.get(user_id) {
            self.teardown_slot(&slot).await;
        }
    }

    async fn teardown_slot(&self, slot: &Arc<SessionSlot>) {
        let user_id = slot.user_id();
        let transport = {
            let mut session = slot.lock().await;
            if !slot.mark_ended() {
                return;
            }
            self.registry.remove_if_same(user_id, slot);
            session.rotation = None;
            session.key_watchdog = None;
            for stream in session.take_owned_streams() {
                stream.stop_all();
            }
            session.remote_stream = None;
            session.session_key = None;
            session.pending_candidates.clear();
            session.bound_senders.clear();
            session.bound_receivers.clear();
            self.set_state(&mut session, CallState::Ended);
            session.transport.clone()
        };

        transport.close().await;

        self.events.emit(CallEvent::RemoteStream { user_id, stream: None });
        self.events.emit(CallEvent::RemoteVideoStream { user_id, stream: None });
        self.events.emit(CallEvent::RemoteScreenShare { user_id, stream: None });
        self.events.emit(CallEvent::LocalVideoStream { user_id, stream: None });
        self.events.emit(CallEvent::LocalScreenShare { user_id, stream: None });
        info!(user_id, "call torn down");
    }
}
