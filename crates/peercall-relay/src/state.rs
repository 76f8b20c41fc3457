use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;

use peercall_protocol::codec::encode_server_msg;
use peercall_protocol::{CallSignalingMessage, IceServer, ServerMessage, UserId};

use crate::config::RelayConfig;

/// Simple token-bucket rate limiter.
pub struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume one token. Returns true if allowed, false if rate-limited.
    pub fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// An authenticated connection.
pub struct ConnectedUser {
    pub username: String,
    /// X25519 identity public key. Opaque to the relay, handed to peers on request.
    pub identity_key: Vec<u8>,
    /// Sender for pushing control messages to this user's writer task.
    pub tx: mpsc::Sender<Vec<u8>>,
    pub signal_rate: RateLimiter,
}

/// Outcome of forwarding a call signal.
#[derive(Debug, PartialEq, Eq)]
pub enum Forward {
    Delivered,
    /// The recipient is not connected (or its queue is gone).
    Undeliverable,
    RateLimited,
}

/// The shared relay state, designed for concurrent access.
pub struct RelayState {
    pub users: DashMap<UserId, ConnectedUser>,
    pub max_users: u32,
    pub ice_servers: Vec<IceServer>,
    signal_burst: u32,
    signal_rate: u32,
    /// Next user_id counter. Starts at 1; 0 marks an unstamped signal.
    next_user_id: AtomicU32,
}

impl RelayState {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            users: DashMap::new(),
            max_users: config.max_users,
            ice_servers: config.ice_servers.clone(),
            signal_burst: config.signal_burst,
            signal_rate: config.signal_rate,
            next_user_id: AtomicU32::new(1),
        }
    }

    pub fn next_user_id(&self) -> UserId {
        self.next_user_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn is_username_taken(&self, username: &str) -> bool {
        self.users
            .iter()
            .any(|entry| entry.value().username.eq_ignore_ascii_case(username))
    }

    /// Register an authenticated user and return its new id.
    pub fn register(&self, username: String, identity_key: Vec<u8>, tx: mpsc::Sender<Vec<u8>>) -> UserId {
        let user_id = self.next_user_id();
        self.users.insert(
            user_id,
            ConnectedUser {
                username,
                identity_key,
                tx,
                signal_rate: RateLimiter::new(self.signal_burst as f64, self.signal_rate as f64),
            },
        );
        user_id
    }

    pub fn remove(&self, user_id: UserId) -> Option<ConnectedUser> {
        self.users.remove(&user_id).map(|(_, user)| user)
    }

    pub fn public_key(&self, user_id: UserId) -> Option<Vec<u8>> {
        self.users.get(&user_id).map(|user| user.identity_key.clone())
    }

    /// Stamp `message` with its authenticated sender and queue it for the recipient.
    pub async fn forward_signal(&self, from: UserId, mut message: CallSignalingMessage) -> Forward {
        let allowed = self
            .users
            .get_mut(&from)
            .map(|mut user| user.signal_rate.try_consume())
            .unwrap_or(false);
        if !allowed {
            return Forward::RateLimited;
        }

        let Some(tx) = self.users.get(&message.to_user_id).map(|user| user.tx.clone()) else {
            return Forward::Undeliverable;
        };
        message.from_user_id = from;
        let Ok(data) = encode_server_msg(&ServerMessage::Signal { message }) else {
            return Forward::Undeliverable;
        };
        match tx.send(data).await {
            Ok(()) => Forward::Delivered,
            Err(_) => Forward::Undeliverable,
        }
    }

    /// Queue `msg` for every connected user.
    pub async fn broadcast(&self, msg: &ServerMessage) {
        let Ok(data) = encode_server_msg(msg) else {
            return;
        };
        let senders: Vec<_> = self.users.iter().map(|entry| entry.value().tx.clone()).collect();
        for tx in senders {
            let _ = tx.send(data.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peercall_protocol::codec::{decode_server_msg, try_decode_frame};
    use peercall_protocol::CallPayload;

    fn make_state() -> RelayState {
        RelayState::new(&RelayConfig::default())
    }

    fn add_user(state: &RelayState, username: &str) -> (UserId, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(16);
        (state.register(username.into(), vec![7; 32], tx), rx)
    }

    fn decode(data: Vec<u8>) -> ServerMessage {
        let mut buf = bytes::BytesMut::from(&data[..]);
        let payload = try_decode_frame(&mut buf).unwrap().unwrap();
        decode_server_msg(&payload).unwrap()
    }

    #[test]
    fn rate_limiter_fresh_allows() {
        let mut rl = RateLimiter::new(3.0, 1.0);
        assert!(rl.try_consume());
        assert!(rl.try_consume());
        assert!(rl.try_consume());
    }

    #[test]
    fn rate_limiter_exhausted_denies() {
        let mut rl = RateLimiter::new(1.0, 0.0);
        assert!(rl.try_consume());
        assert!(!rl.try_consume());
    }

    #[test]
    fn ids_start_at_one() {
        let state = make_state();
        let (first, _rx1) = add_user(&state, "alice");
        let (second, _rx2) = add_user(&state, "bob");
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(state.user_count(), 2);
    }

    #[test]
    fn username_taken_ignores_case() {
        let state = make_state();
        let (_id, _rx) = add_user(&state, "Alice");
        assert!(state.is_username_taken("alice"));
        assert!(!state.is_username_taken("bob"));
    }

    #[tokio::test]
    async fn forward_stamps_sender() {
        let state = make_state();
        let (alice, _rx_a) = add_user(&state, "alice");
        let (bob, mut rx_b) = add_user(&state, "bob");

        let mut spoofed = CallSignalingMessage::outbound(bob, CallPayload::Accept);
        spoofed.from_user_id = 99;
        assert_eq!(state.forward_signal(alice, spoofed).await, Forward::Delivered);

        match decode(rx_b.recv().await.unwrap()) {
            ServerMessage::Signal { message } => {
                assert_eq!(message.from_user_id, alice);
                assert_eq!(message.to_user_id, bob);
            }
            other => panic!("expected signal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forward_to_offline_user() {
        let state = make_state();
        let (alice, _rx) = add_user(&state, "alice");
        let message = CallSignalingMessage::outbound(42, CallPayload::End);
        assert_eq!(state.forward_signal(alice, message).await, Forward::Undeliverable);
    }

    #[tokio::test]
    async fn forward_rate_limited() {
        let config = RelayConfig {
            signal_burst: 1,
            signal_rate: 0,
            ..RelayConfig::default()
        };
        let state = RelayState::new(&config);
        let (alice, _rx_a) = add_user(&state, "alice");
        let (bob, _rx_b) = add_user(&state, "bob");

        let message = CallSignalingMessage::outbound(bob, CallPayload::End);
        assert_eq!(state.forward_signal(alice, message.clone()).await, Forward::Delivered);
        assert_eq!(state.forward_signal(alice, message).await, Forward::RateLimited);
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone() {
        let state = make_state();
        let (_a, mut rx_a) = add_user(&state, "alice");
        let (_b, mut rx_b) = add_user(&state, "bob");
        state
            .broadcast(&ServerMessage::ServerShutdown {
                reason: "bye".into(),
            })
            .await;
        for rx in [&mut rx_a, &mut rx_b] {
            assert!(matches!(
                decode(rx.recv().await.unwrap()),
                ServerMessage::ServerShutdown { .. }
            ));
        }
    }

    #[test]
    fn remove_forgets_key() {
        let state = make_state();
        let (alice, _rx) = add_user(&state, "alice");
        assert_eq!(state.public_key(alice), Some(vec![7; 32]));
        assert!(state.remove(alice).is_some());
        assert_eq!(state.public_key(alice), None);
    }
}
