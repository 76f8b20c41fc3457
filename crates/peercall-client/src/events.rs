//! Observer events published by the call manager.
//!
//! Consumers (a UI, a test harness) receive [`CallEvent`]s over an unbounded
//! channel. Sending never blocks and a dropped receiver is ignored.

use peercall_protocol::UserId;
use tokio::sync::mpsc;

use crate::media::MediaStream;

/// Lifecycle of one call. Transitions only move forward in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallState {
    Idle,
    Inviting,
    Ringing,
    Connecting,
    Active,
    Ending,
    Ended,
}

impl CallState {
    /// Whether the call still holds resources.
    pub fn is_live(self) -> bool {
        self < CallState::Ending
    }
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    CallStateChanged {
        user_id: UserId,
        state: CallState,
    },
    IncomingCall {
        user_id: UserId,
        username: String,
        video: bool,
    },
    /// Remote audio. `None` once the call is torn down.
    RemoteStream {
        user_id: UserId,
        stream: Option<MediaStream>,
    },
    LocalVideoStream {
        user_id: UserId,
        stream: Option<MediaStream>,
    },
    RemoteVideoStream {
        user_id: UserId,
        stream: Option<MediaStream>,
    },
    LocalScreenShare {
        user_id: UserId,
        stream: Option<MediaStream>,
    },
    RemoteScreenShare {
        user_id: UserId,
        stream: Option<MediaStream>,
    },
    /// The remote side announced screen share on or off.
    ScreenShareStateChanged {
        user_id: UserId,
        active: bool,
    },
    /// The remote side announced camera video on or off.
    RemoteVideoStateChanged {
        user_id: UserId,
        enabled: bool,
    },
    /// A session key was installed. `fingerprint` is the emoji rendering both
    /// sides can compare out of band.
    KeyInstalled {
        user_id: UserId,
        fingerprint: String,
        epoch: u64,
    },
    CallFailed {
        user_id: UserId,
        reason: String,
    },
}

/// Cloneable publishing half of the event channel.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<CallEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: CallEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered() {
        assert!(CallState::Idle < CallState::Inviting);
        assert!(CallState::Ringing < CallState::Connecting);
        assert!(CallState::Active < CallState::Ending);
        assert!(CallState::Active.is_live());
        assert!(!CallState::Ending.is_live());
        assert!(!CallState::Ended.is_live());
    }

    #[tokio::test]
    async fn emit_after_receiver_dropped_is_silent() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(CallEvent::CallFailed {
            user_id: 1,
            reason: "x".into(),
        });
        assert!(matches!(rx.recv().await, Some(CallEvent::CallFailed { user_id: 1, .. })));
        drop(rx);
        sink.emit(CallEvent::CallStateChanged {
            user_id: 1,
            state: CallState::Ended,
        });
        EventSink::disabled().emit(CallEvent::CallFailed {
            user_id: 2,
            reason: "y".into(),
        });
    }
}
