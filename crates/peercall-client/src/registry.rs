//! Registry of live calls, keyed by remote user id.
//!
//! Each call lives in a [`SessionSlot`]: an async mutex around the
//! [`PeerSession`] so same-call operations serialize, plus an `ended` flag so
//! work that resumes after an await can tell the call was torn down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use peercall_protocol::UserId;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::CallError;
use crate::session::PeerSession;

pub struct SessionSlot {
    user_id: UserId,
    session_id: String,
    session: Mutex<PeerSession>,
    ended: AtomicBool,
}

impl SessionSlot {
    fn new(session: PeerSession) -> Self {
        Self {
            user_id: session.remote_user_id,
            session_id: session.session_id.clone(),
            session: Mutex::new(session),
            ended: AtomicBool::new(false),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn lock(&self) -> MutexGuard<'_, PeerSession> {
        self.session.lock().await
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Returns `true` only for the first caller.
    pub(crate) fn mark_ended(&self) -> bool {
        !self.ended.swap(true, Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<UserId, Arc<SessionSlot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: UserId) -> Option<Arc<SessionSlot>> {
        self.sessions.get(&user_id).map(|slot| slot.clone())
    }

    /// The live slot for `user_id`, if any.
    pub fn live(&self, user_id: UserId) -> Option<Arc<SessionSlot>> {
        self.get(user_id).filter(|slot| !slot.is_ended())
    }

    /// Register a new call. An ended slot for the same user is replaced.
    pub fn insert(&self, session: PeerSession) -> Result<Arc<SessionSlot>, CallError> {
        let user_id = session.remote_user_id;
        match self.sessions.entry(user_id) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_ended() {
                    return Err(CallError::SessionExists(user_id));
                }
                let slot = Arc::new(SessionSlot::new(session));
                entry.insert(slot.clone());
                Ok(slot)
            }
            Entry::Vacant(entry) => {
                let slot = Arc::new(SessionSlot::new(session));
                entry.insert(slot.clone());
                Ok(slot)
            }
        }
    }

    /// Whether `slot` is still the registered, live call for `user_id`.
    pub fn is_current(&self, user_id: UserId, slot: &Arc<SessionSlot>) -> bool {
        !slot.is_ended()
            && self
                .sessions
                .get(&user_id)
                .is_some_and(|current| Arc::ptr_eq(&current, slot))
    }

    /// Remove `slot` if it is still the one registered for `user_id`.
    pub fn remove_if_same(&self, user_id: UserId, slot: &Arc<SessionSlot>) -> bool {
        self.sessions
            .remove_if(&user_id, |_, current| Arc::ptr_eq(current, slot))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn user_ids(&self) -> Vec<UserId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }
}
