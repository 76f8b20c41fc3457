use async_trait::async_trait;
use dashmap::DashMap;
use peercall_crypto::PublicKeyBytes;
use peercall_protocol::{IceServer, UserId};

use crate::error::CallError;

/// Lookups a call needs from outside: ICE servers and peers' identity keys.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn fetch_ice_servers(&self) -> Result<Vec<IceServer>, CallError>;
    async fn fetch_public_key(&self, user_id: UserId) -> Result<PublicKeyBytes, CallError>;
}

/// A fixed in-memory directory.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    ice_servers: Vec<IceServer>,
    keys: DashMap<UserId, PublicKeyBytes>,
}

impl StaticDirectory {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self {
            ice_servers,
            keys: DashMap::new(),
        }
    }

    pub fn insert_key(&self, user_id: UserId, key: PublicKeyBytes) {
        self.keys.insert(user_id, key);
    }

    pub fn remove_key(&self, user_id: UserId) {
        self.keys.remove(&user_id);
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn fetch_ice_servers(&self) -> Result<Vec<IceServer>, CallError> {
        if self.ice_servers.is_empty() {
            return Err(CallError::Transport("no ICE servers configured".into()));
        }
        Ok(self.ice_servers.clone())
    }

    async fn fetch_public_key(&self, user_id: UserId) -> Result<PublicKeyBytes, CallError> {
        self.keys
            .get(&user_id)
            .map(|k| *k)
            .ok_or_else(|| CallError::KeyExchange(format!("no identity key for user {user_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_lookup() {
        let dir = StaticDirectory::new(vec![IceServer::stun("stun:example.org:3478")]);
        dir.insert_key(3, [9u8; 32]);

        assert_eq!(dir.fetch_ice_servers().await.unwrap().len(), 1);
        assert_eq!(dir.fetch_public_key(3).await.unwrap(), [9u8; 32]);
        assert!(matches!(dir.fetch_public_key(4).await, Err(CallError::KeyExchange(_))));

        dir.remove_key(3);
        assert!(dir.fetch_public_key(3).await.is_err());
    }

    #[tokio::test]
    async fn empty_ice_list_is_an_error() {
        let dir = StaticDirectory::default();
        assert!(dir.fetch_ice_servers().await.is_err());
    }
}
