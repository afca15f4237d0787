//! Storage contract for sessions and pending authorization requests.

use std::sync::Arc;

use async_trait::async_trait;
use smol_str::SmolStr;

use selvage_common::Did;
use selvage_common::store::{FileStore, MemoryStore, StateStore, StateStoreError};

use crate::session::{AuthRequestState, ClientSession};

/// Storage a client needs: durable credential sessions keyed by DID, and
/// (possibly ephemeral) pending authorization requests keyed by their
/// anti-CSRF state.
#[async_trait]
pub trait ClientAuthStore: Send + Sync {
    async fn get_session(&self, did: &Did) -> Result<Option<ClientSession>, StateStoreError>;

    async fn upsert_session(&self, session: ClientSession) -> Result<(), StateStoreError>;

    async fn delete_session(&self, did: &Did) -> Result<(), StateStoreError>;

    async fn get_auth_request(
        &self,
        state: &str,
    ) -> Result<Option<AuthRequestState>, StateStoreError>;

    async fn save_auth_request(&self, request: &AuthRequestState)
    -> Result<(), StateStoreError>;

    async fn delete_auth_request(&self, state: &str) -> Result<(), StateStoreError>;
}

#[async_trait]
impl<T: ClientAuthStore> ClientAuthStore for Arc<T> {
    async fn get_session(&self, did: &Did) -> Result<Option<ClientSession>, StateStoreError> {
        self.as_ref().get_session(did).await
    }
    async fn upsert_session(&self, session: ClientSession) -> Result<(), StateStoreError> {
        self.as_ref().upsert_session(session).await
    }
    async fn delete_session(&self, did: &Did) -> Result<(), StateStoreError> {
        self.as_ref().delete_session(did).await
    }
    async fn get_auth_request(
        &self,
        state: &str,
    ) -> Result<Option<AuthRequestState>, StateStoreError> {
        self.as_ref().get_auth_request(state).await
    }
    async fn save_auth_request(
        &self,
        request: &AuthRequestState,
    ) -> Result<(), StateStoreError> {
        self.as_ref().save_auth_request(request).await
    }
    async fn delete_auth_request(&self, state: &str) -> Result<(), StateStoreError> {
        self.as_ref().delete_auth_request(state).await
    }
}

/// Bridge so the single-flight getter can treat any [`ClientAuthStore`]
/// as a plain session map.
#[async_trait]
impl<T: ClientAuthStore> StateStore<Did, ClientSession> for Arc<T> {
    async fn get(&self, key: &Did) -> Option<ClientSession> {
        self.as_ref().get_session(key).await.ok().flatten()
    }
    async fn set(&self, _key: Did, session: ClientSession) -> Result<(), StateStoreError> {
        self.as_ref().upsert_session(session).await
    }
    async fn del(&self, key: &Did) -> Result<(), StateStoreError> {
        self.as_ref().delete_session(key).await
    }
}

/// Fully in-memory store; sessions do not survive a restart. Suitable
/// for tests and short-lived tools.
#[derive(Clone, Default)]
pub struct MemoryAuthStore {
    sessions: MemoryStore<Did, ClientSession>,
    requests: MemoryStore<SmolStr, AuthRequestState>,
}

#[async_trait]
impl ClientAuthStore for MemoryAuthStore {
    async fn get_session(&self, did: &Did) -> Result<Option<ClientSession>, StateStoreError> {
        Ok(self.sessions.get(did).await)
    }
    async fn upsert_session(&self, session: ClientSession) -> Result<(), StateStoreError> {
        self.sessions.set(session.account_did.clone(), session).await
    }
    async fn delete_session(&self, did: &Did) -> Result<(), StateStoreError> {
        self.sessions.del(did).await
    }
    async fn get_auth_request(
        &self,
        state: &str,
    ) -> Result<Option<AuthRequestState>, StateStoreError> {
        Ok(self.requests.get(&SmolStr::new(state)).await)
    }
    async fn save_auth_request(
        &self,
        request: &AuthRequestState,
    ) -> Result<(), StateStoreError> {
        self.requests.set(request.state.clone(), request.clone()).await
    }
    async fn delete_auth_request(&self, state: &str) -> Result<(), StateStoreError> {
        self.requests.del(&SmolStr::new(state)).await
    }
}

/// Sessions persisted to a JSON file (durable across restarts, as
/// credential sessions must be); pending authorization requests stay in
/// memory, which is all their lifecycle needs.
#[derive(Clone)]
pub struct FileAuthStore {
    sessions: FileStore,
    requests: MemoryStore<SmolStr, AuthRequestState>,
}

impl FileAuthStore {
    /// Store sessions at the given JSON file path.
    pub fn new(path: impl AsRef<std::path::Path>) -> Self {
        Self {
            sessions: FileStore::new(path),
            requests: MemoryStore::default(),
        }
    }

    /// Remove every persisted session.
    pub async fn clear_sessions(&self) -> Result<(), StateStoreError> {
        StateStore::<Did, ClientSession>::clear(&self.sessions).await
    }
}

#[async_trait]
impl ClientAuthStore for FileAuthStore {
    async fn get_session(&self, did: &Did) -> Result<Option<ClientSession>, StateStoreError> {
        Ok(StateStore::<Did, ClientSession>::get(&self.sessions, did).await)
    }
    async fn upsert_session(&self, session: ClientSession) -> Result<(), StateStoreError> {
        StateStore::<Did, ClientSession>::set(
            &self.sessions,
            session.account_did.clone(),
            session,
        )
        .await
    }
    async fn delete_session(&self, did: &Did) -> Result<(), StateStoreError> {
        StateStore::<Did, ClientSession>::del(&self.sessions, did).await
    }
    async fn get_auth_request(
        &self,
        state: &str,
    ) -> Result<Option<AuthRequestState>, StateStoreError> {
        Ok(self.requests.get(&SmolStr::new(state)).await)
    }
    async fn save_auth_request(
        &self,
        request: &AuthRequestState,
    ) -> Result<(), StateStoreError> {
        self.requests.set(request.state.clone(), request.clone()).await
    }
    async fn delete_auth_request(&self, state: &str) -> Result<(), StateStoreError> {
        self.requests.del(&SmolStr::new(state)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TokenSet, TokenType};
    use url::Url;

    fn session(did: &str, access: &str) -> ClientSession {
        ClientSession {
            account_did: Did::new(did).unwrap(),
            host_url: Url::parse("https://pds.example.org").unwrap(),
            authserver_issuer: "https://issuer.example".into(),
            dpop_key: crate::keys::generate_key(&["ES256".into()]).unwrap(),
            dpop_authserver_nonce: Some("n1".into()),
            dpop_host_nonce: None,
            token_set: TokenSet {
                iss: "https://issuer.example".into(),
                sub: Did::new(did).unwrap(),
                aud: "https://pds.example.org".into(),
                scope: Some("atproto".into()),
                refresh_token: Some("rt".into()),
                access_token: access.into(),
                token_type: TokenType::DPoP,
                expires_at: None,
            },
        }
    }

    fn auth_request(state: &str) -> AuthRequestState {
        AuthRequestState {
            state: state.into(),
            authserver_url: Url::parse("https://issuer.example").unwrap(),
            dpop_key: crate::keys::generate_key(&["ES256".into()]).unwrap(),
            dpop_authserver_nonce: None,
            pkce_verifier: "verifier".into(),
            redirect_uri: Url::parse("http://127.0.0.1/").unwrap(),
            app_state: None,
        }
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryAuthStore::default();
        let alice = session("did:plc:alice", "at1");
        store.upsert_session(alice.clone()).await.unwrap();
        assert_eq!(
            store.get_session(&alice.account_did).await.unwrap(),
            Some(alice.clone())
        );

        store.save_auth_request(&auth_request("s1")).await.unwrap();
        assert!(store.get_auth_request("s1").await.unwrap().is_some());
        store.delete_auth_request("s1").await.unwrap();
        assert!(store.get_auth_request("s1").await.unwrap().is_none());

        store.delete_session(&alice.account_did).await.unwrap();
        assert_eq!(store.get_session(&alice.account_did).await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_sessions_survive_reopen() {
        let mut path = std::env::temp_dir();
        path.push(format!("selvage-authstore-{}.json", std::process::id()));

        let store = FileAuthStore::new(&path);
        store.clear_sessions().await.unwrap();
        let alice = session("did:plc:alice", "at1");
        store.upsert_session(alice.clone()).await.unwrap();

        // the DPoP key round-trips through serialization with the session
        let reopened = FileAuthStore::new(&path);
        let loaded = reopened
            .get_session(&alice.account_did)
            .await
            .unwrap()
            .expect("session persisted");
        assert_eq!(loaded, alice);

        // replacement is whole-object
        let updated = session("did:plc:alice", "at2");
        reopened.upsert_session(updated.clone()).await.unwrap();
        assert_eq!(
            reopened
                .get_session(&alice.account_did)
                .await
                .unwrap()
                .unwrap()
                .token_set
                .access_token,
            "at2"
        );

        store.clear_sessions().await.unwrap();
    }
}
