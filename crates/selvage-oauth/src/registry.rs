//! The per-subject session registry: single-flight refresh, staleness
//! with jitter, lifecycle events, and the single-use-token race
//! recovery.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use url::Url;

use selvage_common::Did;
use selvage_common::lock::ProcessLock;

use crate::authstore::ClientAuthStore;
use crate::discovery::ServerDiscovery;
use crate::dpop::DpopEngine;
use crate::error::OAuthError;
use crate::getter::{CachedGetter, GetOptions, Loader};
use crate::request::{refresh_token_grant, revoke_token};
use crate::session::ClientSession;
use crate::types::{ClientConfig, TokenSet};

/// Seconds before expiry at which a token is treated as stale.
const STALE_BUFFER_SECS: i64 = 30;
/// Upper bound on the random component added to the buffer. The jitter
/// desynchronizes refreshes from independent processes that woke up at
/// the same moment.
const STALE_JITTER_SECS: i64 = 30;

/// Why a session left the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteCause {
    /// The user signed out (or the application revoked the session)
    SignedOut,
    /// An unrecoverable refresh failure (e.g. the refresh token was
    /// rejected and no concurrent winner was found)
    RefreshFailed,
    /// The resource server rejected a token that had just been refreshed
    TokenRejected,
    /// The stored entry's subject did not match its storage key
    SubjectMismatch,
}

/// Lifecycle notifications. Fired exactly once per transition, after the
/// corresponding store write, never before.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// A session was created or its tokens replaced
    Updated {
        did: Did,
        token_set: TokenSet,
    },
    /// A session left the store; the application should route the user
    /// to an unauthenticated state
    Deleted {
        did: Did,
        cause: DeleteCause,
    },
}

struct SessionLoader<T, S> {
    client: Arc<T>,
    store: Arc<S>,
    config: ClientConfig,
    events: broadcast::Sender<SessionEvent>,
}

#[async_trait]
impl<T, S> Loader<Did, ClientSession> for SessionLoader<T, S>
where
    T: ServerDiscovery + Send + Sync + 'static,
    S: ClientAuthStore + 'static,
{
    async fn load(
        &self,
        did: &Did,
        stored: Option<ClientSession>,
    ) -> Result<ClientSession, OAuthError> {
        let Some(session) = stored else {
            return Err(OAuthError::SessionNotFound(did.clone()));
        };
        if &session.token_set.sub != did || &session.account_did != did {
            return Err(OAuthError::SubjectMismatch {
                expected: did.clone(),
                found: session.token_set.sub.clone(),
            });
        }

        let issuer = Url::parse(&session.authserver_issuer)?;
        let metadata = self.client.get_authorization_server_metadata(&issuer).await?;
        let attempted = session.token_set.clone();

        match refresh_token_grant(self.client.as_ref(), &self.config, &metadata, session).await {
            Ok(refreshed) => Ok(refreshed),
            Err(error) if error.is_invalid_grant() => {
                // Refresh tokens are single-use. Another process (or
                // device) may have raced us to this one and already
                // stored the replacement; re-read before declaring the
                // session dead.
                if let Some(current) = self.store.get_session(did).await? {
                    if current.token_set.access_token != attempted.access_token
                        || current.token_set.refresh_token != attempted.refresh_token
                    {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(%did, "concurrent refresh won the race; adopting its tokens");
                        return Ok(current);
                    }
                }
                Err(error.into())
            }
            Err(error) => Err(error.into()),
        }
    }

    fn is_stale(&self, _did: &Did, session: &ClientSession) -> bool {
        let Some(expires_at) = session.token_set.expires_at else {
            return false;
        };
        let jitter = rand::thread_rng().gen_range(0..=STALE_JITTER_SECS);
        Utc::now() + TimeDelta::seconds(STALE_BUFFER_SECS + jitter) >= expires_at
    }

    fn should_delete(&self, _did: &Did, error: &OAuthError) -> bool {
        match error.as_root() {
            OAuthError::Request(e) => e.is_invalid_grant(),
            OAuthError::SubjectMismatch { .. } => true,
            _ => false,
        }
    }

    async fn on_updated(&self, did: &Did, session: &ClientSession) {
        let _ = self.events.send(SessionEvent::Updated {
            did: did.clone(),
            token_set: session.token_set.clone(),
        });
    }

    async fn on_deleted(&self, did: &Did, error: &OAuthError) {
        let cause = match error.as_root() {
            OAuthError::SubjectMismatch { .. } => DeleteCause::SubjectMismatch,
            _ => DeleteCause::RefreshFailed,
        };
        let _ = self.events.send(SessionEvent::Deleted {
            did: did.clone(),
            cause,
        });
    }
}

/// Maps subject DIDs to credential sessions, coordinating refresh across
/// concurrent callers (and, with a lock or via store reconciliation,
/// across processes).
pub struct SessionRegistry<T, S>
where
    T: ServerDiscovery + Send + Sync + 'static,
    S: ClientAuthStore + 'static,
{
    store: Arc<S>,
    client: Arc<T>,
    config: ClientConfig,
    getter: CachedGetter<Did, ClientSession, Arc<S>, SessionLoader<T, S>>,
    events: broadcast::Sender<SessionEvent>,
}

impl<T, S> SessionRegistry<T, S>
where
    T: ServerDiscovery + Send + Sync + 'static,
    S: ClientAuthStore + 'static,
{
    pub fn new(store: S, client: Arc<T>, config: ClientConfig) -> Self {
        let store = Arc::new(store);
        let (events, _) = broadcast::channel(32);
        let loader = Arc::new(SessionLoader {
            client: client.clone(),
            store: store.clone(),
            config: config.clone(),
            events: events.clone(),
        });
        let getter = CachedGetter::new(store.clone(), loader);
        Self {
            store,
            client,
            config,
            getter,
            events,
        }
    }

    /// Serialize get-or-refresh across processes with a named lock. The
    /// invalid-grant reconciliation stays active regardless; other
    /// devices may share the store without sharing the lock.
    pub fn with_lock(mut self, lock: Arc<dyn ProcessLock>) -> Self {
        self.getter = self.getter.with_lock(lock);
        self
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn client(&self) -> &Arc<T> {
        &self.client
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Fetch the session for `did`, refreshing per `options`.
    ///
    /// The subject invariant is enforced on every path: a stored entry
    /// whose subject disagrees with its key is deleted (observably) and
    /// reported as an error.
    pub async fn get(&self, did: &Did, options: GetOptions) -> Result<ClientSession, OAuthError> {
        let session = self.getter.get(did, options).await?;
        if &session.token_set.sub != did || &session.account_did != did {
            let found = session.token_set.sub.clone();
            self.del(did, DeleteCause::SubjectMismatch).await?;
            return Err(OAuthError::SubjectMismatch {
                expected: did.clone(),
                found,
            });
        }
        Ok(session)
    }

    /// Persist a session (whole-object replacement) and announce it.
    pub async fn set(&self, session: ClientSession) -> Result<(), OAuthError> {
        if session.account_did != session.token_set.sub {
            return Err(OAuthError::SubjectMismatch {
                expected: session.account_did.clone(),
                found: session.token_set.sub.clone(),
            });
        }
        let did = session.account_did.clone();
        let token_set = session.token_set.clone();
        self.store.upsert_session(session).await?;
        let _ = self.events.send(SessionEvent::Updated { did, token_set });
        Ok(())
    }

    /// Delete a session and announce why.
    pub async fn del(&self, did: &Did, cause: DeleteCause) -> Result<(), OAuthError> {
        self.store.delete_session(did).await?;
        let _ = self.events.send(SessionEvent::Deleted {
            did: did.clone(),
            cause,
        });
        Ok(())
    }

    /// Best-effort revocation at the authorization server, then
    /// unconditional local deletion.
    ///
    /// Revocation failures (offline, server gone) are swallowed: a
    /// session the user asked to end must never linger because the
    /// network was unlucky.
    pub async fn revoke(&self, did: &Did) -> Result<(), OAuthError> {
        if let Ok(Some(session)) = self.store.get_session(did).await {
            let revocation = async {
                let issuer = Url::parse(&session.authserver_issuer)?;
                let metadata = self.client.get_authorization_server_metadata(&issuer).await?;
                let engine = DpopEngine::new(session.dpop_key.clone());
                if let (Some(nonce), Ok(endpoint)) = (
                    &session.dpop_authserver_nonce,
                    Url::parse(&metadata.token_endpoint),
                ) {
                    engine.seed_nonce(&endpoint, nonce.clone());
                }
                revoke_token(
                    self.client.as_ref(),
                    &engine,
                    &self.config,
                    &metadata,
                    &session.token_set.access_token,
                )
                .await?;
                Ok::<_, OAuthError>(())
            };
            if let Err(_revoke_error) = revocation.await {
                #[cfg(feature = "tracing")]
                tracing::debug!(%did, error = %_revoke_error, "best-effort revocation failed");
            }
        }
        self.del(did, DeleteCause::SignedOut).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_expiry(expires_at: Option<chrono::DateTime<Utc>>) -> ClientSession {
        ClientSession {
            account_did: Did::new("did:plc:alice").unwrap(),
            host_url: Url::parse("https://pds.example.org").unwrap(),
            authserver_issuer: "https://issuer.example".into(),
            dpop_key: crate::keys::generate_key(&["ES256".into()]).unwrap(),
            dpop_authserver_nonce: None,
            dpop_host_nonce: None,
            token_set: TokenSet {
                iss: "https://issuer.example".into(),
                sub: Did::new("did:plc:alice").unwrap(),
                aud: "https://pds.example.org".into(),
                scope: None,
                refresh_token: Some("rt1".into()),
                access_token: "at1".into(),
                token_type: crate::types::TokenType::DPoP,
                expires_at,
            },
        }
    }

    fn loader() -> SessionLoader<selvage_identity::PublicResolver, crate::authstore::MemoryAuthStore>
    {
        let (events, _) = broadcast::channel(4);
        SessionLoader {
            client: Arc::new(selvage_identity::PublicResolver::default()),
            store: Arc::new(crate::authstore::MemoryAuthStore::default()),
            config: ClientConfig::localhost(None, "atproto").unwrap(),
            events,
        }
    }

    #[test]
    fn no_expiry_is_never_stale() {
        let loader = loader();
        let session = session_with_expiry(None);
        let did = session.account_did.clone();
        for _ in 0..32 {
            assert!(!loader.is_stale(&did, &session));
        }
    }

    #[test]
    fn expired_token_is_always_stale() {
        let loader = loader();
        let session = session_with_expiry(Some(Utc::now() - TimeDelta::seconds(1)));
        let did = session.account_did.clone();
        for _ in 0..32 {
            assert!(loader.is_stale(&did, &session), "past expiry must be stale");
        }
    }

    #[test]
    fn distant_expiry_is_never_stale_despite_jitter() {
        let loader = loader();
        let session = session_with_expiry(Some(Utc::now() + TimeDelta::hours(1)));
        let did = session.account_did.clone();
        for _ in 0..32 {
            assert!(!loader.is_stale(&did, &session));
        }
    }

    #[test]
    fn near_expiry_falls_in_the_buffer() {
        let loader = loader();
        // 10s out is inside the 30s buffer regardless of jitter
        let session = session_with_expiry(Some(Utc::now() + TimeDelta::seconds(10)));
        let did = session.account_did.clone();
        assert!(loader.is_stale(&did, &session));
    }
}
