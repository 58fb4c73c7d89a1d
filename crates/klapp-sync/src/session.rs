use crate::error::AuthError;
use crate::remote::TimedClient;
use chrono::Utc;
use klapp_core::{Credentials, Session, SessionToken};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Owns the authenticated session. Logins are serialized, so concurrent callers
/// that find no live session share one login instead of racing.
pub struct SessionManager {
    client: TimedClient,
    credentials: Credentials,
    current: Mutex<Option<Session>>,
    logins: AtomicU64,
}

impl SessionManager {
    pub(crate) fn new(client: TimedClient, credentials: Credentials) -> Self {
        Self {
            client,
            credentials,
            current: Mutex::new(None),
            logins: AtomicU64::new(0),
        }
    }

    /// Returns the live session, logging in first when there is none or it expired.
    pub async fn ensure_session(&self) -> Result<Session, AuthError> {
        let mut current = self.current.lock().await;

        if let Some(session) = current.as_ref() {
            if !session.is_expired_at(Utc::now()) {
                return Ok(session.clone());
            }
            debug!("session expired; logging in again");
            *current = None;
        }

        self.logins.fetch_add(1, Ordering::Relaxed);
        match self.client.login(&self.credentials).await {
            Ok(grant) => {
                let session = Session::from_grant(grant, Utc::now());
                info!(email = %self.credentials.email, "logged in");
                *current = Some(session.clone());
                Ok(session)
            }
            Err(err) => {
                let err = AuthError::from_login(err);
                warn!(reason = ?err.reason, "login failed: {}", err.detail);
                Err(err)
            }
        }
    }

    /// Drops the live session unconditionally.
    pub async fn invalidate(&self) {
        if self.current.lock().await.take().is_some() {
            debug!("session invalidated");
        }
    }

    /// Drops the live session only if it still carries `token`. Returns whether
    /// anything was dropped; a newer session from a concurrent re-login survives.
    pub async fn invalidate_token(&self, token: &SessionToken) -> bool {
        let mut current = self.current.lock().await;
        let matches = current
            .as_ref()
            .is_some_and(|session| &session.token == token);
        if matches {
            *current = None;
            debug!("rejected session invalidated");
        }
        matches
    }

    pub async fn is_authenticated(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| !session.is_expired_at(Utc::now()))
    }

    /// Login attempts made so far.
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }
}
