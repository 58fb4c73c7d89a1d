//! In-memory backend used by the engine tests.

use async_trait::async_trait;
use klapp_client::{ClientError, RemoteClient};
use klapp_core::{Credentials, LoginGrant, RemoteMessage, SessionToken};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// One-shot override for the next call of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scripted {
    InvalidCredentials,
    Unauthorized,
    ServerError,
    NotFound,
    /// Never answers; the caller's deadline has to fire.
    Stall,
    /// Answers success without touching the inbox.
    Ignore,
}

impl Scripted {
    fn into_error(self, subject: &str) -> ClientError {
        match self {
            Self::InvalidCredentials => ClientError::InvalidCredentials,
            Self::Unauthorized => ClientError::Unauthorized,
            Self::NotFound => ClientError::NotFound(subject.to_string()),
            Self::ServerError | Self::Stall | Self::Ignore => ClientError::UnexpectedStatus(503),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeClient {
    inbox: Mutex<Vec<RemoteMessage>>,
    active_token: Mutex<Option<SessionToken>>,
    login_script: Mutex<VecDeque<Scripted>>,
    fetch_script: Mutex<VecDeque<Scripted>>,
    mark_script: Mutex<VecDeque<Scripted>>,
    login_delay: Mutex<Option<Duration>>,
    fetch_gate: Mutex<Option<Arc<Notify>>>,
    fetch_times: Mutex<Vec<Instant>>,
    marks: Mutex<Vec<Vec<String>>>,
    logins: AtomicUsize,
    fetches_in_flight: AtomicUsize,
    max_fetches_in_flight: AtomicUsize,
}

impl FakeClient {
    pub(crate) fn with_inbox(messages: Vec<RemoteMessage>) -> Arc<Self> {
        let fake = Self::default();
        *fake.inbox.lock().unwrap() = messages;
        Arc::new(fake)
    }

    pub(crate) fn push_message(&self, message: RemoteMessage) {
        self.inbox.lock().unwrap().insert(0, message);
    }

    pub(crate) fn remove_message(&self, id: &str) {
        self.inbox.lock().unwrap().retain(|message| message.id != id);
    }

    pub(crate) fn is_read_upstream(&self, id: &str) -> bool {
        self.inbox
            .lock()
            .unwrap()
            .iter()
            .find(|message| message.id == id)
            .is_some_and(|message| message.read)
    }

    pub(crate) fn script_login(&self, step: Scripted) {
        self.login_script.lock().unwrap().push_back(step);
    }

    pub(crate) fn script_fetch(&self, step: Scripted) {
        self.fetch_script.lock().unwrap().push_back(step);
    }

    pub(crate) fn script_mark(&self, step: Scripted) {
        self.mark_script.lock().unwrap().push_back(step);
    }

    pub(crate) fn set_login_delay(&self, delay: Duration) {
        *self.login_delay.lock().unwrap() = Some(delay);
    }

    /// Server-side session expiry: every issued token stops working.
    pub(crate) fn revoke_sessions(&self) {
        *self.active_token.lock().unwrap() = None;
    }

    /// Makes fetches wait until the returned gate is notified once per fetch.
    pub(crate) fn hold_fetches(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.fetch_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub(crate) fn login_calls(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.fetch_times.lock().unwrap().len()
    }

    pub(crate) fn fetch_times(&self) -> Vec<Instant> {
        self.fetch_times.lock().unwrap().clone()
    }

    pub(crate) fn fetches_in_flight(&self) -> usize {
        self.fetches_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn max_fetches_in_flight(&self) -> usize {
        self.max_fetches_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_requests(&self) -> Vec<Vec<String>> {
        self.marks.lock().unwrap().clone()
    }

    fn next(script: &Mutex<VecDeque<Scripted>>) -> Option<Scripted> {
        script.lock().unwrap().pop_front()
    }

    fn check_token(&self, token: &SessionToken) -> Result<(), ClientError> {
        match self.active_token.lock().unwrap().as_ref() {
            Some(active) if active == token => Ok(()),
            _ => Err(ClientError::Unauthorized),
        }
    }
}

/// Counts a fetch as in flight until dropped, including when a deadline cancels it.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, high_water: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        high_water.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteClient for FakeClient {
    async fn login(&self, _credentials: &Credentials) -> Result<LoginGrant, ClientError> {
        let issued = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.login_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match Self::next(&self.login_script) {
            Some(Scripted::Stall) => std::future::pending::<()>().await,
            Some(Scripted::Ignore) | None => {}
            Some(step) => return Err(step.into_error("login")),
        }

        let token = SessionToken::new(format!("token-{issued}"));
        *self.active_token.lock().unwrap() = Some(token.clone());
        Ok(LoginGrant {
            token,
            expires_in_secs: None,
        })
    }

    async fn fetch_messages(
        &self,
        token: &SessionToken,
    ) -> Result<Vec<RemoteMessage>, ClientError> {
        self.fetch_times.lock().unwrap().push(Instant::now());
        let _in_flight = InFlight::enter(
            &self.fetches_in_flight,
            &self.max_fetches_in_flight,
        );

        let gate = self.fetch_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        match Self::next(&self.fetch_script) {
            Some(Scripted::Stall) => std::future::pending().await,
            Some(Scripted::Ignore) | None => self.check_token(token).map(|()| {
                self.inbox
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|message| !message.read)
                    .cloned()
                    .collect()
            }),
            Some(step) => Err(step.into_error("messages")),
        }
    }

    async fn mark_read(&self, token: &SessionToken, message_id: &str) -> Result<(), ClientError> {
        self.mark_many_read(token, &[message_id.to_string()]).await
    }

    async fn mark_many_read(
        &self,
        token: &SessionToken,
        message_ids: &[String],
    ) -> Result<(), ClientError> {
        self.marks.lock().unwrap().push(message_ids.to_vec());

        match Self::next(&self.mark_script) {
            Some(Scripted::Stall) => std::future::pending().await,
            Some(Scripted::Ignore) => return Ok(()),
            Some(step) => return Err(step.into_error(&message_ids.join(","))),
            None => {}
        }
        self.check_token(token)?;

        let mut inbox = self.inbox.lock().unwrap();
        for message in inbox.iter_mut() {
            if message_ids.contains(&message.id) {
                message.read = true;
            }
        }
        Ok(())
    }
}
