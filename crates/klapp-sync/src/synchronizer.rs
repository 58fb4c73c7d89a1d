use crate::error::{AuthError, PollError};
use crate::remote::TimedClient;
use crate::session::SessionManager;
use crate::store::MessageStore;
use crate::writes::PendingWrites;
use klapp_client::RemoteClient;
use klapp_core::{Credentials, Diff, RemoteMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub(crate) struct SyncSettings {
    pub request_timeout: Duration,
    pub removal_grace_polls: u32,
    pub max_write_attempts: u32,
    pub refresh_after_write: bool,
}

/// Outcome of one successful fetch-and-reconcile cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub poll_seq: u64,
    pub fetched: usize,
    pub diff: Diff,
    /// The session was rejected mid-cycle and replaced.
    pub relogged: bool,
    pub writes_retried: usize,
}

/// Shared state behind the engine: one session, one store, one poll at a time.
pub(crate) struct Synchronizer {
    pub(crate) client: TimedClient,
    pub(crate) session: SessionManager,
    pub(crate) store: MessageStore,
    pub(crate) pending: PendingWrites,
    pub(crate) refresh: Notify,
    pub(crate) settings: SyncSettings,
    poll_gate: Mutex<()>,
}

impl Synchronizer {
    pub(crate) fn new(
        client: Arc<dyn RemoteClient>,
        credentials: Credentials,
        settings: SyncSettings,
    ) -> Self {
        let client = TimedClient::new(client, settings.request_timeout);
        Self {
            session: SessionManager::new(client.clone(), credentials),
            client,
            store: MessageStore::new(settings.removal_grace_polls),
            pending: PendingWrites::default(),
            refresh: Notify::new(),
            settings,
            poll_gate: Mutex::new(()),
        }
    }

    /// Runs one cycle unless another is already running, in which case it
    /// returns [`PollError::Busy`] without touching the backend.
    pub(crate) async fn poll_once(&self) -> Result<PollReport, PollError> {
        let Ok(_cycle) = self.poll_gate.try_lock() else {
            return Err(PollError::Busy);
        };

        let session = self.session.ensure_session().await?;
        let ticket = self.store.begin_fetch().await;

        let (fetched, relogged) = match self.client.fetch_messages(&session.token).await {
            Ok(fetched) => (fetched, false),
            Err(err) if err.is_unauthorized() => {
                info!("session rejected during poll; logging in again");
                self.session.invalidate_token(&session.token).await;
                (self.fetch_with_fresh_session().await?, true)
            }
            Err(err) => return Err(self.client.transport_error(err).into()),
        };

        let report = self.store.reconcile_fetch(ticket, &fetched).await;
        for id in &report.resolved {
            self.pending.resolve(id);
        }
        for id in &report.diff.reverted {
            self.pending.resolve(id);
            error!(message_id = %id, "backend never recorded read; message is unread again");
        }

        let writes_retried = self.retry_pending_writes().await;

        Ok(PollReport {
            poll_seq: self.store.snapshot().poll_seq,
            fetched: fetched.len(),
            diff: report.diff,
            relogged,
            writes_retried,
        })
    }

    async fn fetch_with_fresh_session(&self) -> Result<Vec<RemoteMessage>, PollError> {
        let session = self.session.ensure_session().await?;
        match self.client.fetch_messages(&session.token).await {
            Ok(fetched) => Ok(fetched),
            Err(err) if err.is_unauthorized() => {
                warn!("fresh session rejected; giving up on this cycle");
                self.session.invalidate_token(&session.token).await;
                Err(AuthError::rejected_after_login().into())
            }
            Err(err) => Err(self.client.transport_error(err).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AuthFailure, TransportError};
    use crate::testing::{FakeClient, Scripted};

    fn settings() -> SyncSettings {
        SyncSettings {
            request_timeout: Duration::from_secs(10),
            removal_grace_polls: 0,
            max_write_attempts: 3,
            refresh_after_write: true,
        }
    }

    fn synchronizer(fake: &Arc<FakeClient>) -> Arc<Synchronizer> {
        Arc::new(Synchronizer::new(
            fake.clone(),
            Credentials::new("parent@example.org", "secret"),
            settings(),
        ))
    }

    #[tokio::test]
    async fn first_poll_logs_in_and_fills_store() {
        let fake = FakeClient::with_inbox(vec![
            RemoteMessage::unread("2", "Parents evening"),
            RemoteMessage::unread("1", "Lunch menu"),
        ]);
        let sync = synchronizer(&fake);

        let report = sync.poll_once().await.expect("poll");
        assert_eq!(report.poll_seq, 1);
        assert_eq!(report.fetched, 2);
        assert_eq!(report.diff.added, vec!["2", "1"]);
        assert!(!report.relogged);
        assert_eq!(fake.login_calls(), 1);

        let snapshot = sync.store.snapshot();
        assert_eq!(snapshot.unread_count, 2);
        assert_eq!(
            snapshot.latest.as_ref().map(|m| m.subject.as_str()),
            Some("Parents evening")
        );
    }

    #[tokio::test]
    async fn rejected_session_triggers_one_relogin() {
        let fake = FakeClient::with_inbox(vec![RemoteMessage::unread("1", "hello")]);
        let sync = synchronizer(&fake);
        sync.poll_once().await.expect("first poll");

        fake.revoke_sessions();
        let report = sync.poll_once().await.expect("second poll");

        assert!(report.relogged);
        assert_eq!(fake.login_calls(), 2);
        assert_eq!(fake.fetch_calls(), 3);
        assert!(report.diff.is_empty());
    }

    #[tokio::test]
    async fn repeated_rejection_surfaces_auth_error_without_looping() {
        let fake = FakeClient::with_inbox(vec![]);
        let sync = synchronizer(&fake);

        fake.script_fetch(Scripted::Unauthorized);
        fake.script_fetch(Scripted::Unauthorized);
        let err = sync.poll_once().await.expect_err("auth error");

        assert!(matches!(
            err,
            PollError::Auth(AuthError {
                reason: AuthFailure::BackendError,
                ..
            })
        ));
        assert_eq!(fake.login_calls(), 2);
        assert_eq!(fake.fetch_calls(), 2);
        assert!(!sync.session.is_authenticated().await);
    }

    #[tokio::test]
    async fn invalid_credentials_fail_the_cycle_and_leave_store_alone() {
        let fake = FakeClient::with_inbox(vec![RemoteMessage::unread("1", "hello")]);
        let sync = synchronizer(&fake);
        sync.poll_once().await.expect("first poll");
        let before = sync.store.snapshot();

        sync.session.invalidate().await;
        fake.script_login(Scripted::InvalidCredentials);
        let err = sync.poll_once().await.expect_err("login rejected");

        assert!(matches!(
            err,
            PollError::Auth(AuthError {
                reason: AuthFailure::InvalidCredentials,
                ..
            })
        ));
        assert_eq!(sync.store.snapshot(), before);
    }

    #[tokio::test]
    async fn transport_failure_leaves_snapshot_untouched() {
        let fake = FakeClient::with_inbox(vec![RemoteMessage::unread("1", "hello")]);
        let sync = synchronizer(&fake);
        sync.poll_once().await.expect("first poll");
        let before = sync.store.snapshot();

        fake.script_fetch(Scripted::ServerError);
        let err = sync.poll_once().await.expect_err("server error");

        assert!(matches!(err, PollError::Transport(TransportError::Failed(_))));
        assert_eq!(sync.store.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_fetch_is_cut_off_by_request_timeout() {
        let fake = FakeClient::with_inbox(vec![]);
        let sync = synchronizer(&fake);

        fake.script_fetch(Scripted::Stall);
        let started = tokio::time::Instant::now();
        let err = sync.poll_once().await.expect_err("timed out");

        assert!(matches!(err, PollError::Transport(TransportError::Timeout(_))));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(fake.fetches_in_flight(), 0);
    }

    #[tokio::test]
    async fn overlapping_poll_is_rejected_as_busy() {
        let fake = FakeClient::with_inbox(vec![RemoteMessage::unread("1", "hello")]);
        let gate = fake.hold_fetches();
        let sync = synchronizer(&fake);

        let first = tokio::spawn({
            let sync = sync.clone();
            async move { sync.poll_once().await }
        });
        while fake.fetches_in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(matches!(sync.poll_once().await, Err(PollError::Busy)));
        gate.notify_one();

        let report = first.await.expect("task").expect("poll");
        assert_eq!(report.poll_seq, 1);
        assert_eq!(fake.max_fetches_in_flight(), 1);
        assert_eq!(fake.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn vanished_messages_leave_the_snapshot() {
        let fake = FakeClient::with_inbox(vec![
            RemoteMessage::unread("2", "b"),
            RemoteMessage::unread("1", "a"),
        ]);
        let sync = synchronizer(&fake);
        sync.poll_once().await.expect("first poll");

        fake.remove_message("2");
        let report = sync.poll_once().await.expect("second poll");

        assert_eq!(report.diff.removed, vec!["2"]);
        let snapshot = sync.store.snapshot();
        assert_eq!(snapshot.unread_count, 1);
        assert_eq!(snapshot.latest.as_ref().map(|m| m.id.as_str()), Some("1"));
    }
}
