use crate::error::{AuthError, MarkReadError, NotFoundError, RemoteWriteError, TransportError};
use crate::store::LocalRead;
use crate::synchronizer::Synchronizer;
use chrono::Utc;
use klapp_core::PendingWrite;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkReadOutcome {
    /// The backend accepted the write.
    Confirmed,
    /// Nothing to do; the message was already read locally.
    AlreadyRead,
}

#[derive(Debug)]
struct Tracked {
    write: PendingWrite,
    /// Claim currently writing this entry, if any.
    claimed_by: Option<u64>,
}

#[derive(Debug, Default)]
struct Ledger {
    entries: BTreeMap<String, Tracked>,
    next_claim: u64,
}

impl Ledger {
    fn next_claim(&mut self) -> u64 {
        self.next_claim += 1;
        self.next_claim
    }
}

/// Local reads the backend has not acknowledged yet.
#[derive(Debug, Default)]
pub struct PendingWrites {
    ledger: Mutex<Ledger>,
}

/// Writes held in flight by one caller. Dropping the claim hands any entry it
/// still holds back to the retry policy, so a cancelled write is retried.
#[derive(Debug)]
struct Claim<'a> {
    pending: &'a PendingWrites,
    id: u64,
    ids: Vec<String>,
}

impl Claim<'_> {
    fn ids(&self) -> &[String] {
        &self.ids
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.pending.release(self.id, &self.ids);
    }
}

impl PendingWrites {
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, ids: Vec<String>) -> Claim<'_> {
        let mut ledger = self.ledger();
        let claim = ledger.next_claim();
        for id in &ids {
            ledger.entries.insert(
                id.clone(),
                Tracked {
                    write: PendingWrite::new(id.clone()),
                    claimed_by: Some(claim),
                },
            );
        }
        Claim {
            pending: self,
            id: claim,
            ids,
        }
    }

    /// Claims every write that is neither in flight nor out of attempts.
    fn claim_retryable(&self) -> Vec<Claim<'_>> {
        let mut ledger = self.ledger();
        let ids = ledger
            .entries
            .values()
            .filter(|tracked| tracked.claimed_by.is_none() && !tracked.write.exhausted)
            .map(|tracked| tracked.write.message_id.clone())
            .collect::<Vec<_>>();

        let mut claims = Vec::with_capacity(ids.len());
        for id in ids {
            let claim = ledger.next_claim();
            if let Some(tracked) = ledger.entries.get_mut(&id) {
                tracked.claimed_by = Some(claim);
            }
            claims.push(Claim {
                pending: self,
                id: claim,
                ids: vec![id],
            });
        }
        claims
    }

    /// Counts a failed attempt against every entry the claim still holds.
    fn record_failure(&self, claim: &Claim<'_>, reason: &str, max_attempts: u32) -> Attempts {
        let mut ledger = self.ledger();
        let mut outcome = Attempts::default();
        for id in claim.ids() {
            let Some(tracked) = ledger.entries.get_mut(id) else {
                continue;
            };
            if tracked.claimed_by != Some(claim.id) {
                continue;
            }
            tracked.claimed_by = None;
            tracked.write.attempts += 1;
            tracked.write.last_attempt_at = Some(Utc::now());
            tracked.write.last_error = Some(reason.to_string());
            outcome.attempts = outcome.attempts.max(tracked.write.attempts);
            if tracked.write.attempts >= max_attempts {
                tracked.write.exhausted = true;
                outcome.exhausted.push(id.clone());
            }
        }
        outcome
    }

    fn release(&self, claim: u64, ids: &[String]) {
        let mut ledger = self.ledger();
        for id in ids {
            if let Some(tracked) = ledger.entries.get_mut(id) {
                if tracked.claimed_by == Some(claim) {
                    debug!(message_id = %id, "write abandoned before completing; left for retry");
                    tracked.claimed_by = None;
                }
            }
        }
    }

    pub(crate) fn resolve(&self, id: &str) -> bool {
        self.ledger().entries.remove(id).is_some()
    }

    pub fn list(&self) -> Vec<PendingWrite> {
        self.ledger()
            .entries
            .values()
            .map(|tracked| tracked.write.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<PendingWrite> {
        self.ledger()
            .entries
            .get(id)
            .map(|tracked| tracked.write.clone())
    }
}

#[derive(Debug, Default)]
struct Attempts {
    attempts: u32,
    exhausted: Vec<String>,
}

#[derive(Debug, Error)]
enum WriteFailure {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("backend does not know {0}")]
    NotFound(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Synchronizer {
    /// Marks one message read locally, then writes through to the backend.
    ///
    /// The local view changes first and stays changed on failure; the write is
    /// retried after later polls until it succeeds or runs out of attempts.
    pub(crate) async fn mark_as_read(&self, id: &str) -> Result<MarkReadOutcome, MarkReadError> {
        if let LocalRead::AlreadyRead = self.store.set_read_local(id).await? {
            debug!(message_id = %id, "message already read");
            return Ok(MarkReadOutcome::AlreadyRead);
        }

        let claim = self.pending.track(vec![id.to_string()]);
        match self.write_through(claim.ids()).await {
            Ok(()) => {
                self.settle_written(claim.ids(), self.settings.refresh_after_write)
                    .await;
                Ok(MarkReadOutcome::Confirmed)
            }
            Err(WriteFailure::NotFound(_)) => {
                self.drop_unknown(id).await;
                Err(NotFoundError(id.to_string()).into())
            }
            Err(failure) => Err(self.record_write_failure(&claim, failure).await.into()),
        }
    }

    /// Marks every unread message read with a single batch write.
    pub(crate) async fn mark_all_read(&self) -> Result<usize, RemoteWriteError> {
        let ids = self.store.set_all_read_local().await;
        if ids.is_empty() {
            debug!("no unread messages to mark");
            return Ok(0);
        }

        let claim = self.pending.track(ids);
        match self.write_through(claim.ids()).await {
            Ok(()) => {
                self.settle_written(claim.ids(), self.settings.refresh_after_write)
                    .await;
                Ok(claim.ids().len())
            }
            Err(failure) => Err(self.record_write_failure(&claim, failure).await),
        }
    }

    /// Retries outstanding writes one message at a time. Returns how many were tried.
    pub(crate) async fn retry_pending_writes(&self) -> usize {
        let claims = self.pending.claim_retryable();
        let tried = claims.len();
        // Claims not reached yet are released if this future is dropped.
        for claim in claims {
            match self.write_through(claim.ids()).await {
                Ok(()) => self.settle_written(claim.ids(), false).await,
                Err(WriteFailure::NotFound(_)) => {
                    for id in claim.ids() {
                        self.drop_unknown(id).await;
                    }
                }
                Err(failure) => {
                    self.record_write_failure(&claim, failure).await;
                }
            }
        }
        tried
    }

    async fn write_through(&self, ids: &[String]) -> Result<(), WriteFailure> {
        let session = self.session.ensure_session().await?;
        match self.client.mark_read(&session.token, ids).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_unauthorized() => {
                debug!("session rejected during write; logging in again");
                self.session.invalidate_token(&session.token).await;
            }
            Err(err) => return Err(self.write_failure(err)),
        }

        let session = self.session.ensure_session().await?;
        match self.client.mark_read(&session.token, ids).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_unauthorized() => {
                self.session.invalidate_token(&session.token).await;
                Err(AuthError::rejected_after_login().into())
            }
            Err(err) => Err(self.write_failure(err)),
        }
    }

    fn write_failure(&self, err: klapp_client::ClientError) -> WriteFailure {
        match err {
            klapp_client::ClientError::NotFound(subject) => WriteFailure::NotFound(subject),
            other => self.client.transport_error(other).into(),
        }
    }

    async fn settle_written(&self, ids: &[String], refresh: bool) {
        for id in ids {
            self.pending.resolve(id);
            self.store.confirm_read(id).await;
        }
        info!(count = ids.len(), "read state written upstream");
        if refresh {
            self.refresh.notify_one();
        }
    }

    /// The backend no longer knows the message: stop retrying and let the next
    /// fetch decide its fate.
    async fn drop_unknown(&self, id: &str) {
        warn!(message_id = %id, "backend does not know message; dropping pending write");
        self.pending.resolve(id);
        self.store.confirm_read(id).await;
    }

    async fn record_write_failure(
        &self,
        claim: &Claim<'_>,
        failure: WriteFailure,
    ) -> RemoteWriteError {
        let reason = failure.to_string();
        let ids = claim.ids();
        let outcome = self
            .pending
            .record_failure(claim, &reason, self.settings.max_write_attempts);

        warn!(
            count = ids.len(),
            attempts = outcome.attempts,
            "read state not confirmed upstream: {reason}"
        );
        for id in &outcome.exhausted {
            self.store.mark_write_exhausted(id).await;
            error!(
                message_id = %id,
                attempts = outcome.attempts,
                "giving up on read write; next poll restores backend state"
            );
        }

        RemoteWriteError {
            message_ids: ids.to_vec(),
            attempts: outcome.attempts,
            reason,
        }
    }
}
