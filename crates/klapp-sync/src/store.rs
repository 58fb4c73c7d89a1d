use crate::error::NotFoundError;
use crate::reconcile::{reconcile, ReconcileOptions, ReconcileReport, StoreState};
use chrono::Utc;
use klapp_core::{Diff, Message, MessageSnapshot, ReadSync, RemoteMessage};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::debug;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Published after every mutation that changed something.
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub diff: Diff,
    pub snapshot: Arc<MessageSnapshot>,
}

/// Store epoch captured when a fetch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalRead {
    Marked(Message),
    AlreadyRead,
}

/// Single writer over the message set. Readers get immutable snapshots and never
/// see a half-applied reconciliation.
pub struct MessageStore {
    state: Mutex<StoreState>,
    removal_grace_polls: u32,
    snapshots: watch::Sender<Arc<MessageSnapshot>>,
    changes: broadcast::Sender<StoreChange>,
}

impl MessageStore {
    pub fn new(removal_grace_polls: u32) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(MessageSnapshot::default()));
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(StoreState::default()),
            removal_grace_polls,
            snapshots,
            changes,
        }
    }

    pub fn snapshot(&self) -> Arc<MessageSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MessageSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub async fn begin_fetch(&self) -> FetchTicket {
        FetchTicket {
            epoch: self.state.lock().await.epoch,
        }
    }

    /// Reconciles a fetch that has no outstanding ticket.
    pub async fn apply_reconciliation(&self, fetched: &[RemoteMessage]) -> Diff {
        let mut state = self.state.lock().await;
        let ticket = FetchTicket { epoch: state.epoch };
        self.reconcile_locked(&mut state, ticket, fetched).diff
    }

    pub async fn reconcile_fetch(
        &self,
        ticket: FetchTicket,
        fetched: &[RemoteMessage],
    ) -> ReconcileReport {
        let mut state = self.state.lock().await;
        self.reconcile_locked(&mut state, ticket, fetched)
    }

    fn reconcile_locked(
        &self,
        state: &mut StoreState,
        ticket: FetchTicket,
        fetched: &[RemoteMessage],
    ) -> ReconcileReport {
        let options = ReconcileOptions {
            fetch_epoch: ticket.epoch,
            removal_grace_polls: self.removal_grace_polls,
            now: Utc::now(),
        };
        let (next, report) = reconcile(state, fetched, &options);
        *state = next;

        debug!(
            poll_seq = state.poll_seq,
            added = report.diff.added.len(),
            read_changed = report.diff.read_changed.len(),
            removed = report.diff.removed.len(),
            "reconciled fetch"
        );
        // Every poll advances poll_seq and reconciled_at, so the snapshot is always republished.
        self.publish(state, report.diff.clone());
        report
    }

    /// Optimistically marks one message read, tagging it as awaiting the remote write.
    pub async fn set_read_local(&self, id: &str) -> Result<LocalRead, NotFoundError> {
        let mut state = self.state.lock().await;
        state.epoch += 1;
        let epoch = state.epoch;

        let message = state
            .messages
            .get_mut(id)
            .ok_or_else(|| NotFoundError(id.to_string()))?;
        if message.read {
            return Ok(LocalRead::AlreadyRead);
        }
        message.read = true;
        message.read_sync = ReadSync::PendingWrite;
        message.local_read_epoch = Some(epoch);
        let marked = message.clone();

        self.publish(
            &state,
            Diff {
                read_changed: vec![id.to_string()],
                ..Diff::default()
            },
        );
        Ok(LocalRead::Marked(marked))
    }

    /// Marks every unread message read locally. Returns the ids that changed.
    pub async fn set_all_read_local(&self) -> Vec<String> {
        let mut state = self.state.lock().await;
        state.epoch += 1;
        let epoch = state.epoch;

        let mut marked = Vec::new();
        for message in state.messages.values_mut().filter(|message| !message.read) {
            message.read = true;
            message.read_sync = ReadSync::PendingWrite;
            message.local_read_epoch = Some(epoch);
            marked.push(message.id.clone());
        }

        if !marked.is_empty() {
            self.publish(
                &state,
                Diff {
                    read_changed: marked.clone(),
                    ..Diff::default()
                },
            );
        }
        marked
    }

    /// Settles an optimistic read once the backend accepted the write.
    pub async fn confirm_read(&self, id: &str) -> bool {
        self.retag(id, ReadSync::PendingWrite, ReadSync::Confirmed).await
    }

    pub async fn mark_write_exhausted(&self, id: &str) -> bool {
        self.retag(id, ReadSync::PendingWrite, ReadSync::WriteExhausted)
            .await
    }

    async fn retag(&self, id: &str, from: ReadSync, to: ReadSync) -> bool {
        let mut state = self.state.lock().await;
        state.epoch += 1;
        let epoch = state.epoch;

        match state.messages.get_mut(id) {
            Some(message) if message.read && message.read_sync == from => {
                message.read_sync = to;
                if to == ReadSync::Confirmed {
                    message.local_read_epoch = Some(epoch);
                }
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, id: &str) -> Option<Message> {
        self.state.lock().await.messages.get(id).cloned()
    }

    pub async fn read_sync(&self, id: &str) -> Option<ReadSync> {
        self.state
            .lock()
            .await
            .messages
            .get(id)
            .map(|message| message.read_sync)
    }

    fn publish(&self, state: &StoreState, diff: Diff) {
        let snapshot = Arc::new(MessageSnapshot::from_messages(
            state.messages.values(),
            state.poll_seq,
            state.reconciled_at,
        ));
        self.snapshots.send_replace(snapshot.clone());
        if !diff.is_empty() {
            // No subscribers is fine.
            let _ = self.changes.send(StoreChange { diff, snapshot });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbox(ids: &[&str]) -> Vec<RemoteMessage> {
        ids.iter()
            .map(|id| RemoteMessage::unread(*id, format!("subject {id}")))
            .collect()
    }

    #[tokio::test]
    async fn snapshot_tracks_reconciliation() {
        let store = MessageStore::new(0);
        assert_eq!(store.snapshot().unread_count, 0);

        let diff = store.apply_reconciliation(&inbox(&["2", "1"])).await;
        assert_eq!(diff.added, vec!["2", "1"]);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.unread_count, 2);
        assert_eq!(snapshot.latest.as_ref().map(|m| m.id.as_str()), Some("2"));
        assert_eq!(snapshot.poll_seq, 1);
        assert!(snapshot.reconciled_at.is_some());
    }

    #[tokio::test]
    async fn held_snapshot_is_unaffected_by_later_writes() {
        let store = MessageStore::new(0);
        store.apply_reconciliation(&inbox(&["1"])).await;

        let held = store.snapshot();
        store.set_read_local("1").await.expect("marked");

        assert_eq!(held.unread_count, 1);
        assert_eq!(store.snapshot().unread_count, 0);
    }

    #[tokio::test]
    async fn local_read_is_tagged_pending_then_confirmed() {
        let store = MessageStore::new(0);
        store.apply_reconciliation(&inbox(&["1"])).await;

        let marked = store.set_read_local("1").await.expect("marked");
        assert!(matches!(marked, LocalRead::Marked(ref m) if m.read_sync == ReadSync::PendingWrite));
        assert_eq!(
            store.set_read_local("1").await.expect("known"),
            LocalRead::AlreadyRead
        );

        assert!(store.confirm_read("1").await);
        assert_eq!(store.read_sync("1").await, Some(ReadSync::Confirmed));
        assert!(!store.confirm_read("1").await);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = MessageStore::new(0);
        assert_eq!(
            store.set_read_local("nope").await,
            Err(NotFoundError("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn subscribers_see_changes_but_not_no_ops() {
        let store = MessageStore::new(0);
        let mut changes = store.subscribe_changes();
        let mut snapshots = store.subscribe();

        store.apply_reconciliation(&inbox(&["1"])).await;
        let change = changes.recv().await.expect("change published");
        assert_eq!(change.diff.added, vec!["1"]);
        assert!(snapshots.has_changed().expect("sender alive"));
        assert_eq!(snapshots.borrow_and_update().unread_count, 1);

        store.apply_reconciliation(&inbox(&["1"])).await;
        assert!(changes.try_recv().is_err());
        assert_eq!(snapshots.borrow_and_update().poll_seq, 2);
    }

    #[tokio::test]
    async fn mark_all_only_touches_unread() {
        let store = MessageStore::new(0);
        store.apply_reconciliation(&inbox(&["3", "2", "1"])).await;
        store.set_read_local("2").await.expect("marked");

        let mut marked = store.set_all_read_local().await;
        marked.sort();
        assert_eq!(marked, vec!["1", "3"]);
        assert!(store.set_all_read_local().await.is_empty());
        assert_eq!(store.snapshot().unread_count, 0);
    }

    #[tokio::test]
    async fn exhausted_write_is_rolled_back_on_next_fetch() {
        let store = MessageStore::new(0);
        store.apply_reconciliation(&inbox(&["1"])).await;
        store.set_read_local("1").await.expect("marked");
        assert!(store.mark_write_exhausted("1").await);

        let diff = store.apply_reconciliation(&inbox(&["1"])).await;
        assert_eq!(diff.reverted, vec!["1"]);
        assert!(store.snapshot().is_unread("1"));
    }

    #[tokio::test]
    async fn confirmed_read_survives_fetch_started_earlier() {
        let store = MessageStore::new(0);
        store.apply_reconciliation(&inbox(&["1"])).await;

        let ticket = store.begin_fetch().await;
        store.set_read_local("1").await.expect("marked");
        store.confirm_read("1").await;

        let report = store.reconcile_fetch(ticket, &inbox(&["1"])).await;
        assert!(report.diff.read_changed.is_empty());
        assert!(!store.snapshot().is_unread("1"));
    }
}
