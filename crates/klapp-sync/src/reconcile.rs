//! Merging a fetched message list into local state.
//!
//! [`reconcile`] is a pure function: it never mutates its input, so the store can
//! compute the next state and swap it in as a single step.

use chrono::{DateTime, Utc};
use klapp_core::{Diff, Message, ReadSync, RemoteMessage};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreState {
    pub messages: BTreeMap<String, Message>,
    pub poll_seq: u64,
    pub next_insertion_seq: u64,
    /// Bumped on every mutation; fetch tickets capture it to detect stale results.
    pub epoch: u64,
    pub reconciled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Store epoch observed when the fetch started.
    pub fetch_epoch: u64,
    /// Consecutive polls a message may be absent before it is dropped.
    pub removal_grace_polls: u32,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub diff: Diff,
    /// Messages whose outstanding local write is settled, by confirmation or removal.
    pub resolved: Vec<String>,
}

pub fn reconcile(
    current: &StoreState,
    fetched: &[RemoteMessage],
    options: &ReconcileOptions,
) -> (StoreState, ReconcileReport) {
    let mut next = current.clone();
    let mut report = ReconcileReport::default();

    next.poll_seq += 1;
    next.epoch += 1;
    next.reconciled_at = Some(options.now);
    let poll_seq = next.poll_seq;

    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(fetched.len());
    for remote in fetched {
        if seen.insert(remote.id.as_str()) {
            unique.push(remote);
        } else {
            debug!(message_id = %remote.id, "duplicate id in fetch; keeping first");
        }
    }
    let fetched = unique;

    // The backend lists newest first, so new arrivals get descending sequence numbers.
    let base_seq = next.next_insertion_seq;
    let mut remaining_new = fetched
        .iter()
        .filter(|remote| !next.messages.contains_key(&remote.id))
        .count() as u64;
    next.next_insertion_seq = base_seq + remaining_new;

    for remote in &fetched {
        match next.messages.get_mut(&remote.id) {
            None => {
                remaining_new -= 1;
                let message = Message::from_remote(remote, poll_seq, base_seq + remaining_new);
                next.messages.insert(remote.id.clone(), message);
                report.diff.added.push(remote.id.clone());
            }
            Some(local) => {
                local.last_seen_poll = poll_seq;
                local.missed_polls = 0;

                if local.subject != remote.subject
                    || local.body != remote.body
                    || local.sent_at != remote.sent_at
                {
                    local.subject.clone_from(&remote.subject);
                    local.body.clone_from(&remote.body);
                    local.sent_at = remote.sent_at;
                    report.diff.content_changed.push(remote.id.clone());
                }

                merge_read_flag(local, remote.read, options.fetch_epoch, &mut report);
            }
        }
    }

    let present = fetched
        .iter()
        .map(|remote| remote.id.as_str())
        .collect::<HashSet<_>>();
    let mut expired = Vec::new();
    for (id, local) in next.messages.iter_mut() {
        if present.contains(id.as_str()) {
            continue;
        }
        local.missed_polls += 1;
        if local.missed_polls > options.removal_grace_polls {
            expired.push(id.clone());
        }
    }
    for id in expired {
        if let Some(removed) = next.messages.remove(&id) {
            if removed.read_sync != ReadSync::Confirmed {
                report.resolved.push(id.clone());
            }
        }
        report.diff.removed.push(id);
    }

    (next, report)
}

fn merge_read_flag(
    local: &mut Message,
    fetched_read: bool,
    fetch_epoch: u64,
    report: &mut ReconcileReport,
) {
    if fetched_read {
        if !local.read {
            local.read = true;
            report.diff.read_changed.push(local.id.clone());
        }
        if local.read_sync != ReadSync::Confirmed {
            local.read_sync = ReadSync::Confirmed;
            report.resolved.push(local.id.clone());
        }
        return;
    }

    if !local.read {
        return;
    }

    match local.read_sync {
        // The write is still in progress; keep the optimistic read.
        ReadSync::PendingWrite => {}
        ReadSync::WriteExhausted => {
            local.read = false;
            local.read_sync = ReadSync::Confirmed;
            local.local_read_epoch = None;
            report.diff.read_changed.push(local.id.clone());
            report.diff.reverted.push(local.id.clone());
        }
        ReadSync::Confirmed => {
            // Fetch started before the local read landed.
            if local
                .local_read_epoch
                .is_some_and(|epoch| epoch > fetch_epoch)
            {
                return;
            }
            local.read = false;
            local.local_read_epoch = None;
            report.diff.read_changed.push(local.id.clone());
        }
    }
}
