use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Bearer token handed out by the backend on login.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionToken([REDACTED])")
    }
}

/// Result of a successful login as reported by the remote client.
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub token: SessionToken,
    pub expires_in_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: SessionToken,
    pub established_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn from_grant(grant: LoginGrant, now: DateTime<Utc>) -> Self {
        let expires_at = grant
            .expires_in_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(chrono::Duration::try_seconds)
            // A hint past the representable range means no usable expiry.
            .and_then(|lifetime| now.checked_add_signed(lifetime));

        Self {
            token: grant.token,
            established_at: now,
            expires_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// One entry of a fetched message list, in backend order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: String,
    pub subject: String,
    pub body: String,
    pub read: bool,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
}

impl RemoteMessage {
    pub fn unread(id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
            body: String::new(),
            read: false,
            sent_at: None,
        }
    }
}

/// Where a message's read flag stands relative to the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadSync {
    #[default]
    Confirmed,
    /// Read locally, remote write not yet confirmed.
    PendingWrite,
    /// Read locally, remote write retries used up.
    WriteExhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub subject: String,
    pub body: String,
    pub read: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub read_sync: ReadSync,
    /// Store epoch at which `read` was last set locally.
    pub local_read_epoch: Option<u64>,
    pub first_seen_poll: u64,
    pub last_seen_poll: u64,
    pub insertion_seq: u64,
    pub missed_polls: u32,
}

impl Message {
    pub fn from_remote(remote: &RemoteMessage, poll_seq: u64, insertion_seq: u64) -> Self {
        Self {
            id: remote.id.clone(),
            subject: remote.subject.clone(),
            body: remote.body.clone(),
            read: remote.read,
            sent_at: remote.sent_at,
            read_sync: ReadSync::Confirmed,
            local_read_epoch: None,
            first_seen_poll: poll_seq,
            last_seen_poll: poll_seq,
            insertion_seq,
            missed_polls: 0,
        }
    }

    /// Larger is more recent. Messages without a timestamp sort after dated ones.
    pub fn recency_key(&self) -> (Option<DateTime<Utc>>, u64) {
        (self.sent_at, self.insertion_seq)
    }

    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            id: self.id.clone(),
            subject: self.subject.clone(),
            body: self.body.clone(),
            sent_at: self.sent_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageSummary {
    pub id: String,
    pub subject: String,
    pub body: String,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Immutable view handed to consumers.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct MessageSnapshot {
    pub unread_count: usize,
    /// Most recent first.
    pub unread: Vec<MessageSummary>,
    pub latest: Option<MessageSummary>,
    pub poll_seq: u64,
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl MessageSnapshot {
    pub fn from_messages<'a>(
        messages: impl IntoIterator<Item = &'a Message>,
        poll_seq: u64,
        reconciled_at: Option<DateTime<Utc>>,
    ) -> Self {
        let mut unread = messages
            .into_iter()
            .filter(|message| !message.read)
            .collect::<Vec<_>>();
        unread.sort_by_key(|message| Reverse(message.recency_key()));

        let unread = unread.into_iter().map(Message::summary).collect::<Vec<_>>();

        Self {
            unread_count: unread.len(),
            latest: unread.first().cloned(),
            unread,
            poll_seq,
            reconciled_at,
        }
    }

    pub fn is_unread(&self, id: &str) -> bool {
        self.unread.iter().any(|message| message.id == id)
    }
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Diff {
    pub added: Vec<String>,
    pub read_changed: Vec<String>,
    pub content_changed: Vec<String>,
    pub removed: Vec<String>,
    /// Optimistic reads rolled back because the backend never recorded them.
    pub reverted: Vec<String>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.read_changed.is_empty()
            && self.content_changed.is_empty()
            && self.removed.is_empty()
            && self.reverted.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingWrite {
    pub message_id: String,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub exhausted: bool,
}

impl PendingWrite {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            exhausted: false,
        }
    }
}
