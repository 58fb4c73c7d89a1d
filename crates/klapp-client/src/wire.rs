use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use klapp_core::RemoteMessage;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub(crate) struct AuthenticateResponse {
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageHeader {
    #[serde(default, deserialize_with = "optional_id")]
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageDetail {
    #[serde(default, deserialize_with = "optional_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub sent_at: Option<String>,
    #[serde(default)]
    pub replies: Vec<Reply>,
    #[serde(default)]
    pub read: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Reply {
    #[serde(default)]
    pub body_html: Option<String>,
}

/// Body of the parent inbox query, restricted to unread messages since `from_date`.
pub(crate) fn unread_filter(from_date: DateTime<Utc>) -> Value {
    serde_json::json!({
        "skip": 0,
        "classes": [],
        "active": true,
        "archived": false,
        "trash_bin": false,
        "only_unread": true,
        "only_absences": false,
        "sent_by_me": false,
        "sent_to_me": false,
        "only_personal": false,
        "only_drafts": false,
        "only_pinned": false,
        "query": "",
        "from_date": from_date.to_rfc3339_opts(SecondsFormat::Secs, false),
    })
}

pub(crate) fn read_request(ids: &[String]) -> Value {
    serde_json::json!({ "messages": ids })
}

pub(crate) fn into_remote_message(fallback_id: &str, detail: MessageDetail) -> RemoteMessage {
    let body = detail
        .replies
        .first()
        .and_then(|reply| reply.body_html.as_deref())
        .map(ammonia::clean)
        .unwrap_or_default();

    RemoteMessage {
        id: detail.id.unwrap_or_else(|| fallback_id.to_string()),
        subject: detail.subject.unwrap_or_default(),
        body,
        read: detail.read.unwrap_or(false),
        sent_at: detail.sent_at.as_deref().and_then(parse_timestamp),
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    // Some payloads omit the offset; the backend reports UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(id)) if !id.is_empty() => Some(id),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    })
}
