use crate::wire::{
    into_remote_message, read_request, unread_filter, AuthenticateResponse, MessageDetail,
    MessageHeader,
};
use crate::ClientError;
use async_trait::async_trait;
use chrono::Utc;
use klapp_core::{Credentials, LoginGrant, RemoteMessage, SessionToken};
use reqwest::{Response, StatusCode};
use std::time::Duration;

const USER_AGENT: &str = concat!("klapp-sync/", env!("CARGO_PKG_VERSION"));

/// Capability the sync engine needs from the backend.
///
/// Implementations report rejections as [`ClientError::Unauthorized`] and never
/// re-authenticate on their own; session handling belongs to the caller.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<LoginGrant, ClientError>;

    /// Unread messages, most recent first.
    async fn fetch_messages(&self, token: &SessionToken)
        -> Result<Vec<RemoteMessage>, ClientError>;

    async fn mark_read(&self, token: &SessionToken, message_id: &str) -> Result<(), ClientError>;

    async fn mark_many_read(
        &self,
        token: &SessionToken,
        message_ids: &[String],
    ) -> Result<(), ClientError> {
        for message_id in message_ids {
            self.mark_read(token, message_id).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub lookback_days: u32,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpKlappClient {
    http: reqwest::Client,
    base_url: String,
    lookback_days: u32,
}

impl HttpKlappClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            lookback_days: config.lookback_days,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn fetch_detail(
        &self,
        token: &SessionToken,
        message_id: &str,
    ) -> Result<MessageDetail, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/v4/messages/{message_id}/parent")))
            .query(&[("include_drafts", "true")])
            .header("accept", "application/json")
            .header("user-role", "parent")
            .bearer_auth(token.expose())
            .send()
            .await?;

        let response = check_status(response, message_id)?;
        Ok(response.json().await?)
    }

    async fn post_read_request(
        &self,
        token: &SessionToken,
        message_ids: &[String],
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url("/v3/messages/read-request"))
            .header("accept", "application/json")
            .bearer_auth(token.expose())
            .json(&read_request(message_ids))
            .send()
            .await?;

        check_status(response, &message_ids.join(","))?;
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for HttpKlappClient {
    async fn login(&self, credentials: &Credentials) -> Result<LoginGrant, ClientError> {
        let response = self
            .http
            .post(self.url("/v2/authenticate"))
            .json(&serde_json::json!({
                "email": credentials.email,
                "password": credentials.password,
                "grant_type": "authenticate",
            }))
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::InvalidCredentials);
        }
        if !response.status().is_success() {
            return Err(ClientError::UnexpectedStatus(response.status().as_u16()));
        }

        let body: AuthenticateResponse = response.json().await?;
        let token = body
            .refresh_token
            .filter(|token| !token.is_empty())
            .ok_or(ClientError::InvalidCredentials)?;

        Ok(LoginGrant {
            token: SessionToken::new(token),
            expires_in_secs: body.expires_in,
        })
    }

    async fn fetch_messages(
        &self,
        token: &SessionToken,
    ) -> Result<Vec<RemoteMessage>, ClientError> {
        let from_date = Utc::now() - chrono::Duration::days(i64::from(self.lookback_days));

        let response = self
            .http
            .post(self.url("/v4/messages/parent"))
            .query(&[("include_drafts", "true")])
            .header("accept", "application/json")
            .header("user-role", "parent")
            .bearer_auth(token.expose())
            .json(&unread_filter(from_date))
            .send()
            .await?;

        let response = check_status(response, "messages")?;
        let headers: Vec<MessageHeader> = response.json().await?;

        let mut messages = Vec::with_capacity(headers.len());
        for header in headers {
            let Some(id) = header.id else {
                continue;
            };

            match self.fetch_detail(token, &id).await {
                Ok(detail) => messages.push(into_remote_message(&id, detail)),
                Err(ClientError::NotFound(_)) => {
                    tracing::debug!(message_id = %id, "message vanished before detail fetch");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(messages)
    }

    async fn mark_read(&self, token: &SessionToken, message_id: &str) -> Result<(), ClientError> {
        self.post_read_request(token, &[message_id.to_string()])
            .await
    }

    async fn mark_many_read(
        &self,
        token: &SessionToken,
        message_ids: &[String],
    ) -> Result<(), ClientError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        self.post_read_request(token, message_ids).await
    }
}

fn check_status(response: Response, subject: &str) -> Result<Response, ClientError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized),
        StatusCode::NOT_FOUND => Err(ClientError::NotFound(subject.to_string())),
        status => Err(ClientError::UnexpectedStatus(status.as_u16())),
    }
}
