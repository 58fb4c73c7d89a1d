use crate::error::TransportError;
use klapp_client::{ClientError, RemoteClient};
use klapp_core::{Credentials, LoginGrant, RemoteMessage, SessionToken};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Remote client with a hard deadline on every call.
#[derive(Clone)]
pub(crate) struct TimedClient {
    inner: Arc<dyn RemoteClient>,
    timeout: Duration,
}

impl TimedClient {
    pub(crate) fn new(inner: Arc<dyn RemoteClient>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    pub(crate) async fn login(&self, credentials: &Credentials) -> Result<LoginGrant, ClientError> {
        self.bounded(self.inner.login(credentials)).await
    }

    pub(crate) async fn fetch_messages(
        &self,
        token: &SessionToken,
    ) -> Result<Vec<RemoteMessage>, ClientError> {
        self.bounded(self.inner.fetch_messages(token)).await
    }

    pub(crate) async fn mark_read(
        &self,
        token: &SessionToken,
        message_ids: &[String],
    ) -> Result<(), ClientError> {
        match message_ids {
            [single] => self.bounded(self.inner.mark_read(token, single)).await,
            many => self.bounded(self.inner.mark_many_read(token, many)).await,
        }
    }

    pub(crate) fn transport_error(&self, err: ClientError) -> TransportError {
        match err {
            ClientError::Timeout => TransportError::Timeout(self.timeout),
            other => TransportError::Failed(other.to_string()),
        }
    }
}
