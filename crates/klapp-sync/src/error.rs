use klapp_client::ClientError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    InvalidCredentials,
    Network,
    BackendError,
}

#[derive(Debug, Clone, Error)]
#[error("authentication failed ({reason:?}): {detail}")]
pub struct AuthError {
    pub reason: AuthFailure,
    pub detail: String,
}

impl AuthError {
    pub(crate) fn from_login(err: ClientError) -> Self {
        let reason = match &err {
            ClientError::InvalidCredentials | ClientError::Unauthorized => {
                AuthFailure::InvalidCredentials
            }
            ClientError::Timeout | ClientError::Http(_) => AuthFailure::Network,
            ClientError::NotFound(_) | ClientError::UnexpectedStatus(_) | ClientError::Data(_) => {
                AuthFailure::BackendError
            }
        };
        Self {
            reason,
            detail: err.to_string(),
        }
    }

    pub(crate) fn rejected_after_login() -> Self {
        Self {
            reason: AuthFailure::BackendError,
            detail: "fresh session rejected by backend".to_string(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("poll already in progress")]
    Busy,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown message id: {0}")]
pub struct NotFoundError(pub String);

#[derive(Debug, Clone, Error)]
#[error("read state of {message_ids:?} not confirmed upstream after {attempts} attempt(s): {reason}")]
pub struct RemoteWriteError {
    pub message_ids: Vec<String>,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Error)]
pub enum MarkReadError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error(transparent)]
    RemoteWrite(#[from] RemoteWriteError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine already running")]
    AlreadyRunning,
    #[error("engine is not running")]
    NotRunning,
}
