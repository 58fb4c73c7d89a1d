use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("session rejected by backend")]
    Unauthorized,
    #[error("message not found: {0}")]
    NotFound(String),
    #[error("request timed out")]
    Timeout,
    #[error("http error: {0}")]
    Http(reqwest::Error),
    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),
    #[error("invalid data: {0}")]
    Data(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(err)
        }
    }
}

impl ClientError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}
