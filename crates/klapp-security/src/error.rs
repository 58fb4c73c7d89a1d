use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("keychain error: {0}")]
    Keychain(#[from] keyring::Error),
    #[error("no password stored for {0}")]
    MissingPassword(String),
    #[error("account email is not configured")]
    MissingEmail,
}
