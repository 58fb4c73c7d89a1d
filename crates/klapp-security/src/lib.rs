mod credentials;
mod error;
mod keychain;

pub use credentials::{CredentialStore, PASSWORD_ENV_VAR};
pub use error::SecurityError;
pub use keychain::{SecretKey, SecretStore};
