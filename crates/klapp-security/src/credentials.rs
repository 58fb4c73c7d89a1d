use crate::{SecretKey, SecretStore, SecurityError};
use klapp_core::Credentials;

pub const PASSWORD_ENV_VAR: &str = "KLAPP_PASSWORD";

const SERVICE_NAME: &str = "io.klapp.sync";
const PASSWORD_NAMESPACE: &str = "account_password";

/// Account password lookup backed by the OS keychain.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    secrets: SecretStore,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(SecretStore::new(SERVICE_NAME))
    }
}

impl CredentialStore {
    pub fn new(secrets: SecretStore) -> Self {
        Self { secrets }
    }

    pub fn store_password(&self, email: &str, password: &str) -> Result<(), SecurityError> {
        let email = normalized_email(email)?;
        self.secrets.set(&password_key(&email), password)
    }

    pub fn forget_password(&self, email: &str) -> Result<(), SecurityError> {
        let email = normalized_email(email)?;
        self.secrets.delete(&password_key(&email))
    }

    /// Environment first, then the keychain.
    pub fn resolve(&self, email: &str) -> Result<Credentials, SecurityError> {
        self.resolve_with(email, std::env::var(PASSWORD_ENV_VAR).ok())
    }

    pub fn resolve_with(
        &self,
        email: &str,
        env_password: Option<String>,
    ) -> Result<Credentials, SecurityError> {
        let email = normalized_email(email)?;

        if let Some(password) = env_password.filter(|value| !value.is_empty()) {
            tracing::debug!(%email, "using password from environment");
            return Ok(Credentials::new(email, password));
        }

        match self.secrets.get(&password_key(&email))? {
            Some(password) => Ok(Credentials::new(email, password)),
            None => Err(SecurityError::MissingPassword(email)),
        }
    }
}

fn normalized_email(email: &str) -> Result<String, SecurityError> {
    let email = email.trim();
    if email.is_empty() {
        return Err(SecurityError::MissingEmail);
    }
    Ok(email.to_ascii_lowercase())
}

fn password_key(email: &str) -> SecretKey {
    SecretKey {
        namespace: PASSWORD_NAMESPACE.to_string(),
        id: email.to_string(),
    }
}
