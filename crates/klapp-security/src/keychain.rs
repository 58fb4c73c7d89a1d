use crate::SecurityError;

#[derive(Debug, Clone)]
pub struct SecretStore {
    service_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretKey {
    pub namespace: String,
    pub id: String,
}

impl SecretKey {
    pub fn as_username(&self) -> String {
        format!("{}:{}", self.namespace, self.id)
    }
}

impl SecretStore {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    pub fn set(&self, key: &SecretKey, value: &str) -> Result<(), SecurityError> {
        let entry = keyring::Entry::new(&self.service_name, &key.as_username())?;
        entry.set_password(value)?;
        Ok(())
    }

    pub fn get(&self, key: &SecretKey) -> Result<Option<String>, SecurityError> {
        let entry = keyring::Entry::new(&self.service_name, &key.as_username())?;
        match entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn delete(&self, key: &SecretKey) -> Result<(), SecurityError> {
        let entry = keyring::Entry::new(&self.service_name, &key.as_username())?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SecretKey;

    #[test]
    fn username_joins_namespace_and_id() {
        let key = SecretKey {
            namespace: "account_password".to_string(),
            id: "parent@example.org".to_string(),
        };
        assert_eq!(key.as_username(), "account_password:parent@example.org");
    }
}
