//! Credential authorization checks for data-source tools.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::RwLock;

/// Looks up whether a tool credential has been authorized.
#[async_trait]
pub trait CredentialChecker: Send + Sync {
    /// The authorized token for `credential` in `namespace`, if any.
    async fn token(&self, namespace: &str, credential: &str) -> Option<SecretString>;

    async fn is_authorized(&self, namespace: &str, credential: &str) -> bool {
        self.token(namespace, credential).await.is_some()
    }
}

/// Credentials held in memory, keyed by namespace and credential name.
#[derive(Default)]
pub struct StaticCredentials {
    tokens: RwLock<HashMap<(String, String), SecretString>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `KSYNC_CREDENTIAL_<NAME>` variables into `namespace`.
    pub fn from_env(namespace: &str) -> Self {
        let tokens = std::env::vars()
            .filter_map(|(key, value)| {
                let name = key.strip_prefix("KSYNC_CREDENTIAL_")?;
                if name.is_empty() || value.is_empty() {
                    return None;
                }
                Some((
                    (namespace.to_string(), name.to_ascii_lowercase()),
                    SecretString::from(value),
                ))
            })
            .collect();
        Self {
            tokens: RwLock::new(tokens),
        }
    }

    pub async fn authorize(&self, namespace: &str, credential: &str, token: SecretString) {
        self.tokens
            .write()
            .await
            .insert((namespace.to_string(), credential.to_string()), token);
    }

    pub async fn revoke(&self, namespace: &str, credential: &str) {
        self.tokens
            .write()
            .await
            .remove(&(namespace.to_string(), credential.to_string()));
    }
}

#[async_trait]
impl CredentialChecker for StaticCredentials {
    async fn token(&self, namespace: &str, credential: &str) -> Option<SecretString> {
        self.tokens
            .read()
            .await
            .get(&(namespace.to_string(), credential.to_string()))
            .filter(|t| !t.expose_secret().is_empty())
            .cloned()
    }
}
