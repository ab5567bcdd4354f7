//! # Secrets Vault
//!
//! Credentials for the speech service are looked up by name through a
//! [`SecretSource`] and cached locally, so starting a session does not hit the
//! backing store every time. Cached values are refreshed once they are older
//! than the configured interval.
//!
//! If a refresh fails but a previous value is cached, the previous value keeps
//! being served. A secret that was never available is a configuration error.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Where secret values come from.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Fetch the current value, `None` when no such secret exists.
    async fn fetch(&self, name: &str) -> AppResult<Option<String>>;
}

/// Reads secrets from process environment variables (including `.env`).
pub struct EnvSecretSource;

#[async_trait]
impl SecretSource for EnvSecretSource {
    async fn fetch(&self, name: &str) -> AppResult<Option<String>> {
        Ok(std::env::var(name).ok())
    }
}

#[derive(Clone)]
struct CachedSecret {
    value: String,
    fetched_at: Instant,
}

pub struct SecretsVault {
    source: Arc<dyn SecretSource>,
    refresh_interval: Duration,
    cache: RwLock<HashMap<String, CachedSecret>>,
}

impl SecretsVault {
    pub fn new(source: Arc<dyn SecretSource>, refresh_interval: Duration) -> Self {
        Self {
            source,
            refresh_interval,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Get a secret by name.
    ///
    /// ## Returns:
    /// - **Ok(value)**: fresh cached value, or newly fetched one
    /// - **Err(Configuration)**: the secret does not exist or is blank
    pub async fn get(&self, name: &str) -> AppResult<String> {
        let cached = self.cache.read().await.get(name).cloned();
        if let Some(secret) = &cached {
            if secret.fetched_at.elapsed() < self.refresh_interval {
                return Ok(secret.value.clone());
            }
        }

        match self.source.fetch(name).await {
            Ok(Some(value)) if !value.trim().is_empty() => {
                debug!(secret = name, "Secret refreshed");
                self.cache.write().await.insert(
                    name.to_string(),
                    CachedSecret {
                        value: value.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(value)
            }
            Ok(_) => {
                self.cache.write().await.remove(name);
                Err(AppError::Configuration(format!("secret '{}' is not set", name)))
            }
            Err(err) => match cached {
                Some(secret) => {
                    warn!(secret = name, error = %err, "Secret refresh failed, serving cached value");
                    Ok(secret.value)
                }
                None => Err(AppError::Configuration(format!(
                    "secret '{}' is unavailable: {}",
                    name, err
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingSource {
        value: Mutex<Option<String>>,
        fail: Mutex<bool>,
        fetches: AtomicUsize,
    }

    impl CountingSource {
        fn new(value: Option<&str>) -> Self {
            Self {
                value: Mutex::new(value.map(str::to_string)),
                fail: Mutex::new(false),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SecretSource for CountingSource {
        async fn fetch(&self, _name: &str) -> AppResult<Option<String>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if *self.fail.lock().unwrap() {
                return Err(AppError::Upstream("store offline".into()));
            }
            Ok(self.value.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn test_cached_within_refresh_interval() {
        let source = Arc::new(CountingSource::new(Some("sk-test")));
        let vault = SecretsVault::new(source.clone(), Duration::from_secs(300));
        assert_eq!(vault.get("KEY").await.unwrap(), "sk-test");
        assert_eq!(vault.get("KEY").await.unwrap(), "sk-test");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_secret_is_configuration_error() {
        let vault = SecretsVault::new(Arc::new(CountingSource::new(None)), Duration::from_secs(300));
        let err = vault.get("KEY").await.unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }

    /// With a zero refresh interval every get refetches; a failed refetch
    /// falls back to the last good value.
    #[tokio::test]
    async fn test_stale_value_served_when_refresh_fails() {
        let source = Arc::new(CountingSource::new(Some("sk-old")));
        let vault = SecretsVault::new(source.clone(), Duration::ZERO);
        assert_eq!(vault.get("KEY").await.unwrap(), "sk-old");

        *source.fail.lock().unwrap() = true;
        assert_eq!(vault.get("KEY").await.unwrap(), "sk-old");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }
}
