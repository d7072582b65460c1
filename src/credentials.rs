//! # Service Credentials
//!
//! Each hosted collaborator receives its own [`ServiceCredential`] at
//! construction time instead of reading a process-wide cached key. A credential
//! remembers where its secret comes from and re-resolves it once the cached
//! value is older than the refresh interval, so rotated keys are picked up
//! without a restart.

use std::env;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
enum SecretSource {
    Environment(String),
    Fixed(String),
}

#[derive(Debug)]
struct CachedSecret {
    value: Option<String>,
    resolved_at: Instant,
}

/// A refreshable API key for one hosted service.
#[derive(Debug)]
pub struct ServiceCredential {
    source: SecretSource,
    refresh_after: Duration,
    cached: RwLock<Option<CachedSecret>>,
}

impl ServiceCredential {
    /// Read the key from `env_var`, re-reading it every `refresh_after`.
    pub fn from_env(env_var: impl Into<String>, refresh_after: Duration) -> Self {
        Self {
            source: SecretSource::Environment(env_var.into()),
            refresh_after,
            cached: RwLock::new(None),
        }
    }

    /// A key that never changes (tests, local development).
    pub fn fixed(secret: impl Into<String>) -> Self {
        Self {
            source: SecretSource::Fixed(secret.into()),
            refresh_after: Duration::MAX,
            cached: RwLock::new(None),
        }
    }

    /// Current secret, or `None` when the service runs without authentication.
    pub fn secret(&self) -> Option<String> {
        {
            let cached = self.cached.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cached.as_ref() {
                if entry.resolved_at.elapsed() < self.refresh_after {
                    return entry.value.clone();
                }
            }
        }

        let value = self.resolve();
        let mut cached = self.cached.write().unwrap_or_else(PoisonError::into_inner);
        *cached = Some(CachedSecret {
            value: value.clone(),
            resolved_at: Instant::now(),
        });
        value
    }

    fn resolve(&self) -> Option<String> {
        match &self.source {
            SecretSource::Fixed(secret) => Some(secret.clone()),
            SecretSource::Environment(name) => {
                let value = env::var(name).ok().filter(|v| !v.trim().is_empty());
                debug!(env_var = %name, present = value.is_some(), "Resolved service credential");
                value
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_secret() {
        let credential = ServiceCredential::fixed("abc");
        assert_eq!(credential.secret().as_deref(), Some("abc"));
    }

    #[test]
    fn test_env_secret_is_refreshed() {
        let name = "KVB_TEST_CREDENTIAL_REFRESH";
        env::set_var(name, "first");
        let credential = ServiceCredential::from_env(name, Duration::ZERO);
        assert_eq!(credential.secret().as_deref(), Some("first"));

        env::set_var(name, "second");
        assert_eq!(credential.secret().as_deref(), Some("second"));

        env::remove_var(name);
        assert_eq!(credential.secret(), None);
    }

    #[test]
    fn test_env_secret_is_cached_within_interval() {
        let name = "KVB_TEST_CREDENTIAL_CACHE";
        env::set_var(name, "cached");
        let credential = ServiceCredential::from_env(name, Duration::from_secs(3600));
        assert_eq!(credential.secret().as_deref(), Some("cached"));

        env::set_var(name, "rotated");
        assert_eq!(credential.secret().as_deref(), Some("cached"));
        env::remove_var(name);
    }
}
