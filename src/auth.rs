use crate::config::AuthConfig;
use crate::error::{ErrorKind, FeedError};
use crate::retry::RetryRule;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Credentials stamped on every request.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub session_token: String,
    pub key_manager_token: Option<String>,
}

impl SessionToken {
    pub fn new(session_token: impl Into<String>) -> Self {
        Self {
            session_token: session_token.into(),
            key_manager_token: None,
        }
    }

    pub fn with_key_manager_token(mut self, token: impl Into<String>) -> Self {
        self.key_manager_token = Some(token.into());
        self
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken").finish_non_exhaustive()
    }
}

/// Obtains a fresh session. Implementations own the actual login mechanism.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self) -> Result<SessionToken, FeedError>;
}

/// Hands out a pre-provisioned token.
#[derive(Debug, Clone)]
pub struct StaticAuthenticator {
    token: SessionToken,
}

impl StaticAuthenticator {
    pub fn new(token: SessionToken) -> Self {
        Self { token }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        let mut token = SessionToken::new(config.session_token.clone());
        token.key_manager_token = config.key_manager_token.clone();
        Self::new(token)
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self) -> Result<SessionToken, FeedError> {
        Ok(self.token.clone())
    }
}

/// Session state shared by every call made on behalf of the bot.
pub struct AuthSession {
    authenticator: Arc<dyn Authenticator>,
    token: RwLock<Option<SessionToken>>,
    refresh_lock: Mutex<()>,
    refreshes: AtomicU64,
}

impl AuthSession {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            token: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Current token, or `Unauthorized` when the session was never established.
    pub async fn token(&self) -> Result<SessionToken, FeedError> {
        self.token
            .read()
            .await
            .clone()
            .ok_or_else(|| FeedError::Unauthorized("no session established".to_string()))
    }

    /// Re-authenticates and replaces the shared token. Concurrent callers are
    /// serialized so only one login is in flight at a time.
    pub async fn refresh(&self) -> Result<(), FeedError> {
        let _guard = self.refresh_lock.lock().await;
        debug!("Refreshing session");
        let token = self.authenticator.authenticate().await?;
        *self.token.write().await = Some(token);
        let count = self.refreshes.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Session refreshed ({} refresh(es) so far)", count);
        Ok(())
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Retry rule refreshing this session on `Unauthorized` failures.
    pub fn refresh_rule(self: &Arc<Self>) -> RetryRule {
        let session = Arc::clone(self);
        RetryRule::new(
            "refresh-session",
            |err| err.kind() == ErrorKind::Unauthorized,
            move || {
                let session = session.clone();
                async move { session.refresh().await }
            },
        )
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("refreshes", &self.refresh_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{RetryConfig, RetryExecutor};
    use std::time::Duration;

    struct CountingAuthenticator {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Authenticator for CountingAuthenticator {
        async fn authenticate(&self) -> Result<SessionToken, FeedError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SessionToken::new(format!("token-{}", n)))
        }
    }

    #[tokio::test]
    async fn test_token_before_refresh_is_unauthorized() {
        let session = AuthSession::new(Arc::new(StaticAuthenticator::new(SessionToken::new("t"))));
        assert!(matches!(session.token().await, Err(FeedError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_refresh_replaces_token() {
        let session = AuthSession::new(Arc::new(CountingAuthenticator {
            calls: AtomicU64::new(0),
        }));
        session.refresh().await.unwrap();
        assert_eq!(session.token().await.unwrap().session_token, "token-1");
        session.refresh().await.unwrap();
        assert_eq!(session.token().await.unwrap().session_token, "token-2");
        assert_eq!(session.refresh_count(), 2);
    }

    #[tokio::test]
    async fn test_refresh_rule_recovers_unauthorized() {
        let session = Arc::new(AuthSession::new(Arc::new(CountingAuthenticator {
            calls: AtomicU64::new(0),
        })));
        let executor = RetryExecutor::new(
            RetryConfig {
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(5),
                ..RetryConfig::default()
            },
            vec![session.refresh_rule()],
        );

        let token = executor
            .execute("whoami", || {
                let session = session.clone();
                async move { session.token().await }
            })
            .await
            .unwrap();

        assert_eq!(token.session_token, "token-1");
        assert_eq!(session.refresh_count(), 1);
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = SessionToken::new("secret").with_key_manager_token("km-secret");
        let rendered = format!("{:?}", token);
        assert!(!rendered.contains("secret"));
    }
}
