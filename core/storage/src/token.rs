//! Access/refresh token lifecycle for OAuth backends.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use driveshare_common::{Error, Result};

/// Interval of the proactive background refresh.
pub const DAILY_REFRESH: Duration = Duration::from_secs(24 * 60 * 60);

/// Tokens returned by a refresh exchange.
#[derive(Debug, Clone)]
pub struct Tokens {
    pub access_token: String,
    /// Possibly rotated refresh token.
    pub refresh_token: String,
    /// When the access token expires, if the service said so.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Tokens {
    /// Check if the access token is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        // Consider expired if less than 5 minutes remaining
        self.expires_at
            .map(|at| at < Utc::now() + ChronoDuration::minutes(5))
            .unwrap_or(false)
    }

    /// Expiry `expires_in` seconds from now.
    pub fn expiry_from_now(expires_in: Option<Duration>) -> Option<DateTime<Utc>> {
        expires_in
            .and_then(|d| ChronoDuration::from_std(d).ok())
            .map(|d| Utc::now() + d)
    }
}

/// Performs the refresh-token exchange against a backend's auth service.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Exchange `refresh_token` for a new access token.
    ///
    /// # Errors
    /// - Refresh token revoked or invalid
    /// - Auth service unreachable
    async fn refresh(&self, refresh_token: &str) -> Result<Tokens>;
}

/// Lifecycle state reported by [`TokenManager::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    Uninitialized,
    /// A refresh exchange is in flight.
    Refreshing,
    Ready,
    /// The last refresh failed with this message.
    Failed(String),
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenStatus::Uninitialized => write!(f, "uninitialized"),
            TokenStatus::Refreshing => write!(f, "refreshing"),
            TokenStatus::Ready => write!(f, "work"),
            TokenStatus::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

struct TokenState {
    refresh_token: String,
    current: Option<Tokens>,
    status: TokenStatus,
}

/// Owns one backend instance's tokens.
///
/// At most one refresh exchange runs at a time. A caller that waited for the
/// lock re-reads the state first and reuses a token another caller just
/// obtained instead of refreshing again.
pub struct TokenManager {
    source: Arc<dyn TokenSource>,
    state: RwLock<TokenState>,
    refresh_lock: Mutex<()>,
    rotated: watch::Sender<String>,
}

impl TokenManager {
    /// Create a manager that will obtain its first access token lazily.
    pub fn new(source: Arc<dyn TokenSource>, refresh_token: impl Into<String>) -> Self {
        Self::from_state(
            source,
            TokenState {
                refresh_token: refresh_token.into(),
                current: None,
                status: TokenStatus::Uninitialized,
            },
        )
    }

    /// Create a manager with tokens obtained elsewhere.
    pub fn with_tokens(source: Arc<dyn TokenSource>, tokens: Tokens) -> Self {
        Self::from_state(
            source,
            TokenState {
                refresh_token: tokens.refresh_token.clone(),
                current: Some(tokens),
                status: TokenStatus::Ready,
            },
        )
    }

    fn from_state(source: Arc<dyn TokenSource>, state: TokenState) -> Self {
        let (rotated, _) = watch::channel(state.refresh_token.clone());
        Self {
            source,
            state: RwLock::new(state),
            refresh_lock: Mutex::new(()),
            rotated,
        }
    }

    /// A valid access token, refreshing first if there is none or it expired.
    pub async fn access_token(&self) -> Result<String> {
        {
            let state = self.state.read().await;
            if let Some(tokens) = state.current.as_ref().filter(|t| !t.is_expired()) {
                return Ok(tokens.access_token.clone());
            }
        }
        self.refresh_if_stale(None).await
    }

    /// Replace an access token the backend rejected.
    ///
    /// If another caller already replaced `rejected` while this one waited
    /// for the lock, the newer token is returned without a network call.
    pub async fn refresh_rejected(&self, rejected: &str) -> Result<String> {
        self.refresh_if_stale(Some(rejected)).await
    }

    /// Refresh unconditionally.
    pub async fn force_refresh(&self) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        self.exchange().await
    }

    /// Run `call` with an access token, replaying it once after a refresh if
    /// the backend rejects the token.
    ///
    /// # Errors
    /// - Refresh failure, which is fatal for this call
    /// - `PermissionDenied` if the replay is rejected as well
    /// - Any other error from `call`, unchanged
    pub async fn with_auth_retry<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut(String) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let token = self.access_token().await?;
        match call(token.clone()).await {
            Err(Error::AuthExpired(reason)) => {
                debug!("Access token rejected ({}), refreshing", reason);
                let fresh = self.refresh_rejected(&token).await?;
                match call(fresh).await {
                    Err(Error::AuthExpired(reason)) => Err(Error::PermissionDenied(format!(
                        "Access token rejected after refresh: {}",
                        reason
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Current lifecycle status.
    pub async fn status(&self) -> TokenStatus {
        self.state.read().await.status.clone()
    }

    /// Current refresh token.
    pub async fn refresh_token(&self) -> String {
        self.state.read().await.refresh_token.clone()
    }

    /// Receive every rotated refresh token, for persisting it.
    pub fn subscribe_refresh_token(&self) -> watch::Receiver<String> {
        self.rotated.subscribe()
    }

    /// Refresh every `period` until the manager is dropped.
    pub fn spawn_periodic_refresh(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match manager.force_refresh().await {
                    Ok(_) => debug!("Scheduled token refresh done"),
                    Err(e) => warn!("Scheduled token refresh failed: {}", e),
                }
            }
        })
    }

    async fn refresh_if_stale(&self, rejected: Option<&str>) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        {
            let state = self.state.read().await;
            if let Some(tokens) = state.current.as_ref() {
                let replaced = rejected.map(|r| r != tokens.access_token).unwrap_or(true);
                if replaced && !tokens.is_expired() {
                    return Ok(tokens.access_token.clone());
                }
            }
        }
        self.exchange().await
    }

    /// Must be called with `refresh_lock` held.
    async fn exchange(&self) -> Result<String> {
        let refresh_token = {
            let mut state = self.state.write().await;
            state.status = TokenStatus::Refreshing;
            state.refresh_token.clone()
        };
        match self.source.refresh(&refresh_token).await {
            Ok(tokens) => {
                let access = tokens.access_token.clone();
                let new_refresh = tokens.refresh_token.clone();
                {
                    let mut state = self.state.write().await;
                    state.refresh_token = new_refresh.clone();
                    state.current = Some(tokens);
                    state.status = TokenStatus::Ready;
                }
                if new_refresh != refresh_token {
                    info!("Refresh token rotated");
                    self.rotated.send_replace(new_refresh);
                }
                info!("Access token refreshed");
                Ok(access)
            }
            Err(e) => {
                let e = match e {
                    Error::AuthExpired(msg) => {
                        Error::PermissionDenied(format!("Refresh token rejected: {}", msg))
                    }
                    other => other,
                };
                warn!("Token refresh failed: {}", e);
                self.state.write().await.status = TokenStatus::Failed(e.to_string());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        rotate: bool,
        fail: bool,
    }

    impl CountingSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                rotate: false,
                fail: false,
            })
        }
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn refresh(&self, refresh_token: &str) -> Result<Tokens> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(Error::AuthExpired("revoked".to_string()));
            }
            Ok(Tokens {
                access_token: format!("access-{}", n),
                refresh_token: if self.rotate {
                    format!("refresh-{}", n)
                } else {
                    refresh_token.to_string()
                },
                expires_at: Some(Utc::now() + ChronoDuration::hours(2)),
            })
        }
    }

    /// Holds every refresh until `release` is notified.
    struct GatedSource {
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl TokenSource for GatedSource {
        async fn refresh(&self, refresh_token: &str) -> Result<Tokens> {
            self.release.notified().await;
            Ok(Tokens {
                access_token: "access-gated".to_string(),
                refresh_token: refresh_token.to_string(),
                expires_at: None,
            })
        }
    }

    fn expired(access: &str) -> Tokens {
        Tokens {
            access_token: access.to_string(),
            refresh_token: "refresh-0".to_string(),
            expires_at: Some(Utc::now() - ChronoDuration::minutes(1)),
        }
    }

    #[test]
    fn test_expiry_buffer() {
        let mut tokens = expired("a");
        assert!(tokens.is_expired());
        tokens.expires_at = Some(Utc::now() + ChronoDuration::minutes(4));
        assert!(tokens.is_expired());
        tokens.expires_at = Some(Utc::now() + ChronoDuration::minutes(10));
        assert!(!tokens.is_expired());
        tokens.expires_at = None;
        assert!(!tokens.is_expired());
    }

    #[tokio::test]
    async fn test_lazy_initial_refresh() {
        let source = CountingSource::new();
        let manager = TokenManager::new(source.clone(), "refresh-0");
        assert_eq!(manager.status().await, TokenStatus::Uninitialized);

        assert_eq!(manager.access_token().await.unwrap(), "access-1");
        assert_eq!(manager.access_token().await.unwrap(), "access-1");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status().await.to_string(), "work");
    }

    #[tokio::test]
    async fn test_status_while_refreshing() {
        let source = Arc::new(GatedSource {
            release: tokio::sync::Notify::new(),
        });
        let manager = Arc::new(TokenManager::new(source.clone(), "refresh-0"));

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.access_token().await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.status().await != TokenStatus::Refreshing {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(manager.status().await.to_string(), "refreshing");

        source.release.notify_one();
        assert_eq!(pending.await.unwrap().unwrap(), "access-gated");
        assert_eq!(manager.status().await, TokenStatus::Ready);
    }

    #[tokio::test]
    async fn test_concurrent_expired_tokens_refresh_once() {
        let source = CountingSource::new();
        let manager = Arc::new(TokenManager::with_tokens(source.clone(), expired("stale")));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.access_token().await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "access-1");
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_rejections_refresh_once() {
        let source = CountingSource::new();
        let manager = Arc::new(TokenManager::new(source.clone(), "refresh-0"));
        let first = manager.access_token().await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                let first = first.clone();
                tokio::spawn(async move { manager.refresh_rejected(&first).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "access-2");
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_auth_retry_replays_once() {
        let source = CountingSource::new();
        let manager = TokenManager::new(source.clone(), "refresh-0");
        let seen = std::sync::Mutex::new(Vec::new());

        let result = manager
            .with_auth_retry(|token| {
                seen.lock().unwrap().push(token.clone());
                async move {
                    if token == "access-1" {
                        Err(Error::AuthExpired("401".to_string()))
                    } else {
                        Ok(token)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "access-2");
        assert_eq!(*seen.lock().unwrap(), vec!["access-1", "access-2"]);
    }

    #[tokio::test]
    async fn test_auth_retry_is_bounded() {
        let source = CountingSource::new();
        let manager = TokenManager::new(source.clone(), "refresh-0");
        let calls = AtomicUsize::new(0);

        let result: Result<()> = manager
            .with_auth_retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::AuthExpired("401".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(Error::PermissionDenied(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_is_fatal() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            rotate: false,
            fail: true,
        });
        let manager = TokenManager::new(source.clone(), "refresh-0");
        let calls = AtomicUsize::new(0);

        let result: Result<()> = manager
            .with_auth_retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(Error::PermissionDenied(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(manager.status().await, TokenStatus::Failed(_)));
    }

    #[tokio::test]
    async fn test_rotation_is_published() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            rotate: true,
            fail: false,
        });
        let manager = TokenManager::new(source, "refresh-0");
        let mut rotations = manager.subscribe_refresh_token();

        manager.force_refresh().await.unwrap();
        rotations.changed().await.unwrap();
        assert_eq!(*rotations.borrow(), "refresh-1");
        assert_eq!(manager.refresh_token().await, "refresh-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_refresh() {
        let source = CountingSource::new();
        let manager = Arc::new(TokenManager::new(source.clone(), "refresh-0"));
        let handle = manager.spawn_periodic_refresh(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(130)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        drop(manager);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(handle.is_finished());
    }
}
