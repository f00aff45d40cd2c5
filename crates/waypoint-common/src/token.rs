//! Access token handling
//!
//! Every registry call goes through [`AccessTokenHolder::with_retry`]. The call is
//! made with the current token; when the registry answers 401/403 and a renewal
//! callback was configured, the callback runs once, the new token replaces the old
//! one and the call is retried exactly once.

use std::{fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{RegistryError, Result};

/// Source of fresh access tokens.
///
/// Implement this trait to hand the client a new token after the registry has
/// rejected the current one.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync + 'static {
    async fn renew(&self) -> anyhow::Result<String>;
}

/// A provider that invokes an async closure.
pub struct FnTokenProvider<F> {
    f: F,
}

impl<F, Fut> FnTokenProvider<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> AccessTokenProvider for FnTokenProvider<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    async fn renew(&self) -> anyhow::Result<String> {
        (self.f)().await
    }
}

/// Shareable handle to an [`AccessTokenProvider`]
#[derive(Clone)]
pub struct TokenCallback(Arc<dyn AccessTokenProvider>);

impl TokenCallback {
    pub fn new<P: AccessTokenProvider>(provider: P) -> Self {
        Self(Arc::new(provider))
    }

    /// Wrap an async closure
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        Self::new(FnTokenProvider::new(f))
    }

    pub async fn renew(&self) -> anyhow::Result<String> {
        self.0.renew().await
    }
}

impl fmt::Debug for TokenCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenCallback")
    }
}

/// Holds the token currently used for registry requests
pub struct AccessTokenHolder {
    token: RwLock<String>,
    callback: Option<TokenCallback>,
}

impl AccessTokenHolder {
    pub fn new(token: &str, callback: Option<TokenCallback>) -> Self {
        Self {
            token: RwLock::new(token.to_string()),
            callback,
        }
    }

    pub fn current(&self) -> String {
        self.token.read().clone()
    }

    pub fn set(&self, token: String) {
        *self.token.write() = token;
    }

    pub fn can_renew(&self) -> bool {
        self.callback.is_some()
    }

    /// Run `op` with the current token, renewing and retrying once on an authorization failure
    pub async fn with_retry<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let err = match op(self.current()).await {
            Err(err) if err.is_access_denied() => err,
            other => return other,
        };

        let Some(callback) = &self.callback else {
            return Err(err);
        };

        warn!(operation, error = %err, "Access denied, renewing access token");
        let fresh = callback
            .renew()
            .await
            .map_err(|e| RegistryError::TokenRenewal(format!("{:#}", e)))?;
        self.set(fresh.clone());
        debug!(operation, "Retrying with renewed access token");

        op(fresh).await
    }
}

impl fmt::Debug for AccessTokenHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenHolder")
            .field("has_token", &!self.token.read().is_empty())
            .field("can_renew", &self.can_renew())
            .finish()
    }
}
