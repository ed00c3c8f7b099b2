use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::{api::B2Api, models::Allowed, B2Config, B2Credentials, B2Error, B2Result, RetryPolicy};

/// Account authorization obtained from `b2_authorize_account`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationContext {
    pub account_id: String,
    pub api_url: String,
    pub download_url: String,
    pub authorization_token: String,
    pub token_issued_at: DateTime<Utc>,
    pub allowed: Allowed,
    pub recommended_part_size: Option<u64>,
    /// Increases by one with every successful authorization
    pub generation: u64,
}

impl AuthorizationContext {
    /// Full URL of an API operation, e.g. `b2_get_upload_url`
    pub fn endpoint(&self, operation: &str) -> String {
        format!("{}/b2api/v2/{}", self.api_url.trim_end_matches('/'), operation)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.allowed.capabilities.iter().any(|c| c == capability)
    }

    /// Time since the token was issued
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.token_issued_at).to_std().unwrap_or_default()
    }
}

type SharedRefresh = Shared<BoxFuture<'static, B2Result<Arc<AuthorizationContext>>>>;

struct AuthState {
    context: Option<Arc<AuthorizationContext>>,
    refresh: Option<SharedRefresh>,
    closed: bool,
}

struct AuthInner {
    api: B2Api,
    credentials: B2Credentials,
    auth_url: String,
    retry: RetryPolicy,
    refresh_after: Duration,
    generation: AtomicU64,
    state: Mutex<AuthState>,
}

/// Owns the account token and refreshes it on demand.
///
/// Concurrent refresh requests share one in-flight authorization call.
#[derive(Clone)]
pub struct AuthSession {
    inner: Arc<AuthInner>,
}

impl AuthSession {
    /// Authorize once and keep the resulting context
    #[instrument(skip_all, fields(key_id = %credentials.key_id))]
    pub async fn connect(api: B2Api, credentials: B2Credentials, config: &B2Config) -> B2Result<Self> {
        let session = Self {
            inner: Arc::new(AuthInner {
                api,
                credentials,
                auth_url: config.auth_url.clone(),
                retry: config.retry.clone(),
                refresh_after: config.token_refresh_after,
                generation: AtomicU64::new(0),
                state: Mutex::new(AuthState {
                    context: None,
                    refresh: None,
                    closed: false,
                }),
            }),
        };

        let context = session.join_refresh()?.await?;
        info!(account_id = %context.account_id, api_url = %context.api_url, "b2 account authorized");
        Ok(session)
    }

    /// Cached context; never touches the network
    pub fn current_context(&self) -> B2Result<Arc<AuthorizationContext>> {
        let state = self.inner.state.lock();
        if state.closed {
            return Err(B2Error::NotConnected);
        }
        state.context.clone().ok_or(B2Error::AuthorizationExpired)
    }

    /// Context that is safe to use right now, refreshing first if the token
    /// is older than the refresh window or has been invalidated
    pub async fn fresh_context(&self) -> B2Result<Arc<AuthorizationContext>> {
        let pending = {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(B2Error::NotConnected);
            }
            match &state.context {
                Some(ctx) if ctx.age(Utc::now()) < self.inner.refresh_after => return Ok(ctx.clone()),
                Some(ctx) => {
                    debug!(generation = ctx.generation, "account token past refresh window");
                    None
                }
                None => state.refresh.clone(),
            }
        };

        match pending {
            Some(refresh) => refresh.await,
            None => self.invalidate_and_refresh().await,
        }
    }

    /// Drop the current context and fetch a new one.
    ///
    /// Callers arriving while a refresh is in flight wait on that refresh and
    /// receive the same context.
    pub async fn invalidate_and_refresh(&self) -> B2Result<Arc<AuthorizationContext>> {
        let refresh = {
            let mut state = self.inner.state.lock();
            state.context = None;
            drop(state);
            self.join_refresh()?
        };
        refresh.await
    }

    /// Refresh only if no newer context than `seen_generation` exists yet
    pub async fn refresh_if_stale(&self, seen_generation: u64) -> B2Result<Arc<AuthorizationContext>> {
        let pending = {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(B2Error::NotConnected);
            }
            if let Some(ctx) = state.context.as_ref().filter(|ctx| ctx.generation > seen_generation) {
                return Ok(ctx.clone());
            }
            state.refresh.clone()
        };

        match pending {
            Some(refresh) => refresh.await,
            None => self.invalidate_and_refresh().await,
        }
    }

    /// Run an account-token call, refreshing once if the token has expired
    pub async fn authorized<T, F, Fut>(&self, mut op: F) -> B2Result<T>
    where
        F: FnMut(Arc<AuthorizationContext>) -> Fut,
        Fut: Future<Output = B2Result<T>>,
    {
        let ctx = self.fresh_context().await?;
        let seen = ctx.generation;

        match op(ctx).await {
            Err(B2Error::AuthorizationExpired) => {
                info!(generation = seen, "account token expired, refreshing");
                let ctx = self.refresh_if_stale(seen).await?;
                op(ctx).await
            }
            other => other,
        }
    }

    /// Release the transport; later calls fail with `NotConnected`
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.context = None;
            state.refresh = None;
        }
        self.inner.api.close().await;
        debug!("b2 session closed");
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.state.lock().closed
    }

    pub(crate) fn api(&self) -> &B2Api {
        &self.inner.api
    }

    /// Shared handle to the in-flight refresh, starting one if needed
    fn join_refresh(&self) -> B2Result<SharedRefresh> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(B2Error::NotConnected);
        }
        if let Some(refresh) = &state.refresh {
            return Ok(refresh.clone());
        }

        let inner = self.inner.clone();
        let refresh = async move {
            let result = inner.authorize().await;
            let mut state = inner.state.lock();
            state.refresh = None;
            if state.closed {
                return Err(B2Error::NotConnected);
            }
            if let Ok(ctx) = &result {
                state.context = Some(ctx.clone());
            }
            result
        }
        .boxed()
        .shared();

        state.refresh = Some(refresh.clone());
        Ok(refresh)
    }
}

impl AuthInner {
    async fn authorize(&self) -> B2Result<Arc<AuthorizationContext>> {
        let response = self
            .retry
            .run("authorize_account", |_| {
                self.api.authorize_account(&self.auth_url, &self.credentials)
            })
            .await
            .map_err(|err| match err {
                B2Error::RetryExhausted { attempts, last } => {
                    warn!(attempts, error = %last, "authorization gave up");
                    B2Error::connection(format!("authorization failed after {} attempts: {}", attempts, last))
                }
                other => other,
            })?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "account token issued");

        Ok(Arc::new(AuthorizationContext {
            account_id: response.account_id,
            api_url: response.api_url,
            download_url: response.download_url,
            authorization_token: response.authorization_token,
            token_issued_at: Utc::now(),
            allowed: response.allowed,
            recommended_part_size: response.recommended_part_size,
            generation,
        }))
    }
}
