use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, instrument};

use crate::{AuthSession, B2Error, B2Result};

/// What an upload endpoint is authorized for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointScope {
    /// Small-file uploads into a bucket
    Bucket(String),
    /// Part uploads for one unfinished large file
    LargeFile(String),
}

impl std::fmt::Display for EndpointScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bucket(id) => write!(f, "bucket:{}", id),
            Self::LargeFile(id) => write!(f, "large_file:{}", id),
        }
    }
}

/// Identity of a minted endpoint, unique per cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u64);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ep-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Idle,
    InUse,
    Invalid,
}

/// A pre-authorized upload URL and its token
#[derive(Debug, Clone)]
pub struct UploadEndpoint {
    pub id: EndpointId,
    pub scope: EndpointScope,
    pub upload_url: String,
    pub authorization_token: String,
    pub minted_at: Instant,
    pub state: LeaseState,
}

/// Fresh URL/token pair returned by the API
#[derive(Debug, Clone)]
pub struct MintedEndpoint {
    pub upload_url: String,
    pub authorization_token: String,
}

/// How an upload ended with the endpoint it borrowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    RecoverableError,
    EndpointInvalid,
}

/// Source of new endpoints
#[async_trait]
pub trait EndpointMinter: Send + Sync {
    async fn mint(&self, scope: &EndpointScope) -> B2Result<MintedEndpoint>;
}

#[async_trait]
impl EndpointMinter for AuthSession {
    async fn mint(&self, scope: &EndpointScope) -> B2Result<MintedEndpoint> {
        let api = self.api().clone();
        let response = match scope {
            EndpointScope::Bucket(bucket_id) => {
                self.authorized(move |ctx| {
                    let api = api.clone();
                    async move { api.get_upload_url(&ctx, bucket_id).await }
                })
                .await?
            }
            EndpointScope::LargeFile(file_id) => {
                self.authorized(move |ctx| {
                    let api = api.clone();
                    async move { api.get_upload_part_url(&ctx, file_id).await }
                })
                .await?
            }
        };

        Ok(MintedEndpoint {
            upload_url: response.upload_url,
            authorization_token: response.authorization_token,
        })
    }
}

/// Counters across all scopes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub minted: u64,
    pub reused: u64,
    pub evicted: u64,
    pub invalidated: u64,
}

/// Occupancy of one scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub minting: usize,
    pub waiting: usize,
}

impl PoolStats {
    /// Entries counted against `max_cache`
    pub fn size(&self) -> usize {
        self.idle + self.in_use + self.minting
    }
}

enum Grant {
    Endpoint(UploadEndpoint),
    MintPermit,
}

struct IdleEntry {
    endpoint: UploadEndpoint,
    released_at: Instant,
}

#[derive(Default)]
struct Pool {
    /// LRU order: front = least recently released
    idle: VecDeque<IdleEntry>,
    in_use: HashSet<EndpointId>,
    minting: usize,
    waiters: VecDeque<oneshot::Sender<Grant>>,
}

impl Pool {
    fn size(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.minting
    }

    fn drop_expired(&mut self, ttl: Duration, now: Instant) -> usize {
        let before = self.idle.len();
        self.idle.retain(|entry| now.duration_since(entry.endpoint.minted_at) < ttl);
        before - self.idle.len()
    }

    fn prune_waiters(&mut self) {
        self.waiters.retain(|tx| !tx.is_closed());
    }

    /// Give the endpoint to the oldest live waiter, or hand it back
    fn hand_to_waiter(&mut self, mut endpoint: UploadEndpoint) -> Option<UploadEndpoint> {
        while let Some(tx) = self.waiters.pop_front() {
            endpoint.state = LeaseState::InUse;
            self.in_use.insert(endpoint.id);
            match tx.send(Grant::Endpoint(endpoint)) {
                Ok(()) => return None,
                Err(Grant::Endpoint(returned)) => {
                    self.in_use.remove(&returned.id);
                    endpoint = returned;
                }
                Err(Grant::MintPermit) => return None,
            }
        }
        endpoint.state = LeaseState::Idle;
        Some(endpoint)
    }

    /// Pass a freed capacity slot to the oldest live waiter
    fn grant_slot(&mut self) {
        while let Some(tx) = self.waiters.pop_front() {
            self.minting += 1;
            if tx.send(Grant::MintPermit).is_ok() {
                return;
            }
            self.minting -= 1;
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.len(),
            in_use: self.in_use.len(),
            minting: self.minting,
            waiting: self.waiters.iter().filter(|tx| !tx.is_closed()).count(),
        }
    }
}

#[derive(Default)]
struct CacheState {
    pools: HashMap<EndpointScope, Pool>,
    stats: CacheStats,
    /// Set by `clear`; no endpoint is handed out afterwards
    closed: bool,
}

enum Step {
    Ready(UploadEndpoint),
    Mint,
    Wait(oneshot::Receiver<Grant>),
}

/// Bounded per-scope pool of ready-to-use upload endpoints.
///
/// Each scope holds at most `max_cache` endpoints (idle, in use, or being
/// minted). Callers beyond that wait in FIFO order until an endpoint is
/// released or a slot frees up.
pub struct UploadEndpointCache {
    minter: Arc<dyn EndpointMinter>,
    max_cache: usize,
    ttl: Duration,
    next_id: AtomicU64,
    state: Mutex<CacheState>,
}

impl UploadEndpointCache {
    pub fn new<M: EndpointMinter + 'static>(minter: M, max_cache: usize, ttl: Duration) -> Arc<Self> {
        Self::with_minter(Arc::new(minter), max_cache, ttl)
    }

    pub fn with_minter(minter: Arc<dyn EndpointMinter>, max_cache: usize, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            minter,
            max_cache: max_cache.max(1),
            ttl,
            next_id: AtomicU64::new(1),
            state: Mutex::new(CacheState::default()),
        })
    }

    pub fn max_cache(&self) -> usize {
        self.max_cache
    }

    /// Borrow an endpoint, reusing an idle one when possible
    pub async fn acquire(self: &Arc<Self>, scope: &EndpointScope) -> B2Result<EndpointLease> {
        self.acquire_inner(scope, false).await
    }

    /// Borrow a newly minted endpoint, evicting the least recently used idle
    /// entry if the scope is full
    pub async fn acquire_fresh(self: &Arc<Self>, scope: &EndpointScope) -> B2Result<EndpointLease> {
        self.acquire_inner(scope, true).await
    }

    #[instrument(skip(self), fields(scope = %scope))]
    async fn acquire_inner(self: &Arc<Self>, scope: &EndpointScope, fresh: bool) -> B2Result<EndpointLease> {
        let step = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(B2Error::NotConnected);
            }
            let CacheState { pools, stats, .. } = &mut *state;
            let pool = pools.entry(scope.clone()).or_default();
            let expired = pool.drop_expired(self.ttl, Instant::now());
            if expired > 0 {
                debug!(expired, "dropped expired idle endpoints");
                stats.evicted += expired as u64;
            }
            pool.prune_waiters();

            if !pool.waiters.is_empty() {
                let (tx, rx) = oneshot::channel();
                pool.waiters.push_back(tx);
                Step::Wait(rx)
            } else if let Some(entry) = (!fresh).then(|| pool.idle.pop_back()).flatten() {
                let mut endpoint = entry.endpoint;
                endpoint.state = LeaseState::InUse;
                pool.in_use.insert(endpoint.id);
                stats.reused += 1;
                Step::Ready(endpoint)
            } else if pool.size() < self.max_cache {
                pool.minting += 1;
                Step::Mint
            } else if let Some(evicted) = fresh.then(|| pool.idle.pop_front()).flatten() {
                debug!(endpoint = %evicted.endpoint.id, "evicting least recently used idle endpoint");
                stats.evicted += 1;
                pool.minting += 1;
                Step::Mint
            } else {
                let (tx, rx) = oneshot::channel();
                pool.waiters.push_back(tx);
                Step::Wait(rx)
            }
        };

        let endpoint = match step {
            Step::Ready(endpoint) => endpoint,
            Step::Mint => self.mint(scope).await?,
            Step::Wait(rx) => {
                debug!("pool at capacity, waiting");
                let waiter = Waiter {
                    rx,
                    cache: self.clone(),
                    scope: scope.clone(),
                    done: false,
                };
                match waiter.wait().await {
                    Ok(Grant::Endpoint(endpoint)) => endpoint,
                    Ok(Grant::MintPermit) => self.mint(scope).await?,
                    Err(_) => return Err(B2Error::NotConnected),
                }
            }
        };

        Ok(EndpointLease {
            endpoint,
            cache: self.clone(),
            armed: true,
        })
    }

    /// Mint with a slot already reserved in `pool.minting`
    async fn mint(self: &Arc<Self>, scope: &EndpointScope) -> B2Result<UploadEndpoint> {
        let mut guard = MintGuard {
            cache: self.clone(),
            scope: scope.clone(),
            armed: true,
        };

        let minted = self.minter.mint(scope).await?;
        guard.armed = false;

        let id = EndpointId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state.lock();
        if state.closed {
            debug!(scope = %scope, "cache cleared while minting, dropping endpoint");
            return Err(B2Error::NotConnected);
        }
        let CacheState { pools, stats, .. } = &mut *state;
        // A discarded scope stays gone; the endpoint is dropped on release
        if let Some(pool) = pools.get_mut(scope) {
            pool.minting = pool.minting.saturating_sub(1);
            pool.in_use.insert(id);
        }
        stats.minted += 1;
        debug!(endpoint = %id, scope = %scope, "minted upload endpoint");

        Ok(UploadEndpoint {
            id,
            scope: scope.clone(),
            upload_url: minted.upload_url,
            authorization_token: minted.authorization_token,
            minted_at: Instant::now(),
            state: LeaseState::InUse,
        })
    }

    fn release_endpoint(&self, mut endpoint: UploadEndpoint, outcome: ReleaseOutcome) {
        let mut state = self.state.lock();
        let CacheState { pools, stats, .. } = &mut *state;
        let Some(pool) = pools.get_mut(&endpoint.scope) else {
            return;
        };
        pool.in_use.remove(&endpoint.id);

        match outcome {
            ReleaseOutcome::Success | ReleaseOutcome::RecoverableError => {
                if let Some(endpoint) = pool.hand_to_waiter(endpoint) {
                    pool.idle.push_back(IdleEntry {
                        endpoint,
                        released_at: Instant::now(),
                    });
                }
            }
            ReleaseOutcome::EndpointInvalid => {
                endpoint.state = LeaseState::Invalid;
                stats.invalidated += 1;
                debug!(endpoint = %endpoint.id, "discarding invalid endpoint");
                pool.grant_slot();
            }
        }
    }

    fn cancel_mint(&self, scope: &EndpointScope) {
        let mut state = self.state.lock();
        if let Some(pool) = state.pools.get_mut(scope) {
            pool.minting = pool.minting.saturating_sub(1);
            pool.grant_slot();
        }
    }

    fn return_grant(&self, scope: &EndpointScope, grant: Grant) {
        match grant {
            Grant::Endpoint(endpoint) => self.release_endpoint(endpoint, ReleaseOutcome::Success),
            Grant::MintPermit => self.cancel_mint(scope),
        }
    }

    /// Forget a scope; endpoints still on loan are dropped when released
    pub fn discard_scope(&self, scope: &EndpointScope) {
        if self.state.lock().pools.remove(scope).is_some() {
            debug!(scope = %scope, "discarded endpoint pool");
        }
    }

    /// Drop every pool and refuse later acquires; waiting callers fail
    /// with `NotConnected`
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.pools.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    pub fn pool_stats(&self, scope: &EndpointScope) -> PoolStats {
        self.state
            .lock()
            .pools
            .get(scope)
            .map(Pool::stats)
            .unwrap_or_default()
    }

    /// Idle endpoint ids of a scope, least recently used first
    pub fn idle_endpoints(&self, scope: &EndpointScope) -> Vec<EndpointId> {
        self.state
            .lock()
            .pools
            .get(scope)
            .map(|pool| pool.idle.iter().map(|entry| entry.endpoint.id).collect())
            .unwrap_or_default()
    }

    /// When the most recently released idle endpoint of a scope went idle
    pub fn last_released_at(&self, scope: &EndpointScope) -> Option<Instant> {
        self.state
            .lock()
            .pools
            .get(scope)
            .and_then(|pool| pool.idle.back().map(|entry| entry.released_at))
    }
}

/// Exclusive loan of an endpoint.
///
/// Dropping the lease without calling `release` returns the endpoint as idle.
pub struct EndpointLease {
    endpoint: UploadEndpoint,
    cache: Arc<UploadEndpointCache>,
    armed: bool,
}

impl EndpointLease {
    pub fn endpoint(&self) -> &UploadEndpoint {
        &self.endpoint
    }

    pub fn id(&self) -> EndpointId {
        self.endpoint.id
    }

    pub fn release(mut self, outcome: ReleaseOutcome) {
        self.armed = false;
        self.cache.release_endpoint(self.endpoint.clone(), outcome);
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        if self.armed {
            self.cache.release_endpoint(self.endpoint.clone(), ReleaseOutcome::Success);
        }
    }
}

impl std::fmt::Debug for EndpointLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointLease").field("endpoint", &self.endpoint.id).finish()
    }
}

/// Frees the reserved slot if minting fails or the caller goes away
struct MintGuard {
    cache: Arc<UploadEndpointCache>,
    scope: EndpointScope,
    armed: bool,
}

impl Drop for MintGuard {
    fn drop(&mut self) {
        if self.armed {
            self.cache.cancel_mint(&self.scope);
        }
    }
}

/// Queued acquire; a grant that lands after the caller gave up is returned
struct Waiter {
    rx: oneshot::Receiver<Grant>,
    cache: Arc<UploadEndpointCache>,
    scope: EndpointScope,
    done: bool,
}

impl Waiter {
    async fn wait(mut self) -> Result<Grant, oneshot::error::RecvError> {
        let grant = (&mut self.rx).await;
        self.done = true;
        grant
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.rx.close();
        if let Ok(grant) = self.rx.try_recv() {
            self.cache.return_grant(&self.scope, grant);
        }
    }
}
