use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    api::B2Api,
    cache::{EndpointLease, EndpointScope, ReleaseOutcome, UploadEndpointCache},
    chunk::{sha1_hex, ChunkDescriptor, ChunkReader, UploadSource},
    models::FileInfo,
    receipt::{PartReceipt, UploadInfo, UploadReceipt},
    AuthSession, AuthorizationContext, B2Config, B2Error, B2Result, RetryPolicy,
};

/// Content type that lets B2 pick one from the file name
pub const AUTO_CONTENT_TYPE: &str = "b2/x-auto";

/// Name and metadata of the file being uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub file_name: String,
    pub content_type: String,
    /// Sent as `X-Bz-Info-*` headers, or `fileInfo` for large files
    pub file_info: BTreeMap<String, String>,
}

impl UploadRequest {
    pub fn new<S: Into<String>>(file_name: S) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: AUTO_CONTENT_TYPE.to_string(),
            file_info: BTreeMap::new(),
        }
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_info<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.file_info.insert(key.into(), value.into());
        self
    }
}

/// Where one upload invocation stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Start,
    SmallUpload,
    LargeUploadInit,
    Uploading { part: u32 },
    Finishing,
    Done,
    Aborted,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

/// Server-side unfinished large file and the parts committed so far
#[derive(Debug, Clone)]
pub struct LargeFileSession {
    pub file_id: String,
    pub bucket_id: String,
    /// Next part number to upload
    pub part_number: u32,
    pub committed_part_sha1s: Vec<String>,
    pub state: UploadState,
    parts: Vec<PartReceipt>,
}

impl LargeFileSession {
    fn new(file_id: String, bucket_id: String) -> Self {
        Self {
            file_id,
            bucket_id,
            part_number: 1,
            committed_part_sha1s: Vec::new(),
            state: UploadState::LargeUploadInit,
            parts: Vec::new(),
        }
    }

    fn transition(&mut self, next: UploadState) {
        debug!(file_id = %self.file_id, from = ?self.state, to = ?next, "large file state");
        self.state = next;
    }

    fn commit(&mut self, part: PartReceipt) {
        self.committed_part_sha1s.push(part.content_sha1.clone());
        self.part_number = part.part_number + 1;
        self.parts.push(part);
    }

    pub fn parts(&self) -> &[PartReceipt] {
        &self.parts
    }
}

enum Route {
    Small(Bytes),
    Large,
}

/// Per-transmission retry bookkeeping shared by small files and parts
struct Attempts<'a> {
    policy: &'a RetryPolicy,
    /// Counted attempt currently being made, starting at 1
    attempt: u32,
    endpoint_retry_used: bool,
    fresh_endpoint: bool,
}

impl<'a> Attempts<'a> {
    fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 1,
            endpoint_retry_used: false,
            fresh_endpoint: false,
        }
    }

    async fn lease(&self, cache: &Arc<UploadEndpointCache>, scope: &EndpointScope) -> B2Result<EndpointLease> {
        if self.fresh_endpoint {
            cache.acquire_fresh(scope).await
        } else {
            cache.acquire(scope).await
        }
    }

    /// Decide whether a failed attempt may go again, sleeping for the backoff
    async fn record(&mut self, err: B2Error, what: &str) -> B2Result<()> {
        if err.is_endpoint_invalid() && !self.endpoint_retry_used {
            self.endpoint_retry_used = true;
            self.fresh_endpoint = false;
            debug!(what, attempt = self.attempt, error = %err, "endpoint invalid, retrying on a new endpoint");
            return Ok(());
        }
        if !err.is_transient() && !err.is_endpoint_invalid() {
            return Err(err);
        }
        if self.attempt >= self.policy.max_attempts {
            return Err(B2Error::RetryExhausted {
                attempts: self.attempt,
                last: Box::new(err),
            });
        }

        warn!(what, attempt = self.attempt, error = %err, "upload attempt failed, backing off");
        self.fresh_endpoint = err.is_transient();
        self.policy.pause(self.attempt).await;
        self.attempt += 1;
        Ok(())
    }
}

fn release_outcome(err: &B2Error) -> ReleaseOutcome {
    if err.is_endpoint_invalid() {
        ReleaseOutcome::EndpointInvalid
    } else {
        ReleaseOutcome::RecoverableError
    }
}

/// A checksum the server echoes back must match the one we sent
fn verify_sha1(what: &str, expected: &str, returned: Option<&str>) -> B2Result<()> {
    match returned {
        Some(returned) if returned != "none" && !returned.eq_ignore_ascii_case(expected) => Err(B2Error::integrity(
            format!("{} sha1 mismatch: sent {}, server stored {}", what, expected, returned),
        )),
        _ => Ok(()),
    }
}

/// Drives one upload from source to a server-confirmed file.
///
/// Small payloads go up in a single call; everything else becomes a large
/// file uploaded part by part, in order, on endpoints borrowed from the cache.
#[derive(Clone)]
pub struct UploadPipeline {
    auth: AuthSession,
    cache: Arc<UploadEndpointCache>,
    config: B2Config,
}

impl UploadPipeline {
    pub fn new(auth: AuthSession, cache: Arc<UploadEndpointCache>, config: B2Config) -> Self {
        Self { auth, cache, config }
    }

    pub fn config(&self) -> &B2Config {
        &self.config
    }

    #[instrument(skip_all, fields(bucket_id = %bucket_id, file_name = %request.file_name))]
    pub async fn upload(
        &self,
        bucket_id: &str,
        request: UploadRequest,
        source: UploadSource,
        cancel: &CancellationToken,
    ) -> B2Result<UploadReceipt> {
        if !self.auth.is_connected() {
            return Err(B2Error::NotConnected);
        }
        if cancel.is_cancelled() {
            return Err(B2Error::Cancelled);
        }

        let mut reader = ChunkReader::open(source, self.config.chunk_size).await?;
        match self.route(&mut reader).await? {
            Route::Small(payload) => self.small_upload(bucket_id, &request, payload, cancel).await,
            Route::Large => self.large_upload(bucket_id, &request, reader, cancel).await,
        }
    }

    async fn route(&self, reader: &mut ChunkReader) -> B2Result<Route> {
        let threshold = self.config.small_file_threshold();

        // A declared stream size is only a hint; a short one is confirmed by reading
        if !reader.is_seekable() && reader.size().is_some_and(|size| size > threshold) {
            return Ok(Route::Large);
        }
        if reader.ends_within(threshold).await? {
            return Ok(Route::Small(reader.read_to_end().await?));
        }
        Ok(Route::Large)
    }

    async fn small_upload(
        &self,
        bucket_id: &str,
        request: &UploadRequest,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> B2Result<UploadReceipt> {
        debug!(state = ?UploadState::SmallUpload, size = payload.len(), "routing to single upload");
        if cancel.is_cancelled() {
            return Err(B2Error::Cancelled);
        }

        let scope = EndpointScope::Bucket(bucket_id.to_string());
        let content_sha1 = sha1_hex(&payload);
        let mut attempts = Attempts::new(&self.config.retry);

        loop {
            let lease = match attempts.lease(&self.cache, &scope).await {
                Ok(lease) => lease,
                Err(err) => {
                    attempts.record(err, "get_upload_url").await?;
                    continue;
                }
            };

            let sent = self
                .api()
                .upload_file(lease.endpoint(), request, payload.clone(), &content_sha1)
                .await;

            match sent {
                Ok(file) => {
                    lease.release(ReleaseOutcome::Success);
                    verify_sha1("file", &content_sha1, file.content_sha1.as_deref())?;
                    info!(file_id = %file.file_id, size = payload.len(), "file uploaded");
                    return Ok(UploadReceipt::new(
                        file,
                        bucket_id.to_string(),
                        payload.len() as u64,
                        UploadInfo::Single {
                            attempts: attempts.attempt,
                        },
                    ));
                }
                Err(err) => {
                    lease.release(release_outcome(&err));
                    attempts.record(err, "upload_file").await?;
                }
            }
        }
    }

    async fn large_upload(
        &self,
        bucket_id: &str,
        request: &UploadRequest,
        mut reader: ChunkReader,
        cancel: &CancellationToken,
    ) -> B2Result<UploadReceipt> {
        debug!(state = ?UploadState::LargeUploadInit, size = ?reader.size(), "routing to large file upload");

        let started = self
            .account_call("start_large_file", move |api, ctx| async move {
                api.start_large_file(&ctx, bucket_id, request).await
            })
            .await?;

        let mut session = LargeFileSession::new(started.file_id, bucket_id.to_string());
        info!(file_id = %session.file_id, "large file started");

        let result = self.upload_parts(&mut session, &mut reader, cancel).await;
        let scope = EndpointScope::LargeFile(session.file_id.clone());

        let outcome = match result {
            Ok(()) => self.finish(&mut session, reader.position()).await,
            Err(err) => Err(err),
        };
        self.cache.discard_scope(&scope);

        match outcome {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                session.transition(UploadState::Aborted);
                self.abandon(&session).await;
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        session: &mut LargeFileSession,
        reader: &mut ChunkReader,
        cancel: &CancellationToken,
    ) -> B2Result<()> {
        let scope = EndpointScope::LargeFile(session.file_id.clone());

        loop {
            if cancel.is_cancelled() {
                info!(file_id = %session.file_id, part = session.part_number, "upload cancelled");
                return Err(B2Error::Cancelled);
            }

            let chunk = match reader.next().await? {
                Some(chunk) => chunk,
                None => return Ok(()),
            };

            session.transition(UploadState::Uploading {
                part: chunk.part_number(),
            });
            let part = self.upload_part(&scope, reader, chunk).await?;
            session.commit(part);
        }
    }

    #[instrument(skip_all, fields(scope = %scope, part = chunk.part_number()))]
    async fn upload_part(
        &self,
        scope: &EndpointScope,
        reader: &mut ChunkReader,
        chunk: ChunkDescriptor,
    ) -> B2Result<PartReceipt> {
        let offset = chunk.offset;
        let part_number = chunk.part_number();
        let mut pending = Some(chunk);
        let mut attempts = Attempts::new(&self.config.retry);

        loop {
            let chunk = match pending.take() {
                Some(chunk) => chunk,
                None => reader.chunk_at(offset).await?,
            };

            let lease = match attempts.lease(&self.cache, scope).await {
                Ok(lease) => lease,
                Err(err) => {
                    pending = Some(chunk);
                    attempts.record(err, "get_upload_part_url").await?;
                    continue;
                }
            };

            match self.api().upload_part(lease.endpoint(), &chunk).await {
                Ok(response) => {
                    lease.release(ReleaseOutcome::Success);
                    verify_sha1("part", &chunk.content_sha1, Some(response.content_sha1.as_str()))?;
                    debug!(part = part_number, attempts = attempts.attempt, "part committed");
                    return Ok(PartReceipt {
                        part_number,
                        size_bytes: chunk.length,
                        content_sha1: chunk.content_sha1,
                        attempts: attempts.attempt,
                    });
                }
                Err(err) => {
                    lease.release(release_outcome(&err));
                    drop(chunk);
                    attempts.record(err, "upload_part").await?;
                }
            }
        }
    }

    async fn finish(&self, session: &mut LargeFileSession, size_bytes: u64) -> B2Result<UploadReceipt> {
        session.transition(UploadState::Finishing);
        let file_id = session.file_id.clone();
        let part_sha1s = session.committed_part_sha1s.clone();
        let (file_id, part_sha1s) = (file_id.as_str(), part_sha1s.as_slice());

        let file: FileInfo = self
            .account_call("finish_large_file", move |api, ctx| async move {
                api.finish_large_file(&ctx, file_id, part_sha1s).await
            })
            .await?;

        session.transition(UploadState::Done);
        info!(file_id = %file.file_id, parts = session.parts.len(), size = size_bytes, "large file finished");

        Ok(UploadReceipt::new(
            file,
            session.bucket_id.clone(),
            size_bytes,
            UploadInfo::Large {
                file_id: session.file_id.clone(),
                part_size: self.config.chunk_size,
                parts: session.parts.clone(),
            },
        ))
    }

    /// Best-effort cancel of an unfinished large file
    async fn abandon(&self, session: &LargeFileSession) {
        let file_id = session.file_id.as_str();
        let cancelled = self
            .auth
            .authorized(move |ctx| {
                let api = self.api().clone();
                async move { api.cancel_large_file(&ctx, file_id).await }
            })
            .await;

        match cancelled {
            Ok(_) => info!(file_id, parts = session.parts.len(), "unfinished large file cancelled"),
            Err(err) => warn!(file_id, error = %err, "failed to cancel unfinished large file"),
        }
    }

    /// Account-token call with transient retries and one refresh on expiry
    async fn account_call<T, F, Fut>(&self, operation: &str, op: F) -> B2Result<T>
    where
        F: Fn(B2Api, Arc<AuthorizationContext>) -> Fut,
        Fut: Future<Output = B2Result<T>>,
    {
        let op = &op;
        let auth = &self.auth;
        self.config
            .retry
            .run(operation, move |_| auth.authorized(move |ctx| op(auth.api().clone(), ctx)))
            .await
    }

    fn api(&self) -> &B2Api {
        self.auth.api()
    }
}
