use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::{
    api::B2Api,
    cache::UploadEndpointCache,
    chunk::UploadSource,
    pipeline::{UploadPipeline, UploadRequest},
    receipt::UploadReceipt,
    transport::{HttpTransport, ReqwestTransport},
    AuthSession, B2Config, B2Credentials, B2Error, B2Result,
};

/// Entry point: one authorized account with its own endpoint cache.
///
/// Clones share the session and the cache.
#[derive(Clone)]
pub struct B2Client {
    auth: AuthSession,
    cache: Arc<UploadEndpointCache>,
    pipeline: UploadPipeline,
}

impl B2Client {
    /// Authorize over HTTPS with a default `reqwest` client
    pub async fn connect(credentials: B2Credentials, config: B2Config) -> B2Result<Self> {
        Self::connect_with_transport(Arc::new(ReqwestTransport::new()), credentials, config).await
    }

    #[instrument(skip_all, fields(max_cache = config.max_cache, chunk_size = config.chunk_size))]
    pub async fn connect_with_transport(
        transport: Arc<dyn HttpTransport>,
        credentials: B2Credentials,
        config: B2Config,
    ) -> B2Result<Self> {
        config.validate()?;

        let api = B2Api::new(transport, config.request_timeout);
        let auth = AuthSession::connect(api, credentials, &config).await?;
        let cache = UploadEndpointCache::new(auth.clone(), config.max_cache, config.endpoint_ttl);
        let pipeline = UploadPipeline::new(auth.clone(), cache.clone(), config);

        Ok(Self { auth, cache, pipeline })
    }

    pub async fn upload(
        &self,
        bucket_id: &str,
        request: UploadRequest,
        source: UploadSource,
    ) -> B2Result<UploadReceipt> {
        self.upload_with_cancel(bucket_id, request, source, &CancellationToken::new())
            .await
    }

    /// Upload that stops between parts once `cancel` fires
    pub async fn upload_with_cancel(
        &self,
        bucket_id: &str,
        request: UploadRequest,
        source: UploadSource,
        cancel: &CancellationToken,
    ) -> B2Result<UploadReceipt> {
        if !self.is_connected() {
            return Err(B2Error::NotConnected);
        }
        self.pipeline.upload(bucket_id, request, source, cancel).await
    }

    /// Upload a local file under `file_name`
    pub async fn upload_path<P: Into<PathBuf>>(
        &self,
        bucket_id: &str,
        file_name: &str,
        path: P,
    ) -> B2Result<UploadReceipt> {
        self.upload(bucket_id, UploadRequest::new(file_name), UploadSource::path(path))
            .await
    }

    /// Drop cached endpoints and release the transport
    pub async fn close(&self) {
        self.cache.clear();
        self.auth.close().await;
        info!("b2 client closed");
    }

    pub fn is_connected(&self) -> bool {
        self.auth.is_connected()
    }

    pub fn auth(&self) -> &AuthSession {
        &self.auth
    }

    pub fn cache(&self) -> &Arc<UploadEndpointCache> {
        &self.cache
    }

    pub fn config(&self) -> &B2Config {
        self.pipeline.config()
    }
}
