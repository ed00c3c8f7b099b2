//! # dog-b2: Async Backblaze B2 uploads for DogRS applications
//!
//! `dog-b2` covers the stateful half of a B2 client: keeping the account
//! token alive, pooling pre-authorized upload URLs across concurrent uploads,
//! and pushing large files part by part with retries and SHA1 verification.
//!
//! ## Key Features
//!
//! - **Coalesced authorization**: concurrent callers that see an expired token share one refresh
//! - **Bounded endpoint cache**: upload URLs are reused per bucket, capped at `max_cache`, handed out in FIFO order
//! - **Large-file pipeline**: start / upload-part / finish with per-part retry and best-effort cancel on failure
//! - **Polymorphic sources**: in-memory buffers, local files, and forward-only streams
//! - **Transport agnostic**: anything implementing [`HttpTransport`]; `reqwest` by default
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_b2::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> B2Result<()> {
//! let client = B2Client::connect(B2Credentials::from_env("B2_")?, B2Config::from_env("B2_")?).await?;
//!
//! let receipt = client
//!     .upload(
//!         "4a48fe8875c6214145260818",
//!         UploadRequest::new("hello.txt").with_content_type("text/plain"),
//!         UploadSource::bytes("Hello, world!"),
//!     )
//!     .await?;
//!
//! println!("stored {} ({} bytes)", receipt.file_id(), receipt.size_bytes);
//! client.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────┐
//! │            B2Client             │  ← connect / upload / close
//! ├─────────────────────────────────┤
//! │         UploadPipeline          │  ← routing, retries, abandon
//! ├────────────────────┬────────────┤
//! │ UploadEndpointCache│ ChunkReader│  ← leases / sized parts
//! ├────────────────────┴────────────┤
//! │           AuthSession           │  ← account token, shared refresh
//! ├─────────────────────────────────┤
//! │      B2Api / HttpTransport      │  ← wire calls
//! └─────────────────────────────────┘
//! ```

pub mod api;
mod auth;
pub mod cache;
mod chunk;
mod client;
mod config;
mod error;
pub mod models;
#[cfg(feature = "tracing-basic")]
pub mod observability;
mod pipeline;
mod receipt;
mod retry;
pub mod transport;

pub use api::B2Api;
pub use auth::{AuthSession, AuthorizationContext};
pub use cache::{
    CacheStats, EndpointId, EndpointLease, EndpointMinter, EndpointScope, LeaseState, MintedEndpoint,
    PoolStats, ReleaseOutcome, UploadEndpoint, UploadEndpointCache,
};
pub use chunk::{sha1_hex, ByteStream, ChunkDescriptor, ChunkReader, UploadSource};
pub use client::B2Client;
pub use config::{B2Config, B2Credentials, RetryPolicy, DEFAULT_AUTH_URL};
pub use error::{B2Error, B2Result};
pub use models::FileInfo;
pub use pipeline::{LargeFileSession, UploadPipeline, UploadRequest, UploadState, AUTO_CONTENT_TYPE};
pub use receipt::{PartReceipt, UploadInfo, UploadReceipt};
pub use tokio_util::sync::CancellationToken;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        B2Client, B2Config, B2Credentials, B2Error, B2Result, ByteStream, RetryPolicy, UploadReceipt,
        UploadRequest, UploadSource,
    };
}
