use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    models::{
        AuthorizeAccountResponse, CancelLargeFileResponse, ErrorBody, FileIdRequest, FileInfo,
        FinishLargeFileRequest, GetUploadUrlRequest, StartLargeFileRequest, UploadPartResponse,
        UploadUrlResponse,
    },
    transport::{HttpRequest, HttpResponse, HttpTransport},
    AuthorizationContext, B2Credentials, B2Error, B2Result, ChunkDescriptor, UploadEndpoint,
    UploadRequest,
};

/// Which credential a request was signed with; decides how a 401 is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Credentials,
    Account,
    Upload,
}

/// Typed calls for the upload-related B2 endpoints
#[derive(Clone)]
pub struct B2Api {
    transport: Arc<dyn HttpTransport>,
    timeout: Duration,
}

impl B2Api {
    pub fn new(transport: Arc<dyn HttpTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub async fn authorize_account(
        &self,
        auth_url: &str,
        credentials: &B2Credentials,
    ) -> B2Result<AuthorizeAccountResponse> {
        let basic = base64::engine::general_purpose::STANDARD.encode(format!(
            "{}:{}",
            credentials.key_id, credentials.application_key
        ));
        let request = HttpRequest::get(auth_url).with_header("Authorization", format!("Basic {}", basic));

        self.call(request, TokenKind::Credentials).await
    }

    pub async fn get_upload_url(
        &self,
        ctx: &AuthorizationContext,
        bucket_id: &str,
    ) -> B2Result<UploadUrlResponse> {
        let request = HttpRequest::post(ctx.endpoint("b2_get_upload_url"))
            .with_header("Authorization", ctx.authorization_token.as_str())
            .with_json(&GetUploadUrlRequest { bucket_id })?;

        self.call(request, TokenKind::Account).await
    }

    pub async fn get_upload_part_url(
        &self,
        ctx: &AuthorizationContext,
        file_id: &str,
    ) -> B2Result<UploadUrlResponse> {
        let request = HttpRequest::post(ctx.endpoint("b2_get_upload_part_url"))
            .with_header("Authorization", ctx.authorization_token.as_str())
            .with_json(&FileIdRequest { file_id })?;

        self.call(request, TokenKind::Account).await
    }

    pub async fn upload_file(
        &self,
        endpoint: &UploadEndpoint,
        upload: &UploadRequest,
        payload: Bytes,
        content_sha1: &str,
    ) -> B2Result<FileInfo> {
        let mut request = HttpRequest::post(endpoint.upload_url.as_str())
            .with_header("Authorization", endpoint.authorization_token.as_str())
            .with_header("X-Bz-File-Name", urlencoding::encode(&upload.file_name).into_owned())
            .with_header("Content-Type", upload.content_type.as_str())
            .with_header("Content-Length", payload.len().to_string())
            .with_header("X-Bz-Content-Sha1", content_sha1);

        check_info_keys(upload)?;
        for (key, value) in &upload.file_info {
            request = request.with_header(
                format!("X-Bz-Info-{}", key),
                urlencoding::encode(value).into_owned(),
            );
        }

        self.call(request.with_body(payload), TokenKind::Upload).await
    }

    pub async fn start_large_file(
        &self,
        ctx: &AuthorizationContext,
        bucket_id: &str,
        upload: &UploadRequest,
    ) -> B2Result<FileInfo> {
        check_info_keys(upload)?;
        let request = HttpRequest::post(ctx.endpoint("b2_start_large_file"))
            .with_header("Authorization", ctx.authorization_token.as_str())
            .with_json(&StartLargeFileRequest {
                bucket_id,
                file_name: &upload.file_name,
                content_type: &upload.content_type,
                file_info: &upload.file_info,
            })?;

        self.call(request, TokenKind::Account).await
    }

    pub async fn upload_part(
        &self,
        endpoint: &UploadEndpoint,
        chunk: &ChunkDescriptor,
    ) -> B2Result<UploadPartResponse> {
        let request = HttpRequest::post(endpoint.upload_url.as_str())
            .with_header("Authorization", endpoint.authorization_token.as_str())
            .with_header("X-Bz-Part-Number", chunk.part_number().to_string())
            .with_header("Content-Length", chunk.length.to_string())
            .with_header("X-Bz-Content-Sha1", chunk.content_sha1.as_str())
            .with_body(chunk.payload.clone());

        self.call(request, TokenKind::Upload).await
    }

    pub async fn finish_large_file(
        &self,
        ctx: &AuthorizationContext,
        file_id: &str,
        part_sha1s: &[String],
    ) -> B2Result<FileInfo> {
        let request = HttpRequest::post(ctx.endpoint("b2_finish_large_file"))
            .with_header("Authorization", ctx.authorization_token.as_str())
            .with_json(&FinishLargeFileRequest {
                file_id,
                part_sha1_array: part_sha1s,
            })?;

        self.call(request, TokenKind::Account).await
    }

    pub async fn cancel_large_file(
        &self,
        ctx: &AuthorizationContext,
        file_id: &str,
    ) -> B2Result<CancelLargeFileResponse> {
        let request = HttpRequest::post(ctx.endpoint("b2_cancel_large_file"))
            .with_header("Authorization", ctx.authorization_token.as_str())
            .with_json(&FileIdRequest { file_id })?;

        self.call(request, TokenKind::Account).await
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }

    async fn call<T: DeserializeOwned>(&self, request: HttpRequest, kind: TokenKind) -> B2Result<T> {
        let url = request.url.clone();
        let response = self.transport.send(request.with_timeout(self.timeout)).await?;

        if !response.is_success() {
            let error = classify(kind, &response);
            debug!(url = %url, status = response.status, error = %error, "b2 request failed");
            return Err(error);
        }

        Ok(serde_json::from_slice(&response.body)?)
    }
}

/// Map a non-2xx response onto the error taxonomy
fn classify(kind: TokenKind, response: &HttpResponse) -> B2Error {
    let body: ErrorBody = serde_json::from_slice(&response.body).unwrap_or_default();
    let status = response.status;
    let code = if body.code.is_empty() { "unknown".to_string() } else { body.code };
    let message = body.message;

    match (status, kind) {
        (401, TokenKind::Credentials) => B2Error::InvalidAuthorization(format!("{}: {}", code, message)),
        (401, TokenKind::Account) if code == "expired_auth_token" || code == "bad_auth_token" => {
            B2Error::AuthorizationExpired
        }
        (401, TokenKind::Account) => B2Error::InvalidAuthorization(format!("{}: {}", code, message)),
        (401, TokenKind::Upload) | (503, TokenKind::Upload) => {
            B2Error::EndpointInvalid(format!("{} {}: {}", status, code, message))
        }
        (400, _) if reports_checksum_mismatch(&code, &message) => {
            B2Error::integrity(format!("{}: {}", code, message))
        }
        (408, _) | (429, _) | (500..=599, _) => B2Error::Transient { status, code, message },
        _ => B2Error::Api { status, code, message },
    }
}

/// B2 accepts up to 50 letters, digits, `-` and `_` in a file info name
fn check_info_keys(upload: &UploadRequest) -> B2Result<()> {
    for key in upload.file_info.keys() {
        let valid = !key.is_empty()
            && key.len() <= 50
            && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(B2Error::invalid_request(format!("invalid file info name {:?}", key)));
        }
    }
    Ok(())
}

fn reports_checksum_mismatch(code: &str, message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    code == "bad_request" && (message.contains("sha1") || message.contains("checksum"))
}
