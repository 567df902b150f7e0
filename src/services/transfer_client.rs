//! HTTP protocol client for the remote backup backend.
//!
//! Covers storage verification, single-shot and multipart uploads over
//! presigned URLs, ranged downloads, and backup listing/deletion. Every
//! outbound call is gated by the shared [`RateLimiter`]; a blocked call fails
//! locally with [`TransferError::RateLimited`] and never touches the network.
//!
//! API calls carry the bearer token. Presigned PUT/GET calls go through a
//! second client without it, since the URL itself is the credential.

use crate::{
    errors::{TransferError, TransferResult},
    models::{
        backup::{BackupInfo, DownloadTarget, StorageQuota},
        multipart::{CompletedPart, MultipartSession, part_range},
    },
    services::rate_limiter::RateLimiter,
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use reqwest::{
    Method, Response, StatusCode,
    header::{AUTHORIZATION, CONTENT_TYPE, ETAG, HeaderMap, HeaderValue, RANGE, RETRY_AFTER},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Cooldown applied when a 429 carries no usable `retry_after`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

const MAX_OBJECT_NAME_LEN: usize = 255;
const ARCHIVE_EXTENSIONS: [&str; 5] = [".zip", ".tar", ".tar.gz", ".sgbp", ".wpress"];

/// `{success, message, data}` envelope every API response is wrapped in.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(default)]
    success: bool,
    message: Option<String>,
    data: Option<T>,
}

/// Returned by `website/upload`: where to PUT the whole file.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadTicket {
    pub upload_id: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct MultipartStart {
    session_id: String,
    urls: BTreeMap<u32, String>,
}

#[derive(Debug, Deserialize)]
struct PartUrls {
    urls: BTreeMap<u32, String>,
}

#[derive(Debug, Serialize)]
struct CompleteMultipart<'a> {
    parts: &'a [CompletedPart],
    max_backups: u32,
}

/// Authenticated client bound to one backend base URL.
#[derive(Clone)]
pub struct TransferClient {
    api: reqwest::Client,
    presigned: reqwest::Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
}

impl TransferClient {
    /// Build a client. An empty token is a local validation failure.
    pub fn new(
        base_url: &str,
        token: &str,
        http_timeout: Duration,
        limiter: Arc<RateLimiter>,
    ) -> TransferResult<Self> {
        if token.trim().is_empty() {
            return Err(TransferError::validation("bearer token is required"));
        }
        if base_url.trim().is_empty() {
            return Err(TransferError::validation("backend URL is required"));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| TransferError::validation("bearer token is not a valid header"))?,
        );

        let api = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(http_timeout)
            .build()?;
        let presigned = reqwest::Client::builder().timeout(http_timeout).build()?;

        Ok(Self {
            api,
            presigned,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter,
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    /// Check the token and report remaining capacity.
    pub async fn verify_storage(&self) -> TransferResult<StorageQuota> {
        self.call(Method::POST, "verify-storage", &[], None)
            .await
            .and_then(require_data)
    }

    /// Open a single-shot upload and get the URL to PUT the whole file to.
    pub async fn start_upload(
        &self,
        name: &str,
        size: u64,
        description: Option<&str>,
    ) -> TransferResult<UploadTicket> {
        ensure_archive_name(name)?;
        let body = json!({ "name": name, "size": size, "description": description });
        let ticket: UploadTicket = self
            .call(Method::POST, "website/upload", &[], Some(body))
            .await
            .and_then(require_data)?;
        info!(name, upload_id = %ticket.upload_id, "single-shot upload opened");
        Ok(ticket)
    }

    /// Finalize a single-shot upload with the whole-file MD5.
    pub async fn complete_upload(
        &self,
        upload_id: &str,
        checksum: &str,
        max_backups: u32,
    ) -> TransferResult<()> {
        ensure_token("upload id", upload_id)?;
        let body = json!({ "checksum": checksum, "max_backups": max_backups });
        self.call::<serde_json::Value>(
            Method::POST,
            &format!("website/upload/{upload_id}"),
            &[],
            Some(body),
        )
        .await?;
        info!(upload_id, "single-shot upload completed");
        Ok(())
    }

    /// Tell the backend an upload failed so it can release reserved space.
    pub async fn fail_upload(&self, upload_id: &str, job_id: &str) -> TransferResult<()> {
        self.release_upload(upload_id, job_id, "fail").await
    }

    /// Tell the backend an upload was cancelled.
    pub async fn cancel_upload(&self, upload_id: &str, job_id: &str) -> TransferResult<()> {
        self.release_upload(upload_id, job_id, "cancel").await
    }

    async fn release_upload(&self, upload_id: &str, job_id: &str, action: &str) -> TransferResult<()> {
        ensure_token("upload id", upload_id)?;
        ensure_token("job id", job_id)?;
        self.call::<serde_json::Value>(
            Method::POST,
            &format!("website/upload/{upload_id}/{action}"),
            &[],
            Some(json!({ "job_id": job_id })),
        )
        .await?;
        info!(upload_id, job_id, action, "upload released");
        Ok(())
    }

    /// Open a multipart session, receiving the first batch of part URLs.
    pub async fn start_multipart(
        &self,
        name: &str,
        size: u64,
        description: Option<&str>,
    ) -> TransferResult<MultipartSession> {
        ensure_archive_name(name)?;
        let body = json!({
            "name": name,
            "size": size,
            "description": description,
            "range": part_range(1),
        });
        let start: MultipartStart = self
            .call(Method::POST, "website/multipart", &[], Some(body))
            .await
            .and_then(require_data)?;
        if start.session_id.is_empty() {
            return Err(TransferError::protocol("multipart start returned no session id"));
        }
        if start.urls.is_empty() {
            return Err(TransferError::protocol("multipart start returned no part URLs"));
        }
        info!(name, session_id = %start.session_id, "multipart session opened");
        Ok(MultipartSession::new(start.session_id, name, start.urls))
    }

    /// Fetch the URL batch starting at `from`.
    pub async fn fetch_part_urls(
        &self,
        session_id: &str,
        from: u32,
    ) -> TransferResult<BTreeMap<u32, String>> {
        ensure_token("session id", session_id)?;
        let batch: PartUrls = self
            .call(
                Method::GET,
                &format!("website/multipart/{session_id}"),
                &[("range", part_range(from))],
                None,
            )
            .await
            .and_then(require_data)?;
        if !batch.urls.contains_key(&from) {
            return Err(TransferError::protocol(format!(
                "URL batch for session {session_id} does not include part {from}"
            )));
        }
        debug!(session_id, from, count = batch.urls.len(), "fetched part URLs");
        Ok(batch.urls)
    }

    /// Upload one part and record it in the session.
    ///
    /// A 403 on the PUT means the presigned URL expired: the batch starting
    /// at this part is refetched and the PUT retried exactly once. Any other
    /// failure propagates.
    pub async fn upload_part(
        &self,
        session: &mut MultipartSession,
        part_number: u32,
        data: Bytes,
    ) -> TransferResult<()> {
        if session.url_for(part_number).is_none() {
            let urls = self.fetch_part_urls(&session.session_id, part_number).await?;
            session.replace_window(urls);
        }
        let url = session
            .url_for(part_number)
            .map(str::to_owned)
            .ok_or_else(|| TransferError::protocol(format!("no URL for part {part_number}")))?;

        let digest = md5::compute(&data);
        let etag = format!("{digest:x}");
        let content_md5 = general_purpose::STANDARD.encode(digest.0);

        let remote_etag = match self.put_presigned(&url, data.clone(), &content_md5).await {
            Err(TransferError::Http { status: 403, .. }) => {
                warn!(
                    session_id = %session.session_id,
                    part_number,
                    "presigned URL expired, refreshing"
                );
                let urls = self.fetch_part_urls(&session.session_id, part_number).await?;
                session.replace_window(urls);
                let url = session.url_for(part_number).map(str::to_owned).ok_or_else(|| {
                    TransferError::protocol(format!("no URL for part {part_number}"))
                })?;
                match self.put_presigned(&url, data, &content_md5).await {
                    Err(TransferError::Http { status: 403, .. }) => {
                        return Err(TransferError::UrlExpired { part_number });
                    }
                    other => other?,
                }
            }
            other => other?,
        };

        if let Some(remote) = remote_etag {
            if remote != etag {
                return Err(TransferError::protocol(format!(
                    "part {part_number} ETag mismatch: local {etag}, backend {remote}"
                )));
            }
        }

        session.record_part(part_number, etag)?;
        debug!(session_id = %session.session_id, part_number, "part uploaded");
        Ok(())
    }

    /// Finalize a multipart session. The backend applies retention
    /// (`max_backups`) as part of the same call.
    pub async fn complete_multipart(
        &self,
        session: &MultipartSession,
        max_backups: u32,
    ) -> TransferResult<()> {
        ensure_token("session id", &session.session_id)?;
        if session.completed_parts.is_empty() {
            return Err(TransferError::protocol("cannot complete a session with no parts"));
        }
        let body = serde_json::to_value(CompleteMultipart {
            parts: &session.completed_parts,
            max_backups,
        })?;
        self.call::<serde_json::Value>(
            Method::POST,
            &format!("website/multipart/{}", session.session_id),
            &[],
            Some(body),
        )
        .await?;
        info!(
            session_id = %session.session_id,
            parts = session.completed_parts.len(),
            "multipart session completed"
        );
        Ok(())
    }

    /// Upload a small non-archive file in one request.
    pub async fn direct_upload(&self, name: &str, data: Bytes) -> TransferResult<()> {
        ensure_object_name(name)?;
        let url = self.endpoint_url("website/direct_upload");
        self.gate(&url)?;
        let resp = self
            .api
            .post(&url)
            .query(&[("name", name)])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;
        let _: Option<serde_json::Value> = self.read_envelope(&url, resp).await?;
        info!(name, "direct upload finished");
        Ok(())
    }

    pub async fn list_backups(&self) -> TransferResult<Vec<BackupInfo>> {
        self.call(Method::GET, "backups", &[], None)
            .await
            .map(Option::unwrap_or_default)
    }

    /// Metadata for one backup, `None` if the backend has no such object.
    pub async fn backup_info(&self, name: &str) -> TransferResult<Option<BackupInfo>> {
        ensure_object_name(name)?;
        match self
            .call::<BackupInfo>(Method::GET, &format!("backups/{name}"), &[], None)
            .await
        {
            Ok(info) => Ok(info),
            Err(TransferError::Http { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn delete_backup(&self, name: &str) -> TransferResult<()> {
        ensure_object_name(name)?;
        self.call::<serde_json::Value>(Method::DELETE, &format!("backups/{name}"), &[], None)
            .await?;
        info!(name, "backup deleted");
        Ok(())
    }

    pub async fn delete_backups(&self, names: &[String]) -> TransferResult<()> {
        for name in names {
            ensure_object_name(name)?;
        }
        self.call::<serde_json::Value>(
            Method::DELETE,
            "backups",
            &[],
            Some(json!({ "names": names })),
        )
        .await?;
        info!(count = names.len(), "backups deleted");
        Ok(())
    }

    /// Presigned download URL and total size for a backup.
    pub async fn download_target(&self, name: &str) -> TransferResult<DownloadTarget> {
        ensure_object_name(name)?;
        self.call(Method::GET, &format!("backups/{name}/download"), &[], None)
            .await
            .and_then(require_data)
    }

    /// GET `length` bytes starting at `offset` from a presigned URL.
    pub async fn download_range(&self, url: &str, offset: u64, length: u64) -> TransferResult<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        self.gate(url)?;
        let range = format!("bytes={}-{}", offset, offset + length - 1);
        let resp = self.presigned.get(url).header(RANGE, &range).send().await?;
        let resp = self.check_status(url, resp).await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        let body = if status == StatusCode::PARTIAL_CONTENT {
            body
        } else {
            // Servers may ignore Range and send the whole object.
            let start = offset as usize;
            let end = (offset + length).min(body.len() as u64) as usize;
            if start > body.len() {
                return Err(TransferError::protocol(format!(
                    "range {range} past end of {}-byte body",
                    body.len()
                )));
            }
            body.slice(start..end)
        };
        if body.len() as u64 > length {
            return Err(TransferError::protocol(format!(
                "asked for {length} bytes, got {}",
                body.len()
            )));
        }
        Ok(body)
    }

    /// Unranged GET, returned as a response for streaming.
    pub async fn download_whole(&self, url: &str) -> TransferResult<Response> {
        self.gate(url)?;
        let resp = self.presigned.get(url).send().await?;
        self.check_status(url, resp).await
    }

    /// PUT raw bytes to a presigned URL. Returns the backend ETag (unquoted)
    /// when it sends one.
    pub async fn put_presigned(
        &self,
        url: &str,
        data: impl Into<reqwest::Body>,
        content_md5: &str,
    ) -> TransferResult<Option<String>> {
        self.gate(url)?;
        let resp = self
            .presigned
            .put(url)
            .header("Content-MD5", content_md5)
            .body(data)
            .send()
            .await?;
        let resp = self.check_status(url, resp).await?;
        Ok(resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_ascii_lowercase()))
    }

    fn gate(&self, url: &str) -> TransferResult<()> {
        match self.limiter.check(url) {
            Some(retry_after) => {
                debug!(url, "refused locally by rate limiter");
                Err(TransferError::RateLimited { retry_after })
            }
            None => Ok(()),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> TransferResult<Option<T>> {
        let url = self.endpoint_url(endpoint);
        self.gate(&url)?;

        let mut req = self.api.request(method.clone(), &url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        debug!(%method, %url, "backend call");
        let resp = req.send().await?;
        self.read_envelope(&url, resp).await
    }

    async fn read_envelope<T: DeserializeOwned>(
        &self,
        url: &str,
        resp: Response,
    ) -> TransferResult<Option<T>> {
        let resp = self.check_status(url, resp).await?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await?;
        let envelope: ApiEnvelope<T> = serde_json::from_slice(&bytes).map_err(|err| {
            TransferError::protocol(format!("malformed response from {url}: {err}"))
        })?;
        if !envelope.success {
            return Err(TransferError::Http {
                status,
                message: envelope
                    .message
                    .unwrap_or_else(|| "request was not successful".into()),
            });
        }
        Ok(envelope.data)
    }

    /// Map 429 into a rate-limit block and any other non-2xx into `Http`.
    async fn check_status(&self, url: &str, resp: Response) -> TransferResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let header_retry = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = resp.text().await.unwrap_or_default();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = header_retry
                .or_else(|| parse_retry_after(&body))
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            self.limiter.record_block(url, retry_after);
            return Err(TransferError::RateLimited { retry_after });
        }

        Err(TransferError::Http {
            status: status.as_u16(),
            message: error_message(&body),
        })
    }
}

fn require_data<T>(data: Option<T>) -> TransferResult<T> {
    data.ok_or_else(|| TransferError::protocol("response is missing `data`"))
}

/// `retry_after` from `{"data": {"retry_after": N}}` or `{"retry_after": N}`.
fn parse_retry_after(body: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/data/retry_after")
        .or_else(|| value.get("retry_after"))
        .and_then(|v| v.as_u64().or_else(|| v.as_str()?.parse().ok()))
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_owned))
        .unwrap_or_else(|| {
            if body.is_empty() {
                "empty response".to_string()
            } else {
                body.chars().take(200).collect()
            }
        })
}

fn ensure_token(what: &str, value: &str) -> TransferResult<()> {
    if value.trim().is_empty() {
        return Err(TransferError::validation(format!("{what} is required")));
    }
    Ok(())
}

/// Validate a flat object name.
///
/// 1-255 characters of `[A-Za-z0-9._-]`, not starting with `.` or `-`,
/// never containing `..`.
pub fn ensure_object_name(name: &str) -> TransferResult<()> {
    let invalid = |reason: &str| TransferError::validation(format!("invalid name `{name}`: {reason}"));
    if name.is_empty() || name.len() > MAX_OBJECT_NAME_LEN {
        return Err(invalid("must be between 1 and 255 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid("allowed characters are letters, digits, dots, underscores and hyphens"));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(invalid("must start with a letter, digit or underscore"));
    }
    if name.contains("..") {
        return Err(invalid("cannot contain consecutive dots"));
    }
    Ok(())
}

/// Whether `name` carries one of the archive extensions.
pub fn is_archive_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    ARCHIVE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Object name rules plus a known archive extension.
pub fn ensure_archive_name(name: &str) -> TransferResult<()> {
    ensure_object_name(name)?;
    if !is_archive_name(name) {
        return Err(TransferError::validation(format!(
            "invalid name `{name}`: not a backup archive"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::SystemClock;

    fn client() -> TransferClient {
        let limiter = Arc::new(RateLimiter::new(Arc::new(SystemClock)));
        TransferClient::new("http://127.0.0.1:9/api/", "token", Duration::from_secs(1), limiter).unwrap()
    }

    #[test]
    fn empty_token_is_rejected_locally() {
        let limiter = Arc::new(RateLimiter::new(Arc::new(SystemClock)));
        let err = TransferClient::new("http://x", " ", Duration::from_secs(1), limiter).err().unwrap();
        assert!(matches!(err, TransferError::Validation(_)));
    }

    #[test]
    fn endpoint_urls_are_joined_once() {
        let client = client();
        assert_eq!(client.endpoint_url("/backups"), "http://127.0.0.1:9/api/backups");
        assert_eq!(client.endpoint_url("website/upload"), "http://127.0.0.1:9/api/website/upload");
    }

    #[tokio::test]
    async fn release_requires_ids_before_any_io() {
        // Port 9 (discard) would fail at the transport level; validation must come first.
        let client = client();
        let err = client.fail_upload("", "job-1").await.unwrap_err();
        assert!(matches!(err, TransferError::Validation(_)));
        let err = client.cancel_upload("up-1", "").await.unwrap_err();
        assert!(matches!(err, TransferError::Validation(_)));
    }

    #[tokio::test]
    async fn blocked_url_fails_without_network() {
        let client = client();
        let url = client.endpoint_url("verify-storage");
        client.limiter().record_block(&url, Duration::from_secs(30));
        let err = client.verify_storage().await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.status(), Some(429));
    }

    #[test]
    fn names_are_validated() {
        assert!(ensure_archive_name("site-2024_01.zip").is_ok());
        assert!(ensure_archive_name("site.tar.gz").is_ok());
        assert!(ensure_archive_name("installer.php").is_err());
        assert!(ensure_object_name("installer.php").is_ok());
        assert!(ensure_object_name("../etc/passwd").is_err());
        assert!(ensure_object_name("a/b.zip").is_err());
        assert!(ensure_object_name(".hidden.zip").is_err());
        assert!(ensure_object_name("").is_err());
        assert!(ensure_object_name(&"a".repeat(256)).is_err());
    }

    #[test]
    fn retry_after_is_read_from_body() {
        assert_eq!(parse_retry_after(r#"{"data":{"retry_after":60}}"#), Some(60));
        assert_eq!(parse_retry_after(r#"{"retry_after":"15"}"#), Some(15));
        assert_eq!(parse_retry_after("not json"), None);
    }

    #[test]
    fn error_message_prefers_envelope() {
        assert_eq!(error_message(r#"{"success":false,"message":"quota"}"#), "quota");
        assert_eq!(error_message(""), "empty response");
        assert_eq!(error_message("plain"), "plain");
    }
}
