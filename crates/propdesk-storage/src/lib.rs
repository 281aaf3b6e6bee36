//! Uploaded-document blob store, webhook signature utilities and the
//! outbound parser notification client for PropDesk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "propdesk-storage";

/// File-level failure, surfaced distinctly from database errors so the UI
/// can tell the operator "file operation failed" vs "save failed".
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file operation failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed store for uploaded intake documents. Writes go through a
/// unique temp file and an atomic rename; re-storing identical content for
/// the same object is a dedup no-op.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn document_relative_path(
        &self,
        uploaded_at: DateTime<Utc>,
        object_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = uploaded_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(object_id).join(format!("{stamp}_{content_hash}.{ext}"))
    }

    /// Persist upload bytes before any run bookkeeping happens; a failure
    /// here must leave nothing partially queued.
    pub async fn store_bytes(
        &self,
        uploaded_at: DateTime<Utc>,
        object_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<StoredDocument, StorageError> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.document_relative_path(uploaded_at, object_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::io(parent, err))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .map_err(|err| StorageError::io(&absolute_path, err))?
        {
            return Ok(StoredDocument {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = match absolute_path.parent() {
            Some(parent) => parent.join(temp_name),
            None => self.root.join(temp_name),
        };

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| StorageError::io(&temp_path, err))?;
        file.write_all(bytes)
            .await
            .map_err(|err| StorageError::io(&temp_path, err))?;
        file.flush()
            .await
            .map_err(|err| StorageError::io(&temp_path, err))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredDocument {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredDocument {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StorageError::io(&absolute_path, err))
            }
        }
    }
}

const HMAC_BLOCK_SIZE: usize = 64;

/// HMAC-SHA256 over the exact raw callback bytes. Computed over bytes, not a
/// re-serialized parse, so field reordering cannot break verification.
pub fn hmac_sha256(secret: &[u8], message: &[u8]) -> [u8; 32] {
    let mut key = [0u8; HMAC_BLOCK_SIZE];
    if secret.len() > HMAC_BLOCK_SIZE {
        let digest = Sha256::digest(secret);
        key[..digest.len()].copy_from_slice(&digest);
    } else {
        key[..secret.len()].copy_from_slice(secret);
    }

    let mut inner = Sha256::new();
    inner.update(key.iter().map(|b| b ^ 0x36).collect::<Vec<u8>>());
    inner.update(message);
    let inner_digest = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(key.iter().map(|b| b ^ 0x5c).collect::<Vec<u8>>());
    outer.update(inner_digest);
    outer.finalize().into()
}

/// Header value a well-behaved parser sends in `x-signature`.
pub fn signature_header(secret: &str, body: &[u8]) -> String {
    format!("sha256={}", hex::encode(hmac_sha256(secret.as_bytes(), body)))
}

/// Verify an inbound `x-signature` header against the raw body. With no
/// secret configured verification is vacuously satisfied; the caller still
/// records the computed flag in the audit log.
pub fn verify_signature(secret: Option<&str>, body: &[u8], header: Option<&str>) -> bool {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return true;
    };
    let Some(header) = header else {
        return false;
    };
    let presented = header.trim();
    let presented = presented.strip_prefix("sha256=").unwrap_or(presented);
    let Ok(presented) = hex::decode(presented) else {
        return false;
    };
    let expected = hmac_sha256(secret.as_bytes(), body);
    constant_time_eq(&expected, &presented)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: reqwest::StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Payload POSTed to the external parser when a run is dispatched.
#[derive(Debug, Clone, Serialize)]
pub struct ParserNotification {
    pub job_id: Uuid,
    pub intake_run_id: Uuid,
    pub object_id: String,
    pub document_path: String,
    pub callback_url: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("parser notification failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("parser returned http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Outbound client for the external parsing service. Dispatch is
/// fire-and-forget from the upload path: the caller spawns `notify` and a
/// failure is logged, never rolled back into the queued run.
#[derive(Debug, Clone)]
pub struct ParserClient {
    client: reqwest::Client,
    endpoint: String,
    backoff: BackoffPolicy,
}

impl ParserClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(anyhow::Error::from)?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn notify(&self, notification: &ParserNotification) -> Result<(), NotifyError> {
        let span = info_span!(
            "parser_notify",
            job_id = %notification.job_id,
            intake_run_id = %notification.intake_run_id
        );
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.post(&self.endpoint).json(notification).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(NotifyError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(NotifyError::Request(err));
                }
            }
        }

        Err(NotifyError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn document_hashing_is_stable() {
        let hash = DocumentStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = DocumentStore::new(dir.path());
        let uploaded_at = DateTime::parse_from_rfc3339("2026-03-01T09:30:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_bytes(uploaded_at, "P1", "pdf", b"%PDF-1.4 same")
            .await
            .expect("first store");
        let second = store
            .store_bytes(uploaded_at, "P1", "pdf", b"%PDF-1.4 same")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn hmac_matches_rfc_test_vector() {
        let mac = hmac_sha256(b"key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            hex::encode(mac),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn signature_verification_round_trips() {
        let body = br#"{"job_id":"abc","status":"succeeded"}"#;
        let header = signature_header("s3cret", body);
        assert!(verify_signature(Some("s3cret"), body, Some(header.as_str())));
        assert!(!verify_signature(Some("s3cret"), body, Some("sha256=deadbeef")));
        assert!(!verify_signature(Some("s3cret"), body, None));
    }

    #[test]
    fn verification_is_vacuous_without_secret() {
        assert!(verify_signature(None, b"anything", None));
        assert!(verify_signature(Some(""), b"anything", Some("garbage")));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
