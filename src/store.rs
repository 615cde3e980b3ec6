//! Object store access
//!
//! The proxy consumes the store through one capability:
//! `fetch(key) -> stream + metadata | not-found | transport failure`.
//! The not-found/transport distinction is load-bearing: not-found drives
//! the SPA index fallback, while a transport failure must surface as a
//! 500 and never fall through to fallback logic.
//!
//! [`S3Store`] talks to any S3-compatible store (MinIO included) with
//! AWS Signature V4 request signing. [`MemoryStore`] backs tests and
//! local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use hmac::{Hmac, Mac};
use hyper::body::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

use crate::config::StorageConfig;
use crate::content_type;

type HmacSha256 = Hmac<Sha256>;

/// Streaming object body. Fully consumed or dropped on every exit path;
/// dropping it releases the underlying store connection.
pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// The result of a successful fetch
pub struct FetchedObject {
    /// Object bytes
    pub body: ByteStream,
    /// Content type as reported by the store, if any
    pub content_type: Option<String>,
    /// Object size, when the store reports it
    pub content_length: Option<u64>,
}

impl FetchedObject {
    /// Resolve the content type to serve: store metadata when usable,
    /// then the extension table, then the octet-stream default. A store
    /// value of `application/octet-stream` counts as unusable, since
    /// that is what stores report when the uploader set nothing.
    pub fn resolved_content_type(&self, key: &str) -> String {
        match self.content_type.as_deref() {
            Some(ct) if !ct.is_empty() && ct != content_type::DEFAULT_CONTENT_TYPE => {
                ct.to_string()
            }
            _ => content_type::from_path(key).to_string(),
        }
    }
}

/// Why a fetch failed
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store affirmatively reports the key absent
    #[error("object not found")]
    NotFound,
    /// Network, auth, or any other unexpected failure
    #[error("store transport failure: {0}")]
    Transport(String),
}

/// Byte-addressable store keyed by string paths. The proxy is a pure
/// reader; writes belong to the build pipeline.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch one object by storage key.
    async fn fetch(&self, key: &str) -> Result<FetchedObject, StoreError>;
}

/// S3-compatible store client. Connection pooling lives inside the
/// reqwest client, so one instance is shared across all requests.
pub struct S3Store {
    client: reqwest::Client,
    endpoint: String,
    host: String,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
}

impl S3Store {
    pub fn new(config: &StorageConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build store HTTP client: {}", e))?;

        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        let host = endpoint
            .strip_prefix("https://")
            .or_else(|| endpoint.strip_prefix("http://"))
            .ok_or_else(|| anyhow::anyhow!("Store endpoint '{}' has no scheme", endpoint))?
            .to_string();

        Ok(Self {
            client,
            endpoint,
            host,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
        })
    }

    /// Path-style canonical URI for a key: `/<bucket>/<encoded key>`,
    /// each segment RFC 3986 encoded, slashes preserved.
    fn canonical_uri(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|seg| urlencoding::encode(seg).into_owned())
            .collect();
        format!("/{}/{}", self.bucket, encoded.join("/"))
    }

    /// Compute the SigV4 headers for a GET of `canonical_uri` at `now`.
    /// Returns `(amz_date, payload_hash, authorization)`.
    fn sign(&self, canonical_uri: &str, now: DateTime<Utc>) -> (String, String, String) {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{}/{}/s3/aws4_request", date, self.region);

        // GET requests carry no payload
        let payload_hash = hex::encode(Sha256::digest(b""));

        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            self.host, payload_hash, amz_date
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";

        let canonical_request = format!(
            "GET\n{}\n\n{}\n{}\n{}",
            canonical_uri, canonical_headers, signed_headers, payload_hash
        );

        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let k_date = hmac_sha256(
            format!("AWS4{}", self.secret_key).as_bytes(),
            date.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, signed_headers, signature
        );

        (amz_date, payload_hash, authorization)
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn fetch(&self, key: &str) -> Result<FetchedObject, StoreError> {
        let canonical_uri = self.canonical_uri(key);
        let url = format!("{}{}", self.endpoint, canonical_uri);
        let (amz_date, payload_hash, authorization) = self.sign(&canonical_uri, Utc::now());

        let response = self
            .client
            .get(&url)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header("Authorization", authorization)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        if status == 404 {
            debug!(key, "Object not found in store");
            return Err(StoreError::NotFound);
        }
        if !(200..300).contains(&status) {
            return Err(StoreError::Transport(format!(
                "store returned status {} for key {}",
                status, key
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let content_length = response.content_length();

        let body = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .boxed();

        Ok(FetchedObject {
            body,
            content_type,
            content_length,
        })
    }
}

/// In-memory store for tests and local development
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, MemoryObject>>,
    fail_transport: AtomicBool,
    fetches: AtomicUsize,
}

#[derive(Clone)]
struct MemoryObject {
    content_type: Option<String>,
    data: Bytes,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object under a key, replacing any previous value.
    pub fn insert(
        &self,
        key: impl Into<String>,
        content_type: Option<&str>,
        data: impl Into<Bytes>,
    ) {
        self.objects
            .write()
            .expect("memory store lock poisoned")
            .insert(
                key.into(),
                MemoryObject {
                    content_type: content_type.map(String::from),
                    data: data.into(),
                },
            );
    }

    /// Remove an object; true when it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.objects
            .write()
            .expect("memory store lock poisoned")
            .remove(key)
            .is_some()
    }

    /// When set, every fetch fails with a transport error.
    pub fn set_fail_transport(&self, fail: bool) {
        self.fail_transport.store(fail, Ordering::SeqCst);
    }

    /// Number of fetch calls made so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn fetch(&self, key: &str) -> Result<FetchedObject, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if self.fail_transport.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("injected transport failure".into()));
        }

        let object = self
            .objects
            .read()
            .expect("memory store lock poisoned")
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)?;

        let len = object.data.len() as u64;
        Ok(FetchedObject {
            body: futures::stream::once(async move { Ok::<_, std::io::Error>(object.data) }).boxed(),
            content_type: object.content_type,
            content_length: Some(len),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_store() -> S3Store {
        S3Store::new(&StorageConfig {
            endpoint: "http://127.0.0.1:9000".to_string(),
            bucket: "sites".to_string(),
            access_key: "AKIAEXAMPLE".to_string(),
            secret_key: "secretkey".to_string(),
            region: "us-east-1".to_string(),
            output_prefix: "__outputs".to_string(),
            request_timeout_secs: 30,
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_requires_scheme() {
        let result = S3Store::new(&StorageConfig {
            endpoint: "minio.example.com:9000".to_string(),
            bucket: "sites".to_string(),
            access_key: "a".to_string(),
            secret_key: "b".to_string(),
            region: "us-east-1".to_string(),
            output_prefix: "__outputs".to_string(),
            request_timeout_secs: 30,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_host_keeps_port() {
        let store = test_store();
        assert_eq!(store.host, "127.0.0.1:9000");
    }

    #[test]
    fn test_canonical_uri_encoding() {
        let store = test_store();
        assert_eq!(
            store.canonical_uri("__outputs/myproj/index.html"),
            "/sites/__outputs/myproj/index.html"
        );
        // Spaces and non-unreserved characters are percent-encoded,
        // slashes preserved
        assert_eq!(
            store.canonical_uri("__outputs/myproj/a b+c.png"),
            "/sites/__outputs/myproj/a%20b%2Bc.png"
        );
    }

    #[test]
    fn test_signature_shape() {
        let store = test_store();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let (amz_date, payload_hash, authorization) =
            store.sign("/sites/__outputs/myproj/index.html", now);

        assert_eq!(amz_date, "20240501T120000Z");
        // SHA-256 of the empty payload
        assert_eq!(
            payload_hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIAEXAMPLE/20240501/us-east-1/s3/aws4_request"
        ));
        assert!(authorization.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));

        let signature = authorization.rsplit("Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_is_deterministic_and_key_dependent() {
        let store = test_store();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let (_, _, auth_a) = store.sign("/sites/x", now);
        let (_, _, auth_b) = store.sign("/sites/x", now);
        assert_eq!(auth_a, auth_b);

        let mut other = test_store();
        other.secret_key = "differentsecret".to_string();
        let (_, _, auth_c) = other.sign("/sites/x", now);
        assert_ne!(auth_a, auth_c);
    }

    #[tokio::test]
    async fn test_memory_store_fetch() {
        let store = MemoryStore::new();
        store.insert("__outputs/t/index.html", Some("text/html"), "<html></html>");

        let fetched = store.fetch("__outputs/t/index.html").await.unwrap();
        assert_eq!(fetched.content_type.as_deref(), Some("text/html"));
        assert_eq!(fetched.content_length, Some(13));

        let body: Vec<u8> = fetched
            .body
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap();
        assert_eq!(body, b"<html></html>");
    }

    #[tokio::test]
    async fn test_memory_store_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.fetch("missing").await,
            Err(StoreError::NotFound)
        ));
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_transport_failure() {
        let store = MemoryStore::new();
        store.insert("key", None, "data");
        store.set_fail_transport(true);
        assert!(matches!(
            store.fetch("key").await,
            Err(StoreError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_resolved_content_type_prefers_store_metadata() {
        let store = MemoryStore::new();
        store.insert("a/file.bin", Some("image/png"), "x");
        let fetched = store.fetch("a/file.bin").await.unwrap();
        assert_eq!(fetched.resolved_content_type("a/file.bin"), "image/png");
    }

    #[tokio::test]
    async fn test_resolved_content_type_falls_back_to_extension() {
        let store = MemoryStore::new();
        store.insert("a/page.html", None, "x");
        store.insert("a/data.css", Some("application/octet-stream"), "x");
        store.insert("a/blob", None, "x");

        let fetched = store.fetch("a/page.html").await.unwrap();
        assert_eq!(fetched.resolved_content_type("a/page.html"), "text/html");

        // octet-stream metadata is unusable; the extension wins
        let fetched = store.fetch("a/data.css").await.unwrap();
        assert_eq!(fetched.resolved_content_type("a/data.css"), "text/css");

        let fetched = store.fetch("a/blob").await.unwrap();
        assert_eq!(
            fetched.resolved_content_type("a/blob"),
            "application/octet-stream"
        );
    }
}
