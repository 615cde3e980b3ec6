//! The serving pipeline
//!
//! Per request: resolve the tenant, fetch the backing object, then either
//! stream it unmodified or rewrite it (HTML/CSS) before responding. A
//! miss on the primary key falls back to the tenant's `index.html` once,
//! so client-side routed deep links resolve; a transport failure never
//! takes the fallback branch.
//!
//! Requests share no mutable state. The store client and [`ServeState`]
//! are read-only after startup; cancellation is handled by drop (a client
//! disconnect drops the request future and with it the in-flight store
//! stream).

use crate::config::Config;
use crate::error::{json_error_response, ServeErrorCode};
use crate::rewrite::Rewriter;
use crate::store::{ByteStream, FetchedObject, ObjectStore, StoreError};
use crate::tenant::{RequestContext, TenantResolver};
use futures::StreamExt;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Response body type: fully materialized rewritten documents and
/// streamed store objects share it. Unsync because streamed bodies wrap
/// a boxed store stream.
pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Process-wide serving state. Built once at startup, immutable after,
/// shared across all request tasks.
pub struct ServeState {
    store: Arc<dyn ObjectStore>,
    resolver: TenantResolver,
    rewriter: Rewriter,
    output_prefix: String,
    asset_max_age_secs: u64,
    max_rewrite_bytes: usize,
}

impl ServeState {
    pub fn new(config: &Config, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            resolver: TenantResolver::new(config.serving.base_domain.clone()),
            rewriter: Rewriter::new(),
            output_prefix: config.storage.output_prefix.clone(),
            asset_max_age_secs: config.serving.asset_max_age_secs,
            max_rewrite_bytes: config.serving.max_rewrite_bytes,
        }
    }

    /// Storage key convention shared with the build pipeline:
    /// `<output-prefix>/<tenantId><path>`, no duplicate slashes.
    fn storage_key(&self, tenant_id: &str, path: &str) -> String {
        format!("{}/{}{}", self.output_prefix, tenant_id, path)
    }
}

/// Which cache directive a response carries
#[derive(Debug, Clone, Copy, PartialEq)]
enum CachePolicy {
    /// Primary-path assets: content under a tenant prefix never changes
    /// in place, so caches may keep it for the full TTL
    Immutable,
    /// Index/fallback documents: the same path can resolve to different
    /// content over time, so caches must revalidate
    Revalidate,
}

impl CachePolicy {
    fn header_value(&self, state: &ServeState) -> String {
        match self {
            CachePolicy::Immutable => {
                format!("public, max-age={}, immutable", state.asset_max_age_secs)
            }
            CachePolicy::Revalidate => "public, max-age=0, must-revalidate".to_string(),
        }
    }
}

/// What the rewriter should do with a buffered document
#[derive(Debug, Clone, Copy, PartialEq)]
enum RewriteKind {
    Html,
    Css,
}

/// The serving proxy server
pub struct GateServer {
    bind_addr: SocketAddr,
    state: Arc<ServeState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GateServer {
    pub fn new(
        bind_addr: SocketAddr,
        state: Arc<ServeState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Serving proxy listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Serving proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServeState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state).await }
    });

    // auto::Builder negotiates HTTP/1.1 and h2c on one listener
    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error from {}: {}", addr, e))?;

    Ok(())
}

/// Handle one request end to end. Generic over the request body because
/// the body is never read; any method is treated with GET semantics.
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<ServeState>,
) -> Result<Response<ResponseBody>, Infallible> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hostname = extract_hostname(&req).unwrap_or_default();
    let path = req.uri().path().to_string();

    debug!(hostname, path, method = %req.method(), request_id, "Incoming request");

    let ctx = match state.resolver.resolve(&hostname, &path) {
        Ok(ctx) => ctx,
        Err(e) => {
            debug!(hostname, path, request_id, error = %e, "Request did not resolve to a tenant");
            return Ok(json_error_response(e.code(), "Project not found"));
        }
    };

    let key = state.storage_key(&ctx.tenant_id, &ctx.path);
    debug!(tenant = %ctx.tenant_id, path = %ctx.path, key, request_id, "Resolved request");

    match state.store.fetch(&key).await {
        Ok(object) => {
            Ok(serve_object(&state, &ctx, &key, object, CachePolicy::Immutable).await)
        }
        Err(StoreError::NotFound) if !ctx.is_index() => {
            index_fallback(&state, &ctx, &request_id).await
        }
        Err(StoreError::NotFound) => {
            debug!(key, request_id, "Object absent and no fallback applies");
            Ok(json_error_response(
                ServeErrorCode::AssetNotFound,
                "Project not found",
            ))
        }
        Err(StoreError::Transport(reason)) => {
            error!(key, request_id, reason, "Store fetch failed");
            Ok(json_error_response(
                ServeErrorCode::UpstreamUnavailable,
                "Error serving file",
            ))
        }
    }
}

/// SPA fallback: the requested key is absent, so serve the tenant's root
/// document instead (client-side routers handle the path). Tried at most
/// once per request, and only after an affirmative not-found.
async fn index_fallback(
    state: &Arc<ServeState>,
    ctx: &RequestContext,
    request_id: &str,
) -> Result<Response<ResponseBody>, Infallible> {
    let index_ctx = RequestContext {
        tenant_id: ctx.tenant_id.clone(),
        path: "/index.html".to_string(),
        routing_mode: ctx.routing_mode,
    };
    let key = state.storage_key(&index_ctx.tenant_id, &index_ctx.path);
    debug!(key, request_id, "Trying index fallback");

    match state.store.fetch(&key).await {
        Ok(object) => {
            Ok(serve_object(state, &index_ctx, &key, object, CachePolicy::Revalidate).await)
        }
        Err(StoreError::NotFound) => {
            debug!(key, request_id, "Index fallback absent");
            Ok(json_error_response(
                ServeErrorCode::AssetNotFound,
                "Project not found",
            ))
        }
        Err(StoreError::Transport(reason)) => {
            error!(key, request_id, reason, "Store fetch failed during index fallback");
            Ok(json_error_response(
                ServeErrorCode::UpstreamUnavailable,
                "Error serving file",
            ))
        }
    }
}

/// Serve one fetched object: rewrite textual types, stream the rest.
async fn serve_object(
    state: &ServeState,
    ctx: &RequestContext,
    key: &str,
    object: FetchedObject,
    cache: CachePolicy,
) -> Response<ResponseBody> {
    let content_type = object.resolved_content_type(key);

    let kind = if content_type.starts_with("text/html") {
        Some(RewriteKind::Html)
    } else if content_type.contains("css") || ctx.path.ends_with(".css") {
        Some(RewriteKind::Css)
    } else {
        None
    };

    match kind {
        Some(kind) => serve_rewritten(state, ctx, key, object, &content_type, kind, cache).await,
        None => stream_response(state, object, &content_type, cache),
    }
}

/// Buffer a textual document and rewrite its root-relative references.
/// Degrades rather than fails: oversized bodies are streamed unmodified,
/// non-UTF-8 bodies are served byte-for-byte as fetched.
async fn serve_rewritten(
    state: &ServeState,
    ctx: &RequestContext,
    key: &str,
    object: FetchedObject,
    content_type: &str,
    kind: RewriteKind,
    cache: CachePolicy,
) -> Response<ResponseBody> {
    // Rewriting needs the whole document; bound the buffer so many
    // concurrent large documents cannot exhaust memory.
    if let Some(len) = object.content_length {
        if len > state.max_rewrite_bytes as u64 {
            warn!(
                key,
                len,
                cap = state.max_rewrite_bytes,
                "Document exceeds rewrite buffer cap, streaming unmodified"
            );
            return stream_response(state, object, content_type, cache);
        }
    }

    let FetchedObject {
        body,
        content_length,
        ..
    } = object;

    match read_to_cap(body, state.max_rewrite_bytes).await {
        Ok(Buffered::Complete(bytes)) => match String::from_utf8(bytes) {
            Ok(text) => {
                let rewritten = match kind {
                    RewriteKind::Html => state.rewriter.rewrite_html(&ctx.tenant_id, &text),
                    RewriteKind::Css => state.rewriter.rewrite_css(&ctx.tenant_id, &text),
                };
                full_response(state, Bytes::from(rewritten), content_type, cache)
            }
            Err(e) => {
                warn!(key, "Document is not valid UTF-8, serving unrewritten");
                full_response(state, Bytes::from(e.into_bytes()), content_type, cache)
            }
        },
        Ok(Buffered::Overflow(prefix, rest)) => {
            warn!(
                key,
                cap = state.max_rewrite_bytes,
                "Document exceeds rewrite buffer cap, streaming unmodified"
            );
            let replay = futures::stream::once(async move { Ok(prefix) }).chain(rest);
            let object = FetchedObject {
                body: replay.boxed(),
                content_type: Some(content_type.to_string()),
                content_length,
            };
            stream_response(state, object, content_type, cache)
        }
        Err(e) => {
            error!(key, error = %e, "Store stream failed while buffering document");
            json_error_response(ServeErrorCode::UpstreamUnavailable, "Error reading file")
        }
    }
}

enum Buffered {
    /// The whole body fit under the cap
    Complete(Vec<u8>),
    /// Cap exceeded: bytes read so far plus the untouched remainder
    Overflow(Bytes, ByteStream),
}

/// Read a body to completion or until it crosses `cap` bytes, whichever
/// comes first. The single suspending read the pipeline uses for text
/// bodies; every exit path either owns the full buffer or hands back the
/// remaining stream.
async fn read_to_cap(mut body: ByteStream, cap: usize) -> Result<Buffered, std::io::Error> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        buf.extend_from_slice(&chunk);
        if buf.len() > cap {
            return Ok(Buffered::Overflow(Bytes::from(buf), body));
        }
    }
    Ok(Buffered::Complete(buf))
}

/// Respond with a fully materialized body
fn full_response(
    state: &ServeState,
    bytes: Bytes,
    content_type: &str,
    cache: CachePolicy,
) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, content_type)
        .header(hyper::header::CACHE_CONTROL, cache.header_value(state))
        .body(
            Full::new(bytes)
                .map_err(|never| match never {})
                .boxed_unsync(),
        )
        .expect("valid response with static headers")
}

/// Respond by piping store bytes straight through, preserving the length
/// when the store reported one
fn stream_response(
    state: &ServeState,
    object: FetchedObject,
    content_type: &str,
    cache: CachePolicy,
) -> Response<ResponseBody> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, content_type)
        .header(hyper::header::CACHE_CONTROL, cache.header_value(state));

    if let Some(len) = object.content_length {
        builder = builder.header(hyper::header::CONTENT_LENGTH, len);
    }

    let frames = object.body.map(|result| result.map(Frame::data));
    builder
        .body(StreamBody::new(frames).boxed_unsync())
        .expect("valid response with static headers")
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Extract the request hostname: the URI authority (HTTP/2) or the Host
/// header, port stripped, validated and lowercased.
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .uri()
        .host()
        .map(String::from)
        .or_else(|| {
            req.headers()
                .get(hyper::header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(String::from)
        })?;

    // Strip port if present
    let hostname = raw.split(':').next()?;

    // Validate length (DNS max is 253 characters)
    if hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Validate characters: alphanumeric, hyphen, and dot only
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}
