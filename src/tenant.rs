//! Tenant resolution
//!
//! Derives which tenant a request belongs to and which file inside that
//! tenant's build output it wants. Two routing modes are supported and
//! normalized into one [`RequestContext`]:
//!
//! - **Subdomain**: `myproj.sites.example.com/about` when the hostname
//!   carries more labels than the configured base domain
//! - **Path**: `sites.example.com/myproj/about`, where the first path
//!   segment names the tenant
//!
//! Tenant existence is never checked here; a tenant is "real" exactly when
//! the store holds objects under its prefix.

use crate::error::ServeErrorCode;

/// First path segments that can never be tenant identifiers. A request
/// whose apparent tenant is one of these means the client still believes
/// it is at the site root, i.e. upstream rewriting failed for that
/// reference, and it must not be looked up as a tenant.
const RESERVED_PREFIXES: &[&str] = &[
    "assets", "static", "dist", "build", "public", "images", "img", "css", "js", "fonts", "media",
    "_next",
];

/// How the tenant was derived from the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    /// Tenant taken from the leftmost hostname label
    Subdomain,
    /// Tenant taken from the first path segment
    Path,
}

/// Per-request resolution result. Immutable; lives for one HTTP exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    /// Opaque tenant identifier
    pub tenant_id: String,
    /// Normalized in-tenant path, always starting with `/`
    pub path: String,
    /// How the tenant was derived
    pub routing_mode: RoutingMode,
}

impl RequestContext {
    /// True when the request already targets the tenant's root document,
    /// in which case the SPA fallback would refetch the same key.
    pub fn is_index(&self) -> bool {
        self.path == "/index.html"
    }
}

/// Why a request could not be resolved to a tenant. All variants map to a
/// 404; the distinction is for logging.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    #[error("no tenant identifier in request")]
    MissingTenant,
    #[error("'{0}' is a reserved asset folder name, not a tenant")]
    ReservedName(String),
    #[error("tenant identifier '{0}' is not URL-safe")]
    InvalidTenantId(String),
    #[error("path contains traversal segments")]
    Traversal,
}

impl ResolveError {
    pub fn code(&self) -> ServeErrorCode {
        ServeErrorCode::InvalidTenant
    }
}

/// Resolves requests to tenants. Constructed once at startup from the
/// platform base domain and shared read-only across requests.
#[derive(Debug, Clone)]
pub struct TenantResolver {
    base_domain: String,
}

impl TenantResolver {
    /// Create a resolver. An empty `base_domain` disables subdomain
    /// routing; every request is then path-routed.
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: base_domain.into().trim_matches('.').to_ascii_lowercase(),
        }
    }

    /// Derive `{tenant, in-tenant path, routing mode}` from a request's
    /// hostname and path.
    pub fn resolve(&self, hostname: &str, path: &str) -> Result<RequestContext, ResolveError> {
        let segments = normalize_segments(path)?;

        if let Some(label) = self.subdomain_label(hostname) {
            // Subdomain mode: the whole path is the in-tenant path
            let tenant_id = validate_tenant_id(label)?;
            return Ok(RequestContext {
                tenant_id,
                path: join_segments(&segments),
                routing_mode: RoutingMode::Subdomain,
            });
        }

        // Path mode: the first segment names the tenant, the rest is the
        // in-tenant path.
        let (tenant, rest) = segments.split_first().ok_or(ResolveError::MissingTenant)?;
        let tenant_id = validate_tenant_id(tenant)?;

        Ok(RequestContext {
            tenant_id,
            path: join_segments(rest),
            routing_mode: RoutingMode::Path,
        })
    }

    /// If the hostname sits strictly below the base domain, return its
    /// leftmost label. Hostnames are matched case-insensitively and
    /// without any port suffix.
    fn subdomain_label<'a>(&self, hostname: &'a str) -> Option<&'a str> {
        if self.base_domain.is_empty() {
            return None;
        }

        let host = hostname.trim_end_matches('.');
        if host.len() <= self.base_domain.len() + 1 {
            return None;
        }

        let (prefix, suffix) = host.split_at(host.len() - self.base_domain.len());
        if !suffix.eq_ignore_ascii_case(&self.base_domain) || !prefix.ends_with('.') {
            return None;
        }

        prefix.trim_end_matches('.').split('.').next()
    }
}

/// Check that a derived tenant identifier is usable: URL-safe charset and
/// not a reserved asset-folder name. URL-safety also guarantees a storage
/// key can never be built from traversal input, since `.`, `/`, `\` and
/// `%` are all rejected.
fn validate_tenant_id(candidate: &str) -> Result<String, ResolveError> {
    if candidate.is_empty() {
        return Err(ResolveError::MissingTenant);
    }

    if !candidate
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ResolveError::InvalidTenantId(candidate.to_string()));
    }

    let lower = candidate.to_ascii_lowercase();
    if RESERVED_PREFIXES.contains(&lower.as_str()) {
        return Err(ResolveError::ReservedName(candidate.to_string()));
    }

    Ok(candidate.to_string())
}

/// Split a request path into normalized segments: query/fragment
/// stripped, repeated and trailing slashes collapsed away. Rejects dot
/// segments and percent-encoded slash/dot/backslash sequences so a
/// storage key can never escape the tenant prefix.
fn normalize_segments(path: &str) -> Result<Vec<&str>, ResolveError> {
    let path = path.split(['?', '#']).next().unwrap_or("");

    let mut segments = Vec::new();
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        if segment == "." || segment == ".." {
            return Err(ResolveError::Traversal);
        }
        let lower = segment.to_ascii_lowercase();
        if lower.contains("%2e")
            || lower.contains("%2f")
            || lower.contains("%5c")
            || segment.contains('\\')
        {
            return Err(ResolveError::Traversal);
        }
        segments.push(segment);
    }

    Ok(segments)
}

/// Join normalized segments back into an in-tenant path; no segments
/// means the directory root, which maps to `/index.html`.
fn join_segments(segments: &[&str]) -> String {
    if segments.is_empty() {
        "/index.html".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}
