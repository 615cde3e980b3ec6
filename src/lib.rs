//! Sitegate - a reverse proxy that serves static-site builds from object storage
//!
//! This library provides the serving half of a multi-tenant static-site
//! hosting platform:
//! - Resolves the tenant for each request from the subdomain or the first
//!   path segment
//! - Fetches the backing object from an S3-compatible store under a
//!   tenant-scoped prefix
//! - Rewrites root-relative references in HTML and CSS so many tenants can
//!   share one origin, and injects a `<base>` tag per document
//! - Falls back to the tenant's `index.html` for client-side routed paths
//! - Streams non-text assets without buffering

pub mod config;
pub mod content_type;
pub mod error;
pub mod rewrite;
pub mod server;
pub mod store;
pub mod tenant;
