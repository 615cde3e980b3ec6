//! Extension-based content type resolution
//!
//! Used when the object store has no usable content-type metadata for a
//! key. The table matches what the build pipeline typically uploads.

/// Fallback content type when nothing better is known
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Map a file path to a MIME type by extension.
///
/// Returns [`DEFAULT_CONTENT_TYPE`] for unknown or missing extensions.
pub fn from_path(path: &str) -> &'static str {
    let ext = path
        .rsplit('.')
        .next()
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "eot" => "application/vnd.ms-fontobject",
        "map" => "application/json",
        "webp" => "image/webp",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        _ => DEFAULT_CONTENT_TYPE,
    }
}
