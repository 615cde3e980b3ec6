//! Root-relative reference rewriting for HTML and CSS
//!
//! Build tooling emits references rooted at `/` (`/assets/app.js`), but
//! tenant output is served under `/<tenant>/`. This module rewrites those
//! references and pins a `<base>` tag so both hardcoded absolute paths and
//! genuinely relative paths resolve inside the tenant's prefix.
//!
//! The rules are a fixed, ordered set. Every rule skips references that
//! are already tenant-scoped, so applying the full pass to its own output
//! is a no-op. The SPA fallback path relies on that: primary and fallback
//! responses run through the same engine and must never double-prefix.

use regex::{Captures, NoExpand, Regex};

/// Compiled rewrite rules. Built once at startup and shared read-only
/// across requests.
#[derive(Debug)]
pub struct Rewriter {
    /// `href="/x"` / `src="/x"`, single or double quotes
    quoted_attr: Regex,
    /// `href=/x` / `src=/x` without quotes
    unquoted_attr: Regex,
    /// `srcset="..."` comma-separated url/descriptor lists
    srcset_attr: Regex,
    /// `url(/x)` with or without quotes, in style blocks and attributes
    css_url: Regex,
    /// `data-src="/x"` / `data-href="/x"` deferred-loading markers
    data_attr: Regex,
    /// Bare references into well-known asset folders, e.g. `src="assets/x"`
    bare_asset: Regex,
    /// A URL that leaves the origin and must never be rewritten
    external: Regex,
    /// An existing `<base ... href=...>` tag
    base_tag: Regex,
    /// The opening `<head>` tag, with or without attributes
    head_open: Regex,
}

impl Default for Rewriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Rewriter {
    pub fn new() -> Self {
        Self {
            quoted_attr: Regex::new(r#"(?i)(href|src)\s*=\s*(["'])(/[^"']*)(["'])"#)
                .expect("valid regex literal"),
            unquoted_attr: Regex::new(r#"(?i)(href|src)\s*=\s*(/[^\s>"']*)"#)
                .expect("valid regex literal"),
            srcset_attr: Regex::new(r#"(?i)srcset\s*=\s*(["'])([^"']*)(["'])"#)
                .expect("valid regex literal"),
            // The regex crate has no backreferences, so quote matching is
            // spelled out as one alternation per quoting style.
            css_url: Regex::new(
                r#"(?i)url\(\s*(?:"(/[^")]*)"|'(/[^')]*)'|(/[^"'()\s]*))\s*\)"#,
            )
            .expect("valid regex literal"),
            data_attr: Regex::new(r#"(?i)(data-src|data-href)\s*=\s*(["'])(/[^"']*)(["'])"#)
                .expect("valid regex literal"),
            bare_asset: Regex::new(
                r#"(?i)(href|src|data-src)\s*=\s*(["'])((?:assets|dist|build|public|static|images|img|css|js|fonts|media)/[^"']*)(["'])"#,
            )
            .expect("valid regex literal"),
            external: Regex::new(r"(?i)^(?:https?|mailto|tel|data):").expect("valid regex literal"),
            base_tag: Regex::new(r#"(?i)<base\s+[^>]*href\s*=\s*["'][^"']*["'][^>]*>"#)
                .expect("valid regex literal"),
            head_open: Regex::new(r"(?i)<head(\s[^>]*)?>").expect("valid regex literal"),
        }
    }

    /// Rewrite an HTML document for a tenant: pin the `<base>` tag, then
    /// apply every reference rule in order.
    pub fn rewrite_html(&self, tenant: &str, html: &str) -> String {
        let html = self.ensure_base_tag(tenant, html);

        let html = self
            .quoted_attr
            .replace_all(&html, |caps: &Captures| {
                match self.prefix_root_relative(&caps[3], tenant) {
                    Some(url) => format!("{}={}{}{}", &caps[1], &caps[2], url, &caps[4]),
                    None => caps[0].to_string(),
                }
            })
            .into_owned();

        let html = self
            .unquoted_attr
            .replace_all(&html, |caps: &Captures| {
                match self.prefix_root_relative(&caps[2], tenant) {
                    // Unquoted attributes come back quoted
                    Some(url) => format!("{}=\"{}\"", &caps[1], url),
                    None => caps[0].to_string(),
                }
            })
            .into_owned();

        let html = self
            .srcset_attr
            .replace_all(&html, |caps: &Captures| {
                let rewritten = self.rewrite_srcset(&caps[2], tenant);
                format!("srcset={}{}{}", &caps[1], rewritten, &caps[3])
            })
            .into_owned();

        let html = self.rewrite_css_urls(&html, tenant);

        let html = self
            .data_attr
            .replace_all(&html, |caps: &Captures| {
                match self.prefix_root_relative(&caps[3], tenant) {
                    Some(url) => format!("{}={}{}{}", &caps[1], &caps[2], url, &caps[4]),
                    None => caps[0].to_string(),
                }
            })
            .into_owned();

        self.bare_asset
            .replace_all(&html, |caps: &Captures| {
                format!("{}={}/{}/{}{}", &caps[1], &caps[2], tenant, &caps[3], &caps[4])
            })
            .into_owned()
    }

    /// Rewrite a CSS document for a tenant: `url(...)` references only.
    pub fn rewrite_css(&self, tenant: &str, css: &str) -> String {
        self.rewrite_css_urls(css, tenant)
    }

    fn rewrite_css_urls(&self, content: &str, tenant: &str) -> String {
        self.css_url
            .replace_all(content, |caps: &Captures| {
                let (url, quote) = if let Some(m) = caps.get(1) {
                    (m.as_str(), "\"")
                } else if let Some(m) = caps.get(2) {
                    (m.as_str(), "'")
                } else {
                    (&caps[3], "")
                };
                match self.prefix_root_relative(url, tenant) {
                    Some(url) => format!("url({quote}{url}{quote})"),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Rewrite each url component of a srcset value, preserving width and
    /// density descriptors verbatim.
    fn rewrite_srcset(&self, value: &str, tenant: &str) -> String {
        value
            .split(',')
            .map(|entry| {
                let trimmed = entry.trim();
                let mut parts = trimmed.split_whitespace();
                let url = match parts.next() {
                    Some(u) => u,
                    None => return trimmed.to_string(),
                };
                let descriptors: Vec<&str> = parts.collect();

                let rewritten = match self.prefix_root_relative(url, tenant) {
                    Some(u) => u,
                    None => url.to_string(),
                };

                if descriptors.is_empty() {
                    rewritten
                } else {
                    format!("{} {}", rewritten, descriptors.join(" "))
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Given a reference starting with `/`, return its tenant-scoped form,
    /// or `None` when it must be left alone: not root-relative after all
    /// (protocol-relative `//`), already tenant-scoped, or an external
    /// scheme.
    fn prefix_root_relative(&self, url: &str, tenant: &str) -> Option<String> {
        let rest = url.strip_prefix('/')?;
        if rest.starts_with('/') {
            return None;
        }
        if rest == tenant || rest.starts_with(&format!("{}/", tenant)) {
            return None;
        }
        if self.external.is_match(rest) {
            return None;
        }
        Some(format!("/{}/{}", tenant, rest))
    }

    /// Ensure the document carries exactly one `<base href="/<tenant>/">`:
    /// replace an existing base tag, else insert after the opening
    /// `<head>`, else before `</head>`, else prepend to the document.
    fn ensure_base_tag(&self, tenant: &str, html: &str) -> String {
        let base_tag = format!("<base href=\"/{}/\">", tenant);

        if self.base_tag.is_match(html) {
            return self
                .base_tag
                .replace(html, NoExpand(base_tag.as_str()))
                .into_owned();
        }

        if let Some(m) = self.head_open.find(html) {
            let mut out = String::with_capacity(html.len() + base_tag.len() + 6);
            out.push_str(&html[..m.end()]);
            out.push_str("\n    ");
            out.push_str(&base_tag);
            out.push_str(&html[m.end()..]);
            return out;
        }

        if let Some(pos) = html.find("</head>") {
            let mut out = String::with_capacity(html.len() + base_tag.len() + 6);
            out.push_str(&html[..pos]);
            out.push_str("    ");
            out.push_str(&base_tag);
            out.push('\n');
            out.push_str(&html[pos..]);
            return out;
        }

        format!("{}\n{}", base_tag, html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> Rewriter {
        Rewriter::new()
    }

    #[test]
    fn test_quoted_href_and_src() {
        let html = r#"<link href="/styles/main.css"><img src='/img/logo.png'>"#;
        let out = rewriter().rewrite_html("myproj", html);
        assert!(out.contains(r#"href="/myproj/styles/main.css""#));
        assert!(out.contains(r#"src='/myproj/img/logo.png'"#));
    }

    #[test]
    fn test_unquoted_attributes_gain_quotes() {
        let html = "<img src=/img/logo.png>";
        let out = rewriter().rewrite_html("myproj", html);
        assert!(out.contains(r#"src="/myproj/img/logo.png""#));
    }

    #[test]
    fn test_srcset_descriptors_preserved() {
        let html = r#"<img srcset="/img/a.png 1x, /img/b.png 2x, https://cdn.example.com/c.png 3x">"#;
        let out = rewriter().rewrite_html("myproj", html);
        assert!(out.contains(
            r#"srcset="/myproj/img/a.png 1x, /myproj/img/b.png 2x, https://cdn.example.com/c.png 3x""#
        ));
    }

    #[test]
    fn test_css_url_variants() {
        let css = r#"body { background: url(/img/bg.png); }
.a { background: url("/img/a.png"); }
.b { background: url('/img/b.png'); }"#;
        let out = rewriter().rewrite_css("myproj", css);
        assert!(out.contains("url(/myproj/img/bg.png)"));
        assert!(out.contains(r#"url("/myproj/img/a.png")"#));
        assert!(out.contains("url('/myproj/img/b.png')"));
    }

    #[test]
    fn test_inline_style_url() {
        let html = r#"<div style="background: url('/img/hero.jpg')"></div>"#;
        let out = rewriter().rewrite_html("myproj", html);
        assert!(out.contains("url('/myproj/img/hero.jpg')"));
    }

    #[test]
    fn test_data_attributes() {
        let html = r#"<img data-src="/img/lazy.png" data-href='/page'>"#;
        let out = rewriter().rewrite_html("myproj", html);
        assert!(out.contains(r#"data-src="/myproj/img/lazy.png""#));
        assert!(out.contains("data-href='/myproj/page'"));
    }

    #[test]
    fn test_bare_asset_folder_references() {
        let html = r#"<script src="assets/app.js"></script><img src="images/x.png">"#;
        let out = rewriter().rewrite_html("myproj", html);
        assert!(out.contains(r#"src="/myproj/assets/app.js""#));
        assert!(out.contains(r#"src="/myproj/images/x.png""#));
    }

    #[test]
    fn test_external_urls_untouched() {
        let html = concat!(
            r#"<a href="https://example.com/x">a</a>"#,
            r#"<a href="http://example.com/y">b</a>"#,
            r#"<a href="mailto:a@b.com">c</a>"#,
            r#"<a href="tel:+123">d</a>"#,
            r#"<img src="data:image/png;base64,AAAA">"#,
            r#"<script src="//cdn.example.com/lib.js"></script>"#,
        );
        let out = rewriter().rewrite_html("myproj", html);
        assert!(out.contains(r#"href="https://example.com/x""#));
        assert!(out.contains(r#"href="http://example.com/y""#));
        assert!(out.contains(r#"href="mailto:a@b.com""#));
        assert!(out.contains(r#"href="tel:+123""#));
        assert!(out.contains(r#"src="data:image/png;base64,AAAA""#));
        assert!(out.contains(r#"src="//cdn.example.com/lib.js""#));
    }

    #[test]
    fn test_idempotence_html() {
        let html = r#"<html><head><link href="/a.css"></head>
<body><img src=/img/x.png srcset="/img/x.png 1x, /img/y.png 2x">
<div style="background: url(/bg.png)"></div>
<script src="assets/app.js"></script></body></html>"#;
        let r = rewriter();
        let once = r.rewrite_html("myproj", html);
        let twice = r.rewrite_html("myproj", &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_idempotence_css() {
        let css = "a { background: url(/x.png); } b { background: url('/y.png'); }";
        let r = rewriter();
        let once = r.rewrite_css("myproj", css);
        let twice = r.rewrite_css("myproj", &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_no_double_prefix() {
        let html = r#"<a href="/myproj/page">x</a><img src="/myproj/img/x.png">"#;
        let out = rewriter().rewrite_html("myproj", html);
        assert!(!out.contains("/myproj/myproj/"));
    }

    #[test]
    fn test_tenant_root_link_not_double_prefixed() {
        let html = r#"<a href="/myproj">home</a>"#;
        let out = rewriter().rewrite_html("myproj", html);
        assert!(out.contains(r#"href="/myproj""#));
        assert!(!out.contains("/myproj/myproj"));
    }

    #[test]
    fn test_root_link_becomes_tenant_root() {
        let html = r#"<a href="/">home</a>"#;
        let out = rewriter().rewrite_html("myproj", html);
        assert!(out.contains(r#"href="/myproj/""#));
    }

    #[test]
    fn test_base_tag_inserted_after_head() {
        let html = "<html><head><title>t</title></head><body></body></html>";
        let out = rewriter().rewrite_html("myproj", html);
        assert_eq!(out.matches("<base ").count(), 1);
        let head = out.find("<head>").unwrap();
        let base = out.find("<base ").unwrap();
        let title = out.find("<title>").unwrap();
        assert!(head < base && base < title);
    }

    #[test]
    fn test_base_tag_inserted_after_head_with_attributes() {
        let html = r#"<head lang="en"><title>t</title></head>"#;
        let out = rewriter().rewrite_html("myproj", html);
        assert!(out.contains(r#"<head lang="en">"#));
        assert_eq!(out.matches(r#"<base href="/myproj/">"#).count(), 1);
    }

    #[test]
    fn test_existing_base_tag_replaced() {
        let html = r#"<head><base target="_blank" href="/old/">"#;
        let out = rewriter().rewrite_html("myproj", html);
        assert_eq!(out.matches("<base ").count(), 1);
        assert!(out.contains(r#"<base href="/myproj/">"#));
        assert!(!out.contains("/old/"));
    }

    #[test]
    fn test_base_tag_before_closing_head_without_opening() {
        let html = "<title>t</title></head><body></body>";
        let out = rewriter().rewrite_html("myproj", html);
        let base = out.find("<base ").unwrap();
        let close = out.find("</head>").unwrap();
        assert!(base < close);
    }

    #[test]
    fn test_base_tag_prepended_without_head() {
        let html = "<div>no head here</div>";
        let out = rewriter().rewrite_html("myproj", html);
        assert!(out.starts_with(r#"<base href="/myproj/">"#));
    }

    #[test]
    fn test_header_element_is_not_head() {
        let html = "<body><header>h</header></body>";
        let out = rewriter().rewrite_html("myproj", html);
        // No <head> structure at all, so the tag is prepended, not
        // spliced into <header>.
        assert!(out.starts_with("<base "));
        assert!(out.contains("<header>h</header>"));
    }

    #[test]
    fn test_whitespace_around_equals() {
        let html = r#"<img src = "/img/x.png">"#;
        let out = rewriter().rewrite_html("myproj", html);
        assert!(out.contains("/myproj/img/x.png"));
    }

    #[test]
    fn test_css_untouched_when_already_scoped() {
        let css = "a { background: url(/myproj/x.png); }";
        let out = rewriter().rewrite_css("myproj", css);
        assert_eq!(out, css);
    }

    #[test]
    fn test_external_css_urls_untouched() {
        let css = "a { background: url(https://cdn.example.com/x.png); } b { background: url(data:image/gif;base64,R0lGOD); }";
        let out = rewriter().rewrite_css("myproj", css);
        assert_eq!(out, css);
    }
}
