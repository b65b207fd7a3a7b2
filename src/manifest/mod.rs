//! HLS manifest rewriter.
//!
//! Rewrites every child URI in an `.m3u8` playlist into a proxied
//! `http://127.0.0.1:<port>/proxy?url=<encoded>` URI, resolving relative URIs
//! against the manifest's own URL first. Every other byte of the manifest —
//! line endings, comments, non-URI tag attributes — passes through
//! untouched.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::trace;
use url::Url;

/// RFC 3986 query-component encode set: unreserved characters
/// (`ALPHA / DIGIT / "-" / "." / "_" / "~"`) pass through; everything else is
/// percent-encoded. Equivalent to `encodeURIComponent`.
const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Rewrite a whole manifest body. `origin_url` is the URL the manifest was
/// itself fetched from (used to resolve relative child URIs); `port` is the
/// live listener port, re-read on every call so a warm cache-hit rewrite
/// always reflects the current process.
pub fn rewrite(manifest: &str, origin_url: &str, port: u16) -> String {
    let base = Url::parse(origin_url).ok();
    let mut out = String::with_capacity(manifest.len() + 128);

    let mut rest = manifest;
    while !rest.is_empty() {
        let (line, terminator, remainder) = split_first_line(rest);
        out.push_str(&rewrite_line(line, base.as_ref(), port));
        out.push_str(terminator);
        rest = remainder;
    }

    out
}

/// Split `text` into its first line, the terminator that followed it
/// (`"\r\n"`, `"\n"`, or `""` for the final unterminated line), and the rest.
fn split_first_line(text: &str) -> (&str, &str, &str) {
    match text.find('\n') {
        Some(idx) => {
            let (line, after_nl) = (&text[..idx], &text[idx + 1..]);
            if line.ends_with('\r') {
                (&line[..line.len() - 1], "\r\n", after_nl)
            } else {
                (line, "\n", after_nl)
            }
        }
        None => (text, "", ""),
    }
}

fn rewrite_line(line: &str, base: Option<&Url>, port: u16) -> String {
    if line.trim().is_empty() {
        return line.to_string();
    }

    if let Some(stripped) = line.strip_prefix('#') {
        if stripped.contains("URI=\"") {
            return format!("#{}", rewrite_uri_attributes(stripped, base, port));
        }
        return line.to_string();
    }

    rewrite_uri(line, base, port)
}

/// Rewrite every `URI="..."` attribute embedded in a tag line, leaving the
/// rest of the tag untouched.
fn rewrite_uri_attributes(tag_body: &str, base: Option<&Url>, port: u16) -> String {
    let mut out = String::with_capacity(tag_body.len() + 64);
    let mut rest = tag_body;
    while let Some(start) = rest.find("URI=\"") {
        let before = &rest[..start];
        out.push_str(before);
        out.push_str("URI=\"");
        let after_marker = &rest[start + "URI=\"".len()..];
        match after_marker.find('"') {
            Some(end) => {
                let uri = &after_marker[..end];
                out.push_str(&rewrite_uri(uri, base, port));
                out.push('"');
                rest = &after_marker[end + 1..];
            }
            None => {
                // Unterminated attribute; emit the remainder verbatim and stop.
                out.push_str(after_marker);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Core URI rewrite rule.
fn rewrite_uri(uri: &str, base: Option<&Url>, port: u16) -> String {
    if is_already_proxied(uri) {
        trace!(uri, "manifest rewrite: already proxied, passing through");
        return uri.to_string();
    }

    let absolute = if is_absolute_http(uri) {
        uri.to_string()
    } else {
        match base.and_then(|b| b.join(uri).ok()) {
            Some(joined) => joined.to_string(),
            None => return uri.to_string(),
        }
    };

    encode_proxy_url(&absolute, port)
}

/// Build the proxied form of an already-absolute URL; shared with `convert_url`
/// as well as the rewrite rule above.
pub fn encode_proxy_url(absolute_url: &str, port: u16) -> String {
    let encoded = utf8_percent_encode(absolute_url, QUERY_COMPONENT);
    format!("http://127.0.0.1:{port}/proxy?url={encoded}")
}

fn is_absolute_http(uri: &str) -> bool {
    let lower = uri.trim_start();
    lower.len() >= 7
        && (lower[..7].eq_ignore_ascii_case("http://")
            || (lower.len() >= 8 && lower[..8].eq_ignore_ascii_case("https://")))
}

/// Detect a URI that already points back at this proxy's `/proxy` endpoint,
/// so rewriting never double-wraps it.
fn is_already_proxied(uri: &str) -> bool {
    let Ok(parsed) = Url::parse(uri) else {
        return false;
    };
    parsed.host_str() == Some("127.0.0.1")
        && parsed.path() == "/proxy"
        && parsed.query_pairs().any(|(k, _)| k == "url")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"k.bin\"\nseg1.ts\nhttp://cdn/seg2.ts\n";

    #[test]
    fn rewrites_relative_and_absolute_and_attribute_uris() {
        let out = rewrite(MANIFEST, "http://o/p/m.m3u8", 9099);
        let expected = concat!(
            "#EXTM3U\n",
            "#EXT-X-KEY:METHOD=AES-128,URI=\"http://127.0.0.1:9099/proxy?url=http%3A%2F%2Fo%2Fp%2Fk.bin\"\n",
            "http://127.0.0.1:9099/proxy?url=http%3A%2F%2Fo%2Fp%2Fseg1.ts\n",
            "http://127.0.0.1:9099/proxy?url=http%3A%2F%2Fcdn%2Fseg2.ts\n",
        );
        assert_eq!(out, expected);
    }

    #[test]
    fn passes_through_blank_and_comment_lines_without_uri_attr() {
        let manifest = "#EXTM3U\n\n#EXT-X-VERSION:3\n";
        assert_eq!(rewrite(manifest, "http://o/m.m3u8", 9000), manifest);
    }

    #[test]
    fn preserves_final_line_without_trailing_newline() {
        let manifest = "#EXTM3U\nseg1.ts";
        let out = rewrite(manifest, "http://o/p/m.m3u8", 9000);
        assert!(!out.ends_with('\n'));
        assert!(out.contains("seg1.ts"));
    }

    #[test]
    fn preserves_crlf_line_endings() {
        let manifest = "#EXTM3U\r\nseg1.ts\r\n";
        let out = rewrite(manifest, "http://o/p/m.m3u8", 9000);
        assert!(out.contains("\r\n"));
        assert!(!out.contains("seg1.ts\n") || out.contains("seg1.ts\r\n"));
    }

    #[test]
    fn rewrite_is_idempotent() {
        let once = rewrite(MANIFEST, "http://o/p/m.m3u8", 9099);
        let twice = rewrite(&once, "http://o/p/m.m3u8", 9099);
        assert_eq!(once, twice);
    }

    #[test]
    fn resolves_parent_relative_uris() {
        let manifest = "#EXTM3U\n../hi/seg1.ts\n";
        let out = rewrite(manifest, "http://o/a/b/m.m3u8", 9000);
        assert!(out.contains("http%3A%2F%2Fo%2Fa%2Fhi%2Fseg1.ts"));
    }
}
