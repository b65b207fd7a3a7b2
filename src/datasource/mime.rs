//! MIME type selection by file extension.

pub fn mime_for_url(url: &str) -> &'static str {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());

    match std::path::Path::new(&path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("mp4") => "video/mp4",
        Some("m4s") => "video/iso.segment",
        Some("m4a") => "audio/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extensions_map_correctly() {
        assert_eq!(mime_for_url("http://o/a.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(mime_for_url("http://o/a.ts"), "video/mp2t");
        assert_eq!(mime_for_url("http://o/a.mp4"), "video/mp4");
        assert_eq!(mime_for_url("http://o/a.m4s"), "video/iso.segment");
        assert_eq!(mime_for_url("http://o/a.m4a"), "audio/mp4");
    }

    #[test]
    fn unknown_extension_falls_back_to_octet_stream() {
        assert_eq!(mime_for_url("http://o/a.bin"), "application/octet-stream");
        assert_eq!(mime_for_url("http://o/a"), "application/octet-stream");
    }
}
