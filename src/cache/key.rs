//! Cache key derivation.
//!
//! A key is derived from `(remote_url, optional_byte_range)`. When a byte
//! range is present, the bounds are folded into the string before hashing so
//! that fMP4 init segments and media segments sharing a URL never collide.

use sha2::{Digest, Sha256};

/// A storage key for one cacheable entity: either a whole resource (a
/// manifest, or a segment fetched without a range) or one byte range of a
/// resource (a fMP4 chunk).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key for a plain URL with no byte range.
    pub fn for_url(url: &str) -> Self {
        Self(url.to_string())
    }

    /// Build the key for a URL restricted to `[lo, hi]` inclusive.
    pub fn for_range(url: &str, lo: u64, hi: u64) -> Self {
        Self(format!("{url}-{lo}-{hi}"))
    }

    /// The raw string this key was derived from — used only for logging and
    /// tests; the on-disk name is always the hash (`hex_digest`).
    pub fn raw(&self) -> &str {
        &self.0
    }

    /// `sha256_hex(key)` — deterministic across runs and processes.
    pub fn hex_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Extension to store a file under, derived from the URL's path extension,
/// defaulting to `bin` when there isn't one.
pub fn extension_for_url(url: &str) -> String {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());

    std::path::Path::new(&path)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .unwrap_or("bin")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn determinism() {
        let a = CacheKey::for_url("http://origin/seg1.ts");
        let b = CacheKey::for_url("http://origin/seg1.ts");
        assert_eq!(a.hex_digest(), b.hex_digest());
    }

    #[test]
    fn range_and_plain_keys_differ() {
        let whole = CacheKey::for_url("http://origin/init.mp4");
        let ranged = CacheKey::for_range("http://origin/init.mp4", 0, 99);
        assert_ne!(whole.hex_digest(), ranged.hex_digest());
    }

    #[test]
    fn distinct_ranges_of_same_url_differ() {
        let a = CacheKey::for_range("http://origin/video.mp4", 0, 999);
        let b = CacheKey::for_range("http://origin/video.mp4", 1000, 1999);
        assert_ne!(a.hex_digest(), b.hex_digest());
    }

    #[test]
    fn extension_defaults_to_bin() {
        assert_eq!(extension_for_url("http://o/seg"), "bin");
        assert_eq!(extension_for_url("http://o/seg.ts"), "ts");
        assert_eq!(extension_for_url("http://o/p/m.m3u8?x=1"), "m3u8");
    }
}
