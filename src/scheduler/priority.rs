//! Priority classification for download requests. Manifests, fMP4 init
//! segments, and small probe ranges jump the BULK queue entirely — nothing
//! should stall behind a backlog of heavy segment downloads waiting on a
//! small header fetch.

use super::ByteRange;

const SMALL_RANGE_THRESHOLD: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Priority,
    Bulk,
}

/// Decide a request's lane. `url` is the full remote URL (including query
/// string); `range` is the byte range requested, if any.
pub fn classify(url: &str, range: Option<ByteRange>) -> Priority {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let lower = path.to_ascii_lowercase();

    if lower.ends_with(".m3u8") || lower.contains(".m3u8") {
        return Priority::Priority;
    }
    if lower.contains("init.mp4") {
        return Priority::Priority;
    }
    if let Some(range) = range {
        if let Some(hi) = range.hi {
            if hi >= range.lo && hi - range.lo + 1 < SMALL_RANGE_THRESHOLD {
                return Priority::Priority;
            }
        }
    }

    Priority::Bulk
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_urls_are_priority() {
        assert_eq!(classify("http://o/live/index.m3u8", None), Priority::Priority);
        assert_eq!(
            classify("http://o/live/index.m3u8?t=1", None),
            Priority::Priority
        );
    }

    #[test]
    fn init_segment_is_priority() {
        assert_eq!(classify("http://o/video/init.mp4", None), Priority::Priority);
    }

    #[test]
    fn small_range_is_priority() {
        let range = ByteRange { lo: 0, hi: Some(511) };
        assert_eq!(classify("http://o/video.mp4", Some(range)), Priority::Priority);
    }

    #[test]
    fn large_range_is_bulk() {
        let range = ByteRange {
            lo: 0,
            hi: Some(2_000_000),
        };
        assert_eq!(classify("http://o/video.mp4", Some(range)), Priority::Bulk);
    }

    #[test]
    fn plain_segment_without_range_is_bulk() {
        assert_eq!(classify("http://o/seg1.ts", None), Priority::Bulk);
    }

    #[test]
    fn open_ended_range_is_not_classified_small() {
        let range = ByteRange { lo: 0, hi: None };
        assert_eq!(classify("http://o/video.mp4", Some(range)), Priority::Bulk);
    }
}
