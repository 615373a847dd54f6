//! HTTP `Range` header parsing.
//!
//! Supports one range per request in the three forms `bytes=a-b`,
//! `bytes=a-` and `bytes=-n`. A request for several ranges is answered with
//! the full representation.

use std::fmt;

/// An inclusive byte span within a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// The whole of a resource of `size` bytes, or `None` if it is empty.
    pub fn full(size: u64) -> Option<Self> {
        (size > 0).then(|| Self {
            start: 0,
            end: size - 1,
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a resource of `size` bytes.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    /// The header is not a byte-range specification.
    Malformed(String),
    /// The range lies entirely outside the resource.
    Unsatisfiable,
}

/// Parse a `Range` header against a resource of `size` bytes.
///
/// `Ok(None)` means the full representation should be sent (multi-range
/// requests whose parts are all well formed). An end past the last byte is
/// clamped.
pub fn parse_range(header: &str, size: u64) -> Result<Option<ByteRange>, RangeError> {
    let header = header.trim();
    let specs = header
        .get(..6)
        .filter(|unit| unit.eq_ignore_ascii_case("bytes="))
        .map(|_| &header[6..])
        .ok_or_else(|| RangeError::Malformed(format!("unsupported range unit: {header}")))?;

    if !specs.contains(',') {
        return parse_spec(specs, size).map(Some);
    }

    for spec in specs.split(',') {
        match parse_spec(spec, size) {
            Ok(_) | Err(RangeError::Unsatisfiable) => {}
            Err(malformed) => return Err(malformed),
        }
    }
    Ok(None)
}

/// One `first-last` byte-range spec.
fn parse_spec(spec: &str, size: u64) -> Result<ByteRange, RangeError> {
    let (first, last) = spec
        .split_once('-')
        .ok_or_else(|| RangeError::Malformed(format!("missing '-' in range: {spec}")))?;
    let (first, last) = (first.trim(), last.trim());

    match (first.is_empty(), last.is_empty()) {
        (true, true) => Err(RangeError::Malformed("empty range".into())),
        // bytes=-n: the final n bytes
        (true, false) => {
            let n = parse_pos(last)?;
            if n == 0 || size == 0 {
                return Err(RangeError::Unsatisfiable);
            }
            Ok(ByteRange {
                start: size.saturating_sub(n),
                end: size - 1,
            })
        }
        // bytes=a-
        (false, true) => {
            let start = parse_pos(first)?;
            if start >= size {
                return Err(RangeError::Unsatisfiable);
            }
            Ok(ByteRange {
                start,
                end: size - 1,
            })
        }
        // bytes=a-b
        (false, false) => {
            let start = parse_pos(first)?;
            let end = parse_pos(last)?;
            if start > end {
                return Err(RangeError::Malformed(format!("range start after end: {spec}")));
            }
            if start >= size {
                return Err(RangeError::Unsatisfiable);
            }
            Ok(ByteRange {
                start,
                end: end.min(size - 1),
            })
        }
    }
}

fn parse_pos(s: &str) -> Result<u64, RangeError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::Malformed(format!("invalid byte position: {s}")));
    }
    s.parse()
        .map_err(|_| RangeError::Malformed(format!("byte position out of range: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, end: u64) -> Option<ByteRange> {
        Some(ByteRange { start, end })
    }

    #[test]
    fn closed_range() {
        assert_eq!(parse_range("bytes=0-99", 1000), Ok(r(0, 99)));
        assert_eq!(parse_range("bytes=500-999", 1000), Ok(r(500, 999)));
    }

    #[test]
    fn end_is_clamped() {
        assert_eq!(parse_range("bytes=900-5000", 1000), Ok(r(900, 999)));
    }

    #[test]
    fn open_ended() {
        assert_eq!(parse_range("bytes=500-", 1000), Ok(r(500, 999)));
    }

    #[test]
    fn suffix() {
        assert_eq!(parse_range("bytes=-100", 1000), Ok(r(900, 999)));
        // Longer than the resource: the whole thing.
        assert_eq!(parse_range("bytes=-5000", 1000), Ok(r(0, 999)));
    }

    #[test]
    fn single_byte_resource() {
        assert_eq!(parse_range("bytes=0-0", 1), Ok(r(0, 0)));
        assert_eq!(parse_range("bytes=-1", 1), Ok(r(0, 0)));
    }

    #[test]
    fn unsatisfiable() {
        assert_eq!(parse_range("bytes=1000-", 1000), Err(RangeError::Unsatisfiable));
        assert_eq!(parse_range("bytes=1000-1200", 1000), Err(RangeError::Unsatisfiable));
        assert_eq!(parse_range("bytes=-0", 1000), Err(RangeError::Unsatisfiable));
    }

    #[test]
    fn zero_size_resource_is_never_satisfiable() {
        assert_eq!(parse_range("bytes=0-", 0), Err(RangeError::Unsatisfiable));
        assert_eq!(parse_range("bytes=-10", 0), Err(RangeError::Unsatisfiable));
        assert_eq!(ByteRange::full(0), None);
    }

    #[test]
    fn malformed() {
        for h in [
            "bytes=",
            "bytes=-",
            "bytes=abc-def",
            "bytes=5",
            "bytes=10-5",
            "bytes=+1-2",
            "items=0-10",
            "0-10",
        ] {
            assert!(
                matches!(parse_range(h, 1000), Err(RangeError::Malformed(_))),
                "{h} should be malformed"
            );
        }
    }

    #[test]
    fn multi_range_means_full_content() {
        assert_eq!(parse_range("bytes=0-10, 20-30", 1000), Ok(None));
        // A part past the end does not spoil the others.
        assert_eq!(parse_range("bytes=0-10,5000-", 1000), Ok(None));
    }

    #[test]
    fn multi_range_parts_are_validated() {
        for h in ["bytes=abc,def", "bytes=0-10,x-1", "bytes=0-1,", "bytes=5-1,0-2"] {
            assert!(
                matches!(parse_range(h, 1000), Err(RangeError::Malformed(_))),
                "{h} should be malformed"
            );
        }
    }

    #[test]
    fn unit_is_case_insensitive() {
        assert_eq!(parse_range("Bytes=0-1", 10), Ok(r(0, 1)));
    }

    #[test]
    fn content_range_format() {
        let range = ByteRange { start: 10, end: 19 };
        assert_eq!(range.len(), 10);
        assert_eq!(range.content_range(100), "bytes 10-19/100");
    }
}
