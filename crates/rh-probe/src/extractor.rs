//! The [`Extractor`] trait and its tagged result.

use std::path::Path;

use async_trait::async_trait;
use rh_core::MediaMetadata;

/// Result of one extraction attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    /// Metadata was read.
    Extracted(MediaMetadata),
    /// The file is not readable as media by this extractor.
    Unsupported(String),
    /// The file could not be read right now (empty, truncated, tool
    /// unavailable); a later attempt may succeed.
    Deferred(String),
}

impl ExtractionOutcome {
    pub fn is_extracted(&self) -> bool {
        matches!(self, ExtractionOutcome::Extracted(_))
    }

    /// The failure reason, if this is not `Extracted`.
    pub fn reason(&self) -> Option<&str> {
        match self {
            ExtractionOutcome::Extracted(_) => None,
            ExtractionOutcome::Unsupported(r) | ExtractionOutcome::Deferred(r) => Some(r),
        }
    }

    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractionOutcome::Extracted(_) => "extracted",
            ExtractionOutcome::Unsupported(_) => "unsupported",
            ExtractionOutcome::Deferred(_) => "deferred",
        }
    }
}

/// A metadata extractor.
///
/// Implementations must be safe to share across worker tasks.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Human-readable name identifying this extractor.
    fn name(&self) -> &'static str;

    /// Whether this extractor should be tried for `path`.
    ///
    /// A return value of `true` does not guarantee that
    /// [`Extractor::extract`] will produce metadata.
    fn supports(&self, path: &Path) -> bool;

    /// Read metadata from the file at `path`.
    async fn extract(&self, path: &Path) -> ExtractionOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons() {
        let ok = ExtractionOutcome::Extracted(MediaMetadata::default());
        assert!(ok.is_extracted());
        assert_eq!(ok.reason(), None);

        let later = ExtractionOutcome::Deferred("empty".into());
        assert_eq!(later.reason(), Some("empty"));
        assert_eq!(later.kind(), "deferred");
    }
}
