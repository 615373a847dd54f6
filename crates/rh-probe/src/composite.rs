//! An extractor that delegates to several [`Extractor`] implementations.

use std::path::Path;

use async_trait::async_trait;
use rh_core::config::ToolsConfig;

use crate::extractor::{ExtractionOutcome, Extractor};
use crate::ffprobe::FfprobeExtractor;
use crate::filename;
use crate::sniff::SignatureSniffer;

/// Tries each registered [`Extractor`] in order and returns the first
/// metadata produced, with title, year, season and episode filled in from
/// the file's path where the extractor found none.
///
/// When none succeeds, a `Deferred` answer from any extractor wins over
/// `Unsupported`: one extractor being temporarily unable to read the file
/// means a retry may still succeed.
pub struct CompositeExtractor {
    extractors: Vec<Box<dyn Extractor>>,
}

impl CompositeExtractor {
    pub fn new(extractors: Vec<Box<dyn Extractor>>) -> Self {
        Self { extractors }
    }

    /// The standard chain: ffprobe (when enabled and found) followed by the
    /// signature sniffer.
    pub fn from_config(tools: &ToolsConfig) -> Self {
        let mut extractors: Vec<Box<dyn Extractor>> = Vec::new();
        if tools.use_ffprobe {
            let ffprobe = match &tools.ffprobe_path {
                Some(path) => Some(FfprobeExtractor::new(path.clone())),
                None => FfprobeExtractor::from_path(),
            };
            match ffprobe {
                Some(ex) => extractors.push(Box::new(ex)),
                None => tracing::info!("ffprobe not found; using signature sniffing only"),
            }
        }
        extractors.push(Box::new(SignatureSniffer::new()));
        Self::new(extractors)
    }

    /// Names of the registered extractors, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.extractors.iter().map(|e| e.name()).collect()
    }
}

#[async_trait]
impl Extractor for CompositeExtractor {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn supports(&self, path: &Path) -> bool {
        self.extractors.iter().any(|e| e.supports(path))
    }

    async fn extract(&self, path: &Path) -> ExtractionOutcome {
        let mut deferred = None;
        let mut unsupported = None;

        for extractor in &self.extractors {
            if !extractor.supports(path) {
                continue;
            }

            match extractor.extract(path).await {
                ExtractionOutcome::Extracted(mut meta) => {
                    filename::enrich(&mut meta, path);
                    return ExtractionOutcome::Extracted(meta);
                }
                ExtractionOutcome::Deferred(reason) => {
                    tracing::debug!(
                        extractor = extractor.name(),
                        path = %path.display(),
                        %reason,
                        "extractor deferred, trying next"
                    );
                    deferred.get_or_insert(reason);
                }
                ExtractionOutcome::Unsupported(reason) => {
                    tracing::debug!(
                        extractor = extractor.name(),
                        path = %path.display(),
                        %reason,
                        "extractor does not support file, trying next"
                    );
                    unsupported = Some(reason);
                }
            }
        }

        if let Some(reason) = deferred {
            return ExtractionOutcome::Deferred(reason);
        }
        ExtractionOutcome::Unsupported(unsupported.unwrap_or_else(|| {
            format!("no extractor supports file: {}", path.display())
        }))
    }
}
