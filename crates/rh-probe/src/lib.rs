//! # rh-probe
//!
//! Metadata extraction for media files.
//!
//! Extraction never fails with an error: every [`Extractor`] answers with an
//! [`ExtractionOutcome`] that tells the indexer whether it got metadata,
//! whether the file is simply not media, or whether it should try again
//! later. Two extractors ship here:
//!
//! - [`SignatureSniffer`] recognises containers from their leading bytes
//!   (MP3, AAC, FLAC, WAV, Ogg, MP4/MOV, Matroska/WebM, AVI, MPEG-TS) and reads
//!   whatever header fields are cheap to reach.
//! - [`FfprobeExtractor`] shells out to `ffprobe` when it is installed.
//!
//! [`CompositeExtractor`] layers them and fills gaps in what they found
//! from the file's path ([`filename`]). [`fingerprint`] provides the
//! stat/SHA-256 helpers used for change detection.
//!
//! ```no_run
//! use rh_probe::{Extractor, SignatureSniffer};
//! use std::path::Path;
//!
//! # async fn example() {
//! let outcome = SignatureSniffer::new().extract(Path::new("song.mp3")).await;
//! println!("{outcome:?}");
//! # }
//! ```

pub mod command;
pub mod composite;
pub mod extractor;
pub mod ffprobe;
pub mod filename;
pub mod fingerprint;
pub mod sniff;

pub use composite::CompositeExtractor;
pub use extractor::{ExtractionOutcome, Extractor};
pub use ffprobe::FfprobeExtractor;
pub use fingerprint::Fingerprint;
pub use sniff::SignatureSniffer;
