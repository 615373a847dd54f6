//! Container recognition from leading bytes.
//!
//! [`SignatureSniffer`] reads the first [`HEAD_LEN`] bytes of a file and
//! matches them against known container signatures. Header fields that sit
//! in that window (ID3 titles, FLAC stream info, WAV format chunk, MP4
//! `mvhd`) are decoded as well; everything else is left empty.

use std::path::Path;

use async_trait::async_trait;
use rh_core::{mime_for_container, MediaMetadata};
use tokio::io::AsyncReadExt;

use crate::extractor::{ExtractionOutcome, Extractor};

/// Bytes read from the start of each file.
pub const HEAD_LEN: usize = 64 * 1024;

/// Signature-based extractor. Needs no external tools.
#[derive(Debug, Clone, Default)]
pub struct SignatureSniffer;

impl SignatureSniffer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Extractor for SignatureSniffer {
    fn name(&self) -> &'static str {
        "sniff"
    }

    fn supports(&self, _path: &Path) -> bool {
        true
    }

    async fn extract(&self, path: &Path) -> ExtractionOutcome {
        match read_head(path).await {
            Ok((head, len)) => sniff(&head, len),
            Err(e) => ExtractionOutcome::Deferred(format!("read failed: {e}")),
        }
    }
}

async fn read_head(path: &Path) -> std::io::Result<(Vec<u8>, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let mut head = Vec::with_capacity(HEAD_LEN.min(len as usize));
    (&mut file).take(HEAD_LEN as u64).read_to_end(&mut head).await?;
    Ok((head, len))
}

/// Identify the container in `head`, the leading bytes of a file of
/// `file_len` bytes.
pub fn sniff(head: &[u8], file_len: u64) -> ExtractionOutcome {
    if file_len == 0 || head.is_empty() {
        return ExtractionOutcome::Deferred("file is empty".into());
    }

    if head.starts_with(b"ID3") {
        return sniff_id3(head, file_len);
    }
    if head.starts_with(b"fLaC") {
        return ExtractionOutcome::Extracted(sniff_flac(head));
    }
    if head.starts_with(b"RIFF") {
        match head.get(8..12) {
            Some(b"WAVE") => return sniff_wav(head, file_len),
            Some(b"AVI ") => return ExtractionOutcome::Extracted(base("avi")),
            _ => {}
        }
    }
    if head.starts_with(b"OggS") {
        return ExtractionOutcome::Extracted(sniff_ogg(head));
    }
    if head.get(4..8) == Some(&b"ftyp"[..]) {
        return ExtractionOutcome::Extracted(sniff_mp4(head));
    }
    if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        let window = &head[..head.len().min(64)];
        let container = if find(window, b"webm").is_some() {
            "webm"
        } else {
            "mkv"
        };
        return ExtractionOutcome::Extracted(base(container));
    }
    if head[0] == 0x47 && head.get(188) == Some(&0x47) && head.get(376).map_or(true, |b| *b == 0x47)
    {
        return ExtractionOutcome::Extracted(base("ts"));
    }
    if is_adts(head) {
        let mut meta = base("aac");
        meta.audio_codec = Some("aac".into());
        return ExtractionOutcome::Extracted(meta);
    }
    if let Some(frame) = MpegFrame::parse(head) {
        let mut meta = base("mp3");
        meta.audio_codec = Some("mp3".into());
        meta.duration_secs = frame.estimate_duration(file_len);
        meta.bit_rate = Some(frame.bitrate_kbps as u64 * 1000);
        return ExtractionOutcome::Extracted(meta);
    }

    if head.len() < 12 {
        ExtractionOutcome::Deferred("file too short to identify".into())
    } else {
        ExtractionOutcome::Unsupported("unrecognized container signature".into())
    }
}

fn base(container: &str) -> MediaMetadata {
    MediaMetadata {
        container: container.to_string(),
        mime_type: mime_for_container(container).to_string(),
        extractor: "sniff".into(),
        ..Default::default()
    }
}

fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    hay.windows(needle.len()).position(|w| w == needle)
}

fn be_u32(b: &[u8], at: usize) -> Option<u32> {
    b.get(at..at + 4)
        .map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
}

fn be_u64(b: &[u8], at: usize) -> Option<u64> {
    b.get(at..at + 8).map(|s| {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(s);
        u64::from_be_bytes(arr)
    })
}

fn le_u16(b: &[u8], at: usize) -> Option<u16> {
    b.get(at..at + 2).map(|s| u16::from_le_bytes([s[0], s[1]]))
}

fn le_u32(b: &[u8], at: usize) -> Option<u32> {
    b.get(at..at + 4)
        .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

fn synchsafe(b: &[u8]) -> u32 {
    b.iter()
        .take(4)
        .fold(0u32, |acc, byte| (acc << 7) | (*byte as u32 & 0x7F))
}

// ---------------------------------------------------------------------------
// MP3 / AAC
// ---------------------------------------------------------------------------

/// Header fields of an MPEG Layer III frame.
#[derive(Debug, Clone, Copy, PartialEq)]
struct MpegFrame {
    bitrate_kbps: u32,
    sample_rate: u32,
}

const MPEG1_L3_KBPS: [u32; 16] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
];
const MPEG2_L3_KBPS: [u32; 16] = [
    0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0,
];
const MPEG1_RATES: [u32; 3] = [44100, 48000, 32000];

impl MpegFrame {
    fn parse(b: &[u8]) -> Option<Self> {
        let h = b.get(..4)?;
        if h[0] != 0xFF || h[1] & 0xE0 != 0xE0 {
            return None;
        }
        let version = (h[1] >> 3) & 0x3;
        let layer = (h[1] >> 1) & 0x3;
        if version == 1 || layer != 1 {
            return None;
        }
        let bitrate_idx = (h[2] >> 4) as usize;
        let rate_idx = ((h[2] >> 2) & 0x3) as usize;
        if rate_idx == 3 {
            return None;
        }
        let (bitrate_kbps, sample_rate) = match version {
            3 => (MPEG1_L3_KBPS[bitrate_idx], MPEG1_RATES[rate_idx]),
            2 => (MPEG2_L3_KBPS[bitrate_idx], MPEG1_RATES[rate_idx] / 2),
            _ => (MPEG2_L3_KBPS[bitrate_idx], MPEG1_RATES[rate_idx] / 4),
        };
        if bitrate_kbps == 0 {
            return None;
        }
        Some(Self {
            bitrate_kbps,
            sample_rate,
        })
    }

    /// Constant-bitrate duration estimate for `audio_len` bytes of frames.
    fn estimate_duration(&self, audio_len: u64) -> Option<f64> {
        if audio_len == 0 {
            return None;
        }
        Some(audio_len as f64 * 8.0 / (self.bitrate_kbps as f64 * 1000.0))
    }
}

fn is_adts(b: &[u8]) -> bool {
    b.len() >= 2 && b[0] == 0xFF && (b[1] & 0xF6) == 0xF0
}

fn sniff_id3(head: &[u8], file_len: u64) -> ExtractionOutcome {
    let Some(header) = head.get(..10) else {
        return ExtractionOutcome::Deferred("truncated ID3 header".into());
    };
    let major = header[3];
    let flags = header[5];
    let mut tag_len = 10 + synchsafe(&header[6..10]) as u64;
    if flags & 0x10 != 0 {
        tag_len += 10;
    }
    if tag_len > file_len {
        return ExtractionOutcome::Deferred("ID3 tag extends past end of file".into());
    }

    let mut meta = base("mp3");
    meta.audio_codec = Some("mp3".into());

    if major == 3 || major == 4 {
        let end = (tag_len as usize).min(head.len());
        let mut pos = 10;
        if flags & 0x40 != 0 {
            let ext = head.get(10..14).map_or(0, |b| {
                if major == 4 {
                    synchsafe(b) as usize
                } else {
                    u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize + 4
                }
            });
            pos += ext;
        }
        while pos + 10 <= end {
            let id = &head[pos..pos + 4];
            if id[0] == 0 {
                break;
            }
            let size = if major == 4 {
                synchsafe(&head[pos + 4..pos + 8]) as usize
            } else {
                be_u32(head, pos + 4).unwrap_or(0) as usize
            };
            let body_start = pos + 10;
            let body_end = body_start.saturating_add(size);
            if body_end > end {
                break;
            }
            let body = &head[body_start..body_end];
            match id {
                b"TIT2" => meta.title = decode_text_frame(body),
                b"TPE1" => insert_tag(&mut meta, "artist", body),
                b"TALB" => insert_tag(&mut meta, "album", body),
                _ => {}
            }
            pos = body_end;
        }
    }

    if let Some(frame) = head.get(tag_len as usize..).and_then(MpegFrame::parse) {
        meta.duration_secs = frame.estimate_duration(file_len - tag_len);
        meta.bit_rate = Some(frame.bitrate_kbps as u64 * 1000);
        meta.tags
            .insert("sample_rate".into(), frame.sample_rate.to_string());
    }

    ExtractionOutcome::Extracted(meta)
}

fn insert_tag(meta: &mut MediaMetadata, key: &str, body: &[u8]) {
    if let Some(value) = decode_text_frame(body) {
        meta.tags.insert(key.into(), value);
    }
}

/// Decode an ID3v2 text frame body (encoding byte followed by text).
fn decode_text_frame(body: &[u8]) -> Option<String> {
    let (&encoding, text) = body.split_first()?;
    let decoded = match encoding {
        0 => text.iter().map(|&b| b as char).collect::<String>(),
        1 | 2 => {
            let (big_endian, data) = match text {
                [0xFE, 0xFF, rest @ ..] => (true, rest),
                [0xFF, 0xFE, rest @ ..] => (false, rest),
                _ => (encoding == 2, text),
            };
            let units: Vec<u16> = data
                .chunks_exact(2)
                .map(|c| {
                    if big_endian {
                        u16::from_be_bytes([c[0], c[1]])
                    } else {
                        u16::from_le_bytes([c[0], c[1]])
                    }
                })
                .collect();
            String::from_utf16_lossy(&units)
        }
        3 => String::from_utf8_lossy(text).into_owned(),
        _ => return None,
    };
    let trimmed = decoded.trim_end_matches('\0').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

// ---------------------------------------------------------------------------
// FLAC
// ---------------------------------------------------------------------------

fn sniff_flac(head: &[u8]) -> MediaMetadata {
    let mut meta = base("flac");
    meta.audio_codec = Some("flac".into());

    // STREAMINFO must be the first metadata block.
    if head.get(4).map(|b| b & 0x7F) != Some(0) {
        return meta;
    }
    let Some(d) = head.get(8..26) else {
        return meta;
    };
    let sample_rate = (d[10] as u32) << 12 | (d[11] as u32) << 4 | (d[12] as u32) >> 4;
    let channels = ((d[12] >> 1) & 0x7) + 1;
    let bits = (((d[12] & 0x1) << 4) | (d[13] >> 4)) + 1;
    let total_samples = ((d[13] & 0x0F) as u64) << 32
        | u32::from_be_bytes([d[14], d[15], d[16], d[17]]) as u64;

    if sample_rate > 0 {
        if total_samples > 0 {
            meta.duration_secs = Some(total_samples as f64 / sample_rate as f64);
        }
        meta.tags.insert("sample_rate".into(), sample_rate.to_string());
    }
    meta.tags.insert("channels".into(), channels.to_string());
    meta.tags.insert("bits_per_sample".into(), bits.to_string());
    meta
}

// ---------------------------------------------------------------------------
// WAV
// ---------------------------------------------------------------------------

fn sniff_wav(head: &[u8], file_len: u64) -> ExtractionOutcome {
    let riff_len = le_u32(head, 4).unwrap_or(0) as u64 + 8;
    if riff_len > file_len {
        return ExtractionOutcome::Deferred("RIFF data extends past end of file".into());
    }

    let mut meta = base("wav");
    let mut byte_rate = 0u32;
    let mut data_len = None;
    let mut pos = 12;

    while let (Some(id), Some(size)) = (head.get(pos..pos + 4), le_u32(head, pos + 4)) {
        let body = pos + 8;
        match id {
            b"fmt " => {
                let format = le_u16(head, body).unwrap_or(0);
                let channels = le_u16(head, body + 2).unwrap_or(0);
                let sample_rate = le_u32(head, body + 4).unwrap_or(0);
                byte_rate = le_u32(head, body + 8).unwrap_or(0);
                meta.audio_codec = Some(if format == 1 { "pcm" } else { "wav" }.into());
                meta.bit_rate = Some(byte_rate as u64 * 8);
                meta.tags.insert("channels".into(), channels.to_string());
                meta.tags.insert("sample_rate".into(), sample_rate.to_string());
            }
            b"data" => {
                data_len = Some(size as u64);
                break;
            }
            _ => {}
        }
        // Chunks are word-aligned.
        pos = body + size as usize + (size as usize & 1);
    }

    if let (Some(len), true) = (data_len, byte_rate > 0) {
        meta.duration_secs = Some(len as f64 / byte_rate as f64);
    }
    ExtractionOutcome::Extracted(meta)
}

// ---------------------------------------------------------------------------
// Ogg
// ---------------------------------------------------------------------------

fn sniff_ogg(head: &[u8]) -> MediaMetadata {
    let mut meta = base("ogg");
    let window = &head[..head.len().min(512)];
    if find(window, b"OpusHead").is_some() {
        meta.audio_codec = Some("opus".into());
    } else if find(window, b"\x01vorbis").is_some() {
        meta.audio_codec = Some("vorbis".into());
    } else if find(window, b"\x7FFLAC").is_some() {
        meta.audio_codec = Some("flac".into());
    } else if find(window, b"\x80theora").is_some() {
        meta.video_codec = Some("theora".into());
        meta.mime_type = "video/ogg".into();
    }
    meta
}

// ---------------------------------------------------------------------------
// MP4 / MOV
// ---------------------------------------------------------------------------

fn sniff_mp4(head: &[u8]) -> MediaMetadata {
    let container = match head.get(8..12) {
        Some(b"M4A ") | Some(b"M4B ") => "m4a",
        Some(b"qt  ") => "mov",
        _ => "mp4",
    };
    let mut meta = base(container);

    // The movie header lives in `moov`, which is often at the front.
    if let Some(at) = find(head, b"mvhd") {
        let b = at + 4;
        let parsed = match head.get(b) {
            Some(0) => be_u32(head, b + 12).zip(be_u32(head, b + 16).map(u64::from)),
            Some(1) => be_u32(head, b + 20).zip(be_u64(head, b + 24)),
            _ => None,
        };
        if let Some((timescale, duration)) = parsed {
            if timescale > 0 {
                meta.duration_secs = Some(duration as f64 / timescale as f64);
            }
        }
    }
    meta
}
