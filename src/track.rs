//! The uniform track model produced by the three manifest parsers.
//!
//! A `Track` is one selectable elementary stream; it owns a `Playlist`, which
//! owns ordered `MediaPart`s, which own `MediaSegment`s. Part boundaries
//! correspond to HLS discontinuities or DASH periods; concatenating segments
//! in part/segment order reproduces network playback order.
//!
//! The enums keep the upstream string forms (`AES-128`, `AUDIO`, `LIVE_TS`,
//! ...) in their serde representation so that `meta.json` files stay
//! interchangeable with other tooling in this space.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// What kind of elementary stream a track carries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MediaKind {
    #[serde(rename = "VIDEO")]
    #[default]
    Video,
    #[serde(rename = "AUDIO")]
    Audio,
    #[serde(rename = "SUBTITLES")]
    Subtitles,
    #[serde(rename = "CLOSED_CAPTIONS")]
    ClosedCaptions,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MediaKind::Video => "VIDEO",
            MediaKind::Audio => "AUDIO",
            MediaKind::Subtitles => "SUBTITLES",
            MediaKind::ClosedCaptions => "CLOSED_CAPTIONS",
            MediaKind::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Which parser family produced a track.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractorType {
    #[serde(rename = "HLS")]
    Hls,
    #[serde(rename = "DASH")]
    Dash,
    #[serde(rename = "MSS")]
    Mss,
    #[serde(rename = "LIVE_TS")]
    LiveTs,
    #[serde(rename = "UNKNOWN")]
    #[default]
    Unknown,
}

/// Segment encryption schemes the pipeline recognises. In-process decryption
/// exists for `Aes128`, `Aes128Ecb`, `AesCtr`, `AesCbc` and `ChaCha20`; the
/// CENC family is dispatched to an external tool; the rest fail the segment
/// with `DecryptUnsupported`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptMethod {
    #[serde(rename = "NONE")]
    #[default]
    None,
    #[serde(rename = "AES-128")]
    Aes128,
    #[serde(rename = "AES-128-ECB")]
    Aes128Ecb,
    #[serde(rename = "AES-CTR")]
    AesCtr,
    #[serde(rename = "AES-CBC")]
    AesCbc,
    #[serde(rename = "SAMPLE-AES")]
    SampleAes,
    #[serde(rename = "SAMPLE-AES-CTR")]
    SampleAesCtr,
    #[serde(rename = "CHACHA20")]
    ChaCha20,
    #[serde(rename = "CENC")]
    Cenc,
    #[serde(rename = "CBCS")]
    Cbcs,
    #[serde(rename = "CLEAR-KEY")]
    ClearKey,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl EncryptMethod {
    /// Parse the upstream string form, e.g. from `EXT-X-KEY:METHOD=`.
    pub fn from_name(name: &str) -> EncryptMethod {
        match name.trim().to_uppercase().as_str() {
            "NONE" => EncryptMethod::None,
            "AES-128" => EncryptMethod::Aes128,
            "AES-128-ECB" => EncryptMethod::Aes128Ecb,
            "AES-CTR" => EncryptMethod::AesCtr,
            "AES-CBC" => EncryptMethod::AesCbc,
            "SAMPLE-AES" => EncryptMethod::SampleAes,
            "SAMPLE-AES-CTR" => EncryptMethod::SampleAesCtr,
            "CHACHA20" => EncryptMethod::ChaCha20,
            "CENC" => EncryptMethod::Cenc,
            "CBCS" => EncryptMethod::Cbcs,
            "CLEAR-KEY" => EncryptMethod::ClearKey,
            _ => EncryptMethod::Unknown,
        }
    }

    /// CENC-family methods are decrypted post-download by the external tool.
    pub fn is_cenc(&self) -> bool {
        matches!(self, EncryptMethod::Cenc | EncryptMethod::Cbcs)
    }
}

impl fmt::Display for EncryptMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EncryptMethod::None => "NONE",
            EncryptMethod::Aes128 => "AES-128",
            EncryptMethod::Aes128Ecb => "AES-128-ECB",
            EncryptMethod::AesCtr => "AES-CTR",
            EncryptMethod::AesCbc => "AES-CBC",
            EncryptMethod::SampleAes => "SAMPLE-AES",
            EncryptMethod::SampleAesCtr => "SAMPLE-AES-CTR",
            EncryptMethod::ChaCha20 => "CHACHA20",
            EncryptMethod::Cenc => "CENC",
            EncryptMethod::Cbcs => "CBCS",
            EncryptMethod::ClearKey => "CLEAR-KEY",
            EncryptMethod::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// The DASH Role of an adaptation set, as far as selection cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleKind {
    #[serde(rename = "MAIN")]
    Main,
    #[serde(rename = "ALTERNATE")]
    Alternate,
    #[serde(rename = "SUPPLEMENTARY")]
    Supplementary,
    #[serde(rename = "COMMENTARY")]
    Commentary,
    #[serde(rename = "DUB")]
    Dub,
    #[serde(rename = "SUBTITLE")]
    Subtitle,
    #[serde(rename = "CAPTION")]
    Caption,
    #[serde(rename = "DESCRIPTION")]
    Description,
    #[serde(rename = "SIGN")]
    Sign,
    #[serde(rename = "METADATA")]
    Metadata,
}

impl RoleKind {
    pub fn from_value(v: &str) -> Option<RoleKind> {
        match v.to_lowercase().as_str() {
            "main" => Some(RoleKind::Main),
            "alternate" => Some(RoleKind::Alternate),
            "supplementary" => Some(RoleKind::Supplementary),
            "commentary" => Some(RoleKind::Commentary),
            "dub" => Some(RoleKind::Dub),
            "subtitle" => Some(RoleKind::Subtitle),
            "caption" => Some(RoleKind::Caption),
            "description" => Some(RoleKind::Description),
            "sign" => Some(RoleKind::Sign),
            "metadata" => Some(RoleKind::Metadata),
            _ => None,
        }
    }
}

/// Encryption parameters attached to a segment.
#[skip_serializing_none]
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptInfo {
    pub method: EncryptMethod,
    pub key: Option<Vec<u8>>,
    pub iv: Option<Vec<u8>>,
    pub uri: Option<String>,
    pub key_format: Option<String>,
}

impl EncryptInfo {
    pub fn is_encrypted(&self) -> bool {
        self.method != EncryptMethod::None
    }
}

/// One fetchable unit of a track: a URL, possibly restricted to a byte range.
#[skip_serializing_none]
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSegment {
    /// Monotonically assigned per track. `-1` is reserved for the init
    /// segment.
    pub index: i64,
    /// Seconds.
    pub duration: f64,
    pub date_time: Option<DateTime<Utc>>,
    pub start_range: Option<i64>,
    pub expect_length: Option<i64>,
    pub url: String,
    /// The `$Number$`/`$Time$` value substituted into a DASH template,
    /// retained for naming the temp file.
    pub name_from_var: Option<String>,
    pub is_encrypted: bool,
    pub encrypt_info: EncryptInfo,
}

impl MediaSegment {
    pub fn new(index: i64, duration: f64, url: String) -> MediaSegment {
        MediaSegment { index, duration, url, ..Default::default() }
    }

    pub fn set_encrypt_info(&mut self, info: EncryptInfo) {
        self.is_encrypted = info.is_encrypted();
        self.encrypt_info = info;
    }

    /// Inclusive end of the byte range, when this is a range segment.
    pub fn stop_range(&self) -> Option<i64> {
        match (self.start_range, self.expect_length) {
            (Some(start), Some(len)) => Some(start + len - 1),
            _ => None,
        }
    }
}

/// A contiguous run of segments between discontinuities or periods.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MediaPart {
    pub segments: Vec<MediaSegment>,
}

impl MediaPart {
    pub fn duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }
}

/// The segmentation of one track.
#[skip_serializing_none]
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Playlist {
    pub url: String,
    pub is_live: bool,
    pub refresh_interval_ms: f64,
    pub target_duration: Option<f64>,
    /// Header-only segment with `index == -1`, needed to initialise fMP4
    /// decoding.
    pub media_init: Option<MediaSegment>,
    pub media_parts: Vec<MediaPart>,
    /// Advertised size estimate, 0 when unknown.
    pub total_bytes: i64,
}

impl Playlist {
    pub fn new() -> Playlist {
        Playlist { refresh_interval_ms: 15_000.0, ..Default::default() }
    }

    pub fn total_duration(&self) -> f64 {
        self.media_parts.iter().map(|p| p.duration()).sum()
    }

    pub fn segment_count(&self) -> usize {
        self.media_parts.iter().map(|p| p.segments.len()).sum()
    }

    pub fn all_segments(&self) -> impl Iterator<Item = &MediaSegment> {
        self.media_parts.iter().flat_map(|p| p.segments.iter())
    }

    pub fn all_segments_mut(&mut self) -> impl Iterator<Item = &mut MediaSegment> {
        self.media_parts.iter_mut().flat_map(|p| p.segments.iter_mut())
    }

    pub fn has_encrypted_segments(&self) -> bool {
        self.all_segments().any(|s| s.is_encrypted)
    }

    /// Distinct encryption methods present, in first-seen order.
    pub fn encrypt_methods(&self) -> Vec<EncryptMethod> {
        let mut methods = Vec::new();
        for seg in self.all_segments() {
            if seg.is_encrypted && !methods.contains(&seg.encrypt_info.method) {
                methods.push(seg.encrypt_info.method);
            }
        }
        methods
    }

    pub fn first_encrypted_segment(&self) -> Option<&MediaSegment> {
        self.all_segments().find(|s| s.is_encrypted)
    }
}

/// Codec description carried by an MSS `QualityLevel`, needed to synthesise
/// the init box client-side.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MssData {
    pub four_cc: String,
    pub codec_private_data: String,
    #[serde(rename = "type")]
    pub stream_type: String,
    pub timescale: u32,
    pub sampling_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub nal_unit_length_field: u8,
    pub duration: u64,
    pub is_protection: bool,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub protection_system_id: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub protection_data: String,
}

/// One selectable elementary stream exposed by a manifest.
#[skip_serializing_none]
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    #[serde(rename = "mediaType")]
    pub kind: MediaKind,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub group_id: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub language: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub name: String,
    pub bandwidth: Option<u64>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub codecs: String,
    /// `"WxH"`.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub resolution: String,
    pub frame_rate: Option<f64>,
    /// Leading integer is the channel count; may carry a layout suffix.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub channels: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub video_range: String,
    pub role: Option<RoleKind>,
    /// `ts`, `m4s`, `mp4`, `vtt`, `ttml`, ...
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub extension: String,
    /// The manifest this track came from.
    #[serde(rename = "originalUrl")]
    pub manifest_url: String,
    /// The track's own playlist URL (HLS) or resolved base (DASH/MSS).
    #[serde(rename = "url")]
    pub media_url: String,
    /// Group-id pointers to associated tracks.
    pub audio_link: Option<String>,
    pub video_link: Option<String>,
    pub subtitle_link: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub period_id: String,
    #[serde(skip)]
    pub extractor: ExtractorType,
    pub mss_data: Option<MssData>,
    /// Subtitle delivered as fMP4-wrapped TTML, to be converted after merge.
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub need_ttml_conversion: bool,
    /// Seconds of leading content dropped (ad filtering); subtitle timelines
    /// are shifted left by this amount.
    pub skipped_duration: Option<f64>,
    pub playlist: Option<Playlist>,
}

impl Track {
    pub fn segment_count(&self) -> usize {
        self.playlist.as_ref().map(|p| p.segment_count()).unwrap_or(0)
    }

    /// Compact one-line description used in track listings and logs, e.g.
    /// `[Vid] 1920x1080 | 4972 Kbps | avc1.640028 | 25.00`.
    pub fn short_description(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        let prefix = match self.kind {
            MediaKind::Audio => {
                push_nonempty(&mut parts, &self.group_id);
                if let Some(bw) = self.bandwidth {
                    parts.push(format!("{} Kbps", bw / 1000));
                }
                push_nonempty(&mut parts, &self.name);
                push_nonempty(&mut parts, &self.codecs);
                push_nonempty(&mut parts, &self.language);
                if !self.channels.is_empty() {
                    parts.push(format!("{}CH", self.channels));
                }
                "[Aud]"
            }
            MediaKind::Subtitles | MediaKind::ClosedCaptions => {
                push_nonempty(&mut parts, &self.group_id);
                push_nonempty(&mut parts, &self.language);
                push_nonempty(&mut parts, &self.name);
                push_nonempty(&mut parts, &self.codecs);
                "[Sub]"
            }
            _ => {
                push_nonempty(&mut parts, &self.resolution);
                if let Some(bw) = self.bandwidth {
                    parts.push(format!("{} Kbps", bw / 1000));
                }
                push_nonempty(&mut parts, &self.group_id);
                if let Some(fr) = self.frame_rate {
                    parts.push(format!("{fr:.2}"));
                }
                push_nonempty(&mut parts, &self.codecs);
                push_nonempty(&mut parts, &self.video_range);
                "[Vid]"
            }
        };
        let mut out = format!("{prefix} {}", parts.join(" | "));
        out.truncate(out.trim_end().len());
        out
    }

    /// Long description: short form plus segment count, encryption methods
    /// and approximate duration.
    pub fn description(&self) -> String {
        let mut out = self.short_description();
        if let Some(playlist) = &self.playlist {
            let n = playlist.segment_count();
            if n > 0 {
                out.push_str(&format!(" | {n} Segment{}", if n > 1 { "s" } else { "" }));
            }
            if playlist.has_encrypted_segments() {
                let methods: Vec<String> =
                    playlist.encrypt_methods().iter().map(|m| m.to_string()).collect();
                out = format!("[*{}] {out}", methods.join(","));
            }
            let total = playlist.total_duration();
            if total > 0.0 {
                out.push_str(&format!(" | ~{}", crate::util::format_duration(total as u64)));
            }
        }
        out
    }
}

fn push_nonempty(parts: &mut Vec<String>, value: &str) {
    if !value.is_empty() {
        parts.push(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_method_names_roundtrip() {
        for m in [
            EncryptMethod::None,
            EncryptMethod::Aes128,
            EncryptMethod::Aes128Ecb,
            EncryptMethod::AesCtr,
            EncryptMethod::AesCbc,
            EncryptMethod::SampleAes,
            EncryptMethod::SampleAesCtr,
            EncryptMethod::ChaCha20,
            EncryptMethod::Cenc,
            EncryptMethod::Cbcs,
            EncryptMethod::ClearKey,
        ] {
            assert_eq!(EncryptMethod::from_name(&m.to_string()), m);
        }
        assert_eq!(EncryptMethod::from_name("FAIRPLAY"), EncryptMethod::Unknown);
    }

    #[test]
    fn test_stop_range() {
        let mut seg = MediaSegment::new(0, 4.0, "https://example.net/0.ts".into());
        assert_eq!(seg.stop_range(), None);
        seg.start_range = Some(100);
        seg.expect_length = Some(50);
        assert_eq!(seg.stop_range(), Some(149));
    }

    #[test]
    fn test_playlist_accounting() {
        let mut playlist = Playlist::new();
        let mut part = MediaPart::default();
        for i in 0..3 {
            let mut seg = MediaSegment::new(i, 4.0, format!("https://example.net/{i}.ts"));
            if i == 1 {
                seg.set_encrypt_info(EncryptInfo {
                    method: EncryptMethod::Aes128,
                    ..Default::default()
                });
            }
            part.segments.push(seg);
        }
        playlist.media_parts.push(part);
        assert_eq!(playlist.segment_count(), 3);
        assert!((playlist.total_duration() - 12.0).abs() < 1e-9);
        assert!(playlist.has_encrypted_segments());
        assert_eq!(playlist.encrypt_methods(), vec![EncryptMethod::Aes128]);
        assert_eq!(playlist.first_encrypted_segment().unwrap().index, 1);
    }

    #[test]
    fn test_track_serde_string_forms() {
        let mut track = Track {
            kind: MediaKind::Audio,
            group_id: "aud".into(),
            language: "en".into(),
            ..Default::default()
        };
        track.playlist = Some(Playlist::new());
        let json = serde_json::to_string(&track).unwrap();
        assert!(json.contains("\"mediaType\":\"AUDIO\""));
        let back: Track = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, MediaKind::Audio);
        assert_eq!(back.group_id, "aud");
    }
}
