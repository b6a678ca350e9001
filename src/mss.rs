//! Microsoft Smooth Streaming (`ism/Manifest`) parsing.
//!
//! MSS delivers fMP4 fragments without a server-side init segment; the
//! client synthesises a `moov` box from the `CodecPrivateData` carried in
//! the manifest (see `mss_moov`). Each `QualityLevel` of each `StreamIndex`
//! becomes one track; fragment URLs are produced by substituting
//! `{bitrate}` and `{start time}` into the URL template while walking the
//! `<c>` timeline elements.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::track::{
    EncryptMethod, ExtractorType, MediaKind, MediaPart, MediaSegment, MssData, Playlist, Track,
};
use crate::AbrError;

const TAG_BITRATE: &str = "{Bitrate}";
const TAG_START_TIME: &str = "{start time}";

/// FourCC codes the moov synthesiser understands. A QualityLevel with any
/// other FourCC is skipped with a warning.
pub const SUPPORTED_FOUR_CC: &[&str] = &[
    "HVC1", "HEV1", "AACL", "AACH", "EC-3", "H264", "AVC1", "DAVC", "TTML", "DVHE", "DVH1",
];

pub fn can_handle_four_cc(four_cc: &str) -> bool {
    SUPPORTED_FOUR_CC.contains(&four_cc)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SmoothStreamingMedia {
    #[serde(rename = "@TimeScale")]
    pub time_scale: Option<u32>,
    #[serde(rename = "@Duration")]
    pub duration: Option<u64>,
    #[serde(rename = "@IsLive")]
    pub is_live: Option<String>,
    #[serde(rename = "Protection")]
    pub protection: Option<Protection>,
    #[serde(rename = "StreamIndex")]
    pub stream_indices: Vec<StreamIndex>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Protection {
    #[serde(rename = "ProtectionHeader")]
    pub protection_header: Option<ProtectionHeader>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProtectionHeader {
    #[serde(rename = "@SystemID")]
    pub system_id: Option<String>,
    #[serde(rename = "$text")]
    pub data: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StreamIndex {
    #[serde(rename = "@Type")]
    pub stream_type: Option<String>,
    #[serde(rename = "@Name")]
    pub name: Option<String>,
    #[serde(rename = "@Subtype")]
    pub subtype: Option<String>,
    #[serde(rename = "@Url")]
    pub url: Option<String>,
    #[serde(rename = "@Language")]
    pub language: Option<String>,
    #[serde(rename = "c")]
    pub chunks: Vec<ChunkElement>,
    #[serde(rename = "QualityLevel")]
    pub quality_levels: Vec<QualityLevel>,
}

/// One `<c>` element: start time `t`, duration `d`, repeat count `r`
/// (1-based; `r="3"` means three fragments in total).
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ChunkElement {
    #[serde(rename = "@t")]
    pub t: Option<i64>,
    #[serde(rename = "@d")]
    pub d: Option<i64>,
    #[serde(rename = "@r")]
    pub r: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct QualityLevel {
    #[serde(rename = "@Index")]
    pub index: Option<String>,
    #[serde(rename = "@Bitrate")]
    pub bitrate: Option<u64>,
    #[serde(rename = "@FourCC")]
    pub four_cc: Option<String>,
    #[serde(rename = "@MaxWidth")]
    pub max_width: Option<u32>,
    #[serde(rename = "@MaxHeight")]
    pub max_height: Option<u32>,
    #[serde(rename = "@CodecPrivateData")]
    pub codec_private_data: Option<String>,
    #[serde(rename = "@SamplingRate")]
    pub sampling_rate: Option<u32>,
    #[serde(rename = "@Channels")]
    pub channels: Option<u16>,
    #[serde(rename = "@BitsPerSample")]
    pub bits_per_sample: Option<u16>,
    #[serde(rename = "@NALUnitLengthField")]
    pub nal_unit_length_field: Option<u8>,
    #[serde(rename = "@Url")]
    pub url: Option<String>,
}

/// Parse a SmoothStreamingMedia manifest fetched from `base_url`.
pub fn parse_manifest(content: &str, base_url: &str) -> Result<Vec<Track>, AbrError> {
    let manifest: SmoothStreamingMedia = quick_xml::de::from_str(content)
        .map_err(|e| AbrError::Parsing(format!("MSS manifest XML: {e}")))?;

    let timescale = manifest.time_scale.unwrap_or(10_000_000);
    let total_duration = manifest.duration.unwrap_or(0);
    let is_live = manifest
        .is_live
        .as_deref()
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let (is_protection, protection_system_id, protection_data) = match manifest
        .protection
        .as_ref()
        .and_then(|p| p.protection_header.as_ref())
    {
        Some(header) => (
            true,
            header
                .system_id
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "9A04F079-9840-4286-AB92-E65BE0885F95".to_string()),
            header.data.clone().unwrap_or_default().trim().to_string(),
        ),
        None => (false, String::new(), String::new()),
    };

    let mut tracks = Vec::new();
    for stream_index in &manifest.stream_indices {
        let stream_type = stream_index.stream_type.clone().unwrap_or_default();
        for quality in &stream_index.quality_levels {
            let four_cc = quality.four_cc.clone().unwrap_or_default();
            if !can_handle_four_cc(&four_cc) {
                warn!("unsupported FourCC {four_cc:?}, skipping QualityLevel");
                continue;
            }
            let url_pattern = quality
                .url
                .clone()
                .or_else(|| stream_index.url.clone())
                .unwrap_or_default()
                .replace("{bitrate}", TAG_BITRATE)
                .replace("{start_time}", TAG_START_TIME)
                .replace("{start time}", TAG_START_TIME);

            let kind = match stream_type.to_lowercase().as_str() {
                "audio" => MediaKind::Audio,
                "text" => MediaKind::Subtitles,
                _ => MediaKind::Video,
            };

            let mut track = Track {
                kind,
                extractor: ExtractorType::Mss,
                extension: "m4s".into(),
                manifest_url: base_url.to_string(),
                media_url: base_url.to_string(),
                bandwidth: quality.bitrate,
                group_id: stream_index
                    .name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .or_else(|| quality.index.clone())
                    .unwrap_or_default(),
                language: stream_index
                    .language
                    .clone()
                    .filter(|l| l.len() == 3)
                    .unwrap_or_default(),
                channels: quality.channels.map(|c| c.to_string()).unwrap_or_default(),
                codecs: parse_codecs(&four_cc, quality.codec_private_data.as_deref().unwrap_or("")),
                ..Default::default()
            };
            if let (Some(w), Some(h)) = (quality.max_width, quality.max_height) {
                if w > 0 && h > 0 {
                    track.resolution = format!("{w}x{h}");
                }
            }

            track.mss_data = Some(MssData {
                four_cc: four_cc.clone(),
                codec_private_data: quality.codec_private_data.clone().unwrap_or_default(),
                stream_type: stream_type.clone(),
                timescale,
                duration: total_duration,
                sampling_rate: quality.sampling_rate.unwrap_or(44_100),
                channels: quality.channels.unwrap_or(2),
                bits_per_sample: quality.bits_per_sample.unwrap_or(16),
                nal_unit_length_field: quality.nal_unit_length_field.unwrap_or(4),
                is_protection,
                protection_system_id: protection_system_id.clone(),
                protection_data: protection_data.clone(),
            });

            let mut playlist = Playlist::new();
            playlist.url = base_url.to_string();
            playlist.is_live = is_live;
            // the init segment has no URL: it is synthesised from the first
            // fragment at download time
            playlist.media_init = Some(MediaSegment::new(-1, 0.0, String::new()));

            let mut part = MediaPart::default();
            let mut current_time: i64 = 0;
            let mut seg_index: i64 = 0;
            let bitrate = quality.bitrate.unwrap_or(0);
            for chunk in &stream_index.chunks {
                if let Some(t) = chunk.t {
                    current_time = t;
                }
                let duration = chunk.d.unwrap_or(0);
                let mut remaining = match chunk.r {
                    // r is 1-based in MSS: total fragment count for the entry
                    Some(r) if r > 0 => r,
                    // negative: repeat until the declared stream duration
                    Some(r) if r < 0 => {
                        if duration > 0 && total_duration > 0 {
                            let left = total_duration as i64 - current_time;
                            (left + duration - 1) / duration
                        } else {
                            1
                        }
                    }
                    _ => 1,
                };
                if remaining < 1 {
                    remaining = 1;
                }
                for _ in 0..remaining {
                    part.segments.push(make_segment(
                        &url_pattern,
                        base_url,
                        current_time,
                        duration,
                        timescale,
                        bitrate,
                        seg_index,
                    ));
                    seg_index += 1;
                    current_time += duration;
                }
            }

            if is_protection && stream_type != "text" {
                if let Some(init) = playlist.media_init.as_mut() {
                    init.encrypt_info.method = EncryptMethod::Cenc;
                    init.is_encrypted = true;
                }
                for seg in part.segments.iter_mut() {
                    seg.encrypt_info.method = EncryptMethod::Cenc;
                    seg.is_encrypted = true;
                }
            }

            playlist.media_parts.push(part);
            track.playlist = Some(playlist);
            tracks.push(track);
        }
    }

    set_default_tracks(&mut tracks);
    Ok(tracks)
}

fn make_segment(
    url_pattern: &str,
    base_url: &str,
    start_time: i64,
    duration: i64,
    timescale: u32,
    bitrate: u64,
    index: i64,
) -> MediaSegment {
    let path = url_pattern
        .replace(TAG_BITRATE, &bitrate.to_string())
        .replace(TAG_START_TIME, &start_time.to_string());
    let url = if path.starts_with("http://") || path.starts_with("https://") {
        path
    } else {
        Url::parse(base_url)
            .and_then(|b| b.join(&path))
            .map(|u| u.to_string())
            .unwrap_or(path)
    };
    let mut seg = MediaSegment::new(index, duration as f64 / timescale as f64, url);
    if url_pattern.contains(TAG_START_TIME) {
        seg.name_from_var = Some(start_time.to_string());
    }
    seg
}

/// RFC 6381 codec string from the FourCC and CodecPrivateData.
fn parse_codecs(four_cc: &str, private_data: &str) -> String {
    if four_cc == "TTML" {
        return "stpp".to_string();
    }
    if private_data.is_empty() {
        return four_cc.to_lowercase();
    }
    match four_cc.to_uppercase().as_str() {
        "H264" | "X264" | "DAVC" | "AVC1" => parse_avc_codecs(private_data),
        "AAC" | "AACL" | "AACH" | "AACP" => parse_aac_codecs(four_cc, private_data),
        _ => four_cc.to_lowercase(),
    }
}

fn parse_avc_codecs(private_data: &str) -> String {
    static RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"00000001\d7([0-9a-fA-F]{6})").unwrap());
    match RE.captures(private_data) {
        Some(caps) => format!("avc1.{}", &caps[1]),
        None => "avc1.4D401E".to_string(),
    }
}

fn parse_aac_codecs(four_cc: &str, private_data: &str) -> String {
    let mut profile = 2u8;
    if four_cc == "AACH" {
        profile = 5; // High Efficiency AAC
    } else if private_data.len() >= 2 {
        if let Ok(bytes) = hex::decode(&private_data[..2]) {
            if !bytes.is_empty() {
                profile = (bytes[0] & 0xF8) >> 3;
            }
        }
    }
    format!("mp4a.40.{profile}")
}

/// Video tracks point at the first audio and subtitle groups by default.
fn set_default_tracks(tracks: &mut [Track]) {
    let first_group = |tracks: &[Track], kind: MediaKind| -> Option<String> {
        tracks.iter().find(|t| t.kind == kind).map(|t| t.group_id.clone())
    };
    let audio = first_group(tracks, MediaKind::Audio);
    let subs = first_group(tracks, MediaKind::Subtitles);
    for track in tracks.iter_mut() {
        if track.kind == MediaKind::Video {
            track.audio_link = audio.clone();
            track.subtitle_link = subs.clone();
        }
    }
}

/// Cheap sniff used by the manifest dispatcher.
pub fn looks_like_mss(content: &str, url: &str) -> bool {
    let content = content.to_lowercase();
    let url = url.to_lowercase();
    content.contains("<smoothstreamingmedia") || url.contains("/manifest") || url.contains(".ism/")
}
