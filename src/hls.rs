//! HLS playlist parsing into the uniform track model.
//!
//! Master playlists are tokenised with the `m3u8-rs` crate. Media playlists
//! are walked line by line, because most of what this pipeline has to honour
//! lives in the *sequencing* of tags: the `EXT-X-KEY` state machine applies
//! to every following `EXTINF`, a missing IV defaults to the big-endian
//! segment index, discontinuities close the current part, and two flavours of
//! ad signalling (Uplynk `#UPLYNK-SEGMENT` markers and youku-style ad URLs)
//! drop segments and splice parts back together.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::DateTime;
use m3u8_rs::{AlternativeMediaType, Playlist as M3u8Playlist};
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};
use url::Url;

use crate::net::HttpFetcher;
use crate::track::{
    EncryptInfo, EncryptMethod, ExtractorType, MediaKind, MediaPart, MediaSegment, Playlist, Track,
};
use crate::util::parse_hex;
use crate::AbrError;

const TAG_EXTM3U: &str = "#EXTM3U";
const TAG_EXTINF: &str = "#EXTINF";
const TAG_TARGET_DURATION: &str = "#EXT-X-TARGETDURATION";
const TAG_MEDIA_SEQUENCE: &str = "#EXT-X-MEDIA-SEQUENCE";
const TAG_DISCONTINUITY: &str = "#EXT-X-DISCONTINUITY";
const TAG_ENDLIST: &str = "#EXT-X-ENDLIST";
const TAG_KEY: &str = "#EXT-X-KEY";
const TAG_MAP: &str = "#EXT-X-MAP";
const TAG_STREAM_INF: &str = "#EXT-X-STREAM-INF";
const TAG_MEDIA: &str = "#EXT-X-MEDIA";
const TAG_BYTERANGE: &str = "#EXT-X-BYTERANGE";
const TAG_PROGRAM_DATE_TIME: &str = "#EXT-X-PROGRAM-DATE-TIME";

static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Z0-9-]+)=("[^"]*"|[^",]*)"#).unwrap());

/// Overrides from `--custom-hls-method/key/iv`, applied to every key tag.
#[derive(Debug, Default, Clone)]
pub struct HlsKeyOverride {
    pub method: Option<EncryptMethod>,
    pub key: Option<Vec<u8>>,
    pub iv: Option<Vec<u8>>,
}

/// Parse an M3U8 document (master or media) fetched from `base_url`.
pub async fn parse_m3u8(
    content: &str,
    base_url: &str,
    fetcher: &HttpFetcher,
    headers: &HashMap<String, String>,
    key_override: &HlsKeyOverride,
) -> Result<Vec<Track>, AbrError> {
    let first_line = content.lines().next().unwrap_or("");
    if !first_line.starts_with(TAG_EXTM3U) {
        return Err(AbrError::Parsing("not a valid M3U8 document".into()));
    }
    if is_master_playlist(content) {
        parse_master_playlist(content, base_url)
    } else {
        let track = parse_media_playlist(content, base_url, fetcher, headers, key_override).await?;
        Ok(vec![track])
    }
}

/// A master playlist contains `#EXT-X-STREAM-INF` or `#EXT-X-MEDIA:`. Note
/// the colon: `#EXT-X-MEDIA-SEQUENCE` shares the shorter prefix and appears
/// only in media playlists.
pub fn is_master_playlist(content: &str) -> bool {
    content.lines().any(|line| {
        line.starts_with(TAG_STREAM_INF) || line.starts_with(&format!("{TAG_MEDIA}:"))
    })
}

fn resolve_url(base_url: &str, reference: &str) -> String {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return reference.to_string();
    }
    match Url::parse(base_url).and_then(|b| b.join(reference)) {
        Ok(u) => u.to_string(),
        Err(_) => reference.to_string(),
    }
}

fn parse_master_playlist(content: &str, base_url: &str) -> Result<Vec<Track>, AbrError> {
    let parsed = m3u8_rs::parse_playlist_res(content.as_bytes())
        .map_err(|e| AbrError::Parsing(format!("master playlist: {e:?}")))?;
    let master = match parsed {
        M3u8Playlist::MasterPlaylist(m) => m,
        M3u8Playlist::MediaPlaylist(_) => {
            return Err(AbrError::Parsing("expected a master playlist".into()))
        }
    };
    let mut tracks = Vec::new();
    for alt in &master.alternatives {
        let kind = match alt.media_type {
            AlternativeMediaType::Audio => MediaKind::Audio,
            AlternativeMediaType::Video => MediaKind::Video,
            AlternativeMediaType::Subtitles => MediaKind::Subtitles,
            AlternativeMediaType::ClosedCaptions => MediaKind::ClosedCaptions,
            AlternativeMediaType::Other(_) => MediaKind::Unknown,
        };
        let Some(uri) = &alt.uri else {
            // closed captions are carried in-band; nothing to download
            continue;
        };
        tracks.push(Track {
            kind,
            group_id: alt.group_id.clone(),
            name: alt.name.clone(),
            language: alt.language.clone().unwrap_or_default(),
            channels: alt.channels.clone().unwrap_or_default(),
            extension: if kind == MediaKind::Subtitles { "vtt".into() } else { "ts".into() },
            media_url: resolve_url(base_url, uri),
            manifest_url: base_url.to_string(),
            extractor: ExtractorType::Hls,
            ..Default::default()
        });
    }
    for variant in &master.variants {
        if variant.is_i_frame {
            continue;
        }
        tracks.push(Track {
            kind: MediaKind::Video,
            bandwidth: Some(variant.bandwidth),
            codecs: variant.codecs.clone().unwrap_or_default(),
            resolution: variant
                .resolution
                .map(|r| format!("{}x{}", r.width, r.height))
                .unwrap_or_default(),
            frame_rate: variant.frame_rate,
            audio_link: variant.audio.clone(),
            video_link: variant.video.clone(),
            subtitle_link: variant.subtitles.clone(),
            extension: "ts".into(),
            media_url: resolve_url(base_url, &variant.uri),
            manifest_url: base_url.to_string(),
            extractor: ExtractorType::Hls,
            ..Default::default()
        });
    }
    if tracks.is_empty() {
        return Err(AbrError::Parsing("master playlist lists no streams".into()));
    }
    Ok(tracks)
}

/// Substrings that mark a playlist URL as an audio rendition when the master
/// playlist gave us no codec information. Codec-based classification from the
/// init probe takes precedence later.
const AUDIO_URL_HINTS: &[&str] = &["audio", "aac", "mp3", "audiohls", "bps_96k", "sound"];

async fn parse_media_playlist(
    content: &str,
    base_url: &str,
    fetcher: &HttpFetcher,
    headers: &HashMap<String, String>,
    key_override: &HlsKeyOverride,
) -> Result<Track, AbrError> {
    let lower_url = base_url.to_lowercase();
    let kind = if AUDIO_URL_HINTS.iter().any(|k| lower_url.contains(k)) {
        MediaKind::Audio
    } else {
        MediaKind::Video
    };

    let mut playlist = Playlist::new();
    playlist.url = base_url.to_string();
    playlist.is_live = true; // until ENDLIST proves otherwise

    let mut parts: Vec<MediaPart> = Vec::new();
    let mut part = MediaPart::default();
    let mut current_segment: Option<MediaSegment> = None;
    let mut current_key: Option<EncryptInfo> = None;
    let mut seg_index: i64 = 0;
    let mut saw_endlist = false;
    let mut has_ad = false; // youku-style ad segment seen, pending splice
    let mut in_uplynk_ad = false;
    let mut total_bytes: i64 = 0;

    for raw_line in content.replace("\r\n", "\n").split('\n') {
        let line = raw_line.trim();
        if line.starts_with("#UPLYNK-SEGMENT") {
            if line.contains(",ad") {
                in_uplynk_ad = true;
            } else if line.contains(",segment") {
                in_uplynk_ad = false;
            }
            continue;
        }
        if in_uplynk_ad && !line.starts_with(TAG_ENDLIST) {
            continue;
        }
        if let Some(value) = tag_value(line, TAG_TARGET_DURATION) {
            if let Ok(d) = value.parse::<f64>() {
                playlist.target_duration = Some(d);
            }
        } else if let Some(value) = tag_value(line, TAG_MEDIA_SEQUENCE) {
            if let Ok(seq) = value.parse::<i64>() {
                seg_index = seq;
            }
        } else if line.starts_with(TAG_KEY) {
            current_key =
                Some(parse_key_info(line, base_url, fetcher, headers, key_override).await);
        } else if line.starts_with(TAG_MAP) {
            if playlist.media_init.is_none() || has_ad {
                if let Some(init) = parse_map_info(line, base_url) {
                    let mut init = init;
                    if let Some(key) = &current_key {
                        if key.is_encrypted() {
                            init.set_encrypt_info(key.clone());
                        }
                    }
                    playlist.media_init = Some(init);
                }
            } else {
                // a second init map switches codec parameters mid-stream;
                // close out what we have rather than emit a broken file
                warn!("second EXT-X-MAP encountered, stopping the playlist here");
                if !part.segments.is_empty() {
                    parts.push(std::mem::take(&mut part));
                }
                saw_endlist = true;
                playlist.is_live = false;
                break;
            }
        } else if line.starts_with(TAG_EXTINF) {
            let mut seg = MediaSegment::new(seg_index, 0.0, String::new());
            seg_index += 1;
            if let Some(value) = tag_value(line, TAG_EXTINF) {
                if let Some(duration) = value.split(',').next() {
                    seg.duration = duration.trim().parse().unwrap_or(0.0);
                }
            }
            if let Some(key) = &current_key {
                if key.is_encrypted() {
                    let mut info = key.clone();
                    if info.iv.as_ref().map(|iv| iv.is_empty()).unwrap_or(true) {
                        info.iv = Some(crate::crypto::iv_from_segment_index(seg.index).to_vec());
                    }
                    seg.set_encrypt_info(info);
                }
            }
            current_segment = Some(seg);
        } else if let Some(value) = tag_value(line, TAG_BYTERANGE) {
            if let Some(seg) = current_segment.as_mut() {
                parse_byte_range(value, seg);
            }
        } else if let Some(value) = tag_value(line, TAG_PROGRAM_DATE_TIME) {
            if let Some(seg) = current_segment.as_mut() {
                if let Ok(t) = DateTime::parse_from_rfc3339(value) {
                    seg.date_time = Some(t.to_utc());
                }
            }
        } else if line.starts_with(TAG_DISCONTINUITY) {
            // a discontinuity right after a dropped ad run splices the part
            // closed by the run's own leading discontinuity back onto the
            // upcoming one; without such a part the normal split applies
            if has_ad {
                if let Some(prev) = parts.pop() {
                    let mut spliced = prev.segments;
                    spliced.append(&mut part.segments);
                    part.segments = spliced;
                    has_ad = false;
                    continue;
                }
            }
            if !part.segments.is_empty() {
                parts.push(std::mem::take(&mut part));
            }
        } else if line.starts_with(TAG_ENDLIST) {
            playlist.is_live = false;
            saw_endlist = true;
            if !part.segments.is_empty() {
                parts.push(std::mem::take(&mut part));
            }
        } else if !line.starts_with('#') && !line.is_empty() {
            if let Some(mut seg) = current_segment.take() {
                let segment_url = resolve_url(base_url, line);
                if is_ad_segment_url(&segment_url) {
                    debug!("dropping ad segment {segment_url}");
                    has_ad = true;
                    seg_index -= 1;
                } else {
                    seg.url = segment_url;
                    if let Some(len) = seg.expect_length {
                        total_bytes += len;
                    }
                    part.segments.push(seg);
                }
            }
        }
    }

    if !saw_endlist && !part.segments.is_empty() {
        parts.push(part);
    }
    playlist.media_parts = parts;
    if playlist.media_parts.is_empty() {
        playlist.media_parts.push(MediaPart::default());
    }
    if playlist.is_live {
        if let Some(td) = playlist.target_duration {
            if td > 0.0 {
                playlist.refresh_interval_ms = td * 2.0 * 1000.0;
            }
        }
    }
    playlist.total_bytes = total_bytes;

    let extension = if playlist.media_init.is_some() { "m4s" } else { "ts" };
    Ok(Track {
        kind,
        extension: extension.into(),
        media_url: base_url.to_string(),
        manifest_url: base_url.to_string(),
        extractor: ExtractorType::Hls,
        playlist: Some(playlist),
        ..Default::default()
    })
}

/// youku-style ad segments are recognisable from their URL shape alone.
fn is_ad_segment_url(url: &str) -> bool {
    (url.contains("ccode=") && url.contains("/ad/") && url.contains("duration="))
        || (url.contains("ccode=0902") && url.contains("duration="))
}

fn tag_value<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    line.strip_prefix(tag)?.strip_prefix(':')
}

/// `KEY=value` attribute list, honouring quoted values.
pub(crate) fn parse_attributes(attrs: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for caps in ATTR_RE.captures_iter(attrs) {
        let value = caps[2].trim().trim_matches('"').to_string();
        out.insert(caps[1].to_string(), value);
    }
    out
}

async fn parse_key_info(
    line: &str,
    base_url: &str,
    fetcher: &HttpFetcher,
    headers: &HashMap<String, String>,
    key_override: &HlsKeyOverride,
) -> EncryptInfo {
    let attrs = parse_attributes(line.strip_prefix(TAG_KEY).unwrap_or(line));
    let mut info = EncryptInfo::default();
    if let Some(method) = attrs.get("METHOD") {
        info.method = EncryptMethod::from_name(method);
    }
    if let Some(format) = attrs.get("KEYFORMAT") {
        info.key_format = Some(format.clone());
    }
    if let Some(uri) = attrs.get("URI") {
        let resolved = resolve_key_uri(base_url, uri);
        info.key = Some(fetch_key(&resolved, fetcher, headers).await);
        info.uri = Some(resolved);
    }
    if let Some(iv) = attrs.get("IV") {
        match parse_hex(iv) {
            Ok(bytes) => info.iv = Some(bytes),
            Err(_) => warn!("ignoring unparseable IV {iv:?}"),
        }
    }
    if let Some(method) = key_override.method {
        info.method = method;
    }
    if let Some(key) = &key_override.key {
        info.key = Some(key.clone());
    }
    if let Some(iv) = &key_override.iv {
        info.iv = Some(iv.clone());
    }
    info
}

fn resolve_key_uri(base_url: &str, uri: &str) -> String {
    let lower = uri.to_lowercase();
    if lower.starts_with("base64:") || lower.starts_with("data:") {
        return uri.to_string();
    }
    resolve_url(base_url, uri)
}

/// Resolve a key URI to bytes. `base64:`, `data:;base64,` and
/// `data:text/plain;base64,` are decoded inline; other non-HTTP URIs are
/// treated as file paths; HTTP(S) is fetched. A failure yields an *empty*
/// key and a warning: the playlist parse still succeeds and the segment
/// decrypt reports the problem later.
async fn fetch_key(
    uri: &str,
    fetcher: &HttpFetcher,
    headers: &HashMap<String, String>,
) -> Vec<u8> {
    let lower = uri.to_lowercase();
    for prefix in ["base64:", "data:;base64,", "data:text/plain;base64,"] {
        if lower.starts_with(prefix) {
            match BASE64.decode(&uri[prefix.len()..]) {
                Ok(bytes) => return bytes,
                Err(e) => {
                    warn!("undecodable base64 key {uri:?}: {e}");
                    return Vec::new();
                }
            }
        }
    }
    if !uri.starts_with("http://") && !uri.starts_with("https://") {
        match fs_err::read(uri) {
            Ok(bytes) => return bytes,
            Err(e) => {
                warn!("cannot read key file {uri}: {e}");
                return Vec::new();
            }
        }
    }
    match fetcher.get_bytes(uri, headers).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("cannot fetch key {uri}: {e}");
            Vec::new()
        }
    }
}

fn parse_map_info(line: &str, base_url: &str) -> Option<MediaSegment> {
    let attrs = parse_attributes(line.strip_prefix(TAG_MAP).unwrap_or(line));
    let uri = attrs.get("URI")?;
    let mut segment = MediaSegment::new(-1, 0.0, resolve_url(base_url, uri));
    if let Some(range) = attrs.get("BYTERANGE") {
        parse_byte_range(range, &mut segment);
    }
    Some(segment)
}

/// `length[@offset]`.
fn parse_byte_range(range: &str, segment: &mut MediaSegment) {
    let mut parts = range.split('@');
    if let Some(len) = parts.next().and_then(|v| v.trim().parse::<i64>().ok()) {
        segment.expect_length = Some(len);
    }
    if let Some(offset) = parts.next().and_then(|v| v.trim().parse::<i64>().ok()) {
        segment.start_range = Some(offset);
    }
}

/// Re-infer a subtitle track's extension from its segment URLs after the
/// playlist has been fetched.
pub fn refine_subtitle_extension(track: &mut Track) {
    if track.kind != MediaKind::Subtitles {
        return;
    }
    let Some(playlist) = &track.playlist else { return };
    let mut has_ttml = false;
    let mut has_vtt = false;
    for seg in playlist.all_segments() {
        if seg.url.contains(".ttml") {
            has_ttml = true;
        }
        if seg.url.contains(".vtt") || seg.url.contains(".webvtt") {
            has_vtt = true;
        }
    }
    if has_ttml {
        track.extension = "ttml".into();
    } else if has_vtt {
        track.extension = "vtt".into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(Duration::from_secs(5), None).unwrap()
    }

    #[test]
    fn test_master_discrimination() {
        assert!(is_master_playlist("#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nv.m3u8\n"));
        assert!(is_master_playlist(
            "#EXTM3U\n#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"a\",NAME=\"en\",URI=\"a.m3u8\"\n"
        ));
        // the sequence tag shares the EXT-X-MEDIA prefix and must not match
        assert!(!is_master_playlist("#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:5\n#EXTINF:4,\ns.ts\n"));
    }

    #[test]
    fn test_attribute_parsing() {
        let attrs = parse_attributes(
            r#"BANDWIDTH=2962190,CODECS="avc1.64001f,mp4a.40.2",RESOLUTION=1280x720,AUDIO="aud""#,
        );
        assert_eq!(attrs["BANDWIDTH"], "2962190");
        assert_eq!(attrs["CODECS"], "avc1.64001f,mp4a.40.2");
        assert_eq!(attrs["RESOLUTION"], "1280x720");
        assert_eq!(attrs["AUDIO"], "aud");
    }

    #[tokio::test]
    async fn test_master_playlist_tracks() {
        let manifest = "#EXTM3U\n\
            #EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"English\",LANGUAGE=\"en\",CHANNELS=\"2\",URI=\"audio/en.m3u8\"\n\
            #EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",NAME=\"Deutsch\",LANGUAGE=\"de\",URI=\"subs/de.m3u8\"\n\
            #EXT-X-STREAM-INF:BANDWIDTH=3000000,CODECS=\"avc1.640028,mp4a.40.2\",RESOLUTION=1920x1080,FRAME-RATE=25.000,AUDIO=\"aud\",SUBTITLES=\"subs\"\n\
            video/1080p.m3u8\n";
        let tracks = parse_m3u8(
            manifest,
            "https://example.net/master.m3u8",
            &fetcher(),
            &HashMap::new(),
            &HlsKeyOverride::default(),
        )
        .await
        .unwrap();
        assert_eq!(tracks.len(), 3);
        let video = tracks.iter().find(|t| t.kind == MediaKind::Video).unwrap();
        assert_eq!(video.resolution, "1920x1080");
        assert_eq!(video.bandwidth, Some(3_000_000));
        assert_eq!(video.audio_link.as_deref(), Some("aud"));
        assert_eq!(video.media_url, "https://example.net/video/1080p.m3u8");
        let audio = tracks.iter().find(|t| t.kind == MediaKind::Audio).unwrap();
        assert_eq!(audio.group_id, "aud");
        assert_eq!(audio.channels, "2");
        let subs = tracks.iter().find(|t| t.kind == MediaKind::Subtitles).unwrap();
        assert_eq!(subs.extension, "vtt");
        assert_eq!(subs.language, "de");
    }

    #[tokio::test]
    async fn test_media_playlist_keys_and_ivs() {
        let key_hex = "000102030405060708090a0b0c0d0e0f";
        let manifest = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:10\n\
             #EXT-X-KEY:METHOD=AES-128,URI=\"base64:{}\",IV=0xabcdefabcdefabcdefabcdefabcdefab\n\
             #EXTINF:4.0,\nseg10.ts\n#EXTINF:4.0,\nseg11.ts\n\
             #EXT-X-KEY:METHOD=NONE\n#EXTINF:4.0,\nseg12.ts\n#EXT-X-ENDLIST\n",
            BASE64.encode(parse_hex(key_hex).unwrap())
        );
        let tracks = parse_m3u8(
            &manifest,
            "https://example.net/media.m3u8",
            &fetcher(),
            &HashMap::new(),
            &HlsKeyOverride::default(),
        )
        .await
        .unwrap();
        let playlist = tracks[0].playlist.as_ref().unwrap();
        assert!(!playlist.is_live);
        let segs: Vec<_> = playlist.all_segments().collect();
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].index, 10);
        assert!(segs[0].is_encrypted);
        assert_eq!(segs[0].encrypt_info.key.as_deref(), Some(&parse_hex(key_hex).unwrap()[..]));
        assert_eq!(segs[0].encrypt_info.iv.as_ref().unwrap().len(), 16);
        assert!(!segs[2].is_encrypted);
        assert_eq!(tracks[0].extension, "ts");
    }

    #[tokio::test]
    async fn test_media_playlist_absent_iv_defaults_to_index() {
        let manifest = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n\
            #EXT-X-KEY:METHOD=AES-128,URI=\"base64:AAAAAAAAAAAAAAAAAAAAAA==\"\n\
            #EXTINF:4.0,\nseg0.ts\n#EXTINF:4.0,\nseg1.ts\n#EXT-X-ENDLIST\n";
        let tracks = parse_m3u8(
            manifest,
            "https://example.net/media.m3u8",
            &fetcher(),
            &HashMap::new(),
            &HlsKeyOverride::default(),
        )
        .await
        .unwrap();
        let playlist = tracks[0].playlist.as_ref().unwrap();
        let segs: Vec<_> = playlist.all_segments().collect();
        assert_eq!(
            segs[1].encrypt_info.iv.as_deref().unwrap(),
            &crate::crypto::iv_from_segment_index(1)[..]
        );
    }

    #[tokio::test]
    async fn test_discontinuity_parts_and_live_refresh() {
        let manifest = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n\
            #EXTINF:6.0,\na0.ts\n#EXTINF:6.0,\na1.ts\n\
            #EXT-X-DISCONTINUITY\n#EXTINF:6.0,\nb0.ts\n";
        let tracks = parse_m3u8(
            manifest,
            "https://example.net/live.m3u8",
            &fetcher(),
            &HashMap::new(),
            &HlsKeyOverride::default(),
        )
        .await
        .unwrap();
        let playlist = tracks[0].playlist.as_ref().unwrap();
        assert!(playlist.is_live);
        assert_eq!(playlist.refresh_interval_ms, 12_000.0);
        assert_eq!(playlist.media_parts.len(), 2);
        assert_eq!(playlist.media_parts[0].segments.len(), 2);
        assert_eq!(playlist.media_parts[1].segments.len(), 1);
    }

    #[tokio::test]
    async fn test_uplynk_ad_suppression() {
        let manifest = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n\
            #UPLYNK-SEGMENT:abc,segment\n#EXTINF:4.0,\nc0.ts\n\
            #UPLYNK-SEGMENT:abc,ad\n#EXTINF:4.0,\nad0.ts\n#EXTINF:4.0,\nad1.ts\n\
            #UPLYNK-SEGMENT:abc,segment\n#EXTINF:4.0,\nc1.ts\n#EXT-X-ENDLIST\n";
        let tracks = parse_m3u8(
            manifest,
            "https://example.net/uplynk.m3u8",
            &fetcher(),
            &HashMap::new(),
            &HlsKeyOverride::default(),
        )
        .await
        .unwrap();
        let playlist = tracks[0].playlist.as_ref().unwrap();
        let urls: Vec<_> = playlist.all_segments().map(|s| s.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://example.net/c0.ts", "https://example.net/c1.ts"]
        );
    }

    #[tokio::test]
    async fn test_ad_url_filtering() {
        let manifest = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n\
            #EXTINF:4.0,\nmain0.ts\n#EXTINF:4.0,\nmain1.ts\n\
            #EXTINF:4.0,\nhttps://ads.example.net/x?ccode=0902&duration=15&other=1\n\
            #EXT-X-DISCONTINUITY\n\
            #EXTINF:4.0,\nmain2.ts\n#EXT-X-ENDLIST\n";
        let tracks = parse_m3u8(
            manifest,
            "https://example.net/youku.m3u8",
            &fetcher(),
            &HashMap::new(),
            &HlsKeyOverride::default(),
        )
        .await
        .unwrap();
        let playlist = tracks[0].playlist.as_ref().unwrap();
        // no part was closed by the ad run itself, so the discontinuity
        // splits as usual; only the ad segment disappears
        assert_eq!(playlist.media_parts.len(), 2);
        assert_eq!(playlist.media_parts[0].segments.len(), 2);
        assert_eq!(playlist.media_parts[1].segments.len(), 1);
        let segs: Vec<_> = playlist.all_segments().collect();
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[2].index, 2); // ad did not consume an index
        assert!(segs[2].url.ends_with("main2.ts"));
    }

    #[tokio::test]
    async fn test_ad_run_part_splice() {
        // the ad run is bracketed by discontinuities: the part closed by the
        // leading one is spliced back onto the content that follows
        let manifest = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n\
            #EXTINF:4.0,\nmain0.ts\n#EXTINF:4.0,\nmain1.ts\n\
            #EXT-X-DISCONTINUITY\n\
            #EXTINF:4.0,\nhttps://ads.example.net/x?ccode=0902&duration=15&other=1\n\
            #EXT-X-DISCONTINUITY\n\
            #EXTINF:4.0,\nmain2.ts\n#EXT-X-ENDLIST\n";
        let tracks = parse_m3u8(
            manifest,
            "https://example.net/youku.m3u8",
            &fetcher(),
            &HashMap::new(),
            &HlsKeyOverride::default(),
        )
        .await
        .unwrap();
        let playlist = tracks[0].playlist.as_ref().unwrap();
        assert_eq!(playlist.media_parts.len(), 1);
        let urls: Vec<&str> = playlist.all_segments().map(|s| s.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.net/main0.ts",
                "https://example.net/main1.ts",
                "https://example.net/main2.ts"
            ]
        );
    }

    #[tokio::test]
    async fn test_map_sets_m4s_extension_and_init() {
        let manifest = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n\
            #EXT-X-MAP:URI=\"init.mp4\"\n#EXTINF:4.0,\ns0.m4s\n#EXT-X-ENDLIST\n";
        let tracks = parse_m3u8(
            manifest,
            "https://example.net/fmp4.m3u8",
            &fetcher(),
            &HashMap::new(),
            &HlsKeyOverride::default(),
        )
        .await
        .unwrap();
        assert_eq!(tracks[0].extension, "m4s");
        let init = tracks[0].playlist.as_ref().unwrap().media_init.as_ref().unwrap();
        assert_eq!(init.index, -1);
        assert_eq!(init.url, "https://example.net/init.mp4");
    }

    #[tokio::test]
    async fn test_byte_ranges_accumulate_total() {
        let manifest = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n\
            #EXTINF:4.0,\n#EXT-X-BYTERANGE:1000@0\nall.ts\n\
            #EXTINF:4.0,\n#EXT-X-BYTERANGE:2000@1000\nall.ts\n#EXT-X-ENDLIST\n";
        let tracks = parse_m3u8(
            manifest,
            "https://example.net/ranges.m3u8",
            &fetcher(),
            &HashMap::new(),
            &HlsKeyOverride::default(),
        )
        .await
        .unwrap();
        let playlist = tracks[0].playlist.as_ref().unwrap();
        let segs: Vec<_> = playlist.all_segments().collect();
        assert_eq!(segs[0].expect_length, Some(1000));
        assert_eq!(segs[1].start_range, Some(1000));
        assert_eq!(segs[1].stop_range(), Some(2999));
        assert_eq!(playlist.total_bytes, 3000);
    }

    #[test]
    fn test_subtitle_extension_refinement() {
        let mut track = Track {
            kind: MediaKind::Subtitles,
            extension: "vtt".into(),
            ..Default::default()
        };
        let mut playlist = Playlist::new();
        let mut part = MediaPart::default();
        part.segments.push(MediaSegment::new(0, 4.0, "https://example.net/s0.ttml".into()));
        playlist.media_parts.push(part);
        track.playlist = Some(playlist);
        refine_subtitle_extension(&mut track);
        assert_eq!(track.extension, "ttml");
    }
}
