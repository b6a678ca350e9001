//! Walking a parsed MPD into the uniform track model.
//!
//! Each Representation becomes one `Track`. BaseURL elements compose
//! hierarchically (MPD → Period → AdaptationSet → Representation), and the
//! four addressing modes are handled in this order: SegmentBase,
//! SegmentList, SegmentTemplate (with or without SegmentTimeline), and a
//! bare BaseURL as a single segment.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::warn;
use url::Url;

use crate::mpd::{self, AdaptationSet, Period, Representation, SegmentTemplate, MPD};
use crate::track::{
    EncryptMethod, ExtractorType, MediaKind, MediaPart, MediaSegment, Playlist, RoleKind, Track,
};
use crate::AbrError;

/// Substitute `$RepresentationID$`, `$Bandwidth$`, `$Number$` and `$Time$`
/// into a SegmentTemplate URL. The printf-style form `$Number%05d$`
/// zero-pads to the given width; per DASH-IF only `%0[width]d` is permitted,
/// so we implement it directly instead of pulling in a printf
/// reimplementation.
pub fn resolve_url_template(template: &str, params: &HashMap<&str, String>) -> String {
    static FORMAT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\$(RepresentationID|Number|Time|Bandwidth)%0(\d+)d\$").unwrap()
    });
    let mut result = template.to_string();
    for key in ["RepresentationID", "Number", "Time", "Bandwidth"] {
        let ident = format!("${key}$");
        if result.contains(&ident) {
            if let Some(value) = params.get(key) {
                result = result.replace(&ident, value);
            }
        }
    }
    while let Some(caps) = FORMAT_RE.captures(&result) {
        let whole = caps.get(0).unwrap().range();
        let key = caps.get(1).unwrap().as_str();
        let width: usize = caps[2].parse().unwrap_or(0);
        let replacement = match params.get(key) {
            Some(value) => format!("{value:0>width$}"),
            None => break,
        };
        result.replace_range(whole, &replacement);
    }
    result
}

/// Join a possibly relative URL against a base, repairing the kkbox.com.tw
/// double-scheme quirk on the way.
fn combine_url(base: &str, reference: &str) -> String {
    let mut reference = reference.to_string();
    if reference.contains("kkbox.com.tw/") {
        reference = reference.replace("//https:%2F%2F", "//");
    }
    if reference.is_empty() {
        return base.to_string();
    }
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return reference;
    }
    match Url::parse(base).and_then(|b| b.join(&reference)) {
        Ok(u) => u.to_string(),
        Err(_) => reference,
    }
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let n: f64 = num.parse().ok()?;
        let d: f64 = den.parse().ok()?;
        if d == 0.0 {
            return None;
        }
        Some((n / d * 1000.0).round() / 1000.0)
    } else {
        s.parse().ok()
    }
}

/// `start-end` (inclusive) → `(start, length)`.
fn parse_byte_range(range: &str) -> Option<(i64, i64)> {
    let (start, end) = range.split_once('-')?;
    let start: i64 = start.trim().parse().ok()?;
    let end: i64 = end.trim().parse().ok()?;
    Some((start, end - start + 1))
}

/// Parse an MPD document fetched from `mpd_url` into tracks.
pub fn parse_mpd(xml: &str, mpd_url: &str) -> Result<Vec<Track>, AbrError> {
    let mpd = mpd::parse(xml)?;
    let is_live = mpd.is_dynamic();

    let mut top_base = mpd_url.to_string();
    if let Some(bu) = mpd.base_url.first() {
        top_base = combine_url(mpd_url, &bu.base);
    }

    let mut tracks = Vec::new();
    for period in &mpd.periods {
        let period_base = extend_base_url(&top_base, period.BaseURL.first().map(|b| b.base.as_str()));
        for adaptation in &period.adaptations {
            let adaptation_base =
                extend_base_url(&period_base, adaptation.BaseURL.first().map(|b| b.base.as_str()));
            for representation in &adaptation.representations {
                match parse_representation(
                    representation,
                    adaptation,
                    period,
                    &mpd,
                    &adaptation_base,
                    mpd_url,
                    is_live,
                ) {
                    Ok(track) => tracks.push(track),
                    Err(e) => warn!("skipping Representation: {e}"),
                }
            }
        }
    }
    set_default_track_associations(&mut tracks);
    Ok(tracks)
}

fn extend_base_url(current: &str, base: Option<&str>) -> String {
    match base {
        Some(b) if !b.is_empty() => combine_url(current, b),
        _ => current.to_string(),
    }
}

fn period_duration_secs(period: &Period, mpd: &MPD) -> f64 {
    period
        .duration
        .or(mpd.mediaPresentationDuration)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn parse_representation(
    repr: &Representation,
    adaptation: &AdaptationSet,
    period: &Period,
    mpd: &MPD,
    base_url: &str,
    mpd_url: &str,
    is_live: bool,
) -> Result<Track, AbrError> {
    let repr_base = extend_base_url(base_url, repr.BaseURL.first().map(|b| b.base.as_str()));

    let mut playlist = Playlist::new();
    playlist.url = mpd_url.to_string();
    playlist.is_live = is_live;
    playlist.media_parts.push(MediaPart::default());

    let mut track = Track {
        manifest_url: mpd_url.to_string(),
        media_url: mpd_url.to_string(),
        period_id: period.id.clone().unwrap_or_default(),
        group_id: repr.id.clone().unwrap_or_default(),
        bandwidth: repr.bandwidth,
        extractor: ExtractorType::Dash,
        kind: MediaKind::Unknown,
        ..Default::default()
    };

    // media kind and extension from the mime type hierarchy
    let mime = adaptation
        .contentType
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| repr.mimeType.clone())
        .or_else(|| adaptation.mimeType.clone())
        .unwrap_or_default();
    if let Some((kind, subtype)) = mime.split_once('/').map(|(k, s)| (k, s.to_string())) {
        track.kind = match kind {
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            "text" => MediaKind::Subtitles,
            _ => MediaKind::Unknown,
        };
        track.extension = subtype;
    } else {
        track.kind = match mime.as_str() {
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            "text" => MediaKind::Subtitles,
            _ => MediaKind::Unknown,
        };
    }

    track.codecs = repr
        .codecs
        .clone()
        .or_else(|| adaptation.codecs.clone())
        .unwrap_or_default();
    track.language = filter_language(
        repr.lang.as_deref().filter(|l| !l.is_empty()).or(adaptation.lang.as_deref()),
    );
    if let (Some(w), Some(h)) = (repr.width, repr.height) {
        if w > 0 && h > 0 {
            track.resolution = format!("{w}x{h}");
        }
    }
    if let Some(fr) = repr
        .frameRate
        .as_deref()
        .filter(|s| !s.is_empty())
        .or(adaptation.frameRate.as_deref())
        .and_then(parse_frame_rate)
    {
        track.frame_rate = Some(fr);
    }
    if let Some(channels) = repr
        .AudioChannelConfiguration
        .first()
        .and_then(|c| c.value.clone())
        .or_else(|| adaptation.AudioChannelConfiguration.first().and_then(|c| c.value.clone()))
    {
        track.channels = channels;
    }

    let role_value = repr
        .Role
        .first()
        .and_then(|r| r.value.clone())
        .or_else(|| adaptation.Role.first().and_then(|r| r.value.clone()));
    if let Some(role) = role_value.as_deref().and_then(RoleKind::from_value) {
        track.role = Some(role);
        if role == RoleKind::Subtitle {
            track.kind = MediaKind::Subtitles;
            if mime.contains("ttml") {
                track.extension = "ttml".into();
            }
        }
    }

    // subtitle codecs always win over the mime-type guess
    if track.codecs == "stpp" || track.codecs == "wvtt" {
        track.kind = MediaKind::Subtitles;
        if track.codecs == "stpp" && (track.extension == "m4s" || track.extension == "mp4") {
            track.extension = "ttml".into();
            track.need_ttml_conversion = true;
        }
    }

    if let Some(adjust) = &repr.volumeAdjust {
        track.group_id = format!("{}-{adjust}", track.group_id);
    }

    if is_live {
        if let Some(depth) = mpd.timeShiftBufferDepth {
            playlist.refresh_interval_ms = depth.as_millis() as f64 / 2.0;
        }
    }

    generate_segments(&mut playlist, repr, adaptation, period, mpd, &repr_base, is_live)?;

    // any ContentProtection on the Representation or its AdaptationSet marks
    // the whole representation as CENC
    if !repr.ContentProtection.is_empty() || !adaptation.ContentProtection.is_empty() {
        if let Some(init) = playlist.media_init.as_mut() {
            init.encrypt_info.method = EncryptMethod::Cenc;
            init.is_encrypted = true;
        }
        for seg in playlist.all_segments_mut() {
            seg.encrypt_info.method = EncryptMethod::Cenc;
            seg.is_encrypted = true;
        }
    }

    // extension fixups: fMP4 subtitles keep m4s, multi-segment media is m4s
    if track.kind == MediaKind::Subtitles && track.extension == "mp4" {
        track.extension = "m4s".into();
    }
    if track.kind != MediaKind::Subtitles
        && (track.extension.is_empty() || playlist.segment_count() > 1)
    {
        track.extension = "m4s".into();
    }

    track.playlist = Some(playlist);
    Ok(track)
}

fn generate_segments(
    playlist: &mut Playlist,
    repr: &Representation,
    adaptation: &AdaptationSet,
    period: &Period,
    mpd: &MPD,
    base_url: &str,
    is_live: bool,
) -> Result<(), AbrError> {
    // (1) SegmentBase: an init range plus the BaseURL as the single segment
    if let Some(sb) = &repr.SegmentBase {
        if let Some(init) = &sb.initialization {
            if let Some(source) = &init.sourceURL {
                let mut media_init = MediaSegment::new(-1, 0.0, combine_url(base_url, source));
                if let Some(range) = init.range.as_deref().and_then(parse_byte_range) {
                    media_init.start_range = Some(range.0);
                    media_init.expect_length = Some(range.1);
                }
                playlist.media_init = Some(media_init);
                let segment =
                    MediaSegment::new(0, period_duration_secs(period, mpd), base_url.to_string());
                playlist.media_parts[0].segments.push(segment);
                return Ok(());
            }
        }
    }

    // (2) SegmentList: explicit URLs
    if let Some(sl) = &repr.SegmentList {
        if !sl.segment_urls.is_empty() {
            if let Some(init) = &sl.Initialization {
                if let Some(source) = &init.sourceURL {
                    let mut media_init = MediaSegment::new(-1, 0.0, combine_url(base_url, source));
                    if let Some(range) = init.range.as_deref().and_then(parse_byte_range) {
                        media_init.start_range = Some(range.0);
                        media_init.expect_length = Some(range.1);
                    }
                    playlist.media_init = Some(media_init);
                }
            }
            let timescale = sl.timescale.unwrap_or(1).max(1) as f64;
            let duration = sl.duration.unwrap_or(0) as f64;
            for (i, su) in sl.segment_urls.iter().enumerate() {
                let Some(media) = &su.media else { continue };
                let mut segment = MediaSegment::new(
                    i as i64,
                    duration / timescale,
                    combine_url(base_url, media),
                );
                if let Some(range) = su.mediaRange.as_deref().and_then(parse_byte_range) {
                    segment.start_range = Some(range.0);
                    segment.expect_length = Some(range.1);
                }
                playlist.media_parts[0].segments.push(segment);
            }
            return Ok(());
        }
    }

    // (3) SegmentTemplate, inner overriding outer
    let inner = repr.SegmentTemplate.clone().unwrap_or_default();
    let outer = adaptation.SegmentTemplate.clone().unwrap_or_default();
    let template = inner.merged_with(&outer);
    if template.media.is_some() || template.initialization.is_some() {
        return generate_template_segments(playlist, &template, repr, period, mpd, base_url, is_live);
    }

    // (4) bare BaseURL: the representation is one file
    let segment = MediaSegment::new(0, period_duration_secs(period, mpd), base_url.to_string());
    playlist.media_parts[0].segments.push(segment);
    Ok(())
}

fn generate_template_segments(
    playlist: &mut Playlist,
    template: &SegmentTemplate,
    repr: &Representation,
    period: &Period,
    mpd: &MPD,
    base_url: &str,
    is_live: bool,
) -> Result<(), AbrError> {
    let rid = repr.id.clone().unwrap_or_default();
    let mut vars: HashMap<&str, String> = HashMap::from([("RepresentationID", rid)]);
    if let Some(bw) = repr.bandwidth {
        vars.insert("Bandwidth", bw.to_string());
    }

    if let Some(init) = &template.initialization {
        let path = resolve_url_template(init, &vars);
        playlist.media_init = Some(MediaSegment::new(-1, 0.0, combine_url(base_url, &path)));
    }

    let Some(media) = &template.media else { return Ok(()) };
    let timescale = template.timescale.unwrap_or(1).max(1);
    let start_number = template.startNumber.unwrap_or(1);

    if let Some(timeline) = &template.SegmentTimeline {
        let uses_time = media.contains("$Time$");
        let end_time = period_duration_secs(period, mpd) * timescale as f64;
        let mut segment_time: i64 = 0;
        let mut seg_index: i64 = 0;
        let mut number = start_number;
        for s in &timeline.segments {
            if let Some(t) = s.t {
                segment_time = t;
            }
            let duration = s.d;
            let repeat = s.r.unwrap_or(0);
            let mut emitted: i64 = 0;
            loop {
                let mut seg_vars = vars.clone();
                seg_vars.insert("Time", segment_time.to_string());
                seg_vars.insert("Number", number.to_string());
                let path = resolve_url_template(media, &seg_vars);
                let mut segment = MediaSegment::new(
                    seg_index,
                    duration as f64 / timescale as f64,
                    combine_url(base_url, &path),
                );
                segment.name_from_var = Some(if uses_time {
                    segment_time.to_string()
                } else {
                    number.to_string()
                });
                playlist.media_parts[0].segments.push(segment);
                seg_index += 1;
                number += 1;
                emitted += 1;
                segment_time += duration;
                if repeat >= 0 {
                    // r counts *additional* copies beyond the first
                    if emitted > repeat {
                        break;
                    }
                } else {
                    // r < 0: repeat until the period is covered
                    if segment_time as f64 >= end_time {
                        break;
                    }
                }
            }
        }
        return Ok(());
    }

    // no timeline: derive the count from the duration attribute
    let duration = template.duration.unwrap_or(0.0);
    if duration <= 0.0 {
        return Err(AbrError::Parsing(
            "SegmentTemplate without SegmentTimeline needs a @duration".into(),
        ));
    }
    let total_secs = period_duration_secs(period, mpd);
    let mut total_number = if total_secs > 0.0 {
        (total_secs * timescale as f64 / duration).ceil() as i64
    } else {
        0
    };
    let mut first_number = start_number as i64;
    if total_number == 0 && is_live {
        if let (Some(avail), Some(depth)) =
            (mpd.availabilityStartTime.as_deref(), mpd.timeShiftBufferDepth)
        {
            if let Ok(start) = DateTime::parse_from_rfc3339(avail) {
                let elapsed = (Utc::now() - start.to_utc()).num_seconds() as f64;
                first_number +=
                    (((elapsed - depth.as_secs_f64()) * timescale as f64 / duration).ceil()) as i64;
                total_number = ((depth.as_secs_f64() * timescale as f64 / duration).ceil()) as i64;
            }
        }
    }
    for i in 0..total_number {
        let number = first_number + i;
        let mut seg_vars = vars.clone();
        seg_vars.insert("Number", number.to_string());
        let path = resolve_url_template(media, &seg_vars);
        let mut segment = MediaSegment::new(
            if is_live { number } else { i },
            duration / timescale as f64,
            combine_url(base_url, &path),
        );
        segment.name_from_var = Some(number.to_string());
        playlist.media_parts[0].segments.push(segment);
    }
    Ok(())
}

fn filter_language(lang: Option<&str>) -> String {
    static LANG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w_\-\d]+$").unwrap());
    match lang {
        Some(l) if !l.is_empty() => {
            if LANG_RE.is_match(l) {
                l.to_string()
            } else {
                "und".to_string()
            }
        }
        _ => String::new(),
    }
}

/// A video track without an explicit audio/subtitle association is paired
/// with the highest-bandwidth audio and subtitle groups.
fn set_default_track_associations(tracks: &mut [Track]) {
    let best_group = |tracks: &[Track], kind: MediaKind| -> Option<String> {
        tracks
            .iter()
            .filter(|t| t.kind == kind)
            .max_by_key(|t| t.bandwidth.unwrap_or(0))
            .map(|t| t.group_id.clone())
    };
    let best_audio = best_group(tracks, MediaKind::Audio);
    let best_subs = best_group(tracks, MediaKind::Subtitles);
    for track in tracks.iter_mut() {
        if track.kind == MediaKind::Video || !track.resolution.is_empty() {
            if track.audio_link.is_none() {
                track.audio_link = best_audio.clone();
            }
            if track.subtitle_link.is_none() {
                track.subtitle_link = best_subs.clone();
            }
        }
    }
}
