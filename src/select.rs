//! Track sorting, filtering and selection.
//!
//! Tracks are presented (and auto-selected) in a stable order: by kind
//! (video first, then audio, then subtitles), bandwidth descending, channel
//! count descending. Selection expressions are either one of the simple
//! policies `all` / `best` / `worst` / `bestN` / `worstN` / `none`, or a
//! colon-separated attribute bundle such as
//! `lang=en.*:codecs=mp4a:bwMin=128000:for=best2` whose values are regular
//! expressions over the track attributes.

use regex::Regex;

use crate::track::{MediaKind, RoleKind, Track};
use crate::AbrError;

/// Channel priority: the leading integer of the channels field ("6/JOC" → 6).
fn channel_order(track: &Track) -> i64 {
    track
        .channels
        .split('/')
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn kind_order(kind: MediaKind) -> u8 {
    match kind {
        MediaKind::Video | MediaKind::Unknown => 0,
        MediaKind::Audio => 1,
        MediaKind::Subtitles | MediaKind::ClosedCaptions => 2,
    }
}

/// Sort for display and selection: kind, then bandwidth descending, then
/// channel count descending.
pub fn sort_tracks(tracks: &mut [Track]) {
    tracks.sort_by(|a, b| {
        kind_order(a.kind)
            .cmp(&kind_order(b.kind))
            .then_with(|| b.bandwidth.unwrap_or(0).cmp(&a.bandwidth.unwrap_or(0)))
            .then_with(|| channel_order(b).cmp(&channel_order(a)))
    });
}

/// How many of the matching tracks survive, and from which end of the
/// sorted-descending list.
#[derive(Debug, Default, Clone, PartialEq)]
pub enum TakePolicy {
    #[default]
    All,
    /// First N of the (best-first) ordering.
    Best(usize),
    /// Last N.
    Worst(usize),
    None,
}

/// A parsed selection expression.
#[derive(Debug, Default, Clone)]
pub struct TrackFilter {
    pub take: TakePolicy,
    pub group_id: Option<Regex>,
    pub language: Option<Regex>,
    pub name: Option<Regex>,
    pub codecs: Option<Regex>,
    pub resolution: Option<Regex>,
    pub frame_rate: Option<Regex>,
    pub channels: Option<Regex>,
    pub video_range: Option<Regex>,
    pub url: Option<Regex>,
    pub segments_min: Option<usize>,
    pub segments_max: Option<usize>,
    pub playlist_min_duration: Option<f64>,
    pub playlist_max_duration: Option<f64>,
    pub bandwidth_min: Option<u64>,
    pub bandwidth_max: Option<u64>,
    pub role: Option<RoleKind>,
}

impl TrackFilter {
    /// Parse a selection expression. Simple forms: `all`, `best`, `worst`,
    /// `none`, `best3`, `worst2`. Anything containing `=` is an attribute
    /// bundle: `key=value` pairs separated by `:`, regex values, with an
    /// optional `for=` carrying the simple form.
    pub fn parse(expr: &str) -> Result<TrackFilter, AbrError> {
        let expr = expr.trim();
        if !expr.contains('=') {
            return Ok(TrackFilter { take: parse_take(expr)?, ..Default::default() });
        }
        let mut filter = TrackFilter { take: TakePolicy::Best(1), ..Default::default() };
        for part in expr.split(':') {
            let Some((key, value)) = part.split_once('=') else {
                return Err(AbrError::Parsing(format!("invalid filter component {part:?}")));
            };
            let key = key.trim();
            let value = value.trim().trim_matches('"');
            let re = || {
                Regex::new(value)
                    .map_err(|e| AbrError::Parsing(format!("invalid filter regex {value:?}: {e}")))
            };
            let num = || {
                value
                    .parse::<u64>()
                    .map_err(|_| AbrError::Parsing(format!("invalid filter number {value:?}")))
            };
            match key {
                "id" | "group" => filter.group_id = Some(re()?),
                "lang" => filter.language = Some(re()?),
                "name" => filter.name = Some(re()?),
                "codecs" => filter.codecs = Some(re()?),
                "res" => filter.resolution = Some(re()?),
                "frame" => filter.frame_rate = Some(re()?),
                "channel" => filter.channels = Some(re()?),
                "range" => filter.video_range = Some(re()?),
                "url" => filter.url = Some(re()?),
                "segsMin" => filter.segments_min = Some(num()? as usize),
                "segsMax" => filter.segments_max = Some(num()? as usize),
                "plistDurMin" => filter.playlist_min_duration = Some(num()? as f64),
                "plistDurMax" => filter.playlist_max_duration = Some(num()? as f64),
                "bwMin" => filter.bandwidth_min = Some(num()?),
                "bwMax" => filter.bandwidth_max = Some(num()?),
                "role" => {
                    filter.role = RoleKind::from_value(value);
                    if filter.role.is_none() {
                        return Err(AbrError::Parsing(format!("unknown role {value:?}")));
                    }
                }
                "for" => filter.take = parse_take(value)?,
                other => {
                    return Err(AbrError::Parsing(format!("unknown filter key {other:?}")));
                }
            }
        }
        Ok(filter)
    }

    fn matches(&self, track: &Track, any_has_segments: bool) -> bool {
        let re_match = |re: &Option<Regex>, value: &str| match re {
            Some(re) => !value.is_empty() && re.is_match(value),
            None => true,
        };
        if !re_match(&self.group_id, &track.group_id)
            || !re_match(&self.language, &track.language)
            || !re_match(&self.name, &track.name)
            || !re_match(&self.codecs, &track.codecs)
            || !re_match(&self.resolution, &track.resolution)
            || !re_match(&self.channels, &track.channels)
            || !re_match(&self.video_range, &track.video_range)
            || !re_match(&self.url, &track.media_url)
        {
            return false;
        }
        if let Some(re) = &self.frame_rate {
            match track.frame_rate {
                Some(fr) => {
                    if !re.is_match(&format!("{fr}")) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        let segments = track.segment_count();
        if any_has_segments {
            if self.segments_min.is_some_and(|min| segments < min) {
                return false;
            }
            if self.segments_max.is_some_and(|max| segments > max) {
                return false;
            }
        }
        if let Some(playlist) = &track.playlist {
            let duration = playlist.total_duration();
            if self.playlist_min_duration.is_some_and(|min| duration <= min) {
                return false;
            }
            if self.playlist_max_duration.is_some_and(|max| duration >= max) {
                return false;
            }
        }
        if let Some(bw) = track.bandwidth {
            if self.bandwidth_min.is_some_and(|min| bw < min) {
                return false;
            }
            if self.bandwidth_max.is_some_and(|max| bw > max) {
                return false;
            }
        }
        if self.role.is_some() && track.role != self.role {
            return false;
        }
        true
    }
}

fn parse_take(expr: &str) -> Result<TakePolicy, AbrError> {
    let expr = expr.trim().to_lowercase();
    match expr.as_str() {
        "all" => return Ok(TakePolicy::All),
        "best" => return Ok(TakePolicy::Best(1)),
        "worst" => return Ok(TakePolicy::Worst(1)),
        "none" | "" => return Ok(TakePolicy::None),
        _ => {}
    }
    if let Some(n) = expr.strip_prefix("best") {
        let n: usize = n
            .parse()
            .map_err(|_| AbrError::Parsing(format!("invalid selection policy {expr:?}")))?;
        return Ok(TakePolicy::Best(n));
    }
    if let Some(n) = expr.strip_prefix("worst") {
        let n: usize = n
            .parse()
            .map_err(|_| AbrError::Parsing(format!("invalid selection policy {expr:?}")))?;
        return Ok(TakePolicy::Worst(n));
    }
    Err(AbrError::Parsing(format!("invalid selection policy {expr:?}")))
}

/// Keep the tracks matching the filter, then apply the take policy over the
/// (already sorted, best-first) match list.
pub fn filter_keep(tracks: &[Track], filter: &TrackFilter) -> Vec<Track> {
    let any_has_segments = tracks.iter().any(|t| t.segment_count() > 0);
    let mut matched: Vec<Track> = tracks
        .iter()
        .filter(|t| filter.matches(t, any_has_segments))
        .cloned()
        .collect();
    match filter.take {
        TakePolicy::All => {}
        TakePolicy::Best(n) => {
            matched.truncate(n);
        }
        TakePolicy::Worst(n) => {
            if matched.len() > n {
                matched.drain(..matched.len() - n);
            }
        }
        TakePolicy::None => matched.clear(),
    }
    matched
}

/// Drop the tracks the filter selects, keeping everything else.
pub fn filter_drop(tracks: &[Track], filter: &TrackFilter) -> Vec<Track> {
    let kept = filter_keep(tracks, filter);
    let selected: Vec<String> = kept.iter().map(|t| t.description()).collect();
    tracks
        .iter()
        .filter(|t| !selected.contains(&t.description()))
        .cloned()
        .collect()
}

/// Apply the per-kind selection expressions to a sorted track list.
pub fn select_tracks(
    tracks: &[Track],
    video: &TrackFilter,
    audio: &TrackFilter,
    subtitle: &TrackFilter,
) -> Vec<Track> {
    let of_kind = |order: u8| -> Vec<Track> {
        tracks.iter().filter(|t| kind_order(t.kind) == order).cloned().collect()
    };
    let mut selected = filter_keep(&of_kind(0), video);
    selected.extend(filter_keep(&of_kind(1), audio));
    selected.extend(filter_keep(&of_kind(2), subtitle));
    selected
}
