//! WebVTT cue model shared by the subtitle extraction flows.
//!
//! Cue times are kept in milliseconds. The `mpegts_timestamp` baseline is the
//! MPEGTS value of the segment's `X-TIMESTAMP-MAP` header (90 kHz clock);
//! merging cue lists from consecutive segments shifts the incoming cues by
//! `(other.base - self.base) / 90000` seconds so that per-segment-relative
//! timelines line up.

use std::sync::LazyLock;

use regex::Regex;

use crate::AbrError;

static CUE_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{2,}:\d{2}:\d{2}\.\d{3})\s*-->\s*(\d{2,}:\d{2}:\d{2}\.\d{3})(.*)").unwrap()
});

static TIMESTAMP_MAP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"X-TIMESTAMP-MAP.*MPEGTS:(\d+)").unwrap());

/// One subtitle cue. Image cues carry the PNG bytes base64-encoded and a
/// payload of the form `Base64::<data>` until the PNG file is written out.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SubCue {
    /// Milliseconds.
    pub start: i64,
    /// Milliseconds.
    pub end: i64,
    pub payload: String,
    pub settings: String,
    pub is_image: bool,
    pub data_base64: String,
}

/// An in-memory WebVTT document.
#[derive(Debug, Default, Clone)]
pub struct WebVttSub {
    /// 90 kHz baseline from `X-TIMESTAMP-MAP`, 0 when the segment has none.
    pub mpegts_timestamp: i64,
    pub cues: Vec<SubCue>,
}

/// Parse `HH:MM:SS.mmm` (hours may exceed two digits) to milliseconds.
pub fn parse_vtt_time(s: &str) -> Result<i64, AbrError> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return Err(AbrError::Parsing(format!("invalid cue time {s:?}")));
    }
    let (secs, millis) = parts[2]
        .split_once('.')
        .ok_or_else(|| AbrError::Parsing(format!("invalid cue time {s:?}")))?;
    let h: i64 = parts[0].parse().map_err(|_| AbrError::Parsing(format!("invalid cue time {s:?}")))?;
    let m: i64 = parts[1].parse().map_err(|_| AbrError::Parsing(format!("invalid cue time {s:?}")))?;
    let sec: i64 = secs.parse().map_err(|_| AbrError::Parsing(format!("invalid cue time {s:?}")))?;
    let ms: i64 = millis.parse().map_err(|_| AbrError::Parsing(format!("invalid cue time {s:?}")))?;
    Ok(((h * 60 + m) * 60 + sec) * 1000 + ms)
}

/// Format milliseconds as `HH:MM:SS.mmm`.
pub fn format_vtt_time(ms: i64) -> String {
    format_time(ms, '.')
}

/// Format milliseconds as `HH:MM:SS,mmm` (SRT convention).
pub fn format_srt_time(ms: i64) -> String {
    format_time(ms, ',')
}

fn format_time(ms: i64, separator: char) -> String {
    let ms = ms.max(0);
    let total_seconds = ms / 1000;
    format!(
        "{:02}:{:02}:{:02}{}{:03}",
        total_seconds / 3600,
        (total_seconds % 3600) / 60,
        total_seconds % 60,
        separator,
        ms % 1000
    )
}

impl WebVttSub {
    /// Parse raw WebVTT text. Unrecognised header lines are skipped; cue
    /// identifiers are not preserved.
    pub fn parse(content: &str) -> WebVttSub {
        let mut vtt = WebVttSub::default();
        if let Some(caps) = TIMESTAMP_MAP_RE.captures(content) {
            vtt.mpegts_timestamp = caps[1].parse().unwrap_or(0);
        }
        let mut current: Option<SubCue> = None;
        for line in content.replace("\r\n", "\n").split('\n') {
            if line.trim().is_empty() {
                if let Some(cue) = current.take() {
                    vtt.cues.push(cue);
                }
                continue;
            }
            if current.is_none() {
                if let Some(caps) = CUE_TIME_RE.captures(line) {
                    if let (Ok(start), Ok(end)) =
                        (parse_vtt_time(&caps[1]), parse_vtt_time(&caps[2]))
                    {
                        current = Some(SubCue {
                            start,
                            end,
                            settings: caps[3].trim().to_string(),
                            ..Default::default()
                        });
                        continue;
                    }
                }
            } else if let Some(cue) = current.as_mut() {
                if !cue.payload.is_empty() {
                    cue.payload.push('\n');
                }
                cue.payload.push_str(line);
            }
        }
        if let Some(cue) = current {
            vtt.cues.push(cue);
        }
        vtt
    }

    /// Append the cues of `other`, shifting them by the difference of the two
    /// MPEGTS baselines.
    pub fn append(&mut self, other: &WebVttSub) {
        let shift_ms = if self.mpegts_timestamp != 0 || other.mpegts_timestamp != 0 {
            ((other.mpegts_timestamp - self.mpegts_timestamp) as f64 / 90_000.0 * 1000.0) as i64
        } else {
            0
        };
        for cue in &other.cues {
            let mut cue = cue.clone();
            cue.start += shift_ms;
            cue.end += shift_ms;
            self.cues.push(cue);
        }
    }

    /// Shift every cue earlier by `offset_ms`, clamping at zero. Used after
    /// ad filtering dropped leading content.
    pub fn left_shift(&mut self, offset_ms: i64) {
        if offset_ms == 0 {
            return;
        }
        for cue in &mut self.cues {
            cue.start = (cue.start - offset_ms).max(0);
            cue.end = (cue.end - offset_ms).max(0);
        }
    }

    pub fn sort_by_start(&mut self) {
        self.cues.sort_by_key(|c| (c.start, c.end));
    }

    /// Drop exact duplicates produced by overlapping segment windows.
    pub fn dedup(&mut self) {
        self.cues.dedup();
    }

    pub fn to_vtt(&self) -> String {
        let mut out = String::from("WEBVTT\n\n");
        for cue in &self.cues {
            out.push_str(&format_vtt_time(cue.start));
            out.push_str(" --> ");
            out.push_str(&format_vtt_time(cue.end));
            if !cue.settings.is_empty() {
                out.push(' ');
                out.push_str(&cue.settings);
            }
            out.push('\n');
            out.push_str(&cue.payload);
            out.push_str("\n\n");
        }
        out
    }

    pub fn to_srt(&self) -> String {
        if self.cues.is_empty() {
            return String::from("1\n00:00:00,000 --> 00:00:00,000\n\n");
        }
        let mut out = String::new();
        for (i, cue) in self.cues.iter().enumerate() {
            out.push_str(&format!(
                "{}\n{} --> {}\n{}\n\n",
                i + 1,
                format_srt_time(cue.start),
                format_srt_time(cue.end),
                cue.payload
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_roundtrip_identity() {
        // identity over [0, 24h) at millisecond precision
        for ms in [0i64, 1, 999, 1000, 59_999, 3_600_000, 86_399_999] {
            assert_eq!(parse_vtt_time(&format_vtt_time(ms)).unwrap(), ms);
        }
        assert_eq!(parse_vtt_time("01:02:03.456").unwrap(), 3_723_456);
        assert!(parse_vtt_time("02:03.456").is_err());
    }

    #[test]
    fn test_parse_and_emit() {
        let content = "WEBVTT\nX-TIMESTAMP-MAP=MPEGTS:900000,LOCAL:00:00:00.000\n\n\
                       00:00:01.000 --> 00:00:02.500 line:85%\nfirst cue\nsecond line\n\n\
                       00:00:03.000 --> 00:00:04.000\nsecond cue\n";
        let vtt = WebVttSub::parse(content);
        assert_eq!(vtt.mpegts_timestamp, 900_000);
        assert_eq!(vtt.cues.len(), 2);
        assert_eq!(vtt.cues[0].payload, "first cue\nsecond line");
        assert_eq!(vtt.cues[0].settings, "line:85%");
        let srt = vtt.to_srt();
        assert!(srt.starts_with("1\n00:00:01,000 --> 00:00:02,500\nfirst cue\nsecond line\n"));
        assert!(vtt.to_vtt().contains("00:00:03.000 --> 00:00:04.000\nsecond cue"));
    }

    #[test]
    fn test_append_identity_and_associativity() {
        let seg = |base: i64, start: i64| {
            let mut v = WebVttSub { mpegts_timestamp: base, ..Default::default() };
            v.cues.push(SubCue { start, end: start + 1000, payload: "x".into(), ..Default::default() });
            v
        };
        // empty VttSub is an identity for append
        let mut merged = WebVttSub::default();
        merged.append(&seg(0, 5_000));
        assert_eq!(merged.cues[0].start, 5_000);

        // (a + b) + c == a + (b + c) when bases agree through the chain
        let a = seg(0, 0);
        let b = seg(90_000, 0);
        let c = seg(180_000, 0);
        let mut left = a.clone();
        left.append(&b);
        left.append(&c);
        let mut bc = b.clone();
        bc.append(&c);
        let mut right = a;
        right.append(&bc);
        let starts = |v: &WebVttSub| v.cues.iter().map(|c| c.start).collect::<Vec<_>>();
        assert_eq!(starts(&left), starts(&right));
        assert_eq!(starts(&left), vec![0, 1_000, 2_000]);
    }

    #[test]
    fn test_left_shift_clamps() {
        let mut vtt = WebVttSub::default();
        vtt.cues.push(SubCue { start: 500, end: 1_500, ..Default::default() });
        vtt.left_shift(1_000);
        assert_eq!(vtt.cues[0].start, 0);
        assert_eq!(vtt.cues[0].end, 500);
    }

    #[test]
    fn test_empty_srt_placeholder() {
        let vtt = WebVttSub::default();
        assert_eq!(vtt.to_srt(), "1\n00:00:00,000 --> 00:00:00,000\n\n");
    }
}
