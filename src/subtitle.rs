//! Subtitle extraction from downloaded segments.
//!
//! Four delivery shapes reach this module: TTML wrapped in fMP4 (`stpp`
//! codec), WebVTT wrapped in fMP4 (`wvtt`), raw TTML documents, and raw
//! WebVTT text. All of them funnel into a [`WebVttSub`] cue list which the
//! manager writes out as SRT or VTT.
//!
//! TTML documents found in the wild are frequently not well-formed (several
//! `<tt>` roots concatenated in one `mdat`, HTML entities, unclosed spans),
//! so the cue-level fields are pulled out with lenient regular expressions
//! instead of a strict XML parse. SMPTE-TT image cues (`smpte:image`
//! elements referenced by `smpte:backgroundImage`) are carried as
//! `Base64::<data>` payloads until [`write_image_pngs`] turns them into
//! numbered PNG files.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use fs_err as fs;
use regex::Regex;
use tracing::warn;

use crate::mp4;
use crate::webvtt::{SubCue, WebVttSub};
use crate::AbrError;

static TT_ROOT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<tt.*?</tt>").unwrap());
static P_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<p\b([^>]*)>(.*?)</p>").unwrap());
static ATTR_BEGIN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"begin="([^"]*)""#).unwrap());
static ATTR_END_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"end="([^"]*)""#).unwrap());
static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<smpte:image[^>]*xml:id="(.*?)"[^>]*>([\s\S]*?)</smpte:image>"#).unwrap()
});
static BG_IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r##"smpte:backgroundImage="#(.*?)""##).unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static BR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<br\s*/?>").unwrap());

/// Parse a TTML clock value: `HH:MM:SS.mmm` or the seconds form `5.28s`.
/// Returns milliseconds.
pub fn parse_ttml_time(value: &str) -> Result<i64, AbrError> {
    let value = value.trim();
    if let Some(secs) = value.strip_suffix('s') {
        if let Ok(s) = secs.parse::<f64>() {
            return Ok((s * 1000.0).round() as i64);
        }
    }
    crate::webvtt::parse_vtt_time(value)
        .map_err(|_| AbrError::Parsing(format!("invalid TTML time {value:?}")))
}

fn clean_markup(raw: &str) -> String {
    let with_breaks = BR_RE.replace_all(raw, "\n");
    TAG_RE.replace_all(&with_breaks, "").trim().to_string()
}

/// Parse one or more TTML documents into cues, globally sorted by start
/// time. Image cues get the `Base64::` payload convention.
pub fn extract_sub(xmls: &[String]) -> WebVttSub {
    let mut vtt = WebVttSub::default();
    for xml in xmls {
        if !xml.contains("<tt") {
            continue;
        }
        let mut images = std::collections::HashMap::new();
        for caps in IMAGE_RE.captures_iter(xml) {
            images.insert(caps[1].to_string(), caps[2].trim().to_string());
        }
        for caps in P_BLOCK_RE.captures_iter(xml) {
            let attrs = &caps[1];
            let content = &caps[2];
            let (Some(begin), Some(end)) = (
                ATTR_BEGIN_RE.captures(attrs).map(|c| c[1].to_string()),
                ATTR_END_RE.captures(attrs).map(|c| c[1].to_string()),
            ) else {
                continue;
            };
            let (Ok(start), Ok(end)) = (parse_ttml_time(&begin), parse_ttml_time(&end)) else {
                continue;
            };
            let mut cue = SubCue { start, end, ..Default::default() };
            let bg_ref = BG_IMAGE_RE
                .captures(attrs)
                .or_else(|| BG_IMAGE_RE.captures(content))
                .map(|c| c[1].to_string());
            match bg_ref.and_then(|id| images.get(&id).cloned()) {
                Some(data) => {
                    cue.is_image = true;
                    cue.payload = format!("Base64::{data}");
                    cue.data_base64 = data;
                }
                None => {
                    cue.payload = clean_markup(content);
                }
            }
            vtt.cues.push(cue);
        }
    }
    vtt.sort_by_start();
    vtt
}

/// TTML-in-fMP4 (`stpp`): pull each file's `mdat` payload, split concatenated
/// `<tt>` roots, parse all of them.
pub fn extract_ttml_from_mp4s(paths: &[PathBuf]) -> Result<WebVttSub, AbrError> {
    let mut xmls = Vec::new();
    for path in paths {
        let data = fs::read(path)
            .map_err(|e| AbrError::SubtitleExtraction(format!("{}: {e}", path.display())))?;
        let mdat = mp4::concat_mdat(&data);
        if mdat.is_empty() {
            warn!("no mdat in subtitle segment {}", path.display());
            continue;
        }
        let text = String::from_utf8_lossy(&mdat).to_string();
        let matches: Vec<String> =
            TT_ROOT_RE.find_iter(&text).map(|m| m.as_str().to_string()).collect();
        if matches.is_empty() {
            xmls.push(text);
        } else {
            xmls.extend(matches);
        }
    }
    Ok(extract_sub(&xmls))
}

/// Raw TTML document (one segment).
pub fn extract_from_ttml_text(content: &str, mpegts_timestamp: i64) -> WebVttSub {
    let mut vtt = extract_sub(&[content.to_string()]);
    vtt.mpegts_timestamp = mpegts_timestamp;
    vtt
}

/// WebVTT-in-fMP4 (`wvtt`): walk the binary-merged file. The `mdhd` gives
/// the timescale; each `moof/traf` gives the fragment's base decode time
/// (`tfdt`), default sample duration (`tfhd`) and per-sample rows (`trun`);
/// the following `mdat` carries `sampleSize` bytes per sample, each holding
/// `vttc` cue boxes.
pub fn extract_vtt_from_mp4(path: &Path) -> Result<WebVttSub, AbrError> {
    let data = fs::read(path)
        .map_err(|e| AbrError::SubtitleExtraction(format!("{}: {e}", path.display())))?;

    let timescale = mp4::find_box_path(&data, &[b"moov", b"trak", b"mdia", b"mdhd"])
        .and_then(mp4::mdhd_timescale)
        .ok_or_else(|| AbrError::SubtitleExtraction("missing timescale for wvtt track".into()))?;

    let mut vtt = WebVttSub::default();
    let mut base_time: u64 = 0;
    let mut default_duration: u32 = 0;
    let mut samples: Vec<mp4::TrunSample> = Vec::new();

    for (name, payload) in mp4::boxes(&data) {
        match &name {
            b"moof" => {
                samples.clear();
                if let Some(traf) = mp4::find_box(payload, b"traf") {
                    if let Some(t) = mp4::find_box(traf, b"tfdt").and_then(mp4::tfdt_base_time) {
                        base_time = t;
                    }
                    if let Some(tfhd) = mp4::find_box(traf, b"tfhd").and_then(mp4::parse_tfhd) {
                        default_duration = tfhd.default_sample_duration;
                    }
                    if let Some(t) = mp4::find_box(traf, b"trun").and_then(mp4::parse_trun) {
                        samples = t;
                    }
                }
            }
            b"mdat" => {
                let mut offset = 0usize;
                let mut current_time = base_time;
                for sample in &samples {
                    let mut duration = sample.duration;
                    if duration == 0 {
                        duration = default_duration;
                    }
                    let start = if sample.composition_time_offset != 0 {
                        base_time.saturating_add_signed(sample.composition_time_offset as i64)
                    } else {
                        current_time
                    };
                    let end = start + duration as u64;
                    current_time = end;

                    let size = sample.size as usize;
                    if offset + size > payload.len() {
                        return Err(AbrError::SubtitleExtraction(
                            "mdat too short for trun sample sizes".into(),
                        ));
                    }
                    let sample_data = &payload[offset..offset + size];
                    offset += size;

                    if let Some((text, settings)) = mp4::parse_vttc_sample(sample_data) {
                        vtt.cues.push(SubCue {
                            start: (start as f64 / timescale as f64 * 1000.0).round() as i64,
                            end: (end as f64 / timescale as f64 * 1000.0).round() as i64,
                            payload: text,
                            settings,
                            ..Default::default()
                        });
                    }
                }
                samples.clear();
            }
            _ => {}
        }
    }
    vtt.sort_by_start();
    vtt.dedup();
    Ok(vtt)
}

/// Decode `Base64::` image cues into sequentially numbered `{N}.png` files
/// in `dir`, rewriting each cue payload to the file name.
pub fn write_image_pngs(vtt: &mut WebVttSub, dir: &Path) -> Result<(), AbrError> {
    if !vtt.cues.iter().any(|c| c.is_image) {
        return Ok(());
    }
    warn!("image-based subtitles detected, emitting PNG files");
    let mut counter = 0usize;
    for cue in vtt.cues.iter_mut() {
        if !cue.is_image || !cue.payload.starts_with("Base64::") {
            continue;
        }
        let mut name = format!("{counter}.png");
        counter += 1;
        let mut dest = dir.join(&name);
        while dest.exists() {
            name = format!("{counter}.png");
            counter += 1;
            dest = dir.join(&name);
        }
        let data = match BASE64.decode(cue.payload.trim_start_matches("Base64::")) {
            Ok(data) => data,
            Err(e) => {
                warn!("undecodable image cue {name}: {e}");
                continue;
            }
        };
        fs::write(&dest, data)
            .map_err(|e| AbrError::Io(e, format!("writing image cue {}", dest.display())))?;
        cue.payload = name;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTML_DOC: &str = r#"<tt xmlns="http://www.w3.org/ns/ttml"><body><div>
        <p begin="00:00:01.000" end="00:00:02.000">Hello <span>world</span></p>
        <p begin="3.5s" end="4.0s">Line one<br/>Line two</p>
    </div></body></tt>"#;

    #[test]
    fn test_ttml_time_forms() {
        assert_eq!(parse_ttml_time("00:00:05.088").unwrap(), 5_088);
        assert_eq!(parse_ttml_time("5.5s").unwrap(), 5_500);
        assert!(parse_ttml_time("bogus").is_err());
    }

    #[test]
    fn test_extract_sub_plain_cues() {
        let vtt = extract_sub(&[TTML_DOC.to_string()]);
        assert_eq!(vtt.cues.len(), 2);
        assert_eq!(vtt.cues[0].start, 1_000);
        assert_eq!(vtt.cues[0].payload, "Hello world");
        assert_eq!(vtt.cues[1].payload, "Line one\nLine two");
    }

    #[test]
    fn test_multiple_roots_are_split_and_sorted() {
        let doc_a = r#"<tt><body><div><p begin="00:00:10.000" end="00:00:11.000">late</p></div></body></tt>"#;
        let doc_b = r#"<tt><body><div><p begin="00:00:01.000" end="00:00:02.000">early</p></div></body></tt>"#;
        let concatenated = format!("{doc_a}{doc_b}");
        let roots: Vec<String> =
            TT_ROOT_RE.find_iter(&concatenated).map(|m| m.as_str().to_string()).collect();
        assert_eq!(roots.len(), 2);
        let vtt = extract_sub(&roots);
        assert_eq!(vtt.cues[0].payload, "early");
        assert_eq!(vtt.cues[1].payload, "late");
    }

    #[test]
    fn test_image_cues() {
        let doc = r##"<tt xmlns:smpte="http://smpte"><head><metadata>
            <smpte:image imagetype="PNG" encoding="Base64" xml:id="img1">aGVsbG8=</smpte:image>
          </metadata></head><body><div>
            <p begin="00:00:00.000" end="00:00:01.000" smpte:backgroundImage="#img1"></p>
          </div></body></tt>"##;
        let vtt = extract_sub(&[doc.to_string()]);
        assert_eq!(vtt.cues.len(), 1);
        assert!(vtt.cues[0].is_image);
        assert_eq!(vtt.cues[0].payload, "Base64::aGVsbG8=");

        let dir = tempfile::tempdir().unwrap();
        let mut vtt = vtt;
        write_image_pngs(&mut vtt, dir.path()).unwrap();
        assert_eq!(vtt.cues[0].payload, "0.png");
        assert_eq!(fs::read(dir.path().join("0.png")).unwrap(), b"hello");
    }

    #[test]
    fn test_wvtt_extraction() {
        // assemble a one-fragment wvtt file: moov/trak/mdia/mdhd(timescale
        // 1000) + moof(traf: tfdt 0, trun 2 samples) + mdat(2 vttc samples)
        fn basic(name: &[u8; 4], body: &[u8]) -> Vec<u8> {
            let mut v = ((body.len() + 8) as u32).to_be_bytes().to_vec();
            v.extend(name);
            v.extend(body);
            v
        }
        fn full(name: &[u8; 4], version: u8, flags: u32, body: &[u8]) -> Vec<u8> {
            let mut inner = vec![version];
            inner.extend(&flags.to_be_bytes()[1..]);
            inner.extend(body);
            basic(name, &inner)
        }
        let mut mdhd_body = vec![0u8; 8];
        mdhd_body.extend(1000u32.to_be_bytes());
        mdhd_body.extend([0u8; 8]);
        let moov = basic(
            b"moov",
            &basic(b"trak", &basic(b"mdia", &full(b"mdhd", 0, 0, &mdhd_body))),
        );

        let make_sample = |text: &[u8]| {
            let payl = basic(b"payl", text);
            basic(b"vttc", &payl)
        };
        let s0 = make_sample(b"first");
        let s1 = make_sample(b"second");

        let mut trun_body = 2u32.to_be_bytes().to_vec();
        for (dur, sample) in [(1000u32, &s0), (2000u32, &s1)] {
            trun_body.extend(dur.to_be_bytes());
            trun_body.extend((sample.len() as u32).to_be_bytes());
        }
        let trun = full(b"trun", 0, 0x000300, &trun_body);
        let tfdt = full(b"tfdt", 0, 0, &5000u32.to_be_bytes());
        let mut traf_body = tfdt;
        traf_body.extend(trun);
        let moof = basic(b"moof", &basic(b"traf", &traf_body));

        let mut mdat_body = s0.clone();
        mdat_body.extend(&s1);
        let mdat = basic(b"mdat", &mdat_body);

        let mut file = moov;
        file.extend(moof);
        file.extend(mdat);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), &file).unwrap();

        let vtt = extract_vtt_from_mp4(tmp.path()).unwrap();
        assert_eq!(vtt.cues.len(), 2);
        assert_eq!(vtt.cues[0].payload, "first");
        assert_eq!(vtt.cues[0].start, 5_000); // 5000 / 1000 timescale
        assert_eq!(vtt.cues[0].end, 6_000);
        assert_eq!(vtt.cues[1].start, 6_000);
        assert_eq!(vtt.cues[1].end, 8_000);
    }
}
