// Common code for media handling.
//
// Wraps the ffprobe side-channel the manager uses to fill in codec
// information after the first segment (or init segment) of a track has been
// downloaded, and to demote mislabelled tracks whose container turns out to
// hold only audio.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::track::MediaKind;

/// One probed elementary stream.
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub codec_type: String,
    pub codec_name: String,
}

impl MediaInfo {
    pub fn is_audio(&self) -> bool {
        self.codec_type == "audio"
    }
}

/// A finished per-track file queued for the final mux.
#[derive(Debug, Clone)]
pub struct OutputFile {
    pub path: PathBuf,
    pub kind: MediaKind,
    pub lang_code: String,
    pub description: String,
    pub media_infos: Vec<MediaInfo>,
}

/// Probe the streams of a media file. Failures yield an empty list (the
/// probe is advisory; downloads must not fail because ffprobe is missing).
pub fn probe_media_info(path: &Path) -> Vec<MediaInfo> {
    match ffprobe::ffprobe(path) {
        Ok(meta) => meta
            .streams
            .iter()
            .map(|s| MediaInfo {
                codec_type: s.codec_type.clone().unwrap_or_default(),
                codec_name: s.codec_name.clone().unwrap_or_default(),
            })
            .collect(),
        Err(e) => {
            warn!("error probing {}: {e}", path.display());
            Vec::new()
        }
    }
}

/// Normalise a language tag to an ISO 639-2 code for muxer metadata;
/// unrecognised tags become `und`.
pub fn normalize_language_code(lang: &str) -> String {
    let lang = lang.trim();
    let primary = lang.split(['-', '_']).next().unwrap_or("").to_lowercase();
    let mapped = match primary.as_str() {
        "en" | "eng" => "eng",
        "de" | "deu" | "ger" => "deu",
        "fr" | "fra" | "fre" => "fra",
        "es" | "spa" => "spa",
        "it" | "ita" => "ita",
        "pt" | "por" => "por",
        "nl" | "nld" | "dut" => "nld",
        "ru" | "rus" => "rus",
        "ja" | "jpn" => "jpn",
        "ko" | "kor" => "kor",
        "zh" | "zho" | "chi" | "cmn" => "zho",
        "yue" => "yue",
        "ar" | "ara" => "ara",
        "hi" | "hin" => "hin",
        "tr" | "tur" => "tur",
        "pl" | "pol" => "pol",
        "sv" | "swe" => "swe",
        "da" | "dan" => "dan",
        "no" | "nor" | "nob" => "nor",
        "fi" | "fin" => "fin",
        "cs" | "ces" | "cze" => "ces",
        "el" | "ell" | "gre" => "ell",
        "he" | "heb" => "heb",
        "th" | "tha" => "tha",
        "vi" | "vie" => "vie",
        "id" | "ind" => "ind",
        "uk" | "ukr" => "ukr",
        "hu" | "hun" => "hun",
        "ro" | "ron" | "rum" => "ron",
        _ => {
            // pass three-letter codes through untouched
            if primary.len() == 3 && primary.chars().all(|c| c.is_ascii_lowercase()) {
                return primary;
            }
            "und"
        }
    };
    mapped.to_string()
}

/// Human-readable track name for a normalised language code.
pub fn language_name_from_code(code: &str) -> &'static str {
    match code {
        "eng" => "English",
        "deu" => "Deutsch",
        "fra" => "Français",
        "spa" => "Español",
        "ita" => "Italiano",
        "por" => "Português",
        "nld" => "Nederlands",
        "rus" => "Русский",
        "jpn" => "日本語",
        "kor" => "한국어",
        "zho" => "中文",
        "yue" => "粵語",
        "ara" => "العربية",
        "hin" => "हिन्दी",
        "tur" => "Türkçe",
        "pol" => "Polski",
        "swe" => "Svenska",
        "dan" => "Dansk",
        "nor" => "Norsk",
        "fin" => "Suomi",
        "ces" => "Čeština",
        "ell" => "Ελληνικά",
        "heb" => "עברית",
        "tha" => "ไทย",
        "vie" => "Tiếng Việt",
        "ind" => "Bahasa Indonesia",
        "ukr" => "Українська",
        "hun" => "Magyar",
        "ron" => "Română",
        _ => "",
    }
}
