//! Serde-based parser for the subset of the DASH MPD format (ISO/IEC
//! 23009-1) that segment generation consumes.
//!
//! The MPD format is documented by ISO using an XML Schema at
//! <https://standards.iso.org/ittf/PubliclyAvailableStandards/MPEG-DASH_schema_files/>.
//! When MPD files in practical use diverge from the formal standard, we
//! prefer to interoperate with existing practice. quick-xml + serde ignore
//! unknown fields when deserializing, so the model only has to cover what
//! the walker in `dash.rs` actually reads.

#![allow(non_snake_case)]

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{de, Deserialize};

use crate::AbrError;

/// Parse an XML duration string, as per <https://www.w3.org/TR/xmlschema-2/#duration>.
///
/// The lexical representation is the ISO 8601 extended format `PnYnMnDTnHnMnS`,
/// with 'T' separating the date and time parts. The number of seconds can
/// include decimal digits. Examples seen in manifests: "PT0H0M30.030S",
/// "PT1.2S", "PT1004199059S", "P0Y20M0D".
///
/// Limitations: negative durations are rejected (std::time::Duration cannot
/// represent them), and only the seconds component accepts a fraction.
pub fn parse_xs_duration(s: &str) -> Result<Duration, AbrError> {
    static RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(concat!(
            r"^(?P<sign>[+-])?P",
            r"(?:(?P<years>\d+)Y)?",
            r"(?:(?P<months>\d+)M)?",
            r"(?:(?P<weeks>\d+)W)?",
            r"(?:(?P<days>\d+)D)?",
            r"(?:(?P<hastime>T)",
            r"(?:(?P<hours>\d+)H)?",
            r"(?:(?P<minutes>\d+)M)?",
            r"(?:(?P<seconds>\d+)(?:(?P<nanoseconds>[.,]\d+)?)S)?",
            r")?"
        ))
        .unwrap()
    });
    let m = RE
        .captures(s)
        .ok_or_else(|| AbrError::Parsing(format!("invalid xs:duration {s:?}")))?;
    if m.name("hastime").is_none()
        && m.name("years").is_none()
        && m.name("months").is_none()
        && m.name("weeks").is_none()
        && m.name("days").is_none()
    {
        return Err(AbrError::Parsing(format!("empty xs:duration {s:?}")));
    }
    if m.name("sign").is_some_and(|s| s.as_str() == "-") {
        return Err(AbrError::Parsing("negative xs:duration".into()));
    }
    let mut nsecs: u32 = 0;
    if let Some(frac) = m.name("nanoseconds") {
        let mut digits = &frac.as_str()[1..]; // drop the "." or ","
        if digits.len() > 9 {
            digits = &digits[..9];
        }
        nsecs = format!("{digits:0<9}").parse().unwrap();
    }
    let field = |name: &str| m.name(name).map(|v| v.as_str().parse::<u64>().unwrap()).unwrap_or(0);
    let secs = field("seconds")
        + field("minutes") * 60
        + field("hours") * 3600
        + field("days") * 86_400
        + field("weeks") * 86_400 * 7
        + field("months") * 86_400 * 30
        + field("years") * 86_400 * 365;
    Ok(Duration::new(secs, nsecs))
}

fn deserialize_xs_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: de::Deserializer<'de>,
{
    match <Option<String>>::deserialize(deserializer) {
        Ok(Some(s)) => parse_xs_duration(&s).map(Some).map_err(de::Error::custom),
        _ => Ok(None),
    }
}

/// A URI prefix for segments, specifiable on MPD, Period, AdaptationSet and
/// Representation; nested occurrences resolve against their ancestor.
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BaseURL {
    #[serde(rename = "$text")]
    pub base: String,
}

/// One `<S>` entry: a run of `1 + r` contiguous segments of duration `d`,
/// starting at time `t` (or at the running time when `t` is absent).
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct S {
    #[serde(rename = "@t")]
    pub t: Option<i64>,
    #[serde(rename = "@d")]
    pub d: i64,
    /// Negative means "repeat until the end of the period".
    #[serde(rename = "@r")]
    pub r: Option<i64>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SegmentTimeline {
    #[serde(rename = "S")]
    pub segments: Vec<S>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Initialization {
    #[serde(rename = "@sourceURL")]
    pub sourceURL: Option<String>,
    #[serde(rename = "@range")]
    pub range: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SegmentTemplate {
    #[serde(rename = "@initialization")]
    pub initialization: Option<String>,
    #[serde(rename = "@media")]
    pub media: Option<String>,
    #[serde(rename = "@startNumber")]
    pub startNumber: Option<u64>,
    // the standard says an unsigned int, but floating point values appear
    // in practice (eg. akamaized.net test streams)
    #[serde(rename = "@duration")]
    pub duration: Option<f64>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,
    #[serde(rename = "@presentationTimeOffset")]
    pub presentationTimeOffset: Option<u64>,
    pub SegmentTimeline: Option<SegmentTimeline>,
}

impl SegmentTemplate {
    /// The inner (Representation-level) template overrides the outer
    /// (AdaptationSet-level) one attribute by attribute.
    pub fn merged_with(&self, outer: &SegmentTemplate) -> SegmentTemplate {
        SegmentTemplate {
            initialization: self.initialization.clone().or_else(|| outer.initialization.clone()),
            media: self.media.clone().or_else(|| outer.media.clone()),
            startNumber: self.startNumber.or(outer.startNumber),
            duration: self.duration.or(outer.duration),
            timescale: self.timescale.or(outer.timescale),
            presentationTimeOffset: self.presentationTimeOffset.or(outer.presentationTimeOffset),
            SegmentTimeline: self.SegmentTimeline.clone().or_else(|| outer.SegmentTimeline.clone()),
        }
    }
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SegmentBase {
    #[serde(rename = "Initialization")]
    pub initialization: Option<Initialization>,
    #[serde(rename = "@indexRange")]
    pub indexRange: Option<String>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SegmentURL {
    #[serde(rename = "@media")]
    pub media: Option<String>,
    #[serde(rename = "@mediaRange")]
    pub mediaRange: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SegmentList {
    #[serde(rename = "@duration")]
    pub duration: Option<u64>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,
    pub Initialization: Option<Initialization>,
    #[serde(rename = "SegmentURL")]
    pub segment_urls: Vec<SegmentURL>,
}

/// Contains information on the DRM mechanism protecting the stream. Its mere
/// presence marks every segment of the representation as CENC-encrypted.
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ContentProtection {
    #[serde(rename = "@schemeIdUri")]
    pub schemeIdUri: Option<String>,
    #[serde(rename = "@cenc:default_KID", alias = "@default_KID")]
    pub default_KID: Option<String>,
    #[serde(rename = "@value")]
    pub value: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Role {
    #[serde(rename = "@schemeIdUri")]
    pub schemeIdUri: Option<String>,
    #[serde(rename = "@value")]
    pub value: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AudioChannelConfiguration {
    #[serde(rename = "@schemeIdUri")]
    pub schemeIdUri: Option<String>,
    #[serde(rename = "@value")]
    pub value: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Representation {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@bandwidth")]
    pub bandwidth: Option<u64>,
    #[serde(rename = "@width")]
    pub width: Option<u64>,
    #[serde(rename = "@height")]
    pub height: Option<u64>,
    #[serde(rename = "@frameRate")]
    pub frameRate: Option<String>, // can be something like "30000/1001"
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "@mimeType")]
    pub mimeType: Option<String>,
    #[serde(rename = "@lang")]
    pub lang: Option<String>,
    #[serde(rename = "@volumeAdjust")]
    pub volumeAdjust: Option<String>,
    pub BaseURL: Vec<BaseURL>,
    pub Role: Vec<Role>,
    pub SegmentBase: Option<SegmentBase>,
    pub SegmentList: Option<SegmentList>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    pub AudioChannelConfiguration: Vec<AudioChannelConfiguration>,
    pub ContentProtection: Vec<ContentProtection>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AdaptationSet {
    #[serde(rename = "@contentType")]
    pub contentType: Option<String>,
    #[serde(rename = "@mimeType")]
    pub mimeType: Option<String>,
    #[serde(rename = "@frameRate")]
    pub frameRate: Option<String>,
    #[serde(rename = "@lang")]
    pub lang: Option<String>,
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    pub BaseURL: Vec<BaseURL>,
    pub Role: Vec<Role>,
    #[serde(rename = "Representation")]
    pub representations: Vec<Representation>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    pub AudioChannelConfiguration: Vec<AudioChannelConfiguration>,
    pub ContentProtection: Vec<ContentProtection>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Period {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@duration", deserialize_with = "deserialize_xs_duration")]
    pub duration: Option<Duration>,
    pub BaseURL: Vec<BaseURL>,
    #[serde(rename = "AdaptationSet")]
    pub adaptations: Vec<AdaptationSet>,
}

/// The root of a parsed MPD manifest.
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MPD {
    #[serde(rename = "@type")]
    pub mpdtype: Option<String>,
    #[serde(rename = "@availabilityStartTime")]
    pub availabilityStartTime: Option<String>,
    #[serde(rename = "@timeShiftBufferDepth", deserialize_with = "deserialize_xs_duration")]
    pub timeShiftBufferDepth: Option<Duration>,
    #[serde(rename = "@publishTime")]
    pub publishTime: Option<String>,
    #[serde(rename = "@mediaPresentationDuration", deserialize_with = "deserialize_xs_duration")]
    pub mediaPresentationDuration: Option<Duration>,
    #[serde(rename = "@maxSegmentDuration")]
    pub maxSegmentDuration: Option<String>,
    #[serde(rename = "BaseURL")]
    pub base_url: Vec<BaseURL>,
    #[serde(rename = "Period")]
    pub periods: Vec<Period>,
}

impl MPD {
    pub fn is_dynamic(&self) -> bool {
        self.mpdtype.as_deref() == Some("dynamic")
    }
}

/// Parse an MPD document.
pub fn parse(xml: &str) -> Result<MPD, AbrError> {
    quick_xml::de::from_str(xml).map_err(|e| AbrError::Parsing(format!("MPD XML: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xs_duration() {
        assert_eq!(parse_xs_duration("PT30S").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_xs_duration("PT1M30.5S").unwrap(), Duration::from_millis(90_500));
        assert_eq!(parse_xs_duration("PT1H2M3S").unwrap(), Duration::from_secs(3_723));
        assert_eq!(parse_xs_duration("P1DT2H").unwrap(), Duration::from_secs(93_600));
        assert_eq!(parse_xs_duration("PT72H").unwrap(), Duration::from_secs(259_200));
        assert!(parse_xs_duration("1H2M").is_err());
        assert!(parse_xs_duration("P").is_err());
        assert!(parse_xs_duration("-PT30S").is_err());
    }

    #[test]
    fn test_minimal_mpd() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <MPD type="static" mediaPresentationDuration="PT20S"><Period></Period></MPD>"#;
        let mpd = parse(xml).unwrap();
        assert!(!mpd.is_dynamic());
        assert_eq!(mpd.periods.len(), 1);
        assert_eq!(mpd.mediaPresentationDuration, Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_segment_template_merge() {
        let inner = SegmentTemplate {
            media: Some("seg-$Number$.m4s".into()),
            ..Default::default()
        };
        let outer = SegmentTemplate {
            media: Some("outer-$Number$.m4s".into()),
            initialization: Some("init.mp4".into()),
            timescale: Some(1000),
            ..Default::default()
        };
        let merged = inner.merged_with(&outer);
        assert_eq!(merged.media.as_deref(), Some("seg-$Number$.m4s"));
        assert_eq!(merged.initialization.as_deref(), Some("init.mp4"));
        assert_eq!(merged.timescale, Some(1000));
    }

    #[test]
    fn test_timeline_and_protection_parse() {
        let xml = r#"<MPD type="static" mediaPresentationDuration="PT5S">
          <Period>
            <AdaptationSet contentType="video" mimeType="video/mp4">
              <ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" cenc:default_KID="33363237-3430-3932-3735-343133363433"/>
              <SegmentTemplate timescale="1000" initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/$Time$.m4s">
                <SegmentTimeline>
                  <S t="0" d="1000" r="4"/>
                </SegmentTimeline>
              </SegmentTemplate>
              <Representation id="1080p" bandwidth="5000000" width="1920" height="1080"/>
            </AdaptationSet>
          </Period>
        </MPD>"#;
        let mpd = parse(xml).unwrap();
        let adaptation = &mpd.periods[0].adaptations[0];
        assert_eq!(adaptation.ContentProtection.len(), 1);
        let timeline = adaptation.SegmentTemplate.as_ref().unwrap().SegmentTimeline.as_ref().unwrap();
        assert_eq!(timeline.segments[0].r, Some(4));
        assert_eq!(adaptation.representations[0].id.as_deref(), Some("1080p"));
    }
}
