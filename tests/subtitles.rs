// Tests for the subtitle extraction flows: TTML-in-fMP4 with concatenated
// <tt> roots, image cues, and SRT emission.

use abr_dl::subtitle::{extract_sub, extract_ttml_from_mp4s, write_image_pngs};
use abr_dl::webvtt::{format_srt_time, WebVttSub};

fn make_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend(fourcc);
    out.extend(body);
    out
}

fn ttml_doc(start: &str, end: &str, text: &str) -> String {
    format!(
        r#"<tt xmlns="http://www.w3.org/ns/ttml"><body><div><p begin="{start}" end="{end}">{text}</p></div></body></tt>"#
    )
}

#[test]
fn test_stpp_segments_with_multiple_roots() {
    // two m4s files whose mdat payloads each hold two concatenated <tt>
    // roots: SplitMultipleRootElements must yield four parses in total
    let dir = tempfile::tempdir().unwrap();
    let mut paths = Vec::new();
    let docs = [
        (ttml_doc("00:00:06.000", "00:00:07.000", "four"),
         ttml_doc("00:00:02.000", "00:00:03.000", "two")),
        (ttml_doc("00:00:08.000", "00:00:09.000", "five"),
         ttml_doc("00:00:00.500", "00:00:01.000", "one")),
    ];
    for (i, (a, b)) in docs.iter().enumerate() {
        let mdat = make_box(b"mdat", format!("{a}{b}").as_bytes());
        let path = dir.path().join(format!("{i}.m4s"));
        std::fs::write(&path, &mdat).unwrap();
        paths.push(path);
    }

    let vtt = extract_ttml_from_mp4s(&paths).unwrap();
    assert_eq!(vtt.cues.len(), 4);
    // globally sorted by start time regardless of file order
    let payloads: Vec<&str> = vtt.cues.iter().map(|c| c.payload.as_str()).collect();
    assert_eq!(payloads, ["one", "two", "four", "five"]);

    let srt = vtt.to_srt();
    assert!(srt.starts_with("1\n00:00:00,500 --> 00:00:01,000\none\n"));
    assert!(srt.contains("4\n00:00:08,000 --> 00:00:09,000\nfive\n"));
}

#[test]
fn test_image_cues_written_as_numbered_pngs() {
    let doc = r##"<tt xmlns:smpte="urn:smpte"><head><metadata>
        <smpte:image imagetype="PNG" encoding="Base64" xml:id="i0">Zmlyc3Q=</smpte:image>
        <smpte:image imagetype="PNG" encoding="Base64" xml:id="i1">c2Vjb25k</smpte:image>
      </metadata></head><body><div>
        <p begin="00:00:00.000" end="00:00:01.000" smpte:backgroundImage="#i0"></p>
        <p begin="00:00:01.000" end="00:00:02.000" smpte:backgroundImage="#i1"></p>
      </div></body></tt>"##;
    let mut vtt = extract_sub(&[doc.to_string()]);
    assert_eq!(vtt.cues.len(), 2);
    assert!(vtt.cues.iter().all(|c| c.is_image));

    let dir = tempfile::tempdir().unwrap();
    write_image_pngs(&mut vtt, dir.path()).unwrap();
    assert_eq!(vtt.cues[0].payload, "0.png");
    assert_eq!(vtt.cues[1].payload, "1.png");
    assert_eq!(std::fs::read(dir.path().join("0.png")).unwrap(), b"first");
    assert_eq!(std::fs::read(dir.path().join("1.png")).unwrap(), b"second");
}

#[test]
fn test_cue_merge_across_segments_shifts_by_mpegts_base() {
    // segments with X-TIMESTAMP-MAP bases 90000 apart are one second apart
    let seg0 = "WEBVTT\nX-TIMESTAMP-MAP=MPEGTS:0,LOCAL:00:00:00.000\n\n\
                00:00:00.000 --> 00:00:01.000\nfirst\n";
    let seg1 = "WEBVTT\nX-TIMESTAMP-MAP=MPEGTS:90000,LOCAL:00:00:00.000\n\n\
                00:00:00.000 --> 00:00:01.000\nsecond\n";
    let mut merged = WebVttSub::parse(seg0);
    merged.append(&WebVttSub::parse(seg1));
    assert_eq!(merged.cues.len(), 2);
    assert_eq!(merged.cues[1].start, 1_000);
    assert_eq!(format_srt_time(merged.cues[1].start), "00:00:01,000");
}

#[test]
fn test_skipped_duration_left_shift() {
    let mut vtt = WebVttSub::parse(
        "WEBVTT\n\n00:00:09.500 --> 00:00:11.000\nlate cue\n",
    );
    vtt.left_shift(10_000);
    assert_eq!(vtt.cues[0].start, 0);
    assert_eq!(vtt.cues[0].end, 1_000);
}
