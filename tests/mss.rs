// Tests for Smooth Streaming: manifest parsing and init-box synthesis from
// the manifest's CodecPrivateData plus a first fragment.

use abr_dl::mp4;
use abr_dl::mss::parse_manifest;
use abr_dl::track::MediaKind;

const AAC_MANIFEST: &str = r#"<?xml version="1.0"?>
<SmoothStreamingMedia MajorVersion="2" MinorVersion="1" TimeScale="10000000" Duration="60000000">
  <StreamIndex Type="audio" Name="audio" Language="eng"
               Url="QualityLevels({bitrate})/Fragments(audio={start time})">
    <QualityLevel Index="0" Bitrate="128000" FourCC="AACL" SamplingRate="44100"
                  Channels="2" BitsPerSample="16" CodecPrivateData="1210"/>
    <c t="0" d="20000000" r="3"/>
  </StreamIndex>
</SmoothStreamingMedia>"#;

fn make_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend(fourcc);
    out.extend(body);
    out
}

fn make_full_box(fourcc: &[u8; 4], version: u8, flags: u32, body: &[u8]) -> Vec<u8> {
    let mut inner = vec![version];
    inner.extend(&flags.to_be_bytes()[1..]);
    inner.extend(body);
    make_box(fourcc, &inner)
}

fn fragment_with_track_id(track_id: u32) -> Vec<u8> {
    let tfhd = make_full_box(b"tfhd", 0, 0, &track_id.to_be_bytes());
    make_box(b"moof", &make_box(b"traf", &tfhd))
}

#[test]
fn test_aac_track_model() {
    let tracks = parse_manifest(AAC_MANIFEST, "https://example.net/a.ism/Manifest").unwrap();
    assert_eq!(tracks.len(), 1);
    let track = &tracks[0];
    assert_eq!(track.kind, MediaKind::Audio);
    assert_eq!(track.codecs, "mp4a.40.2");
    assert_eq!(track.language, "eng");
    assert_eq!(track.extension, "m4s");
    let playlist = track.playlist.as_ref().unwrap();
    // r="3" is a 1-based total: three fragments
    assert_eq!(playlist.segment_count(), 3);
    let mss = track.mss_data.as_ref().unwrap();
    assert_eq!(mss.codec_private_data, "1210");
    assert_eq!(mss.sampling_rate, 44_100);
}

#[test]
fn test_fragment_urls_follow_start_times() {
    let tracks = parse_manifest(AAC_MANIFEST, "https://example.net/a.ism/Manifest").unwrap();
    let playlist = tracks[0].playlist.as_ref().unwrap();
    let urls: Vec<&str> = playlist.all_segments().map(|s| s.url.as_str()).collect();
    assert!(urls[0].ends_with("Fragments(audio=0)"));
    assert!(urls[1].ends_with("Fragments(audio=20000000)"));
    assert!(urls[2].ends_with("Fragments(audio=40000000)"));
    // durations come from d / TimeScale
    assert!(playlist.all_segments().all(|s| (s.duration - 2.0).abs() < 1e-9));
}

#[test]
fn test_init_box_synthesis_carries_codec_private_data() {
    let tracks = parse_manifest(AAC_MANIFEST, "https://example.net/a.ism/Manifest").unwrap();
    let mut processor = abr_dl::mss_moov::MssMoovProcessor::new(&tracks[0]).unwrap();
    let header = processor.gen_header(&fragment_with_track_id(2)).unwrap();

    // the header is a well-formed moov tree with the manifest's timescale
    let mdhd = mp4::find_box_path(&header, &[b"moov", b"trak", b"mdia", b"mdhd"]).unwrap();
    assert_eq!(mp4::mdhd_timescale(mdhd), Some(10_000_000));

    // the mp4a/esds sample entry embeds the AudioSpecificConfig [0x12, 0x10]
    let stsd = mp4::find_box_path(
        &header,
        &[b"moov", b"trak", b"mdia", b"minf", b"stbl", b"stsd"],
    )
    .unwrap();
    let (_, _, entries) = mp4::full_box(stsd).unwrap();
    let mp4a = mp4::find_box(&entries[4..], b"mp4a").expect("mp4a sample entry");
    assert!(mp4a.windows(2).any(|w| w == [0x12, 0x10]));

    // and the mvex/trex matches the fragment's track id
    let trex = mp4::find_box_path(&header, &[b"moov", b"mvex", b"trex"]).unwrap();
    let (_, _, body) = mp4::full_box(trex).unwrap();
    assert_eq!(&body[..4], &2u32.to_be_bytes());
}
