// Tests for the HLS parsing path: a master playlist with an AES-128 media
// rendition, parsed from inline fixtures without any network access.

use std::collections::HashMap;
use std::time::Duration;

use abr_dl::hls::{parse_m3u8, HlsKeyOverride};
use abr_dl::net::HttpFetcher;
use abr_dl::select::{select_tracks, sort_tracks, TrackFilter};
use abr_dl::track::{EncryptMethod, MediaKind};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(Duration::from_secs(5), None).unwrap()
}

#[tokio::test]
async fn test_master_with_audio_group_and_selection() {
    let master = "#EXTM3U\n\
        #EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"English stereo\",LANGUAGE=\"en\",URI=\"audio.m3u8\"\n\
        #EXT-X-STREAM-INF:BANDWIDTH=3000000,CODECS=\"avc1.640028,mp4a.40.2\",RESOLUTION=1920x1080,AUDIO=\"aud\"\n\
        video_3000k.m3u8\n\
        #EXT-X-STREAM-INF:BANDWIDTH=1200000,CODECS=\"avc1.64001f,mp4a.40.2\",RESOLUTION=1280x720,AUDIO=\"aud\"\n\
        video_1200k.m3u8\n";
    let mut tracks = parse_m3u8(
        master,
        "https://example.net/stream/master.m3u8",
        &fetcher(),
        &HashMap::new(),
        &HlsKeyOverride::default(),
    )
    .await
    .unwrap();
    assert_eq!(tracks.len(), 3);

    sort_tracks(&mut tracks);
    let selected = select_tracks(
        &tracks,
        &TrackFilter::parse("best").unwrap(),
        &TrackFilter::parse("all").unwrap(),
        &TrackFilter::parse("all").unwrap(),
    );
    // best video plus the one audio rendition
    assert_eq!(selected.len(), 2);
    assert_eq!(selected[0].kind, MediaKind::Video);
    assert_eq!(selected[0].bandwidth, Some(3_000_000));
    assert_eq!(selected[0].audio_link.as_deref(), Some("aud"));
    assert_eq!(selected[1].kind, MediaKind::Audio);
    assert_eq!(selected[1].name, "English stereo");
}

#[tokio::test]
async fn test_aes_media_playlist_inline_key() {
    let key_bytes: Vec<u8> = (0u8..16).collect();
    let media = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n\
         #EXT-X-KEY:METHOD=AES-128,URI=\"base64:{}\",IV=0x00000000000000000000000000001234\n\
         {}#EXT-X-ENDLIST\n",
        BASE64.encode(&key_bytes),
        (0..10).map(|i| format!("#EXTINF:4.0,\nseg{i}.ts\n")).collect::<String>()
    );
    let tracks = parse_m3u8(
        &media,
        "https://example.net/stream/video_3000k.m3u8",
        &fetcher(),
        &HashMap::new(),
        &HlsKeyOverride::default(),
    )
    .await
    .unwrap();
    assert_eq!(tracks.len(), 1);
    let playlist = tracks[0].playlist.as_ref().unwrap();
    assert!(!playlist.is_live);
    assert_eq!(playlist.segment_count(), 10);
    assert!((playlist.total_duration() - 40.0).abs() < 1e-9);
    for seg in playlist.all_segments() {
        assert!(seg.is_encrypted);
        assert_eq!(seg.encrypt_info.method, EncryptMethod::Aes128);
        assert_eq!(seg.encrypt_info.key.as_deref(), Some(&key_bytes[..]));
        // the explicit IV applies to every segment
        assert_eq!(seg.encrypt_info.iv.as_ref().unwrap()[14..], [0x12, 0x34]);
    }
    assert_eq!(tracks[0].extension, "ts");
}

#[tokio::test]
async fn test_key_override_wins() {
    let media = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n\
        #EXT-X-KEY:METHOD=AES-128,URI=\"base64:AAAAAAAAAAAAAAAAAAAAAA==\"\n\
        #EXTINF:4.0,\nseg0.ts\n#EXT-X-ENDLIST\n";
    let key_override = HlsKeyOverride {
        method: Some(EncryptMethod::ChaCha20),
        key: Some(vec![0x11; 32]),
        iv: Some(vec![0x22; 12]),
    };
    let tracks = parse_m3u8(
        media,
        "https://example.net/x.m3u8",
        &fetcher(),
        &HashMap::new(),
        &key_override,
    )
    .await
    .unwrap();
    let seg = tracks[0].playlist.as_ref().unwrap().all_segments().next().unwrap();
    assert_eq!(seg.encrypt_info.method, EncryptMethod::ChaCha20);
    assert_eq!(seg.encrypt_info.key.as_deref(), Some(&[0x11u8; 32][..]));
    assert_eq!(seg.encrypt_info.iv.as_deref(), Some(&[0x22u8; 12][..]));
}
