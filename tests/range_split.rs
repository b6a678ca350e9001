// Tests for the single-huge-file range split: 10 MiB logical clips with an
// open-ended final clip.

use abr_dl::fetch::split_into_clips;
use abr_dl::track::MediaSegment;

const MIB: i64 = 1024 * 1024;

fn source() -> MediaSegment {
    MediaSegment::new(0, 0.0, "https://example.net/movie.mp4".into())
}

#[test]
fn test_50_mib_yields_five_clips() {
    let clips = split_into_clips(&source(), 50 * MIB);
    assert_eq!(clips.len(), 5);
    assert_eq!(clips[0].start_range, Some(0));
    assert_eq!(clips[0].expect_length, Some(10 * MIB + 1));
    assert_eq!(clips[0].stop_range(), Some(10 * MIB));
    // each clip starts one past the previous stop
    for pair in clips.windows(2) {
        if let Some(stop) = pair[0].stop_range() {
            assert_eq!(pair[1].start_range, Some(stop + 1));
        }
    }
    // final clip is open-ended
    assert_eq!(clips[4].expect_length, None);
    assert_eq!(clips[4].stop_range(), None);
    // indexes are contiguous from zero
    let indexes: Vec<i64> = clips.iter().map(|c| c.index).collect();
    assert_eq!(indexes, [0, 1, 2, 3, 4]);
}

#[test]
fn test_small_file_is_one_open_ended_clip() {
    let clips = split_into_clips(&source(), 10 * MIB);
    assert_eq!(clips.len(), 1);
    assert_eq!(clips[0].start_range, Some(0));
    assert_eq!(clips[0].expect_length, None);
}

#[test]
fn test_clip_urls_and_encryption_carry_over() {
    let mut seg = source();
    seg.is_encrypted = true;
    let clips = split_into_clips(&seg, 25 * MIB);
    assert_eq!(clips.len(), 3);
    assert!(clips.iter().all(|c| c.url == "https://example.net/movie.mp4"));
    assert!(clips.iter().all(|c| c.is_encrypted));
}
