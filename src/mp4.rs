//! Minimal ISO-BMFF (MP4) box parsing.
//!
//! Just enough of the box grammar for the pipeline's needs: finding the
//! Widevine KID in an init segment (`pssh` / `tenc`), reading fragment timing
//! (`mdhd` / `tfdt` / `tfhd` / `trun`) for embedded WebVTT, and pulling
//! `mdat` payloads for subtitle extraction. Boxes are walked over byte
//! slices; nothing is allocated for boxes we do not care about.

use crate::util::normalize_kid;

/// The protection system identifier Widevine writes into `pssh` boxes.
pub const WIDEVINE_SYSTEM_ID: [u8; 16] = [
    0xed, 0xef, 0x8b, 0xa9, 0x79, 0xd6, 0x4a, 0xce, 0xa3, 0xc8, 0x27, 0xdc, 0xd5, 0x1d, 0x21, 0xed,
];

/// Box types that only contain other boxes and are safe to descend into.
const CONTAINER_BOXES: &[&[u8; 4]] = &[
    b"moov", b"trak", b"mdia", b"minf", b"stbl", b"mvex", b"moof", b"traf", b"edts", b"sinf",
    b"schi",
];

/// A parsed box header: `(total_size, fourcc, header_len)`. Handles 32-bit
/// sizes, 64-bit extended sizes (`size == 1`) and to-end-of-data (`size == 0`).
pub fn read_box_header(data: &[u8]) -> Option<(usize, [u8; 4], usize)> {
    if data.len() < 8 {
        return None;
    }
    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let fourcc = [data[4], data[5], data[6], data[7]];
    if size == 1 {
        if data.len() < 16 {
            return None;
        }
        let ext = u64::from_be_bytes(data[8..16].try_into().unwrap());
        Some((ext as usize, fourcc, 16))
    } else if size == 0 {
        Some((data.len(), fourcc, 8))
    } else {
        Some((size as usize, fourcc, 8))
    }
}

/// Iterate over the sibling boxes in `data`, yielding `(fourcc, payload)`.
pub fn boxes(data: &[u8]) -> BoxIter<'_> {
    BoxIter { data, pos: 0 }
}

pub struct BoxIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for BoxIter<'a> {
    type Item = ([u8; 4], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let (size, fourcc, header_len) = read_box_header(rest)?;
        if size < header_len || size > rest.len() {
            return None;
        }
        self.pos += size;
        Some((fourcc, &rest[header_len..size]))
    }
}

/// First box named `target` among the siblings in `data`.
pub fn find_box<'a>(data: &'a [u8], target: &[u8; 4]) -> Option<&'a [u8]> {
    boxes(data).find(|(name, _)| name == target).map(|(_, payload)| payload)
}

/// Follow a path of nested box names from `data`, returning the payload of
/// the final box.
pub fn find_box_path<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> Option<&'a [u8]> {
    let mut current = data;
    for name in path {
        current = find_box(current, name)?;
    }
    Some(current)
}

/// Split a full-box payload into `(version, flags, rest)`.
pub fn full_box(payload: &[u8]) -> Option<(u8, u32, &[u8])> {
    if payload.len() < 4 {
        return None;
    }
    let version = payload[0];
    let flags = u32::from_be_bytes([0, payload[1], payload[2], payload[3]]);
    Some((version, flags, &payload[4..]))
}

fn collect_named<'a>(data: &'a [u8], target: &[u8; 4], out: &mut Vec<&'a [u8]>) {
    for (name, payload) in boxes(data) {
        if &name == target {
            out.push(payload);
        } else if CONTAINER_BOXES.contains(&&name) {
            collect_named(payload, target, out);
        }
    }
}

/// All boxes named `target` anywhere under `data`, descending through the
/// known container boxes.
pub fn collect_boxes<'a>(data: &'a [u8], target: &[u8; 4]) -> Vec<&'a [u8]> {
    let mut out = Vec::new();
    collect_named(data, target, &mut out);
    out
}

/// Look for a Widevine `pssh` box and return the KID: the last 16 bytes of
/// the box payload, hex-encoded without dashes. The scan for the SystemID is
/// position-independent so that version 0 and version 1 boxes (and re-muxed
/// oddities) are all accepted.
pub fn find_widevine_kid(data: &[u8]) -> Option<String> {
    for pssh in collect_boxes(data, b"pssh") {
        if pssh.len() < 32 {
            continue;
        }
        let has_widevine = pssh.windows(16).any(|w| w == WIDEVINE_SYSTEM_ID.as_slice());
        if has_widevine {
            return Some(normalize_kid(&hex::encode(&pssh[pssh.len() - 16..])));
        }
    }
    None
}

/// Default KID from a `tenc` box (inside `sinf/schi` of an encrypted sample
/// entry): 16 bytes at offset 8 of the full-box payload.
pub fn find_default_kid(data: &[u8]) -> Option<String> {
    for tenc in collect_boxes(data, b"tenc") {
        if let Some((_, _, rest)) = full_box(tenc) {
            if rest.len() >= 24 {
                return Some(normalize_kid(&hex::encode(&rest[8..24])));
            }
        }
    }
    // sample entries are not plain containers; fall back to a raw scan for
    // the fourcc the way re-muxed streams are usually probed
    let needle = b"tenc";
    for i in 0..data.len().saturating_sub(28) {
        if &data[i..i + 4] == needle {
            let kid = &data[i + 12..i + 28];
            if kid.iter().any(|b| *b != 0) {
                return Some(normalize_kid(&hex::encode(kid)));
            }
        }
    }
    None
}

/// Timescale from an `mdhd` full-box payload.
pub fn mdhd_timescale(payload: &[u8]) -> Option<u32> {
    let (version, _, rest) = full_box(payload)?;
    // creation_time and modification_time precede the timescale
    let offset = if version == 1 { 16 } else { 8 };
    if rest.len() < offset + 4 {
        return None;
    }
    Some(u32::from_be_bytes(rest[offset..offset + 4].try_into().unwrap()))
}

/// Base media decode time from a `tfdt` full-box payload (32- or 64-bit).
pub fn tfdt_base_time(payload: &[u8]) -> Option<u64> {
    let (version, _, rest) = full_box(payload)?;
    if version == 1 {
        if rest.len() < 8 {
            return None;
        }
        Some(u64::from_be_bytes(rest[..8].try_into().unwrap()))
    } else {
        if rest.len() < 4 {
            return None;
        }
        Some(u32::from_be_bytes(rest[..4].try_into().unwrap()) as u64)
    }
}

/// Track fragment header. Flags drive which optional fields are present.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tfhd {
    pub track_id: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
}

pub fn parse_tfhd(payload: &[u8]) -> Option<Tfhd> {
    let (_, flags, rest) = full_box(payload)?;
    let mut r = Reader::new(rest);
    let mut tfhd = Tfhd { track_id: r.u32()?, ..Default::default() };
    if flags & 0x000001 != 0 {
        r.skip(8)?; // base_data_offset
    }
    if flags & 0x000002 != 0 {
        r.skip(4)?; // sample_description_index
    }
    if flags & 0x000008 != 0 {
        tfhd.default_sample_duration = r.u32()?;
    }
    if flags & 0x000010 != 0 {
        tfhd.default_sample_size = r.u32()?;
    }
    Some(tfhd)
}

/// One sample row of a `trun` box.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrunSample {
    pub duration: u32,
    pub size: u32,
    pub composition_time_offset: i32,
}

pub fn parse_trun(payload: &[u8]) -> Option<Vec<TrunSample>> {
    let (_, flags, rest) = full_box(payload)?;
    let mut r = Reader::new(rest);
    let sample_count = r.u32()?;
    if flags & 0x000001 != 0 {
        r.skip(4)?; // data_offset
    }
    if flags & 0x000004 != 0 {
        r.skip(4)?; // first_sample_flags
    }
    let mut samples = Vec::with_capacity(sample_count as usize);
    for _ in 0..sample_count {
        let mut sample = TrunSample::default();
        if flags & 0x000100 != 0 {
            sample.duration = r.u32()?;
        }
        if flags & 0x000200 != 0 {
            sample.size = r.u32()?;
        }
        if flags & 0x000400 != 0 {
            r.skip(4)?; // sample_flags
        }
        if flags & 0x000800 != 0 {
            sample.composition_time_offset = r.u32()? as i32;
        }
        samples.push(sample);
    }
    Some(samples)
}

/// `track_ID` of the first `moof/traf/tfhd` in a media fragment. Used to
/// synthesise an MSS init box matching the fragments.
pub fn first_fragment_track_id(data: &[u8]) -> Option<u32> {
    let tfhd = find_box_path(data, &[b"moof", b"traf", b"tfhd"])?;
    parse_tfhd(tfhd).map(|t| t.track_id)
}

/// Payload of the first `mdat` box.
pub fn first_mdat(data: &[u8]) -> Option<&[u8]> {
    find_box(data, b"mdat")
}

/// Concatenated payloads of every top-level `mdat` box.
pub fn concat_mdat(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, payload) in boxes(data) {
        if &name == b"mdat" {
            out.extend_from_slice(payload);
        }
    }
    out
}

/// `payl` (cue text) and `sttg` (cue settings) from one `vttc` sample. A
/// sample may be a bare `vttc` box or a `vtte` (empty cue), in which case
/// `None` is returned.
pub fn parse_vttc_sample(sample: &[u8]) -> Option<(String, String)> {
    for (name, payload) in boxes(sample) {
        if &name == b"vttc" {
            let payl = find_box(payload, b"payl")
                .map(|d| String::from_utf8_lossy(d).trim_end_matches('\0').to_string());
            let sttg = find_box(payload, b"sttg")
                .map(|d| String::from_utf8_lossy(d).trim_end_matches('\0').to_string());
            if let Some(text) = payl {
                return Some((text, sttg.unwrap_or_default()));
            }
        }
    }
    None
}

/// Big-endian cursor over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        if self.pos + n > self.data.len() {
            return None;
        }
        self.pos += n;
        Some(())
    }

    fn u32(&mut self) -> Option<u32> {
        if self.pos + 4 > self.data.len() {
            return None;
        }
        let v = u32::from_be_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Some(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + body.len());
        out.extend_from_slice(&((8 + body.len()) as u32).to_be_bytes());
        out.extend_from_slice(fourcc);
        out.extend_from_slice(body);
        out
    }

    fn make_full_box(fourcc: &[u8; 4], version: u8, flags: u32, body: &[u8]) -> Vec<u8> {
        let mut payload = vec![version];
        payload.extend_from_slice(&flags.to_be_bytes()[1..]);
        payload.extend_from_slice(body);
        make_box(fourcc, &payload)
    }

    #[test]
    fn test_box_iteration() {
        let mut data = make_box(b"ftyp", b"isom");
        data.extend(make_box(b"free", b""));
        let names: Vec<[u8; 4]> = boxes(&data).map(|(n, _)| n).collect();
        assert_eq!(names, vec![*b"ftyp", *b"free"]);
        assert_eq!(find_box(&data, b"ftyp"), Some(&b"isom"[..]));
        assert_eq!(find_box(&data, b"mdat"), None);
    }

    #[test]
    fn test_truncated_box_stops_iteration() {
        let mut data = make_box(b"ftyp", b"isom");
        data.extend_from_slice(&[0, 0, 0, 99, b'm', b'd', b'a', b't']);
        let names: Vec<[u8; 4]> = boxes(&data).map(|(n, _)| n).collect();
        assert_eq!(names, vec![*b"ftyp"]);
    }

    #[test]
    fn test_widevine_kid_from_pssh() {
        let kid = [0xabu8; 16];
        let mut body = vec![0u8; 4]; // version 0 + flags
        body.extend_from_slice(&WIDEVINE_SYSTEM_ID);
        body.extend_from_slice(&20u32.to_be_bytes());
        body.extend_from_slice(&[0u8; 4]); // some pssh data prefix
        body.extend_from_slice(&kid);
        let moov = make_box(b"moov", &make_box(b"pssh", &body));
        assert_eq!(find_widevine_kid(&moov), Some("ab".repeat(16)));
    }

    #[test]
    fn test_non_widevine_pssh_ignored() {
        let mut body = vec![0u8; 4];
        body.extend_from_slice(&[0x11u8; 16]); // some other system
        body.extend_from_slice(&[0u8; 20]);
        let moov = make_box(b"moov", &make_box(b"pssh", &body));
        assert_eq!(find_widevine_kid(&moov), None);
    }

    #[test]
    fn test_mdhd_timescale_versions() {
        let mut v0 = vec![0u8; 8]; // creation + modification (32-bit each)
        v0.extend_from_slice(&90_000u32.to_be_bytes());
        v0.extend_from_slice(&[0u8; 8]);
        let b = make_full_box(b"mdhd", 0, 0, &v0);
        let (_, payload) = boxes(&b).next().unwrap();
        assert_eq!(mdhd_timescale(payload), Some(90_000));

        let mut v1 = vec![0u8; 16]; // creation + modification (64-bit each)
        v1.extend_from_slice(&1_000u32.to_be_bytes());
        let b = make_full_box(b"mdhd", 1, 0, &v1);
        let (_, payload) = boxes(&b).next().unwrap();
        assert_eq!(mdhd_timescale(payload), Some(1_000));
    }

    #[test]
    fn test_tfdt_base_time() {
        let b = make_full_box(b"tfdt", 0, 0, &123u32.to_be_bytes());
        let (_, payload) = boxes(&b).next().unwrap();
        assert_eq!(tfdt_base_time(payload), Some(123));
        let b = make_full_box(b"tfdt", 1, 0, &(1u64 << 40).to_be_bytes());
        let (_, payload) = boxes(&b).next().unwrap();
        assert_eq!(tfdt_base_time(payload), Some(1 << 40));
    }

    #[test]
    fn test_tfhd_flag_driven_fields() {
        let mut body = 7u32.to_be_bytes().to_vec(); // track_ID
        body.extend_from_slice(&4_000u32.to_be_bytes()); // default_sample_duration
        let b = make_full_box(b"tfhd", 0, 0x000008, &body);
        let (_, payload) = boxes(&b).next().unwrap();
        let tfhd = parse_tfhd(payload).unwrap();
        assert_eq!(tfhd.track_id, 7);
        assert_eq!(tfhd.default_sample_duration, 4_000);
        assert_eq!(tfhd.default_sample_size, 0);
    }

    #[test]
    fn test_trun_samples() {
        let mut body = 2u32.to_be_bytes().to_vec(); // sample_count
        body.extend_from_slice(&100u32.to_be_bytes()); // duration 0
        body.extend_from_slice(&64u32.to_be_bytes()); // size 0
        body.extend_from_slice(&200u32.to_be_bytes()); // duration 1
        body.extend_from_slice(&32u32.to_be_bytes()); // size 1
        let b = make_full_box(b"trun", 0, 0x000300, &body);
        let (_, payload) = boxes(&b).next().unwrap();
        let samples = parse_trun(payload).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].duration, 100);
        assert_eq!(samples[1].size, 32);
    }

    #[test]
    fn test_vttc_sample() {
        let payl = make_box(b"payl", b"Hello cue");
        let sttg = make_box(b"sttg", b"line:85%");
        let mut vttc_body = payl;
        vttc_body.extend(sttg);
        let sample = make_box(b"vttc", &vttc_body);
        let (text, settings) = parse_vttc_sample(&sample).unwrap();
        assert_eq!(text, "Hello cue");
        assert_eq!(settings, "line:85%");
        let empty = make_box(b"vtte", b"");
        assert_eq!(parse_vttc_sample(&empty), None);
    }

    #[test]
    fn test_first_fragment_track_id() {
        let tfhd = make_full_box(b"tfhd", 0, 0, &42u32.to_be_bytes());
        let traf = make_box(b"traf", &tfhd);
        let moof = make_box(b"moof", &traf);
        assert_eq!(first_fragment_track_id(&moof), Some(42));
    }
}
