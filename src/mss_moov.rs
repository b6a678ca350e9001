//! Synthesis of an fMP4 init segment for Smooth Streaming tracks.
//!
//! MSS servers ship bare `moof`+`mdat` fragments; a playable file needs a
//! `moov` header describing the track. We build one from the manifest's
//! `CodecPrivateData`: a full `moov { mvhd, trak { tkhd, mdia { mdhd, hdlr,
//! minf { smhd|vmhd|sthd, dinf, stbl } } }, mvex { mehd, trex } }` tree,
//! with an `mp4a`+`esds` sample entry for audio, `avc1`/`hvc1` for video
//! and `stpp` for TTML text. The `track_ID` is read from the first
//! downloaded fragment's `tfhd` so the header matches the fragments.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;

use crate::mp4;
use crate::track::Track;
use crate::util::parse_hex;
use crate::AbrError;

const TRACK_ENABLED: u32 = 0x1;
const TRACK_IN_MOVIE: u32 = 0x2;
const TRACK_IN_PREVIEW: u32 = 0x4;
const SELF_CONTAINED: u32 = 0x1;

/// Builds the init box for one MSS track.
pub struct MssMoovProcessor {
    track_id: u32,
    four_cc: String,
    codec_private_data: String,
    timescale: u32,
    duration: u64,
    language: [u8; 3],
    width: u16,
    height: u16,
    stream_type: String,
    channels: u16,
    bits_per_sample: u16,
    sampling_rate: u32,
    nal_unit_length_field: u8,
    bandwidth: u32,
    creation_time: u64,
    is_protection: bool,
    protection_system_id: String,
    protection_data: String,
}

impl MssMoovProcessor {
    pub fn new(track: &Track) -> Result<MssMoovProcessor, AbrError> {
        let data = track
            .mss_data
            .as_ref()
            .ok_or_else(|| AbrError::InitBoxGeneration("track carries no MSS data".into()))?;
        let (width, height) = match track.resolution.split_once('x') {
            Some((w, h)) => (w.parse().unwrap_or(0), h.parse().unwrap_or(0)),
            None => (0, 0),
        };
        let mut language = *b"und";
        if track.language.len() == 3 && track.language.is_ascii() {
            language.copy_from_slice(track.language.as_bytes());
        }
        Ok(MssMoovProcessor {
            track_id: 2,
            four_cc: data.four_cc.clone(),
            codec_private_data: data.codec_private_data.clone(),
            timescale: data.timescale,
            duration: data.duration,
            language,
            width,
            height,
            stream_type: data.stream_type.clone(),
            channels: data.channels,
            bits_per_sample: data.bits_per_sample,
            sampling_rate: data.sampling_rate,
            nal_unit_length_field: data.nal_unit_length_field,
            bandwidth: track.bandwidth.unwrap_or(0) as u32,
            creation_time: Utc::now().timestamp().max(0) as u64,
            is_protection: data.is_protection,
            protection_system_id: data.protection_system_id.clone(),
            protection_data: data.protection_data.clone(),
        })
    }

    /// Generate the init bytes, reading the `track_ID` from the first
    /// downloaded fragment.
    pub fn gen_header(&mut self, first_segment: &[u8]) -> Result<Vec<u8>, AbrError> {
        if let Some(track_id) = mp4::first_fragment_track_id(first_segment) {
            self.track_id = track_id;
        }
        self.gen_moov()
    }

    fn gen_moov(&self) -> Result<Vec<u8>, AbrError> {
        let mut payload = self.gen_mvhd();
        payload.extend(self.gen_trak()?);
        payload.extend(self.gen_mvex());
        if self.is_protection && !self.protection_data.is_empty() {
            payload.extend(self.gen_pssh()?);
        }
        Ok(basic_box(b"moov", payload))
    }

    fn gen_mvhd(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend(self.creation_time.to_be_bytes());
        buf.extend(self.creation_time.to_be_bytes()); // modification_time
        buf.extend(self.timescale.to_be_bytes());
        buf.extend(self.duration.to_be_bytes());
        buf.extend(0x0001_0000u32.to_be_bytes()); // rate 1.0
        buf.extend(0x0100u16.to_be_bytes()); // volume 1.0
        buf.extend([0u8; 10]); // reserved
        buf.extend(UNITY_MATRIX);
        buf.extend([0u8; 24]); // pre_defined
        buf.extend(0xFFFF_FFFFu32.to_be_bytes()); // next_track_ID
        full_box(b"mvhd", 1, 0, buf)
    }

    fn gen_trak(&self) -> Result<Vec<u8>, AbrError> {
        let mut payload = self.gen_tkhd();
        payload.extend(self.gen_mdia()?);
        Ok(basic_box(b"trak", payload))
    }

    fn gen_tkhd(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend(self.creation_time.to_be_bytes());
        buf.extend(self.creation_time.to_be_bytes());
        buf.extend(self.track_id.to_be_bytes());
        buf.extend([0u8; 4]); // reserved
        buf.extend(self.duration.to_be_bytes());
        buf.extend([0u8; 8]); // reserved
        buf.extend(0u16.to_be_bytes()); // layer
        buf.extend(0u16.to_be_bytes()); // alternate_group
        let volume: u16 = if self.stream_type == "audio" { 0x0100 } else { 0 };
        buf.extend(volume.to_be_bytes());
        buf.extend([0u8; 2]); // reserved
        buf.extend(UNITY_MATRIX);
        buf.extend(((self.width as u32) << 16).to_be_bytes());
        buf.extend(((self.height as u32) << 16).to_be_bytes());
        full_box(b"tkhd", 1, TRACK_ENABLED | TRACK_IN_MOVIE | TRACK_IN_PREVIEW, buf)
    }

    fn gen_mdia(&self) -> Result<Vec<u8>, AbrError> {
        let mut payload = self.gen_mdhd();
        payload.extend(self.gen_hdlr());
        payload.extend(self.gen_minf()?);
        Ok(basic_box(b"mdia", payload))
    }

    fn gen_mdhd(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend(self.creation_time.to_be_bytes());
        buf.extend(self.creation_time.to_be_bytes());
        buf.extend(self.timescale.to_be_bytes());
        buf.extend(self.duration.to_be_bytes());
        let packed: u16 = ((self.language[0] as u16 - 0x60) << 10)
            | ((self.language[1] as u16 - 0x60) << 5)
            | (self.language[2] as u16 - 0x60);
        buf.extend(packed.to_be_bytes());
        buf.extend(0u16.to_be_bytes()); // pre_defined
        full_box(b"mdhd", 1, 0, buf)
    }

    fn gen_hdlr(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend(0u32.to_be_bytes()); // pre_defined
        let handler: &[u8; 4] = match self.stream_type.as_str() {
            "audio" => b"soun",
            "text" => b"subt",
            _ => b"vide",
        };
        buf.extend(handler);
        buf.extend([0u8; 12]); // reserved
        buf.extend(b"RE Handler\0");
        full_box(b"hdlr", 0, 0, buf)
    }

    fn gen_minf(&self) -> Result<Vec<u8>, AbrError> {
        let mut payload = match self.stream_type.as_str() {
            "audio" => full_box(b"smhd", 0, 0, vec![0u8; 4]),
            "text" => full_box(b"sthd", 0, 0, Vec::new()),
            _ => full_box(b"vmhd", 0, 1, vec![0u8; 8]),
        };
        payload.extend(self.gen_dinf());
        payload.extend(self.gen_stbl()?);
        Ok(basic_box(b"minf", payload))
    }

    fn gen_dinf(&self) -> Vec<u8> {
        let mut dref = vec![0, 0, 0, 1];
        dref.extend(full_box(b"url ", 0, SELF_CONTAINED, Vec::new()));
        basic_box(b"dinf", full_box(b"dref", 0, 0, dref))
    }

    fn gen_stbl(&self) -> Result<Vec<u8>, AbrError> {
        let mut payload = self.gen_stsd()?;
        payload.extend(full_box(b"stts", 0, 0, vec![0u8; 4]));
        payload.extend(full_box(b"stsc", 0, 0, vec![0u8; 4]));
        payload.extend(full_box(b"stsz", 0, 0, vec![0u8; 8]));
        payload.extend(full_box(b"stco", 0, 0, vec![0u8; 4]));
        Ok(basic_box(b"stbl", payload))
    }

    fn gen_stsd(&self) -> Result<Vec<u8>, AbrError> {
        let mut payload = vec![0, 0, 0, 1];
        payload.extend(self.sample_entry()?);
        Ok(full_box(b"stsd", 0, 0, payload))
    }

    fn sample_entry(&self) -> Result<Vec<u8>, AbrError> {
        let mut buf = Vec::new();
        buf.extend([0u8; 6]); // reserved
        buf.extend(1u16.to_be_bytes()); // data_reference_index
        match self.stream_type.as_str() {
            "audio" => {
                buf.extend([0u8; 8]); // reserved
                buf.extend(self.channels.to_be_bytes());
                buf.extend(self.bits_per_sample.to_be_bytes());
                buf.extend(0u16.to_be_bytes()); // pre_defined
                buf.extend(0u16.to_be_bytes()); // reserved
                buf.extend((self.sampling_rate << 16).to_be_bytes());
                let config = parse_hex(&self.codec_private_data).map_err(|_| {
                    AbrError::InitBoxGeneration(format!(
                        "invalid audio CodecPrivateData {:?}",
                        self.codec_private_data
                    ))
                })?;
                buf.extend(self.gen_esds(&config));
                Ok(basic_box(b"mp4a", buf))
            }
            "video" => {
                buf.extend([0u8; 16]); // pre_defined + reserved
                buf.extend(self.width.to_be_bytes());
                buf.extend(self.height.to_be_bytes());
                buf.extend(0x0048_0000u32.to_be_bytes()); // horizresolution 72 dpi
                buf.extend(0x0048_0000u32.to_be_bytes()); // vertresolution
                buf.extend(0u32.to_be_bytes()); // reserved
                buf.extend(1u16.to_be_bytes()); // frame_count
                buf.extend([0u8; 32]); // compressorname
                buf.extend(0x0018u16.to_be_bytes()); // depth
                buf.extend((-1i16).to_be_bytes()); // pre_defined
                match self.four_cc.as_str() {
                    "H264" | "AVC1" | "DAVC" => {
                        buf.extend(self.gen_avcc()?);
                        Ok(basic_box(b"avc1", buf))
                    }
                    "HVC1" | "HEV1" | "DVHE" | "DVH1" => {
                        // fragments carry in-band parameter sets; an empty
                        // configuration record keeps the header parseable
                        buf.extend(basic_box(b"hvcC", Vec::new()));
                        Ok(basic_box(b"hvc1", buf))
                    }
                    other => Err(AbrError::InitBoxGeneration(format!(
                        "unsupported video FourCC {other}"
                    ))),
                }
            }
            "text" => {
                buf.extend(b"http://www.w3.org/ns/ttml\0"); // namespace
                buf.extend(b"\0"); // schema_location
                buf.extend(b"\0"); // auxiliary_mime_types
                Ok(basic_box(b"stpp", buf))
            }
            other => Err(AbrError::InitBoxGeneration(format!("unsupported stream type {other}"))),
        }
    }

    /// `esds` carrying the hex-decoded CodecPrivateData as the
    /// AudioSpecificConfig.
    fn gen_esds(&self, audio_specific_config: &[u8]) -> Vec<u8> {
        let cfg_len = audio_specific_config.len() as u8;
        let mut payload = Vec::new();
        // ES_Descriptor
        payload.push(0x03);
        payload.push(20 + cfg_len);
        payload.extend((self.track_id as u16).to_be_bytes());
        payload.push(0x00); // flags
        // DecoderConfigDescriptor
        payload.push(0x04);
        payload.push(15 + cfg_len);
        payload.push(0x40); // objectTypeIndication: MPEG-4 AAC
        payload.push(0x15); // streamType: AudioStream
        payload.extend([0u8; 3]); // bufferSizeDB
        payload.extend(self.bandwidth.to_be_bytes()); // maxBitrate
        payload.extend(self.bandwidth.to_be_bytes()); // avgBitrate
        // DecoderSpecificInfo
        payload.push(0x05);
        payload.push(cfg_len);
        payload.extend(audio_specific_config);
        full_box(b"esds", 0, 0, payload)
    }

    /// AVCDecoderConfigurationRecord assembled from the Annex-B formatted
    /// CodecPrivateData (SPS and PPS separated by 00000001 start codes).
    fn gen_avcc(&self) -> Result<Vec<u8>, AbrError> {
        let data = parse_hex(&self.codec_private_data).map_err(|_| {
            AbrError::InitBoxGeneration(format!(
                "invalid video CodecPrivateData {:?}",
                self.codec_private_data
            ))
        })?;
        let mut sps: Option<Vec<u8>> = None;
        let mut pps: Option<Vec<u8>> = None;
        for nal in split_annex_b(&data) {
            if nal.is_empty() {
                continue;
            }
            match nal[0] & 0x1F {
                7 => sps = Some(nal.to_vec()),
                8 => pps = Some(nal.to_vec()),
                _ => {}
            }
        }
        let sps = sps
            .ok_or_else(|| AbrError::InitBoxGeneration("CodecPrivateData carries no SPS".into()))?;
        let pps = pps
            .ok_or_else(|| AbrError::InitBoxGeneration("CodecPrivateData carries no PPS".into()))?;
        let mut buf = Vec::new();
        buf.push(1); // configurationVersion
        buf.push(sps[1]); // AVCProfileIndication
        buf.push(sps[2]); // profile_compatibility
        buf.push(sps[3]); // AVCLevelIndication
        buf.push(0xFC | (self.nal_unit_length_field.saturating_sub(1) & 0x03));
        buf.push(0xE0 | 1); // one SPS
        buf.extend((sps.len() as u16).to_be_bytes());
        buf.extend(&sps);
        buf.push(1); // one PPS
        buf.extend((pps.len() as u16).to_be_bytes());
        buf.extend(&pps);
        Ok(basic_box(b"avcC", buf))
    }

    fn gen_mvex(&self) -> Vec<u8> {
        let mut payload = full_box(b"mehd", 1, 0, self.duration.to_be_bytes().to_vec());
        let mut trex = Vec::new();
        trex.extend(self.track_id.to_be_bytes());
        trex.extend(1u32.to_be_bytes()); // default_sample_description_index
        trex.extend(0u32.to_be_bytes()); // default_sample_duration
        trex.extend(0u32.to_be_bytes()); // default_sample_size
        trex.extend(0u32.to_be_bytes()); // default_sample_flags
        payload.extend(full_box(b"trex", 0, 0, trex));
        basic_box(b"mvex", payload)
    }

    /// PlayReady `pssh` from the manifest's ProtectionHeader.
    fn gen_pssh(&self) -> Result<Vec<u8>, AbrError> {
        let system_id = parse_hex(&self.protection_system_id).map_err(|_| {
            AbrError::InitBoxGeneration(format!(
                "invalid protection SystemID {:?}",
                self.protection_system_id
            ))
        })?;
        if system_id.len() != 16 {
            return Err(AbrError::InitBoxGeneration("protection SystemID is not 16 bytes".into()));
        }
        let data = BASE64
            .decode(self.protection_data.trim())
            .map_err(|e| AbrError::InitBoxGeneration(format!("undecodable ProtectionHeader: {e}")))?;
        let mut payload = Vec::new();
        payload.extend(&system_id);
        payload.extend((data.len() as u32).to_be_bytes());
        payload.extend(&data);
        Ok(full_box(b"pssh", 0, 0, payload))
    }
}

const UNITY_MATRIX: [u8; 32] = [
    0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 64, 0, 0,
    0,
];

fn basic_box(name: &[u8; 4], payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend(((8 + payload.len()) as u32).to_be_bytes());
    out.extend(name);
    out.extend(payload);
    out
}

fn full_box(name: &[u8; 4], version: u8, flags: u32, payload: Vec<u8>) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.push(version);
    body.extend(&flags.to_be_bytes()[1..]);
    body.extend(payload);
    basic_box(name, body)
}

/// Split Annex-B byte stream on 4-byte start codes.
fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 4 <= data.len() {
        if data[i..i + 4] == [0, 0, 0, 1] {
            starts.push(i + 4);
            i += 4;
        } else {
            i += 1;
        }
    }
    for (n, &start) in starts.iter().enumerate() {
        let end = if n + 1 < starts.len() { starts[n + 1] - 4 } else { data.len() };
        nals.push(&data[start..end]);
    }
    nals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4;
    use crate::track::{MediaKind, MssData};

    fn audio_track() -> Track {
        Track {
            kind: MediaKind::Audio,
            language: "eng".into(),
            bandwidth: Some(128_000),
            mss_data: Some(MssData {
                four_cc: "AACL".into(),
                codec_private_data: "1210".into(),
                stream_type: "audio".into(),
                timescale: 10_000_000,
                duration: 120_000_000,
                sampling_rate: 44_100,
                channels: 2,
                bits_per_sample: 16,
                nal_unit_length_field: 4,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn make_fragment_with_track_id(track_id: u32) -> Vec<u8> {
        let tfhd = full_box(b"tfhd", 0, 0, track_id.to_be_bytes().to_vec());
        let traf = basic_box(b"traf", tfhd);
        basic_box(b"moof", traf)
    }

    #[test]
    fn test_audio_header_structure() {
        let track = audio_track();
        let mut processor = MssMoovProcessor::new(&track).unwrap();
        let header = processor.gen_header(&make_fragment_with_track_id(7)).unwrap();

        let moov = mp4::find_box(&header, b"moov").expect("moov");
        let mvhd = mp4::find_box(moov, b"mvhd").expect("mvhd");
        let (version, _, _) = mp4::full_box(mvhd).unwrap();
        assert_eq!(version, 1);

        let mdhd = mp4::find_box_path(&header, &[b"moov", b"trak", b"mdia", b"mdhd"]).unwrap();
        assert_eq!(mp4::mdhd_timescale(mdhd), Some(10_000_000));

        // esds carries the hex-decoded CodecPrivateData [0x12, 0x10]
        let stsd = mp4::find_box_path(
            &header,
            &[b"moov", b"trak", b"mdia", b"minf", b"stbl", b"stsd"],
        )
        .unwrap();
        let (_, _, entries) = mp4::full_box(stsd).unwrap();
        let mp4a = mp4::find_box(&entries[4..], b"mp4a").expect("mp4a entry");
        let esds_pos = mp4a.windows(4).position(|w| w == b"esds").expect("esds");
        let esds_tail = &mp4a[esds_pos..];
        assert!(esds_tail.windows(2).any(|w| w == [0x12, 0x10]));

        // the trex must reference the fragment's track id
        let trex = mp4::find_box_path(&header, &[b"moov", b"mvex", b"trex"]).unwrap();
        let (_, _, trex_body) = mp4::full_box(trex).unwrap();
        assert_eq!(&trex_body[..4], &7u32.to_be_bytes());
    }

    #[test]
    fn test_avcc_from_codec_private_data() {
        let track = Track {
            kind: MediaKind::Video,
            resolution: "1280x720".into(),
            bandwidth: Some(2_000_000),
            mss_data: Some(MssData {
                four_cc: "H264".into(),
                codec_private_data:
                    "000000016764001FAC2CA5014016EC0440000003004000000C83C60C65800000000168EFBCB0"
                        .into(),
                stream_type: "video".into(),
                timescale: 10_000_000,
                duration: 120_000_000,
                nal_unit_length_field: 4,
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut processor = MssMoovProcessor::new(&track).unwrap();
        let header = processor.gen_header(&make_fragment_with_track_id(1)).unwrap();
        let stsd = mp4::find_box_path(
            &header,
            &[b"moov", b"trak", b"mdia", b"minf", b"stbl", b"stsd"],
        )
        .unwrap();
        let (_, _, entries) = mp4::full_box(stsd).unwrap();
        let avc1 = mp4::find_box(&entries[4..], b"avc1").expect("avc1 entry");
        let avcc_pos = avc1.windows(4).position(|w| w == b"avcC").expect("avcC");
        // configurationVersion, profile, compat, level follow the fourcc
        let record = &avc1[avcc_pos + 4..];
        assert_eq!(record[0], 1);
        assert_eq!(record[1], 0x64); // High profile from the SPS
    }

    #[test]
    fn test_missing_mss_data_is_an_error() {
        let track = Track::default();
        assert!(MssMoovProcessor::new(&track).is_err());
    }

    #[test]
    fn test_split_annex_b() {
        let data = [0, 0, 0, 1, 0x67, 0xAA, 0, 0, 0, 1, 0x68, 0xBB, 0xCC];
        let nals = split_annex_b(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], &[0x67, 0xAA]);
        assert_eq!(nals[1], &[0x68, 0xBB, 0xCC]);
    }
}
