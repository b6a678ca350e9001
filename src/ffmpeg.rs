//! Muxing support using ffmpeg or mkvmerge as a subprocess.
//
// The final mux combines the per-track merged files (video + audio tracks +
// subtitles, plus any externally imported tracks) into one container. Track
// dispositions follow a fixed policy: video is default, exactly one audio
// track is default, subtitles are never default. All invocations capture
// stderr in full and surface it in the error on failure.

use std::path::{Path, PathBuf};

use crate::media::{language_name_from_code, normalize_language_code, OutputFile};
use crate::merge::invoke_tool;
use crate::track::MediaKind;
use crate::AbrError;

/// Mux `files` into `output_base` + container extension with ffmpeg.
/// Returns the final path.
pub fn mux_inputs_ffmpeg(
    ffmpeg: &str,
    files: &[OutputFile],
    output_base: &Path,
    mux_format: &str,
    write_date: bool,
) -> Result<PathBuf, AbrError> {
    if files.is_empty() {
        return Err(AbrError::Muxing("no files to mux".into()));
    }
    let mut args: Vec<String> =
        vec!["-loglevel".into(), "warning".into(), "-nostdin".into(), "-y".into(), "-dn".into()];
    for file in files {
        args.extend(["-i".into(), file.path.display().to_string()]);
    }
    for i in 0..files.len() {
        args.extend(["-map".into(), i.to_string()]);
    }

    let has_srt = files.iter().any(|f| f.path.extension().is_some_and(|e| e == "srt"));
    match mux_format.to_uppercase().as_str() {
        "MP4" => args.extend([
            "-strict".into(),
            "unofficial".into(),
            "-c:a".into(),
            "copy".into(),
            "-c:v".into(),
            "copy".into(),
            "-c:s".into(),
            "mov_text".into(),
        ]),
        "TS" => args.extend([
            "-strict".into(),
            "unofficial".into(),
            "-c:a".into(),
            "copy".into(),
            "-c:v".into(),
            "copy".into(),
        ]),
        "MKV" => {
            let subtitle_codec = if has_srt { "srt" } else { "webvtt" };
            args.extend([
                "-strict".into(),
                "unofficial".into(),
                "-c:a".into(),
                "copy".into(),
                "-c:v".into(),
                "copy".into(),
                "-c:s".into(),
                subtitle_codec.into(),
            ]);
        }
        other => return Err(AbrError::Muxing(format!("unsupported mux format {other}"))),
    }
    args.extend(["-map_metadata".into(), "-1".into()]);

    // per-stream language/title; a multi-stream input advances the stream
    // index by however many streams ffprobe saw in it
    let mut stream_index = 0usize;
    for file in files {
        let lang = normalize_language_code(&file.lang_code);
        args.extend([format!("-metadata:s:{stream_index}"), format!("language={lang}")]);
        if !file.description.is_empty() {
            args.extend([format!("-metadata:s:{stream_index}"), format!("title={}", file.description)]);
        }
        stream_index += file.media_infos.len().max(1);
    }

    let has_video = files.iter().any(|f| f.kind == MediaKind::Video);
    let audio_count = files.iter().filter(|f| f.kind == MediaKind::Audio).count();
    if has_video {
        args.extend(["-disposition:v:0".into(), "default".into()]);
    }
    args.extend(["-disposition:s".into(), "0".into()]);
    if audio_count > 0 {
        args.extend(["-disposition:a:0".into(), "default".into()]);
        for i in 1..audio_count {
            args.extend([format!("-disposition:a:{i}"), "0".into()]);
        }
    }
    if write_date {
        args.extend(["-metadata".into(), format!("date={}", chrono::Utc::now().to_rfc3339())]);
    }
    args.extend(["-ignore_unknown".into(), "-copy_unknown".into()]);

    let ext = match mux_format.to_uppercase().as_str() {
        "MKV" => ".mkv",
        "TS" => ".ts",
        _ => ".mp4",
    };
    let output = PathBuf::from(format!("{}{ext}", output_base.display()));
    args.push(output.display().to_string());

    let working_dir = output_base.parent().unwrap_or_else(|| Path::new("."));
    invoke_tool(ffmpeg, &args, working_dir).map_err(|e| match e {
        AbrError::Merging(msg) => AbrError::Muxing(msg),
        other => other,
    })?;
    Ok(output)
}

/// Mux with mkvmerge: `-q --output OUT.mkv --no-chapters` plus per-input
/// `--language 0:LANG`, `--default-track 0:no` for subtitles and non-first
/// audio, and `--track-name` from the description or the language name.
pub fn mux_inputs_mkvmerge(
    mkvmerge: &str,
    files: &[OutputFile],
    output_base: &Path,
) -> Result<PathBuf, AbrError> {
    if files.is_empty() {
        return Err(AbrError::Muxing("no files to mux".into()));
    }
    let output = PathBuf::from(format!("{}.mkv", output_base.display()));
    let mut args: Vec<String> =
        vec!["-q".into(), "--output".into(), output.display().to_string(), "--no-chapters".into()];

    let mut audio_seen = false;
    for file in files {
        let lang = normalize_language_code(&file.lang_code);
        args.extend(["--language".into(), format!("0:{lang}")]);
        if matches!(file.kind, MediaKind::Subtitles | MediaKind::ClosedCaptions) {
            args.extend(["--default-track".into(), "0:no".into()]);
        }
        if file.kind == MediaKind::Audio {
            if audio_seen {
                args.extend(["--default-track".into(), "0:no".into()]);
            }
            audio_seen = true;
        }
        let mut name = file.description.clone();
        if name.is_empty() && lang != "und" {
            name = language_name_from_code(&lang).to_string();
        }
        if !name.is_empty() {
            args.extend(["--track-name".into(), format!("0:{name}")]);
        }
        args.push(file.path.display().to_string());
    }

    let working_dir = output_base.parent().unwrap_or_else(|| Path::new("."));
    invoke_tool(mkvmerge, &args, working_dir).map_err(|e| match e {
        AbrError::Merging(msg) => AbrError::Muxing(msg),
        other => other,
    })?;
    Ok(output)
}
