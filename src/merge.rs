//! Concatenating downloaded segments into per-track files.
//!
//! Two merge strategies exist: plain binary concatenation (fMP4, subtitles,
//! anything CENC-encrypted) and an ffmpeg remux using the `concat:` protocol
//! (MPEG-TS audio/video), with the concat *demuxer* as an opt-in fallback
//! for inputs the protocol chokes on. When the number of input files would
//! overflow an OS command line they are pre-merged in batches named
//! `T0000.ts`, `T0001.ts`, ...

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use fs_err as fs;
use fs_err::File;
use tracing::{debug, warn};

use crate::util::ensure_dir;
use crate::AbrError;

/// Append `files` into `out` in order. Missing inputs are skipped with a
/// warning so that one lost segment does not void the whole track.
pub fn binary_concat(files: &[PathBuf], out: &Path) -> Result<(), AbrError> {
    if files.is_empty() {
        return Ok(());
    }
    if let Some(parent) = out.parent() {
        ensure_dir(parent)?;
    }
    let mut sink = io::BufWriter::new(
        File::create(out).map_err(|e| AbrError::Io(e, format!("creating {}", out.display())))?,
    );
    for input in files {
        let file = match File::open(input) {
            Ok(f) => f,
            Err(e) => {
                warn!("cannot open {}: {e}", input.display());
                continue;
            }
        };
        let mut reader = io::BufReader::new(file);
        io::copy(&mut reader, &mut sink)
            .map_err(|e| AbrError::Io(e, format!("appending {}", input.display())))?;
    }
    io::Write::flush(&mut sink).map_err(|e| AbrError::Io(e, format!("flushing {}", out.display())))?;
    Ok(())
}

/// Pre-merge into batches of 100 (200 for truly huge sets) so the final
/// ffmpeg invocation stays under the command-line length limit. The batch
/// inputs are deleted as they are folded in.
pub fn partial_combine(files: &[PathBuf]) -> Result<Vec<PathBuf>, AbrError> {
    let batch_size = if files.len() > 90_000 { 200 } else { 100 };
    let dir = files[0].parent().unwrap_or_else(|| Path::new("."));
    let mut merged = Vec::new();
    for (index, batch) in files.chunks(batch_size).enumerate() {
        let out = dir.join(format!("T{index:04}.ts"));
        binary_concat(batch, &out)?;
        for file in batch {
            let _ = fs::remove_file(file);
        }
        merged.push(out);
    }
    Ok(merged)
}

/// Optional metadata and behaviour toggles for [`ffmpeg_merge`].
#[derive(Debug, Default, Clone)]
pub struct MergeOptions {
    pub fast_start: bool,
    pub write_date: bool,
    pub use_concat_demuxer: bool,
    pub poster: Option<String>,
    pub audio_name: Option<String>,
    pub title: Option<String>,
    pub copyright: Option<String>,
    pub comment: Option<String>,
    pub encoding_tool: Option<String>,
}

/// Output extension for a mux format name.
pub fn mux_extension(mux_format: &str) -> &'static str {
    match mux_format.to_uppercase().as_str() {
        "MKV" => ".mkv",
        "TS" => ".ts",
        "M4A" | "AAC" => ".m4a",
        "EAC3" => ".eac3",
        "AC3" => ".ac3",
        "FLV" => ".flv",
        _ => ".mp4",
    }
}

/// Remux the (already ordered) segment files into `output_base + extension`
/// with ffmpeg, copying streams. Returns the final output path.
///
/// `working_dir` must be the directory holding the inputs: the `concat:`
/// protocol and the concat-demuxer list both use bare file names to dodge
/// command-line length and quoting problems.
pub fn ffmpeg_merge(
    ffmpeg: &str,
    files: &[PathBuf],
    output_base: &Path,
    mux_format: &str,
    use_aac_filter: bool,
    options: &MergeOptions,
    working_dir: &Path,
) -> Result<PathBuf, AbrError> {
    if files.is_empty() {
        return Err(AbrError::Merging("no files to merge".into()));
    }
    let mut args: Vec<String> = vec!["-loglevel".into(), "warning".into(), "-nostdin".into()];

    let mut concat_list: Option<PathBuf> = None;
    if options.use_concat_demuxer {
        let list = create_concat_file(files, working_dir)?;
        args.extend(["-f".into(), "concat".into(), "-safe".into(), "0".into()]);
        args.push("-i".into());
        args.push(list.file_name().unwrap().to_string_lossy().to_string());
        concat_list = Some(list);
    } else {
        let names: Vec<String> = files
            .iter()
            .map(|f| f.file_name().unwrap_or_default().to_string_lossy().to_string())
            .collect();
        args.push("-i".into());
        args.push(format!("concat:{}", names.join("|")));
    }

    let output = PathBuf::from(format!("{}{}", output_base.display(), mux_extension(mux_format)));
    match mux_format.to_uppercase().as_str() {
        "MP4" => {
            if let Some(poster) = &options.poster {
                args.extend(["-i".into(), poster.clone()]);
            }
            args.extend(["-map".into(), "0:v?".into(), "-map".into(), "0:a?".into()]);
            args.extend(["-map".into(), "0:s?".into()]);
            if options.poster.is_some() {
                args.extend([
                    "-map".into(),
                    "1".into(),
                    "-c:v:1".into(),
                    "copy".into(),
                    "-disposition:v:1".into(),
                    "attached_pic".into(),
                ]);
            }
            if options.write_date {
                args.extend([
                    "-metadata".into(),
                    format!("date={}", chrono::Utc::now().to_rfc3339()),
                ]);
            }
            for (key, value) in [
                ("encoding_tool", &options.encoding_tool),
                ("title", &options.title),
                ("copyright", &options.copyright),
                ("comment", &options.comment),
            ] {
                if let Some(v) = value {
                    args.extend(["-metadata".into(), format!("{key}={v}")]);
                }
            }
            if let Some(audio_name) = &options.audio_name {
                args.extend([
                    "-metadata:s:a:0".into(),
                    format!("title={audio_name}"),
                    "-metadata:s:a:0".into(),
                    format!("handler={audio_name}"),
                ]);
            }
            if options.fast_start {
                args.extend(["-movflags".into(), "+faststart".into()]);
            }
            args.extend(["-c".into(), "copy".into(), "-y".into()]);
            if use_aac_filter {
                args.extend(["-bsf:a".into(), "aac_adtstoasc".into()]);
            }
        }
        "MKV" | "FLV" => {
            args.extend(["-map".into(), "0".into(), "-c".into(), "copy".into(), "-y".into()]);
            if use_aac_filter {
                args.extend(["-bsf:a".into(), "aac_adtstoasc".into()]);
            }
        }
        "M4A" => {
            args.extend([
                "-map".into(),
                "0".into(),
                "-c".into(),
                "copy".into(),
                "-f".into(),
                "mp4".into(),
                "-y".into(),
            ]);
            if use_aac_filter {
                args.extend(["-bsf:a".into(), "aac_adtstoasc".into()]);
            }
        }
        "TS" => {
            args.extend([
                "-map".into(),
                "0".into(),
                "-c".into(),
                "copy".into(),
                "-y".into(),
                "-f".into(),
                "mpegts".into(),
                "-bsf:v".into(),
                "h264_mp4toannexb".into(),
            ]);
        }
        "EAC3" | "AC3" | "AAC" => {
            args.extend(["-map".into(), "0:a".into(), "-c".into(), "copy".into(), "-y".into()]);
        }
        other => return Err(AbrError::Merging(format!("unsupported mux format {other}"))),
    }
    args.push(output.display().to_string());

    let result = invoke_tool(ffmpeg, &args, working_dir);
    if let Some(list) = concat_list {
        let _ = fs::remove_file(list);
    }
    result?;
    if !output.exists() {
        return Err(AbrError::Merging(format!(
            "ffmpeg reported success but {} does not exist",
            output.display()
        )));
    }
    Ok(output)
}

/// Run an external merge/mux tool, capturing stderr in full; a non-zero exit
/// surfaces the entire stderr text in the error.
pub(crate) fn invoke_tool(binary: &str, args: &[String], working_dir: &Path) -> Result<(), AbrError> {
    debug!("running {binary} {}", args.join(" "));
    let output = Command::new(binary)
        .args(args)
        .current_dir(working_dir)
        .output()
        .map_err(|e| AbrError::Io(e, format!("spawning {binary}")))?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(AbrError::Merging(format!(
            "{binary} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    if !stderr.trim().is_empty() {
        debug!("{binary} stderr: {}", stderr.trim());
    }
    Ok(())
}

fn create_concat_file(files: &[PathBuf], dir: &Path) -> Result<PathBuf, AbrError> {
    let path = dir.join("concat_inputs.txt");
    let mut body = String::new();
    for file in files {
        body.push_str(&format!(
            "file '{}'\n",
            file.file_name().unwrap_or_default().to_string_lossy()
        ));
    }
    fs::write(&path, body).map_err(|e| AbrError::Io(e, "writing concat list".into()))?;
    Ok(path)
}
