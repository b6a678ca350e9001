//! Command-line front-end over the `abr_dl` library.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use abr_dl::fetch::{MuxImport, StreamDownloader};
use abr_dl::hls::HlsKeyOverride;
use abr_dl::progress::ProgressManager;
use abr_dl::track::EncryptMethod;

#[derive(Parser, Debug)]
#[command(
    name = "abr-dl",
    version,
    about = "Download media content from HLS, MPEG-DASH and Smooth Streaming manifests",
    arg_required_else_help = true
)]
struct Args {
    /// Manifest URL (m3u8, mpd, ism/Manifest) or a raw TS stream URL
    input: String,

    /// Number of segment download workers per track
    #[arg(long, default_value_t = 16)]
    thread_count: usize,

    /// Retries for one segment download
    #[arg(long, default_value_t = 3, alias = "retry-count")]
    download_retry_count: u32,

    /// Retries for manifest/key requests
    #[arg(long, default_value_t = 3)]
    web_request_retry_count: u32,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 100.0)]
    http_request_timeout: f64,

    /// Custom request header, "Key: Value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Decryption key KID:KEY in hex (repeatable)
    #[arg(long = "key")]
    keys: Vec<String>,

    /// File with one KID:KEY per line, searched by discovered KID
    #[arg(long)]
    key_text_file: Option<String>,

    /// Override the encryption method of HLS key tags (e.g. AES-128, CHACHA20)
    #[arg(long)]
    custom_hls_method: Option<String>,

    /// Override the HLS key bytes (hex)
    #[arg(long)]
    custom_hls_key: Option<String>,

    /// Override the HLS IV bytes (hex)
    #[arg(long)]
    custom_hls_iv: Option<String>,

    /// Video selection: all|best|worst|bestN|worstN|none or a filter bundle
    #[arg(short = 'v', long, default_value = "best")]
    select_video: String,

    /// Audio selection
    #[arg(short = 'a', long, default_value = "all")]
    select_audio: String,

    /// Subtitle selection
    #[arg(short = 's', long, default_value = "all")]
    select_subtitle: String,

    /// Drop matching video tracks after selection
    #[arg(long)]
    drop_video: Option<String>,

    /// Drop matching audio tracks after selection
    #[arg(long)]
    drop_audio: Option<String>,

    /// Drop matching subtitle tracks after selection
    #[arg(long)]
    drop_subtitle: Option<String>,

    /// Mux all finished tracks into one container when done
    #[arg(long, short = 'M')]
    mux_after_done: bool,

    /// Container for --mux-after-done: mp4, mkv or ts
    #[arg(long, default_value = "mp4")]
    mux_format: String,

    /// Use mkvmerge instead of ffmpeg for the final mux
    #[arg(long)]
    use_mkvmerge: bool,

    /// External file joining the mux: path=...:type=audio:lang=eng:name=... (repeatable)
    #[arg(long = "mux-import")]
    mux_imports: Vec<String>,

    /// Leave subtitles out of the final mux
    #[arg(long)]
    mux_skip_subtitle: bool,

    /// Subtitle output format: srt or vtt
    #[arg(long, default_value = "srt")]
    subtitle_format: String,

    /// Concatenate segments byte-for-byte instead of remuxing with ffmpeg
    #[arg(long)]
    binary_merge: bool,

    /// Decrypt CENC segments as they download instead of after merge
    #[arg(long)]
    mp4_real_time_decryption: bool,

    /// Base name for output files
    #[arg(long)]
    save_name: Option<String>,

    /// Output directory
    #[arg(long, default_value = "Downloads")]
    save_dir: String,

    /// Directory for temporary segment files
    #[arg(long)]
    tmp_dir: Option<String>,

    /// Base URL overriding the redirected manifest URL
    #[arg(long)]
    base_url: Option<String>,

    /// Proxy, e.g. http://127.0.0.1:8888 or socks5://127.0.0.1:1080
    #[arg(long)]
    custom_proxy: Option<String>,

    /// Copy the input URL query string onto every segment URL
    #[arg(long)]
    append_url_params: bool,

    /// Download the selected tracks concurrently instead of one after another
    #[arg(long)]
    concurrent_download: bool,

    /// Download only; leave the temp segments unmerged
    #[arg(long)]
    skip_merge: bool,

    /// Stop after parsing and selection (writes meta JSON only)
    #[arg(long)]
    skip_download: bool,

    /// Remove temporary files after a fully successful run
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    delete_after_done: bool,

    /// Fail a track when any segment could not be downloaded
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    check_segments_count: bool,

    /// Use the ffmpeg concat demuxer instead of the concat protocol
    #[arg(long)]
    use_ffmpeg_concat_demuxer: bool,

    /// Write meta.json / meta_selected.json into the temp directory
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    write_meta_json: bool,

    /// ffmpeg executable
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg_binary_path: String,

    /// mkvmerge executable
    #[arg(long, default_value = "mkvmerge")]
    mkvmerge_binary_path: String,

    /// mp4decrypt-compatible executable for CENC content
    #[arg(long, default_value = "mp4decrypt")]
    decryption_binary_path: String,

    /// Disable the progress display
    #[arg(long)]
    no_progress: bool,

    /// Log filter, e.g. info or abr_dl=debug
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_headers(raw: &[String]) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for entry in raw {
        match entry.split_once(':') {
            Some((key, value)) => {
                headers.insert(key.trim().to_string(), value.trim().to_string());
            }
            None => error!("ignoring malformed header {entry:?} (expected \"Key: Value\")"),
        }
    }
    headers
}

fn parse_key_override(args: &Args) -> Result<HlsKeyOverride, String> {
    let mut key_override = HlsKeyOverride::default();
    if let Some(method) = &args.custom_hls_method {
        key_override.method = Some(EncryptMethod::from_name(method));
    }
    if let Some(key) = &args.custom_hls_key {
        key_override.key =
            Some(hex::decode(key.trim_start_matches("0x")).map_err(|e| e.to_string())?);
    }
    if let Some(iv) = &args.custom_hls_iv {
        key_override.iv =
            Some(hex::decode(iv.trim_start_matches("0x")).map_err(|e| e.to_string())?);
    }
    Ok(key_override)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let progress = if args.no_progress {
        // logs go straight to stderr when the progress display is off
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
        Arc::new(ProgressManager::hidden())
    } else {
        // route log lines through the progress region so they are printed
        // above the bars instead of tearing frames
        let progress = Arc::new(ProgressManager::new());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(progress.log_writer())
            .init();
        progress
    };

    let key_override = match parse_key_override(&args) {
        Ok(v) => v,
        Err(e) => {
            error!("invalid custom HLS key material: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut downloader = StreamDownloader::new(&args.input)
        .headers(parse_headers(&args.headers))
        .thread_count(args.thread_count)
        .download_retry_count(args.download_retry_count)
        .web_request_retry_count(args.web_request_retry_count)
        .http_request_timeout(Duration::from_secs_f64(args.http_request_timeout))
        .custom_hls_key(key_override)
        .select_video(&args.select_video)
        .select_audio(&args.select_audio)
        .select_subtitle(&args.select_subtitle)
        .subtitle_format(&args.subtitle_format)
        .binary_merge(args.binary_merge)
        .mp4_real_time_decryption(args.mp4_real_time_decryption)
        .save_dir(&args.save_dir)
        .append_url_params(args.append_url_params)
        .concurrent_download(args.concurrent_download)
        .skip_merge(args.skip_merge)
        .skip_download(args.skip_download)
        .delete_after_done(args.delete_after_done)
        .check_segments_count(args.check_segments_count)
        .use_ffmpeg_concat_demuxer(args.use_ffmpeg_concat_demuxer)
        .write_meta_json(args.write_meta_json)
        .mux_after_done(args.mux_after_done)
        .mux_format(&args.mux_format)
        .use_mkvmerge(args.use_mkvmerge)
        .mux_skip_subtitle(args.mux_skip_subtitle)
        .ffmpeg_path(&args.ffmpeg_binary_path)
        .mkvmerge_path(&args.mkvmerge_binary_path)
        .decryption_binary_path(&args.decryption_binary_path)
        .progress_manager(progress);

    for key in &args.keys {
        downloader = downloader.key(key);
    }
    if let Some(path) = &args.key_text_file {
        downloader = downloader.key_text_file(path);
    }
    if let Some(name) = &args.save_name {
        downloader = downloader.save_name(name);
    }
    if let Some(dir) = &args.tmp_dir {
        downloader = downloader.tmp_dir(dir);
    }
    if let Some(base) = &args.base_url {
        downloader = downloader.base_url(base);
    }
    if let Some(proxy) = &args.custom_proxy {
        downloader = downloader.proxy(proxy);
    }
    if let Some(expr) = &args.drop_video {
        downloader = downloader.drop_video(expr);
    }
    if let Some(expr) = &args.drop_audio {
        downloader = downloader.drop_audio(expr);
    }
    if let Some(expr) = &args.drop_subtitle {
        downloader = downloader.drop_subtitle(expr);
    }
    for import in &args.mux_imports {
        match MuxImport::parse(import) {
            Ok(parsed) => downloader = downloader.mux_import(parsed),
            Err(e) => {
                error!("invalid --mux-import: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    match downloader.download().await {
        Ok(summary) => {
            if summary.validation_failed {
                error!("run finished with validation failures");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
