//! Support for downloading content from adaptive-bitrate streaming manifests.
//!
//! [`StreamDownloader`] is the entry point: a builder over the whole
//! pipeline. `download()` fetches and parses the manifest (HLS, DASH, MSS,
//! or a raw live TS stream), applies the track selection, then drives the
//! per-track download loop: init segment first (with Widevine KID discovery
//! and key lookup), then a bounded worker pool over the media segments, with
//! AES-class decryption inline and CENC dispatched to the external tool.
//! Completed tracks are merged in the background (binary concat or ffmpeg),
//! subtitles are extracted and rewritten, and an optional final mux combines
//! everything into one container.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fs_err as fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use url::Url;

use crate::decryption::{decrypt_cenc, search_key_from_file};
use crate::hls::{self, HlsKeyOverride};
use crate::media::{probe_media_info, MediaInfo, OutputFile};
use crate::merge::{self, MergeOptions};
use crate::mss_moov::MssMoovProcessor;
use crate::net::{retry, HttpFetcher, RetryPolicy, LIVE_TS_SENTINEL};
use crate::progress::{ProgressManager, Task, TaskKind};
use crate::segment::{download_segment, segment_file_name, SegmentContext};
use crate::select::{filter_drop, select_tracks, sort_tracks, TrackFilter};
use crate::subtitle;
use crate::track::{
    EncryptMethod, ExtractorType, MediaKind, MediaPart, MediaSegment, Playlist, Track,
};
use crate::util::{ensure_dir, sanitize_filename, segment_pad_width};
use crate::webvtt::WebVttSub;
use crate::{dash, ffmpeg, mp4, mss, AbrError};

/// Retain source m4s segments after image-subtitle PNG extraction.
const ENV_KEEP_IMAGE_SEGMENTS: &str = "RE_KEEP_IMAGE_SEGMENTS";

/// Fixed clip size used when splitting one huge file into range segments.
const SPLIT_CLIP_SIZE: i64 = 10 * 1024 * 1024;

/// Over this many merge inputs, pre-merge batches first.
const PRE_MERGE_THRESHOLD: usize = 1000;

/// An externally supplied track joining the final mux
/// (`--mux-import path=...:type=audio:lang=eng:name=English`).
#[derive(Debug, Clone)]
pub struct MuxImport {
    pub kind: MediaKind,
    pub path: PathBuf,
    pub lang_code: String,
    pub description: String,
}

impl MuxImport {
    pub fn parse(expr: &str) -> Result<MuxImport, AbrError> {
        let mut path = None;
        let mut kind = MediaKind::Audio;
        let mut lang = String::new();
        let mut name = String::new();
        for part in expr.split(':') {
            let Some((key, value)) = part.split_once('=') else {
                return Err(AbrError::Parsing(format!("invalid mux import component {part:?}")));
            };
            match key.trim() {
                "path" => path = Some(PathBuf::from(value)),
                "type" => {
                    kind = match value.to_lowercase().as_str() {
                        "video" => MediaKind::Video,
                        "audio" => MediaKind::Audio,
                        "subtitle" | "subtitles" => MediaKind::Subtitles,
                        other => {
                            return Err(AbrError::Parsing(format!(
                                "unknown mux import type {other:?}"
                            )))
                        }
                    }
                }
                "lang" => lang = value.to_string(),
                "name" => name = value.to_string(),
                other => {
                    return Err(AbrError::Parsing(format!("unknown mux import key {other:?}")))
                }
            }
        }
        let path =
            path.ok_or_else(|| AbrError::Parsing("mux import needs a path=".to_string()))?;
        Ok(MuxImport { kind, path, lang_code: lang, description: name })
    }
}

/// What a finished run hands back to the caller.
#[derive(Debug, Default)]
pub struct DownloadSummary {
    /// Per-track merged output files (and the mux outputs when enabled).
    pub output_files: Vec<PathBuf>,
    pub validation_failed: bool,
}

/// The StreamDownloader follows the builder pattern to configure the
/// download of adaptive streaming media content.
///
/// Example
/// ```rust,no_run
/// use abr_dl::StreamDownloader;
///
/// # #[tokio::main] async fn main() {
/// let summary = StreamDownloader::new("https://example.net/master.m3u8")
///     .thread_count(16)
///     .save_dir("downloads")
///     .select_video("best")
///     .select_audio("all")
///     .download()
///     .await;
/// # }
/// ```
pub struct StreamDownloader {
    url: String,
    headers: HashMap<String, String>,
    base_url: Option<String>,
    proxy: Option<String>,
    append_url_params: bool,
    thread_count: usize,
    download_retry_count: u32,
    web_request_retry_count: u32,
    http_timeout: Duration,
    keys: Vec<String>,
    key_text_file: Option<PathBuf>,
    hls_key_override: HlsKeyOverride,
    video_select: TrackFilter,
    audio_select: TrackFilter,
    subtitle_select: TrackFilter,
    drop_video: Option<TrackFilter>,
    drop_audio: Option<TrackFilter>,
    drop_subtitle: Option<TrackFilter>,
    save_name: Option<String>,
    save_dir: PathBuf,
    tmp_dir: Option<PathBuf>,
    subtitle_format: String,
    binary_merge: bool,
    skip_merge: bool,
    skip_download: bool,
    delete_after_done: bool,
    check_segments_count: bool,
    concurrent_download: bool,
    mp4_real_time_decryption: bool,
    use_ffmpeg_concat_demuxer: bool,
    write_meta_json: bool,
    mux_after_done: bool,
    mux_format: String,
    use_mkvmerge: bool,
    mux_skip_subtitle: bool,
    mux_imports: Vec<MuxImport>,
    ffmpeg_path: String,
    mkvmerge_path: String,
    decryption_binary_path: String,
    hidden_progress: bool,
    progress: Option<Arc<ProgressManager>>,
}

impl StreamDownloader {
    /// Create a downloader for the manifest at `url`.
    pub fn new(url: &str) -> StreamDownloader {
        StreamDownloader {
            url: url.to_string(),
            headers: HashMap::new(),
            base_url: None,
            proxy: None,
            append_url_params: false,
            thread_count: 8,
            download_retry_count: 3,
            web_request_retry_count: 3,
            http_timeout: Duration::from_secs(100),
            keys: Vec::new(),
            key_text_file: None,
            hls_key_override: HlsKeyOverride::default(),
            video_select: TrackFilter::parse("best").unwrap(),
            audio_select: TrackFilter::parse("all").unwrap(),
            subtitle_select: TrackFilter::parse("all").unwrap(),
            drop_video: None,
            drop_audio: None,
            drop_subtitle: None,
            save_name: None,
            save_dir: PathBuf::from("Downloads"),
            tmp_dir: None,
            subtitle_format: "srt".to_string(),
            binary_merge: false,
            skip_merge: false,
            skip_download: false,
            delete_after_done: true,
            check_segments_count: true,
            concurrent_download: false,
            mp4_real_time_decryption: false,
            use_ffmpeg_concat_demuxer: false,
            write_meta_json: true,
            mux_after_done: false,
            mux_format: "mp4".to_string(),
            use_mkvmerge: false,
            mux_skip_subtitle: false,
            mux_imports: Vec::new(),
            ffmpeg_path: "ffmpeg".to_string(),
            mkvmerge_path: "mkvmerge".to_string(),
            decryption_binary_path: "mp4decrypt".to_string(),
            hidden_progress: false,
            progress: None,
        }
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Base URL used to absolutize segment references, overriding the
    /// redirected manifest URL (mostly useful for local manifest files).
    pub fn base_url(mut self, base: &str) -> Self {
        self.base_url = Some(base.to_string());
        self
    }

    pub fn proxy(mut self, proxy: &str) -> Self {
        self.proxy = Some(proxy.to_string());
        self
    }

    /// Copy the input URL's query string onto every segment URL.
    pub fn append_url_params(mut self, yes: bool) -> Self {
        self.append_url_params = yes;
        self
    }

    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = n.max(1);
        self
    }

    pub fn download_retry_count(mut self, n: u32) -> Self {
        self.download_retry_count = n;
        self
    }

    pub fn web_request_retry_count(mut self, n: u32) -> Self {
        self.web_request_retry_count = n;
        self
    }

    pub fn http_request_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Add a `KID:KEY` decryption key (hex).
    pub fn key(mut self, key: &str) -> Self {
        self.keys.push(key.to_string());
        self
    }

    pub fn key_text_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_text_file = Some(path.into());
        self
    }

    pub fn custom_hls_key(mut self, key_override: HlsKeyOverride) -> Self {
        self.hls_key_override = key_override;
        self
    }

    pub fn select_video(mut self, expr: &str) -> Self {
        if let Ok(f) = TrackFilter::parse(expr) {
            self.video_select = f;
        }
        self
    }

    pub fn select_audio(mut self, expr: &str) -> Self {
        if let Ok(f) = TrackFilter::parse(expr) {
            self.audio_select = f;
        }
        self
    }

    pub fn select_subtitle(mut self, expr: &str) -> Self {
        if let Ok(f) = TrackFilter::parse(expr) {
            self.subtitle_select = f;
        }
        self
    }

    pub fn drop_video(mut self, expr: &str) -> Self {
        self.drop_video = TrackFilter::parse(expr).ok();
        self
    }

    pub fn drop_audio(mut self, expr: &str) -> Self {
        self.drop_audio = TrackFilter::parse(expr).ok();
        self
    }

    pub fn drop_subtitle(mut self, expr: &str) -> Self {
        self.drop_subtitle = TrackFilter::parse(expr).ok();
        self
    }

    pub fn save_name(mut self, name: &str) -> Self {
        if !name.is_empty() {
            self.save_name = Some(name.to_string());
        }
        self
    }

    pub fn save_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.save_dir = dir.into();
        self
    }

    pub fn tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = Some(dir.into());
        self
    }

    /// `srt` (default) or `vtt`.
    pub fn subtitle_format(mut self, format: &str) -> Self {
        self.subtitle_format = format.to_lowercase();
        self
    }

    pub fn binary_merge(mut self, yes: bool) -> Self {
        self.binary_merge = yes;
        self
    }

    pub fn skip_merge(mut self, yes: bool) -> Self {
        self.skip_merge = yes;
        self
    }

    pub fn skip_download(mut self, yes: bool) -> Self {
        self.skip_download = yes;
        self
    }

    pub fn delete_after_done(mut self, yes: bool) -> Self {
        self.delete_after_done = yes;
        self
    }

    pub fn check_segments_count(mut self, yes: bool) -> Self {
        self.check_segments_count = yes;
        self
    }

    pub fn concurrent_download(mut self, yes: bool) -> Self {
        self.concurrent_download = yes;
        self
    }

    /// Decrypt CENC segments as they arrive instead of once after merge.
    pub fn mp4_real_time_decryption(mut self, yes: bool) -> Self {
        self.mp4_real_time_decryption = yes;
        self
    }

    pub fn use_ffmpeg_concat_demuxer(mut self, yes: bool) -> Self {
        self.use_ffmpeg_concat_demuxer = yes;
        self
    }

    pub fn write_meta_json(mut self, yes: bool) -> Self {
        self.write_meta_json = yes;
        self
    }

    pub fn mux_after_done(mut self, yes: bool) -> Self {
        self.mux_after_done = yes;
        self
    }

    /// Container for the final mux: `mp4`, `mkv` or `ts`.
    pub fn mux_format(mut self, format: &str) -> Self {
        self.mux_format = format.to_lowercase();
        self
    }

    pub fn use_mkvmerge(mut self, yes: bool) -> Self {
        self.use_mkvmerge = yes;
        self
    }

    pub fn mux_skip_subtitle(mut self, yes: bool) -> Self {
        self.mux_skip_subtitle = yes;
        self
    }

    pub fn mux_import(mut self, import: MuxImport) -> Self {
        self.mux_imports.push(import);
        self
    }

    pub fn ffmpeg_path(mut self, path: &str) -> Self {
        self.ffmpeg_path = path.to_string();
        self
    }

    pub fn mkvmerge_path(mut self, path: &str) -> Self {
        self.mkvmerge_path = path.to_string();
        self
    }

    pub fn decryption_binary_path(mut self, path: &str) -> Self {
        self.decryption_binary_path = path.to_string();
        self
    }

    /// Disable the terminal progress display (tests, cron jobs).
    pub fn hidden_progress(mut self, yes: bool) -> Self {
        self.hidden_progress = yes;
        self
    }

    /// Share an externally created progress manager, so the caller can route
    /// its own log output through the progress region.
    pub fn progress_manager(mut self, manager: Arc<ProgressManager>) -> Self {
        self.progress = Some(manager);
        self
    }

    /// Run the whole pipeline.
    pub async fn download(mut self) -> Result<DownloadSummary, AbrError> {
        if self.mux_after_done {
            // the mux needs clean fMP4/TS inputs, which binary merge provides
            self.binary_merge = true;
        }
        let fetcher = HttpFetcher::new(self.http_timeout, self.proxy.as_deref())?;
        let web_retry = RetryPolicy::with_max_retries(self.web_request_retry_count);

        info!("loading manifest {}", self.url);
        let (content, final_url) = retry(&web_retry, || {
            let fetcher = fetcher.clone();
            let url = self.url.clone();
            let headers = self.headers.clone();
            async move { fetcher.get_string(&url, &headers).await }
        })
        .await?;
        let base = self.base_url.clone().unwrap_or(final_url);

        let mut tracks =
            extract_tracks(&content, &base, &fetcher, &self.headers, &self.hls_key_override)
                .await?;
        sort_tracks(&mut tracks);
        for track in &tracks {
            info!("{}", track.description());
        }

        let tmp_dir = self.tmp_dir.clone().unwrap_or_else(|| {
            self.save_dir.join(self.save_name.as_deref().unwrap_or("abr-dl-tmp"))
        });
        ensure_dir(&tmp_dir)?;
        if self.write_meta_json {
            write_meta_json(&tmp_dir.join("meta.json"), &tracks);
        }

        let mut selected =
            select_tracks(&tracks, &self.video_select, &self.audio_select, &self.subtitle_select);
        for (kind, filter) in [
            (MediaKind::Video, &self.drop_video),
            (MediaKind::Audio, &self.drop_audio),
            (MediaKind::Subtitles, &self.drop_subtitle),
        ] {
            if let Some(filter) = filter {
                let (of_kind, rest): (Vec<Track>, Vec<Track>) =
                    selected.into_iter().partition(|t| t.kind == kind);
                let mut kept = filter_drop(&of_kind, filter);
                kept.extend(rest);
                selected = kept;
                sort_tracks(&mut selected);
            }
        }
        if selected.is_empty() {
            return Err(AbrError::Other("no tracks selected".into()));
        }
        info!("selected {} track(s)", selected.len());

        resolve_track_playlists(
            &fetcher,
            &self.headers,
            &self.hls_key_override,
            &mut selected,
        )
        .await?;
        if self.append_url_params {
            append_input_params(&self.url, &mut selected);
        }
        if self.write_meta_json {
            write_meta_json(&tmp_dir.join("meta_selected.json"), &selected);
        }
        if self.skip_download {
            info!("skip-download set, stopping after track selection");
            return Ok(DownloadSummary::default());
        }

        ensure_dir(&self.save_dir)?;
        let progress = match self.progress.clone() {
            Some(manager) => manager,
            None if self.hidden_progress => Arc::new(ProgressManager::hidden()),
            None => Arc::new(ProgressManager::new()),
        };
        progress.start();

        let ctx = Arc::new(RunContext {
            fetcher,
            headers: self.headers.clone(),
            segment_retry: RetryPolicy::with_max_retries(self.download_retry_count),
            progress: progress.clone(),
            keys: Mutex::new(self.keys.clone()),
            output_files: Mutex::new(Vec::new()),
            validation_failed: AtomicBool::new(false),
            tmp_dir: tmp_dir.clone(),
            opts: self,
        });

        let download_error = run_tracks(ctx.clone(), selected).await;

        let mut mux_success = true;
        if ctx.opts.mux_after_done && !ctx.output_files.lock().unwrap().is_empty() {
            info!("muxing outputs");
            mux_success = mux_after_done(&ctx);
            if !mux_success {
                error!("muxing failed");
            }
        }

        let validation_failed = ctx.validation_failed.load(Ordering::SeqCst);
        if ctx.opts.delete_after_done {
            let all_ok = download_error.is_none()
                && !ctx.opts.skip_merge
                && mux_success
                && !validation_failed;
            if all_ok {
                let _ = fs::remove_dir_all(&ctx.tmp_dir);
                info!("run complete, temp files removed");
            } else {
                let mut reasons = Vec::new();
                if download_error.is_some() {
                    reasons.push("download failed");
                }
                if ctx.opts.skip_merge {
                    reasons.push("merge skipped by configuration");
                }
                if !mux_success {
                    reasons.push("muxing failed");
                }
                if validation_failed {
                    reasons.push("file validation or post-processing failed");
                }
                info!("temp files kept ({})", reasons.join(", "));
            }
        } else {
            info!("temp files kept (--delete-after-done=false)");
        }

        progress.stop().await;

        if let Some(e) = download_error {
            return Err(e);
        }
        let output_files =
            ctx.output_files.lock().unwrap().iter().map(|f| f.path.clone()).collect();
        Ok(DownloadSummary { output_files, validation_failed })
    }
}

/// Shared state for one `download()` run.
struct RunContext {
    fetcher: HttpFetcher,
    headers: HashMap<String, String>,
    segment_retry: RetryPolicy,
    progress: Arc<ProgressManager>,
    keys: Mutex<Vec<String>>,
    output_files: Mutex<Vec<OutputFile>>,
    validation_failed: AtomicBool,
    tmp_dir: PathBuf,
    opts: StreamDownloader,
}

/// Everything the merge stage needs from a finished track download.
struct TrackResult {
    track: Track,
    stream_dir: PathBuf,
    files: BTreeMap<i64, PathBuf>,
    kid: String,
    media_infos: Vec<MediaInfo>,
    binary_merge: bool,
}

/// Detect the manifest family from the body and the (final) URL.
pub fn detect_extractor(content: &str, url: &str) -> ExtractorType {
    let content_lower = content.to_lowercase();
    let url_lower = url.to_lowercase();
    if content == LIVE_TS_SENTINEL {
        return ExtractorType::LiveTs;
    }
    if content_lower.contains("#extm3u")
        || url_lower.contains(".m3u8")
        || url_lower.contains("/m3u8/")
    {
        return ExtractorType::Hls;
    }
    if content_lower.contains("<mpd")
        || url_lower.contains(".mpd")
        || content_lower.contains("urn:mpeg:dash:schema")
    {
        return ExtractorType::Dash;
    }
    if mss::looks_like_mss(content, url) {
        return ExtractorType::Mss;
    }
    ExtractorType::Hls
}

/// A raw TS stream is modelled as one live track with a single segment.
pub fn live_ts_track(url: &str) -> Track {
    let mut playlist = Playlist::new();
    playlist.url = url.to_string();
    playlist.is_live = true;
    let mut part = MediaPart::default();
    part.segments.push(MediaSegment::new(0, 0.0, url.to_string()));
    playlist.media_parts.push(part);
    Track {
        kind: MediaKind::Video,
        extension: "ts".into(),
        media_url: url.to_string(),
        manifest_url: url.to_string(),
        extractor: ExtractorType::LiveTs,
        playlist: Some(playlist),
        ..Default::default()
    }
}

async fn extract_tracks(
    content: &str,
    base_url: &str,
    fetcher: &HttpFetcher,
    headers: &HashMap<String, String>,
    key_override: &HlsKeyOverride,
) -> Result<Vec<Track>, AbrError> {
    match detect_extractor(content, base_url) {
        ExtractorType::Hls => {
            hls::parse_m3u8(content, base_url, fetcher, headers, key_override).await
        }
        ExtractorType::Dash => dash::parse_mpd(content, base_url),
        ExtractorType::Mss => mss::parse_manifest(content, base_url),
        ExtractorType::LiveTs => Ok(vec![live_ts_track(base_url)]),
        ExtractorType::Unknown => Err(AbrError::Parsing("unrecognised manifest".into())),
    }
}

/// Fetch the media playlists of tracks that only carry a playlist URL so
/// far (HLS master entries), and refine their extensions.
async fn resolve_track_playlists(
    fetcher: &HttpFetcher,
    headers: &HashMap<String, String>,
    key_override: &HlsKeyOverride,
    tracks: &mut [Track],
) -> Result<(), AbrError> {
    for track in tracks.iter_mut() {
        if track.playlist.is_some() || track.media_url.is_empty() {
            continue;
        }
        let (content, final_url) = match fetcher.get_string(&track.media_url, headers).await {
            Ok(r) => r,
            Err(e) => {
                warn!("cannot load playlist {}: {e}", track.media_url);
                continue;
            }
        };
        match detect_extractor(&content, &final_url) {
            ExtractorType::Hls => {
                let parsed =
                    hls::parse_m3u8(&content, &final_url, fetcher, headers, key_override).await?;
                if let Some(parsed_track) = parsed.into_iter().next() {
                    track.playlist = parsed_track.playlist;
                    if track.kind == MediaKind::Subtitles {
                        hls::refine_subtitle_extension(track);
                    } else if track
                        .playlist
                        .as_ref()
                        .is_some_and(|p| p.media_init.is_some())
                    {
                        track.extension = "m4s".into();
                    } else {
                        track.extension = "ts".into();
                    }
                }
            }
            ExtractorType::LiveTs => {
                track.playlist = live_ts_track(&final_url).playlist;
                track.extension = "ts".into();
            }
            other => {
                warn!("unexpected nested manifest type {other:?} at {}", track.media_url);
            }
        }
    }
    Ok(())
}

/// Propagate the input URL's query string onto every segment URL.
fn append_input_params(input_url: &str, tracks: &mut [Track]) {
    let Ok(input) = Url::parse(input_url) else { return };
    let Some(query) = input.query() else { return };
    for track in tracks {
        let Some(playlist) = track.playlist.as_mut() else { continue };
        if let Some(init) = playlist.media_init.as_mut() {
            init.url = append_query(&init.url, query);
        }
        for seg in playlist.all_segments_mut() {
            seg.url = append_query(&seg.url, query);
        }
    }
}

fn append_query(url: &str, query: &str) -> String {
    if url.is_empty() || url.contains(query) {
        return url.to_string();
    }
    if url.contains('?') {
        format!("{url}&{query}")
    } else {
        format!("{url}?{query}")
    }
}

fn write_meta_json(path: &Path, tracks: &[Track]) {
    match serde_json::to_string_pretty(tracks) {
        Ok(json) => {
            if let Err(e) = fs::write(path, json) {
                warn!("cannot write {}: {e}", path.display());
            }
        }
        Err(e) => warn!("cannot serialise track list: {e}"),
    }
}

/// Drive all selected tracks: concurrently when configured, sequentially
/// otherwise. Merges run in the background and are joined before returning.
async fn run_tracks(ctx: Arc<RunContext>, tracks: Vec<Track>) -> Option<AbrError> {
    let mut first_error: Option<AbrError> = None;
    let mut merge_set: JoinSet<()> = JoinSet::new();

    if ctx.opts.concurrent_download {
        let mut download_set: JoinSet<Option<AbrError>> = JoinSet::new();
        for (task_id, track) in tracks.into_iter().enumerate() {
            let ctx = ctx.clone();
            download_set.spawn(async move { process_track(ctx, task_id, track).await.err() });
        }
        while let Some(joined) = download_set.join_next().await {
            match joined {
                Ok(Some(e)) if first_error.is_none() => first_error = Some(e),
                Ok(_) => {}
                Err(e) if first_error.is_none() => {
                    first_error = Some(AbrError::Other(format!("track worker panicked: {e}")))
                }
                Err(_) => {}
            }
        }
    } else {
        for (task_id, track) in tracks.into_iter().enumerate() {
            let task = ctx.progress.add_task(TaskKind::Download, &track.short_description());
            match download_track(ctx.clone(), task_id, track, task.clone()).await {
                Ok(result) => {
                    if !ctx.opts.skip_merge {
                        let ctx = ctx.clone();
                        merge_set
                            .spawn(async move { merge_track_logged(ctx, task_id, result).await });
                    }
                }
                Err(e) => {
                    task.set_error(&e.to_string());
                    error!("track {task_id} download failed: {e}");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
    }
    while merge_set.join_next().await.is_some() {}
    first_error
}

/// Download + merge for one track when tracks run concurrently (each track
/// is its own tokio task, so the merge can follow inline).
async fn process_track(ctx: Arc<RunContext>, task_id: usize, track: Track) -> Result<(), AbrError> {
    let task = ctx.progress.add_task(TaskKind::Download, &track.short_description());
    match download_track(ctx.clone(), task_id, track, task.clone()).await {
        Ok(result) => {
            if !ctx.opts.skip_merge {
                merge_track_logged(ctx, task_id, result).await;
            }
            Ok(())
        }
        Err(e) => {
            task.set_error(&e.to_string());
            error!("track {task_id} download failed: {e}");
            Err(e)
        }
    }
}

async fn merge_track_logged(ctx: Arc<RunContext>, task_id: usize, result: TrackResult) {
    if let Err(e) = merge_track(ctx.clone(), task_id, result).await {
        error!("track {task_id} post-processing failed: {e}");
        ctx.validation_failed.store(true, Ordering::SeqCst);
    }
}

fn snapshot_keys(ctx: &RunContext) -> Vec<String> {
    ctx.keys.lock().unwrap().clone()
}

fn discover_kid_and_key(ctx: &RunContext, data: &[u8]) -> String {
    let kid = mp4::find_widevine_kid(data)
        .or_else(|| mp4::find_default_kid(data))
        .unwrap_or_default();
    if !kid.is_empty() {
        info!("discovered KID {kid}");
        if let Some(key_file) = &ctx.opts.key_text_file {
            match search_key_from_file(key_file, &kid) {
                Ok(Some(key)) => ctx.keys.lock().unwrap().push(key),
                Ok(None) => {}
                Err(e) => warn!("key file lookup failed: {e}"),
            }
        }
    }
    kid
}

/// Number the worker pool will write into `fileDictionary`; one entry per
/// successful segment, plus `-1` for the init segment.
async fn download_track(
    ctx: Arc<RunContext>,
    task_id: usize,
    mut track: Track,
    task: Arc<Task>,
) -> Result<TrackResult, AbrError> {
    let playlist =
        track.playlist.clone().ok_or_else(|| AbrError::Other("track has no playlist".into()))?;

    let mut segments: Vec<MediaSegment> = playlist.all_segments().cloned().collect();

    // a single huge file on a range-capable server is split into 10 MiB
    // logical clips and downloaded like an ordinary segmented track
    if segments.len() == 1 && segments[0].start_range.is_none() {
        if let Some(split) = try_split_single_segment(&ctx, &segments[0]).await {
            warn!("single large file detected, split into {} ranged clips", split.len());
            segments = split;
        }
    }

    let mut total = segments.len() as u64;
    if playlist.media_init.is_some() {
        total += 1;
    }
    let total_bytes = (playlist.total_bytes > 0).then_some(playlist.total_bytes as u64);
    task.set_total(total, total_bytes);
    task.start();

    let stream_dir = ctx
        .tmp_dir
        .join(format!("{task_id}_{}", sanitize_filename(&track.short_description())));
    ensure_dir(&stream_dir)?;
    info!("downloading {}", track.description());

    let seg_ctx = SegmentContext {
        fetcher: ctx.fetcher.clone(),
        headers: ctx.headers.clone(),
        retry: ctx.segment_retry,
    };

    let files: Arc<Mutex<BTreeMap<i64, PathBuf>>> = Arc::new(Mutex::new(BTreeMap::new()));
    let mut binary_merge = ctx.opts.binary_merge;
    let mut current_kid = String::new();
    let mut media_infos: Vec<MediaInfo> = Vec::new();
    let pad_width = segment_pad_width(segments.len().max(playlist.segment_count()));
    let extension = if track.extension.is_empty() { "ts".to_string() } else { track.extension.clone() };

    // ---- init segment ----
    if let Some(init) = playlist.media_init.clone().filter(|i| !i.url.is_empty()) {
        if !binary_merge && track.kind != MediaKind::Subtitles {
            binary_merge = true;
            info!("fMP4 init segment present, switching to binary merge");
        }
        let init_path = stream_dir.join("_init.mp4.tmp");
        download_segment(&seg_ctx, &init, &init_path, &task, None).await.map_err(|e| {
            warn!("init segment download failed: {e}");
            e
        })?;
        task.increment(1);
        let mut init_final = init_path.clone();
        let init_bytes = fs::read(&init_path)
            .map_err(|e| AbrError::Io(e, "reading init segment".into()))?;
        current_kid = discover_kid_and_key(&ctx, &init_bytes);

        // real-time CENC decryption of the init itself
        if ctx.opts.mp4_real_time_decryption
            && !current_kid.is_empty()
            && init.encrypt_info.method.is_cenc()
        {
            let keys = snapshot_keys(&ctx);
            if !keys.is_empty() {
                let dec_path = replace_tmp_suffix(&init_path, "_dec.tmp");
                let binary = ctx.opts.decryption_binary_path.clone();
                let enc = init_path.clone();
                let dec = dec_path.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    decrypt_cenc(&binary, &keys, &enc, &dec)
                })
                .await
                .map_err(|e| AbrError::Decrypting(format!("decrypt worker died: {e}")))?;
                match outcome {
                    Ok(()) => init_final = dec_path,
                    Err(e) => error!("init segment CENC decryption failed: {e}"),
                }
            }
        }
        files.lock().unwrap().insert(-1, init_final.clone());

        info!("reading media information...");
        let probe_path = init_final.clone();
        media_infos =
            tokio::task::spawn_blocking(move || probe_media_info(&probe_path)).await.unwrap_or_default();
        apply_media_infos(&mut track, &media_infos, &mut binary_merge);
    }

    if !binary_merge && segments.iter().any(|s| s.encrypt_info.method.is_cenc()) {
        binary_merge = true;
        info!("CENC content detected, switching to binary merge");
    }

    // ---- overall decrypt tasks ----
    let aes_count = segments
        .iter()
        .filter(|s| s.is_encrypted && s.encrypt_info.method == EncryptMethod::Aes128)
        .count() as u64;
    let aes_task = (aes_count > 0).then(|| {
        let t = ctx.progress.add_task(
            TaskKind::Decrypt,
            &format!("{} (AES-128)", track.short_description()),
        );
        t.set_total(aes_count, None);
        t
    });
    let cenc_count =
        segments.iter().filter(|s| s.encrypt_info.method.is_cenc()).count() as u64;
    let realtime_cenc = ctx.opts.mp4_real_time_decryption && cenc_count > 0;
    let cenc_task = realtime_cenc.then(|| {
        let t = ctx.progress.add_task(
            TaskKind::Decrypt,
            &format!("{} (CENC)", track.short_description()),
        );
        t.set_total(cenc_count, None);
        t
    });

    // ---- first content segment (KID discovery / media probe / MSS init) ----
    let mut remaining = segments;
    if !remaining.is_empty()
        && (playlist.media_init.as_ref().map(|i| i.url.is_empty()).unwrap_or(true)
            || track.extractor == ExtractorType::Mss)
    {
        let first = remaining.remove(0);
        let first_path = stream_dir.join(segment_file_name(&first, pad_width, &extension));
        download_segment(&seg_ctx, &first, &first_path, &task, aes_task.as_ref()).await?;
        task.increment(1);
        let mut first_final = first_path.clone();

        if current_kid.is_empty() {
            if let Ok(bytes) = fs::read(&first_path) {
                current_kid = discover_kid_and_key(&ctx, &bytes);
            }
        }
        if realtime_cenc && !current_kid.is_empty() && first.encrypt_info.method.is_cenc() {
            let keys = snapshot_keys(&ctx);
            if !keys.is_empty() {
                let dec_path = replace_tmp_suffix(&first_path, "_dec.tmp");
                let binary = ctx.opts.decryption_binary_path.clone();
                let (enc, dec) = (first_path.clone(), dec_path.clone());
                let outcome = tokio::task::spawn_blocking(move || {
                    decrypt_cenc(&binary, &keys, &enc, &dec)
                })
                .await
                .map_err(|e| AbrError::Decrypting(format!("decrypt worker died: {e}")))?;
                match outcome {
                    Ok(()) => first_final = dec_path,
                    Err(e) => {
                        if let Some(t) = &cenc_task {
                            t.set_error(&format!("real-time CENC decryption failed: {e}"));
                        }
                    }
                }
            }
        }

        if playlist.media_init.as_ref().map(|i| i.url.is_empty()).unwrap_or(true)
            && media_infos.is_empty()
        {
            info!("reading media information...");
            let probe_path = first_final.clone();
            media_infos = tokio::task::spawn_blocking(move || probe_media_info(&probe_path))
                .await
                .unwrap_or_default();
            apply_media_infos(&mut track, &media_infos, &mut binary_merge);
        }

        if track.extractor == ExtractorType::Mss {
            info!("synthesising MSS init box");
            let first_bytes = fs::read(&first_final)
                .map_err(|e| AbrError::Io(e, "reading first MSS fragment".into()))?;
            let mut processor = MssMoovProcessor::new(&track)?;
            let header = processor.gen_header(&first_bytes)?;
            let init_path = stream_dir.join("_init.mp4.tmp");
            fs::write(&init_path, header)
                .map_err(|e| AbrError::Io(e, "writing synthesised init box".into()))?;
            files.lock().unwrap().insert(-1, init_path);
            task.increment(1);
        }

        files.lock().unwrap().insert(first.index, first_final);
    }

    // ---- worker pool over the remaining segments ----
    let semaphore = Arc::new(Semaphore::new(ctx.opts.thread_count));
    let failures = Arc::new(AtomicU32::new(0));
    let keys_snapshot = Arc::new(snapshot_keys(&ctx));
    let mut pool: JoinSet<()> = JoinSet::new();
    for seg in remaining {
        let semaphore = semaphore.clone();
        let seg_ctx = seg_ctx.clone();
        let task = task.clone();
        let aes_task = aes_task.clone();
        let cenc_task = cenc_task.clone();
        let files = files.clone();
        let failures = failures.clone();
        let stream_dir = stream_dir.clone();
        let extension = extension.clone();
        let kid = current_kid.clone();
        let keys = keys_snapshot.clone();
        let decrypt_binary = ctx.opts.decryption_binary_path.clone();
        let realtime = realtime_cenc && !kid.is_empty() && !keys.is_empty();
        let check_length = ctx.opts.check_segments_count;
        pool.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            if check_length && failures.load(Ordering::SeqCst) > 0 {
                // a sibling already failed the track; don't start more work
                return;
            }
            let path = stream_dir.join(segment_file_name(&seg, pad_width, &extension));
            match download_segment(&seg_ctx, &seg, &path, &task, aes_task.as_ref()).await {
                Ok(final_path) => {
                    let mut stored = final_path.clone();
                    if realtime && seg.encrypt_info.method.is_cenc() {
                        let dec_path = replace_tmp_suffix(&final_path, "_dec.tmp");
                        let keys = keys.to_vec();
                        let dec = dec_path.clone();
                        let enc = final_path.clone();
                        let outcome = tokio::task::spawn_blocking(move || {
                            decrypt_cenc(&decrypt_binary, &keys, &enc, &dec)
                        })
                        .await;
                        match outcome {
                            Ok(Ok(())) => {
                                stored = dec_path;
                                if let Some(t) = &cenc_task {
                                    t.increment(1);
                                }
                            }
                            Ok(Err(e)) => {
                                if let Some(t) = &cenc_task {
                                    t.set_error(&format!(
                                        "real-time CENC decryption failed: {e}"
                                    ));
                                }
                            }
                            Err(e) => {
                                if let Some(t) = &cenc_task {
                                    t.set_error(&format!("decrypt worker died: {e}"));
                                }
                            }
                        }
                    }
                    files.lock().unwrap().insert(seg.index, stored);
                    task.increment(1);
                }
                Err(e) => {
                    warn!("segment {} failed: {e}", seg.index);
                    failures.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
    }
    while pool.join_next().await.is_some() {}

    let failure_count = failures.load(Ordering::SeqCst);
    if failure_count > 0 && ctx.opts.check_segments_count {
        if let Some(t) = &aes_task {
            if !t.is_finished() {
                t.set_error("dependent download task failed");
            }
        }
        if let Some(t) = &cenc_task {
            if !t.is_finished() {
                t.set_error("dependent download task failed");
            }
        }
        return Err(AbrError::Other(format!("{failure_count} segment(s) failed to download")));
    }

    let files = Arc::try_unwrap(files)
        .map(|m| m.into_inner().unwrap())
        .unwrap_or_else(|arc| arc.lock().unwrap().clone());
    Ok(TrackResult { track, stream_dir, files, kid: current_kid, media_infos, binary_merge })
}

/// HEAD-probe a single-file track and split it into 10 MiB range clips when
/// the server advertises `Accept-Ranges: bytes`.
async fn try_split_single_segment(
    ctx: &RunContext,
    segment: &MediaSegment,
) -> Option<Vec<MediaSegment>> {
    if !ctx.fetcher.supports_ranges(&segment.url, &ctx.headers).await {
        return None;
    }
    let file_size = ctx.fetcher.content_length(&segment.url, &ctx.headers).await;
    if file_size <= 0 {
        return None;
    }
    let clips = split_into_clips(segment, file_size);
    (clips.len() > 1).then_some(clips)
}

/// Cut a `file_size`-byte resource into 10 MiB range segments; the final
/// clip is open-ended so trailing bytes are never lost to rounding.
pub fn split_into_clips(segment: &MediaSegment, file_size: i64) -> Vec<MediaSegment> {
    let mut clips = Vec::new();
    let mut remaining = file_size;
    let mut counter: i64 = 0;
    let mut index: i64 = 0;
    while remaining > 0 {
        let mut seg = MediaSegment::new(index, 0.0, segment.url.clone());
        seg.encrypt_info = segment.encrypt_info.clone();
        seg.is_encrypted = segment.is_encrypted;
        seg.start_range = Some(counter);
        if remaining - SPLIT_CLIP_SIZE > 0 {
            seg.expect_length = Some(SPLIT_CLIP_SIZE + 1);
            remaining -= SPLIT_CLIP_SIZE;
            counter += SPLIT_CLIP_SIZE + 1;
            index += 1;
            clips.push(seg);
        } else {
            // final clip is open-ended
            clips.push(seg);
            break;
        }
    }
    clips
}

/// `xxx.tmp` → `xxx_dec.tmp`.
fn replace_tmp_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path.to_string_lossy();
    PathBuf::from(match name.strip_suffix(".tmp") {
        Some(stem) => format!("{stem}{suffix}"),
        None => format!("{name}{suffix}"),
    })
}

/// Feed the ffprobe results back into the track: Dolby Vision forces binary
/// merge, and a "video" track whose streams are all audio is demoted.
fn apply_media_infos(track: &mut Track, infos: &[MediaInfo], binary_merge: &mut bool) {
    if infos.is_empty() {
        return;
    }
    for info in infos {
        info!("  [{}] {}", info.codec_type, info.codec_name);
    }
    if !*binary_merge && infos.iter().any(|i| i.codec_name.starts_with("dvh")) {
        *binary_merge = true;
        info!("Dolby Vision detected, switching to binary merge");
    }
    if infos.iter().all(MediaInfo::is_audio) && track.kind != MediaKind::Subtitles {
        track.kind = MediaKind::Audio;
        // pure audio merges fine (better, even) with ffmpeg; MSS stays
        // binary because its synthesised init must lead the file
        if track.extractor != ExtractorType::Mss {
            *binary_merge = false;
        }
    }
}

/// Validate, post-process (subtitles), merge and record one finished track.
async fn merge_track(
    ctx: Arc<RunContext>,
    task_id: usize,
    mut result: TrackResult,
) -> Result<(), AbrError> {
    let playlist = result.track.playlist.as_ref().expect("downloaded track has playlist");
    let mut expected = playlist.segment_count();
    if result.files.contains_key(&-1) {
        expected += 1;
    }
    // a range-split single segment legitimately yields more files
    let actual = result.files.len();
    if actual < expected {
        ctx.validation_failed.store(true, Ordering::SeqCst);
        return Err(AbrError::SegmentCountMismatch { expected, actual });
    }

    // subtitles are extracted/fixed rather than merged
    if result.track.kind == MediaKind::Subtitles {
        let fixed = post_process_subtitles(&ctx, &mut result).await?;
        result.files = BTreeMap::from([(0, fixed)]);
    }

    if result.files.is_empty() {
        warn!("track {task_id} has no downloaded segments, nothing to merge");
        return Ok(());
    }

    let output_path = build_output_path(&ctx, &result.track, task_id);
    let merge_task =
        ctx.progress.add_task(TaskKind::Merge, &result.track.short_description());
    merge_task.set_total(1, None);
    merge_task.start();

    let ordered: Vec<PathBuf> = result.files.values().cloned().collect();
    let final_path = if result.track.kind == MediaKind::Subtitles {
        // the fixed subtitle file only needs to move into place
        fs::rename(&ordered[0], &output_path)
            .or_else(|_| fs::copy(&ordered[0], &output_path).map(|_| ()))
            .map_err(|e| AbrError::Io(e, "placing subtitle output".into()))?;
        output_path.clone()
    } else if result.binary_merge || ctx.opts.ffmpeg_path.is_empty() {
        let out = output_path.clone();
        let files = ordered.clone();
        tokio::task::spawn_blocking(move || merge::binary_concat(&files, &out))
            .await
            .map_err(|e| AbrError::Merging(format!("merge worker died: {e}")))??;
        output_path.clone()
    } else {
        let mut inputs = ordered.clone();
        if inputs.len() > PRE_MERGE_THRESHOLD {
            info!("{} inputs, pre-merging in batches", inputs.len());
            let batched = inputs.clone();
            inputs = tokio::task::spawn_blocking(move || merge::partial_combine(&batched))
                .await
                .map_err(|e| AbrError::Merging(format!("merge worker died: {e}")))??;
        }
        let mux_format =
            if result.track.kind == MediaKind::Audio { "M4A" } else { "MP4" };
        let output_base = output_path.with_extension("");
        let options = MergeOptions {
            use_concat_demuxer: ctx.opts.use_ffmpeg_concat_demuxer,
            ..Default::default()
        };
        let ffmpeg_path = ctx.opts.ffmpeg_path.clone();
        let working_dir = result.stream_dir.clone();
        let format = mux_format.to_string();
        tokio::task::spawn_blocking(move || {
            merge::ffmpeg_merge(
                &ffmpeg_path,
                &inputs,
                &output_base,
                &format,
                true,
                &options,
                &working_dir,
            )
        })
        .await
        .map_err(|e| AbrError::Merging(format!("merge worker died: {e}")))?
        .inspect_err(|_| merge_task.set_error("merge failed"))?
    };
    merge_task.update(1, fs::metadata(&final_path).ok().map(|m| m.len()));

    // post-merge CENC decryption happens only when real-time decryption was
    // off and we have a KID with keys
    let keys = snapshot_keys(&ctx);
    if !ctx.opts.mp4_real_time_decryption && !result.kid.is_empty() && !keys.is_empty() {
        info!("decrypting merged output {}", final_path.display());
        let decrypt_task = ctx.progress.add_task(
            TaskKind::Decrypt,
            &final_path.file_name().unwrap_or_default().to_string_lossy(),
        );
        decrypt_task.set_total(1, fs::metadata(&final_path).ok().map(|m| m.len()));
        let dec_path = final_path.with_extension(format!(
            "dec.{}",
            final_path.extension().unwrap_or_default().to_string_lossy()
        ));
        let binary = ctx.opts.decryption_binary_path.clone();
        let (enc, dec) = (final_path.clone(), dec_path.clone());
        let outcome =
            tokio::task::spawn_blocking(move || decrypt_cenc(&binary, &keys, &enc, &dec))
                .await
                .map_err(|e| AbrError::Decrypting(format!("decrypt worker died: {e}")))?;
        match outcome {
            Ok(()) => {
                fs::remove_file(&final_path)
                    .map_err(|e| AbrError::Io(e, "replacing encrypted output".into()))?;
                fs::rename(&dec_path, &final_path)
                    .map_err(|e| AbrError::Io(e, "renaming decrypted output".into()))?;
                decrypt_task.update(1, None);
            }
            Err(e) => {
                decrypt_task.set_error(&e.to_string());
                return Err(e);
            }
        }
    }

    let mut output_files = ctx.output_files.lock().unwrap();
    output_files.push(OutputFile {
        path: final_path,
        kind: result.track.kind,
        lang_code: result.track.language.clone(),
        description: result.track.name.clone(),
        media_infos: result.media_infos.clone(),
    });
    Ok(())
}

/// Run the subtitle flow matching the track shape and write the fixed
/// SRT/VTT file; returns its path.
async fn post_process_subtitles(
    ctx: &Arc<RunContext>,
    result: &mut TrackResult,
) -> Result<PathBuf, AbrError> {
    let track = &result.track;
    let ordered: Vec<PathBuf> =
        result.files.iter().filter(|(i, _)| **i >= 0).map(|(_, p)| p.clone()).collect();
    let stream_dir = result.stream_dir.clone();

    let is_fmp4 = track.extension == "m4s" || track.need_ttml_conversion;
    let mut vtt = if is_fmp4 && track.codecs.contains("stpp") {
        info!("extracting TTML (fMP4) subtitles...");
        let files = ordered.clone();
        tokio::task::spawn_blocking(move || subtitle::extract_ttml_from_mp4s(&files))
            .await
            .map_err(|e| AbrError::SubtitleExtraction(format!("worker died: {e}")))??
    } else if is_fmp4 && track.codecs.contains("wvtt") {
        info!("extracting WebVTT (fMP4) subtitles...");
        let merged = stream_dir.join("temp_sub.mp4");
        let all: Vec<PathBuf> = result.files.values().cloned().collect();
        merge::binary_concat(&all, &merged)?;
        let merged_for_worker = merged.clone();
        let vtt =
            tokio::task::spawn_blocking(move || subtitle::extract_vtt_from_mp4(&merged_for_worker))
                .await
                .map_err(|e| AbrError::SubtitleExtraction(format!("worker died: {e}")))??;
        let _ = fs::remove_file(&merged);
        vtt
    } else if track.extension == "ttml" {
        info!("fixing raw TTML subtitles...");
        let mut merged = WebVttSub::default();
        for path in &ordered {
            let content = fs::read_to_string(path)
                .map_err(|e| AbrError::Io(e, format!("reading {}", path.display())))?;
            let piece = subtitle::extract_from_ttml_text(&content, 0);
            merged.append(&piece);
        }
        merged
    } else {
        info!("fixing raw VTT subtitles...");
        let mut merged = WebVttSub::default();
        let mut first = true;
        for path in &ordered {
            let content = fs::read_to_string(path)
                .map_err(|e| AbrError::Io(e, format!("reading {}", path.display())))?;
            let piece = WebVttSub::parse(&content);
            if first {
                merged = piece;
                first = false;
            } else {
                merged.append(&piece);
            }
        }
        merged
    };

    if let Some(skipped) = track.skipped_duration.filter(|d| *d > 0.0) {
        vtt.left_shift((skipped * 1000.0) as i64);
    }
    subtitle::write_image_pngs(&mut vtt, &stream_dir)?;
    if std::env::var(ENV_KEEP_IMAGE_SEGMENTS).as_deref() != Ok("1")
        && vtt.cues.iter().any(|c| c.is_image)
    {
        for path in &ordered {
            let _ = fs::remove_file(path);
        }
    }
    vtt.sort_by_start();

    let (content, fixed_path) = if ctx.opts.subtitle_format == "vtt" {
        (vtt.to_vtt(), stream_dir.join("fixed_sub.tmp.vtt"))
    } else {
        (vtt.to_srt(), stream_dir.join("fixed_sub.tmp.srt"))
    };
    fs::write(&fixed_path, content)
        .map_err(|e| AbrError::Io(e, "writing fixed subtitle file".into()))?;
    Ok(fixed_path)
}

/// Saved name policy: explicit save-name (suffixed with the language for
/// non-video tracks), else composed from the track attributes, else
/// `track_{id}`; `_N` appended until the name is free.
fn build_output_path(ctx: &RunContext, track: &Track, task_id: usize) -> PathBuf {
    let base_name = match &ctx.opts.save_name {
        Some(name) => {
            if !track.language.is_empty() && track.kind != MediaKind::Video {
                format!("{name}.{}", track.language)
            } else {
                name.clone()
            }
        }
        None => {
            let mut parts: Vec<String> = Vec::new();
            for value in [&track.group_id, &track.codecs, &track.resolution] {
                if !value.is_empty() {
                    parts.push(value.clone());
                }
            }
            if let Some(bw) = track.bandwidth {
                parts.push(bw.to_string());
            }
            if !track.language.is_empty() {
                parts.push(track.language.clone());
            }
            if parts.is_empty() {
                format!("track_{task_id}")
            } else {
                parts.join("_")
            }
        }
    };
    let extension = output_extension(ctx, track);
    let mut candidate = base_name.clone();
    let mut counter = 1;
    loop {
        let path = ctx.opts.save_dir.join(format!("{}{extension}", sanitize_filename(&candidate)));
        let taken = path.exists()
            || ctx.output_files.lock().unwrap().iter().any(|f| f.path == path);
        if !taken {
            return path;
        }
        candidate = format!("{base_name}_{counter}");
        counter += 1;
    }
}

fn output_extension(ctx: &RunContext, track: &Track) -> String {
    if track.kind == MediaKind::Subtitles {
        return format!(".{}", ctx.opts.subtitle_format);
    }
    if track.kind == MediaKind::Audio && (track.extension == "m4s" || track.extension == "mp4") {
        return ".m4a".into();
    }
    if track.extension == "m4s" || track.extension == "mp4" {
        return ".mp4".into();
    }
    ".ts".into()
}

/// Partition the merged outputs by kind (plus the imports) and produce the
/// final container(s): one mux per video track carrying every audio and
/// subtitle track, or an audio-only container when no video exists at all.
fn mux_after_done(ctx: &Arc<RunContext>) -> bool {
    let outputs = ctx.output_files.lock().unwrap().clone();
    let mut videos: Vec<OutputFile> =
        outputs.iter().filter(|f| f.kind == MediaKind::Video).cloned().collect();
    let mut audios: Vec<OutputFile> =
        outputs.iter().filter(|f| f.kind == MediaKind::Audio).cloned().collect();
    let mut subtitles: Vec<OutputFile> = if ctx.opts.mux_skip_subtitle {
        Vec::new()
    } else {
        outputs.iter().filter(|f| f.kind == MediaKind::Subtitles).cloned().collect()
    };

    for import in &ctx.opts.mux_imports {
        let file = OutputFile {
            path: import.path.clone(),
            kind: import.kind,
            lang_code: import.lang_code.clone(),
            description: import.description.clone(),
            media_infos: Vec::new(),
        };
        match import.kind {
            MediaKind::Video => videos.push(file),
            MediaKind::Subtitles => {
                if !ctx.opts.mux_skip_subtitle {
                    subtitles.push(file);
                }
            }
            _ => audios.push(file),
        }
    }

    if videos.is_empty() {
        if audios.is_empty() {
            warn!("nothing to mux: no video and no audio outputs");
            return true;
        }
        warn!("no video track, producing an audio-only container");
    }

    let mut all_ok = true;
    if !videos.is_empty() {
        for video in &videos {
            let mut inputs = vec![video.clone()];
            inputs.extend(audios.iter().cloned());
            inputs.extend(subtitles.iter().cloned());
            let base = video.path.with_extension("");
            let base = PathBuf::from(format!("{}.MUX", base.display()));
            if !execute_mux(ctx, &inputs, &base) {
                all_ok = false;
            }
        }
    } else {
        let mut inputs = audios.clone();
        inputs.extend(subtitles.iter().cloned());
        let base = audios[0].path.with_extension("");
        let base = PathBuf::from(format!("{}.MUX", base.display()));
        if !execute_mux(ctx, &inputs, &base) {
            all_ok = false;
        }
    }
    all_ok
}

fn execute_mux(ctx: &Arc<RunContext>, inputs: &[OutputFile], output_base: &Path) -> bool {
    info!("muxing {} input(s) into {}", inputs.len(), output_base.display());
    let mux_task = ctx.progress.add_task(
        TaskKind::Mux,
        &output_base.file_name().unwrap_or_default().to_string_lossy(),
    );
    mux_task.set_total(1, None);
    mux_task.start();
    let muxed = if ctx.opts.use_mkvmerge {
        ffmpeg::mux_inputs_mkvmerge(&ctx.opts.mkvmerge_path, inputs, output_base)
    } else {
        ffmpeg::mux_inputs_ffmpeg(
            &ctx.opts.ffmpeg_path,
            inputs,
            output_base,
            &ctx.opts.mux_format,
            true,
        )
    };
    match muxed {
        Ok(path) => {
            mux_task.update(1, fs::metadata(&path).ok().map(|m| m.len()));
            info!("mux complete: {}", path.display());
            ctx.output_files.lock().unwrap().push(OutputFile {
                path,
                kind: MediaKind::Unknown,
                lang_code: String::new(),
                description: String::new(),
                media_infos: Vec::new(),
            });
            true
        }
        Err(e) => {
            mux_task.set_error(&e.to_string());
            error!("mux failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_extractor() {
        assert_eq!(
            detect_extractor("#EXTM3U\n...", "https://example.net/x"),
            ExtractorType::Hls
        );
        assert_eq!(
            detect_extractor("<MPD type=\"static\"/>", "https://example.net/x"),
            ExtractorType::Dash
        );
        assert_eq!(
            detect_extractor("<SmoothStreamingMedia/>", "https://example.net/x"),
            ExtractorType::Mss
        );
        assert_eq!(
            detect_extractor(LIVE_TS_SENTINEL, "https://example.net/x"),
            ExtractorType::LiveTs
        );
        assert_eq!(
            detect_extractor("", "https://example.net/video.ism/Manifest"),
            ExtractorType::Mss
        );
        assert_eq!(
            detect_extractor("", "https://example.net/playlist.m3u8?yes=1"),
            ExtractorType::Hls
        );
    }

    #[test]
    fn test_live_ts_track_shape() {
        let track = live_ts_track("https://example.net/live");
        assert_eq!(track.kind, MediaKind::Video);
        assert_eq!(track.extension, "ts");
        let playlist = track.playlist.as_ref().unwrap();
        assert!(playlist.is_live);
        assert_eq!(playlist.segment_count(), 1);
        assert_eq!(
            playlist.all_segments().next().unwrap().url,
            "https://example.net/live"
        );
    }

    #[test]
    fn test_mux_import_parse() {
        let import =
            MuxImport::parse("path=extra/video.mp4:type=video:lang=en:name=Main").unwrap();
        assert_eq!(import.kind, MediaKind::Video);
        assert_eq!(import.path, PathBuf::from("extra/video.mp4"));
        assert_eq!(import.lang_code, "en");
        assert_eq!(import.description, "Main");
        assert!(MuxImport::parse("type=video").is_err());
        assert!(MuxImport::parse("path=a:type=whatever").is_err());
    }

    #[test]
    fn test_append_query() {
        assert_eq!(append_query("https://e.net/a.ts", "tok=1"), "https://e.net/a.ts?tok=1");
        assert_eq!(
            append_query("https://e.net/a.ts?x=2", "tok=1"),
            "https://e.net/a.ts?x=2&tok=1"
        );
        // idempotent
        assert_eq!(
            append_query("https://e.net/a.ts?tok=1", "tok=1"),
            "https://e.net/a.ts?tok=1"
        );
    }

    #[test]
    fn test_replace_tmp_suffix() {
        assert_eq!(
            replace_tmp_suffix(Path::new("/x/0001.m4s.tmp"), "_dec.tmp"),
            PathBuf::from("/x/0001.m4s_dec.tmp")
        );
        assert_eq!(
            replace_tmp_suffix(Path::new("/x/_init.mp4.tmp"), "_dec.tmp"),
            PathBuf::from("/x/_init.mp4_dec.tmp")
        );
    }
}
