//! Downloading one media segment: fetch with retry, byte accounting,
//! in-process decryption, write to the temp path.
//!
//! Only *network* bytes feed the speed container; decrypted output is never
//! counted. CENC segments pass through untouched (the manager dispatches
//! them to the external decrypt tool); every other encrypted segment is
//! decrypted inline before the file is written, so `*.tmp` files on disk are
//! always cleartext for in-process methods.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::crypto;
use crate::net::{HttpFetcher, RetryPolicy};
use crate::progress::Task;
use crate::track::{EncryptInfo, EncryptMethod, MediaSegment};
use crate::util::ensure_dir;
use crate::AbrError;

/// Shared context for the per-track segment workers.
#[derive(Clone)]
pub struct SegmentContext {
    pub fetcher: HttpFetcher,
    pub headers: HashMap<String, String>,
    pub retry: RetryPolicy,
}

/// Decrypt a whole-segment cipher in process. CENC family data is returned
/// unchanged; methods without an in-process implementation fail with
/// `DecryptUnsupported`.
pub fn decrypt_in_process(data: Vec<u8>, info: &EncryptInfo) -> Result<Vec<u8>, AbrError> {
    let key = info.key.as_deref().unwrap_or_default();
    let iv = info.iv.as_deref().unwrap_or_default();
    match info.method {
        EncryptMethod::None => Ok(data),
        EncryptMethod::Cenc | EncryptMethod::Cbcs => Ok(data),
        EncryptMethod::Aes128 | EncryptMethod::AesCbc => {
            crypto::aes_128_cbc_decrypt(&data, key, iv)
        }
        EncryptMethod::Aes128Ecb => crypto::aes_128_ecb_decrypt(&data, key),
        EncryptMethod::AesCtr => crypto::aes_128_ctr_decrypt(&data, key, iv),
        EncryptMethod::ChaCha20 => crypto::chacha20_decrypt_per_1024(&data, key, iv),
        other => Err(AbrError::DecryptUnsupported(other.to_string())),
    }
}

/// Fetch one segment into `output_path`. Byte counts flow into `task`; a
/// successful AES-class decrypt bumps `aes_task` by one. Returns the final
/// file path.
pub async fn download_segment(
    ctx: &SegmentContext,
    segment: &MediaSegment,
    output_path: &Path,
    task: &Task,
    aes_task: Option<&Arc<Task>>,
) -> Result<PathBuf, AbrError> {
    if let Some(parent) = output_path.parent() {
        ensure_dir(parent)?;
    }
    let range = segment.start_range.map(|start| (start, segment.stop_range()));

    // retry loop written out by hand: the attempt future borrows the
    // streaming response, which the generic retry helper cannot express
    let mut delay = ctx.retry.base_delay;
    let mut data: Option<Vec<u8>> = None;
    for attempt in 0..=ctx.retry.max_retries {
        if attempt > 0 {
            debug!("segment {} retry {attempt}/{}", segment.index, ctx.retry.max_retries);
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(ctx.retry.backoff);
        }
        match fetch_segment_once(ctx, segment, range, task).await {
            Ok(body) => {
                data = Some(body);
                break;
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => debug!("segment {} attempt failed: {e}", segment.index),
        }
    }
    let data = data.ok_or(AbrError::SegmentDownload(segment.index))?;

    let is_aes_class = segment.is_encrypted && !segment.encrypt_info.method.is_cenc();
    let data = if is_aes_class {
        let info = segment.encrypt_info.clone();
        let result = tokio::task::spawn_blocking(move || decrypt_in_process(data, &info))
            .await
            .map_err(|e| AbrError::Decrypting(format!("decrypt worker died: {e}")))?;
        match result {
            Ok(clear) => clear,
            Err(e) => {
                if let Some(aes_task) = aes_task {
                    aes_task.set_error(&format!("segment {} decryption failed: {e}", segment.index));
                }
                return Err(e);
            }
        }
    } else {
        data
    };

    tokio::fs::write(output_path, &data)
        .await
        .map_err(|e| AbrError::Io(e, format!("writing {}", output_path.display())))?;

    if is_aes_class {
        if let Some(aes_task) = aes_task {
            aes_task.increment(1);
        }
    }
    debug!("segment {} done ({} bytes)", segment.index, data.len());
    Ok(output_path.to_path_buf())
}

async fn fetch_segment_once(
    ctx: &SegmentContext,
    segment: &MediaSegment,
    range: Option<(i64, Option<i64>)>,
    task: &Task,
) -> Result<Vec<u8>, AbrError> {
    debug!("downloading segment {}: {}", segment.index, segment.url);
    let (mut resp, _) = ctx.fetcher.send_get(&segment.url, &ctx.headers, range).await?;
    let mut body: Vec<u8> = Vec::new();
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| AbrError::Network(format!("reading segment {}: {e}", segment.index)))?
    {
        task.add_bytes(chunk.len() as u64);
        body.extend_from_slice(&chunk);
    }
    if let Some(expected) = segment.expect_length {
        if segment.start_range.is_some() && body.len() as i64 != expected {
            return Err(AbrError::Network(format!(
                "segment {}: expected {expected} bytes, got {}",
                segment.index,
                body.len()
            )));
        }
    }
    Ok(body)
}

/// Temp file name for a segment: zero-padded index (or the template value
/// the manifest named it with) plus the track extension and `.tmp`.
pub fn segment_file_name(segment: &MediaSegment, pad_width: usize, extension: &str) -> String {
    format!("{:0>pad_width$}.{extension}.tmp", segment.index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrypt_dispatch() {
        let clear = decrypt_in_process(
            vec![1, 2, 3],
            &EncryptInfo { method: EncryptMethod::None, ..Default::default() },
        )
        .unwrap();
        assert_eq!(clear, vec![1, 2, 3]);

        // CENC passes through for the external tool
        let cenc = decrypt_in_process(
            vec![9, 9],
            &EncryptInfo { method: EncryptMethod::Cenc, ..Default::default() },
        )
        .unwrap();
        assert_eq!(cenc, vec![9, 9]);

        let err = decrypt_in_process(
            vec![0; 16],
            &EncryptInfo { method: EncryptMethod::SampleAes, ..Default::default() },
        )
        .unwrap_err();
        assert!(matches!(err, AbrError::DecryptUnsupported(_)));

        let err = decrypt_in_process(
            vec![0; 16],
            &EncryptInfo { method: EncryptMethod::Aes128, ..Default::default() },
        )
        .unwrap_err();
        assert!(matches!(err, AbrError::Decrypting(_))); // missing key
    }

    #[test]
    fn test_segment_file_names() {
        let seg = MediaSegment::new(7, 4.0, "https://example.net/7.ts".into());
        assert_eq!(segment_file_name(&seg, 4, "ts"), "0007.ts.tmp");
        assert_eq!(segment_file_name(&seg, 1, "m4s"), "7.m4s.tmp");
    }
}
