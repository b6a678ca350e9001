// Small helpers shared across the pipeline: filename hygiene, human-readable
// byte counts, segment name padding.

use std::path::Path;

use fs_err as fs;

use crate::AbrError;

/// Characters that are not acceptable in a filename on at least one of the
/// platforms we write to. Each is replaced by `_`.
const ILLEGAL_FILENAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Replace illegal filename characters by `_`. The argument is a single path
/// component, not a path.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if ILLEGAL_FILENAME_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// Width used for zero-padded temp segment names: number of decimal digits
/// needed for the largest index.
pub fn segment_pad_width(total_segments: usize) -> usize {
    let mut width = 1;
    let mut n = total_segments.saturating_sub(1);
    while n >= 10 {
        n /= 10;
        width += 1;
    }
    width
}

/// "1.24 MB", "317 B". Monotone over non-negative byte counts.
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.2} KB", b / KB)
    } else {
        format!("{bytes} B")
    }
}

/// "1.24 MB/s" etc., for the progress display.
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_size(bytes_per_second))
}

/// "25s", "4m10s", "1h2m3s".
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3600 {
        format!("{}m{}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h{}m{}s", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
    }
}

/// Create `dir` and its ancestors; failure aborts the calling operation.
pub fn ensure_dir(dir: &Path) -> Result<(), AbrError> {
    fs::create_dir_all(dir)
        .map_err(|e| AbrError::Io(e, format!("creating directory {}", dir.display())))
}

/// Parse a hex string, tolerating a `0x` prefix, dashes (UUID form) and mixed
/// case. Used for KIDs, keys and IVs.
pub fn parse_hex(s: &str) -> Result<Vec<u8>, AbrError> {
    let cleaned: String = s
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .chars()
        .filter(|c| *c != '-')
        .collect();
    hex::decode(&cleaned).map_err(|e| AbrError::Parsing(format!("invalid hex string {s:?}: {e}")))
}

/// Normalise a KID or key for comparison: lowercase hex without dashes.
pub fn normalize_kid(s: &str) -> String {
    s.trim()
        .chars()
        .filter(|c| *c != '-')
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_filename("Déjà vu (1080p)"), "Déjà vu (1080p)");
    }

    #[test]
    fn test_segment_pad_width() {
        assert_eq!(segment_pad_width(0), 1);
        assert_eq!(segment_pad_width(1), 1);
        assert_eq!(segment_pad_width(10), 1);
        assert_eq!(segment_pad_width(11), 2);
        assert_eq!(segment_pad_width(100), 2);
        assert_eq!(segment_pad_width(101), 3);
        assert_eq!(segment_pad_width(100_000), 5);
    }

    #[test]
    fn test_format_size_ordering() {
        let sizes = [0u64, 1, 1023, 1024, 1_048_575, 1_048_576, 5_000_000_000];
        for w in sizes.windows(2) {
            // the formatted form never regresses across a size increase
            assert_ne!(format_size(w[0]), format_size(w[1]));
        }
        assert_eq!(format_size(317), "317 B");
        assert_eq!(format_size(1024), "1.00 KB");
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0xDEADbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(
            parse_hex("edef8ba9-79d6-4ace-a3c8-27dcd51d21ed").unwrap().len(),
            16
        );
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_normalize_kid() {
        assert_eq!(
            normalize_kid("EDEF8BA9-79D6-4ACE-A3C8-27DCD51D21ED"),
            "edef8ba979d64acea3c827dcd51d21ed"
        );
    }
}
