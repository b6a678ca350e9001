//! Support for decrypting CENC-protected media content.
//
// Common Encryption (cenc/cbcs) is not decrypted in-process: we shell out to
// an mp4decrypt-compatible helper application with the `--key KID:KEY`
// argument convention. The invocation counts as successful only when the
// process exits 0 *and* the output file exists with a non-zero size, because
// some tool versions exit 0 after writing nothing.

use std::io::BufRead;
use std::path::Path;
use std::process::Command;

use fs_err as fs;
use tracing::{debug, error, info, warn};

use crate::util::normalize_kid;
use crate::AbrError;

/// Trim subprocess output for inclusion in log lines and error messages.
pub fn partial_process_output(out: &[u8]) -> String {
    let text = String::from_utf8_lossy(out);
    let trimmed = text.trim();
    if trimmed.len() > 4000 {
        let mut end = 4000;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    } else {
        trimmed.to_string()
    }
}

/// Look up `kid` in a key text file holding one `KID:KEY` pair per line
/// (hex, case-insensitive, dashes ignored; a leading `--key ` is tolerated
/// so mp4decrypt command logs can be pasted in directly).
pub fn search_key_from_file(key_text_file: &Path, kid: &str) -> Result<Option<String>, AbrError> {
    let wanted = normalize_kid(kid);
    if wanted.is_empty() {
        return Ok(None);
    }
    let file = fs::File::open(key_text_file)
        .map_err(|e| AbrError::Io(e, format!("opening key file {}", key_text_file.display())))?;
    for line in std::io::BufReader::new(file).lines() {
        let line = line.map_err(|e| AbrError::Io(e, "reading key file".into()))?;
        let line = line.trim().trim_start_matches("--key").trim();
        let Some((file_kid, file_key)) = line.split_once(':') else { continue };
        if normalize_kid(file_kid) == wanted {
            info!("found key for KID {kid} in {}", key_text_file.display());
            return Ok(Some(format!("{kid}:{}", file_key.trim())));
        }
    }
    Ok(None)
}

/// Decrypt `inpath` into `outpath` with the external tool at
/// `decrypt_binary`, passing every known `KID:KEY` pair.
pub fn decrypt_cenc(
    decrypt_binary: &str,
    keys: &[String],
    inpath: &Path,
    outpath: &Path,
) -> Result<(), AbrError> {
    if keys.is_empty() {
        return Err(AbrError::Decrypting("no decryption keys available".into()));
    }
    let mut args: Vec<String> = Vec::new();
    for key in keys {
        args.push("--key".into());
        args.push(key.clone());
    }
    args.push(inpath.to_string_lossy().to_string());
    args.push(outpath.to_string_lossy().to_string());
    debug!("running {decrypt_binary} {}", args.join(" "));
    let out = Command::new(decrypt_binary)
        .args(&args)
        .output()
        .map_err(|e| AbrError::Io(e, format!("spawning {decrypt_binary}")))?;

    let mut no_output = true;
    if let Ok(metadata) = fs::metadata(outpath) {
        no_output = metadata.len() == 0;
    }
    if !out.status.success() || no_output {
        error!("decryption subprocess failed for {}", inpath.display());
        let msg = partial_process_output(&out.stdout);
        if !msg.is_empty() {
            warn!("decrypt stdout: {msg}");
        }
        let msg = partial_process_output(&out.stderr);
        if !msg.is_empty() {
            warn!("decrypt stderr: {msg}");
        }
    }
    if no_output {
        warn!("undecrypted stream left in {}", inpath.display());
        return Err(AbrError::Decrypting(format!("decrypting {}", inpath.display())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_key_file_lookup() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment line").unwrap();
        writeln!(
            file,
            "--key 33363237-3430-3932-3735-343133363433:00000000000000000000000000000001"
        )
        .unwrap();
        writeln!(file, "AABBCCDD00112233445566778899AABB:ffeeddccbbaa99887766554433221100")
            .unwrap();
        let found =
            search_key_from_file(file.path(), "aabbccdd00112233445566778899aabb").unwrap();
        assert_eq!(
            found.as_deref(),
            Some("aabbccdd00112233445566778899aabb:ffeeddccbbaa99887766554433221100")
        );
        let dashed =
            search_key_from_file(file.path(), "33363237-3430-3932-3735-343133363433").unwrap();
        assert!(dashed.unwrap().ends_with(":00000000000000000000000000000001"));
        assert!(search_key_from_file(file.path(), "00000000000000000000000000000000")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_decrypt_requires_keys() {
        let err = decrypt_cenc("mp4decrypt", &[], Path::new("in.mp4"), Path::new("out.mp4"))
            .unwrap_err();
        assert!(matches!(err, AbrError::Decrypting(_)));
    }
}
