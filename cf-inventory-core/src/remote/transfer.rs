//! Staging of local files before they are uploaded to a remote host.
//!
//! Scripts and env-files written on Windows carry CRLF line endings and a
//! UTF-8 BOM, either of which breaks `/bin/sh` on the remote side. Binaries
//! built for Windows carry an `.exe` suffix the remote never expects.
//! [`stage_uploads`] copies every file into a scratch directory in the
//! canonical remote form and returns the staged paths.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const SNIFF_LEN: usize = 8192;

/// Files ready for upload. The scratch directory lives as long as this value.
pub struct StagedUpload {
    _dir: TempDir,
    pub paths: Vec<PathBuf>,
}

/// A file with a NUL byte in its first 8 KiB is treated as binary.
pub fn is_text(content: &[u8]) -> bool {
    !content.iter().take(SNIFF_LEN).any(|b| *b == 0)
}

/// Strip a leading BOM and turn CRLF (and lone CR) into LF.
pub fn normalize_text(content: &[u8]) -> Vec<u8> {
    let body = content.strip_prefix(UTF8_BOM).unwrap_or(content);
    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.iter().peekable();
    while let Some(&b) = iter.next() {
        if b == b'\r' {
            if iter.peek() == Some(&&b'\n') {
                iter.next();
            }
            out.push(b'\n');
        } else {
            out.push(b);
        }
    }
    out
}

/// File name used on the remote side for a local path.
pub fn remote_file_name(local: &Path) -> String {
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.len().checked_sub(4) {
        Some(stem_len) if stem_len > 0 && name.is_char_boundary(stem_len) && name[stem_len..].eq_ignore_ascii_case(".exe") => {
            name[..stem_len].to_string()
        }
        _ => name,
    }
}

pub fn stage_uploads(local_paths: &[PathBuf]) -> std::io::Result<StagedUpload> {
    let dir = tempfile::tempdir()?;
    let mut paths = Vec::with_capacity(local_paths.len());
    for local in local_paths {
        let content = fs::read(local)?;
        let name = remote_file_name(local);
        let staged = dir.path().join(&name);
        if is_text(&content) {
            let normalized = normalize_text(&content);
            debug!(
                source = %local.display(),
                staged = %staged.display(),
                changed = normalized.len() != content.len(),
                "Staged text file"
            );
            fs::write(&staged, normalized)?;
        } else {
            debug!(source = %local.display(), staged = %staged.display(), "Staged binary file");
            fs::write(&staged, &content)?;
        }
        copy_permissions(local, &staged)?;
        paths.push(staged);
    }
    info!(files = paths.len(), "Staged files for upload");
    Ok(StagedUpload { _dir: dir, paths })
}

#[cfg(unix)]
fn copy_permissions(from: &Path, to: &Path) -> std::io::Result<()> {
    let perms = fs::metadata(from)?.permissions();
    fs::set_permissions(to, perms)
}

#[cfg(not(unix))]
fn copy_permissions(_from: &Path, _to: &Path) -> std::io::Result<()> {
    Ok(())
}
