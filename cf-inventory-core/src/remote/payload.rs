//! Transport-safe delivery of shell scripts.
//!
//! A script is base64-encoded and wrapped in a one-line command that decodes
//! it and pipes it into `/bin/sh -s`. The base64 alphabet contains no quote,
//! whitespace or shell metacharacter, so the wrapper survives any number of
//! quoting layers (ssh argument, `sh -c`, nested launch scripts) unchanged.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Shell that decodes and runs a payload on the remote side.
pub const REMOTE_SHELL: &str = "/bin/sh";

pub fn encode_payload(script: &str) -> String {
    STANDARD.encode(script.as_bytes())
}

pub fn decode_payload(encoded: &str) -> Result<String, String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("payload base64 decode failed: {e}"))?;
    String::from_utf8(bytes).map_err(|e| format!("payload is not UTF-8: {e}"))
}

/// One-line command that runs `script` in a non-interactive shell.
pub fn wire_command(script: &str) -> String {
    format!(
        "printf '%s' '{}' | base64 -d | {REMOTE_SHELL} -s",
        encode_payload(script)
    )
}

/// Shell snippet writing `script` to `path` without interpreting it.
pub fn write_file_command(script: &str, path: &str) -> String {
    format!(
        "printf '%s' '{}' | base64 -d > {}",
        encode_payload(script),
        shell_quote(path)
    )
}

/// Pull the payload back out of a command built by [`wire_command`].
pub fn extract_payload(command: &str) -> Option<&str> {
    let rest = command.strip_prefix("printf '%s' '")?;
    let end = rest.find('\'')?;
    Some(&rest[..end])
}

/// POSIX single-quote a word.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:@=+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}
