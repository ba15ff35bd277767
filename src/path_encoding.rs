//! Filesystem-safe stream directory names.
//!
//! A stream's directory is named `<escaped-path>~<unix-nanos>~<8-hex>`:
//! the URL path percent-escaped so it is filesystem safe, a creation
//! timestamp, and a random suffix. Names are stable once assigned (the
//! metadata store records them) and never reused, which lets Delete
//! rename a directory aside and unlink it asynchronously while the same
//! path is immediately recreatable.

use chrono::Utc;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};

/// Escape everything except ASCII alphanumerics, `-`, `_` and `.`; in
/// particular `/`, `~` and `%` are escaped, so the `~` field separators
/// below are unambiguous.
const PATH_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Maximum length for the escaped path before truncation.
const MAX_ENCODED_LENGTH: usize = 200;
/// Length to truncate to, leaving room for the hash suffix.
const TRUNCATE_LENGTH: usize = 180;
/// Length of the hash suffix used for truncated paths.
const HASH_SUFFIX_LENGTH: usize = 16;

/// Prefix of directories pending asynchronous unlink.
pub const DELETED_PREFIX: &str = ".deleted~";

/// Escape a stream path into a filesystem-safe string.
///
/// Overlong results are truncated with a SHA-256 suffix to stay unique
/// within filesystem name limits.
pub fn encode_path(path: &str) -> String {
    let encoded = utf8_percent_encode(path, PATH_ESCAPE).to_string();
    if encoded.len() > MAX_ENCODED_LENGTH {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        let hash = hex::encode(hasher.finalize());
        format!(
            "{}~{}",
            &encoded[..TRUNCATE_LENGTH],
            &hash[..HASH_SUFFIX_LENGTH]
        )
    } else {
        encoded
    }
}

/// Generate a fresh directory name for a stream path.
pub fn generate_stream_dir_name(path: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let random = hex::encode(rand::random::<[u8; 4]>());
    format!("{}~{}~{}", encode_path(path), nanos, random)
}

/// Name a stream directory is renamed to while awaiting unlink.
pub fn deleted_dir_name(dir_name: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{DELETED_PREFIX}{dir_name}~{nanos}")
}

/// Whether a directory entry is a pending-unlink leftover.
pub fn is_deleted_dir_name(name: &str) -> bool {
    name.starts_with(DELETED_PREFIX)
}
