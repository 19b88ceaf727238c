//! Namespace identity — the stable key a lab is deployed under.
//!
//! The identity is a SHA-256 digest of the normalized lab path,
//! truncated to 128 bits and hex encoded. Hex keeps it URL-safe,
//! filesystem-safe and valid inside DNS-style resource names. It is
//! recomputed on demand and never stored.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Digest bytes kept in the identity (128 bits).
const DIGEST_BYTES: usize = 16;

/// Length of the short form used for resource-name prefixes.
pub const SHORT_LEN: usize = 7;

/// Deterministic identity of a deployed lab.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabHash(String);

impl LabHash {
    /// Wrap an identity read back from a backend label.
    ///
    /// Input is lowercased and stripped of characters outside `[a-z0-9-]`.
    pub fn from_raw(raw: &str) -> Self {
        Self(sanitize(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First seven sanitized characters, for contexts that need very
    /// short names (boundary and network prefixes).
    pub fn short(&self) -> String {
        sanitize(&self.0).chars().take(SHORT_LEN).collect()
    }
}

impl fmt::Display for LabHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LabHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the identity of a lab from its filesystem path.
pub fn derive(path: &Path) -> LabHash {
    let normalized = normalize_path(path);
    digest(normalized.to_string_lossy().as_bytes())
}

/// Derive the identity of a lab that is addressed by an explicit name.
pub fn derive_from_name(name: &str) -> LabHash {
    let ascii: String = name.chars().filter(char::is_ascii).collect();
    digest(ascii.as_bytes())
}

fn digest(bytes: &[u8]) -> LabHash {
    let hash = Sha256::digest(bytes);
    LabHash(hex::encode(&hash[..DIGEST_BYTES]))
}

/// Lowercase and keep only `[a-z0-9-]`.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}

/// Normalize a lab path before hashing.
///
/// Non-ASCII characters are dropped, relative paths are resolved against
/// the current directory, and `.`/`..`/repeated separators are collapsed
/// lexically. Symlinks are not followed, so the result depends only on
/// the input and the working directory.
pub fn normalize_path(path: &Path) -> PathBuf {
    let ascii: String = path
        .to_string_lossy()
        .chars()
        .filter(char::is_ascii)
        .collect();
    let ascii = PathBuf::from(ascii);

    let absolute = if ascii.is_absolute() {
        ascii
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(ascii),
            Err(_) => ascii,
        }
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
