//! Name validation for anything that ends up in a backend resource name.
//!
//! Device and collision-domain names are embedded in container, pod and
//! network names, so they are checked before any provisioning call.

use crate::error::{TopologyError, TopologyResult};

/// Longest name accepted for a device or collision domain.
pub const MAX_NAME_LEN: usize = 63;

/// `[A-Za-z0-9][A-Za-z0-9_.-]*`
fn is_resource_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Check that `name` can be used inside backend resource names.
pub fn validate(kind: &'static str, name: &str) -> TopologyResult<()> {
    if name.len() > MAX_NAME_LEN || !is_resource_name(name) {
        return Err(TopologyError::NameConflict {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Check a resource prefix from settings (lowercase, DNS-label safe).
pub fn is_valid_prefix(prefix: &str) -> bool {
    let mut chars = prefix.chars();
    let first_ok = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit());
    prefix.len() <= 16
        && first_ok
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Lowercase `name` and replace everything outside `[a-z0-9-]` with `-`.
///
/// Used when a backend requires DNS-label names. Distinct inputs can
/// collapse to the same output, so callers that need uniqueness append
/// a hash suffix.
pub fn dns_label(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' }
        })
        .collect();
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(validate("device", "r1").is_ok());
        assert!(validate("device", "pc_1.lan-a").is_ok());
        assert!(validate("lan", "A").is_ok());
    }

    #[test]
    fn rejects_unsafe_names() {
        for bad in ["", "-lead", "has space", "slash/name", "dollar$", "ünicode"] {
            let err = validate("device", bad).unwrap_err();
            assert!(matches!(err, TopologyError::NameConflict { kind: "device", .. }), "{bad}");
        }
    }

    #[test]
    fn rejects_overlong_names() {
        let name = "a".repeat(MAX_NAME_LEN + 1);
        assert!(validate("lan", &name).is_err());
    }

    #[test]
    fn prefix_rules() {
        assert!(is_valid_prefix("meshlab"));
        assert!(is_valid_prefix("lab-1"));
        assert!(!is_valid_prefix("Mesh"));
        assert!(!is_valid_prefix("a_b"));
        assert!(!is_valid_prefix(""));
    }

    #[test]
    fn dns_label_downcases_and_replaces() {
        assert_eq!(dns_label("Core_Router.1"), "core-router-1");
        assert_eq!(dns_label("lan_"), "lan");
    }
}
