//! Path identities
//!
//! Two paths that the local filesystem would treat as the same entry must map
//! to the same store key. A [`Normalizer`] is picked once at startup and
//! injected wherever identities are computed.

use std::sync::Arc;
use unicode_normalization::UnicodeNormalization;

use crate::document::Identity;

pub trait Normalizer: Send + Sync {
    fn identity(&self, path: &str) -> Identity;

    /// Whether distinct spellings of a name can share an identity
    fn is_case_insensitive(&self) -> bool;
}

/// Identity is the path as-is (Linux)
#[derive(Debug, Clone, Copy, Default)]
pub struct CaseSensitive;

impl Normalizer for CaseSensitive {
    fn identity(&self, path: &str) -> Identity {
        path.to_string()
    }

    fn is_case_insensitive(&self) -> bool {
        false
    }
}

/// NFD then uppercase (macOS HFS+/APFS default)
#[derive(Debug, Clone, Copy, Default)]
pub struct CaseInsensitive;

impl Normalizer for CaseInsensitive {
    fn identity(&self, path: &str) -> Identity {
        path.nfd().collect::<String>().to_uppercase()
    }

    fn is_case_insensitive(&self) -> bool {
        true
    }
}

/// Uppercase without Unicode normalization (NTFS)
#[derive(Debug, Clone, Copy, Default)]
pub struct UppercaseOnly;

impl Normalizer for UppercaseOnly {
    fn identity(&self, path: &str) -> Identity {
        path.to_uppercase()
    }

    fn is_case_insensitive(&self) -> bool {
        true
    }
}

/// Normalizer matching the default filesystem of the target OS
pub fn platform_normalizer() -> Arc<dyn Normalizer> {
    if cfg!(target_os = "macos") {
        Arc::new(CaseInsensitive)
    } else if cfg!(windows) {
        Arc::new(UppercaseOnly)
    } else {
        Arc::new(CaseSensitive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_sensitive_keeps_path() {
        assert_eq!(CaseSensitive.identity("Foo/Bar.txt"), "Foo/Bar.txt");
        assert_ne!(
            CaseSensitive.identity("foo"),
            CaseSensitive.identity("FOO")
        );
    }

    #[test]
    fn test_case_insensitive_merges_unicode_forms() {
        let composed = "caf\u{e9}.txt";
        let decomposed = "cafe\u{301}.TXT";
        assert_eq!(
            CaseInsensitive.identity(composed),
            CaseInsensitive.identity(decomposed)
        );
    }

    #[test]
    fn test_uppercase_only_does_not_normalize() {
        assert_eq!(UppercaseOnly.identity("a/b.txt"), "A/B.TXT");
        assert_ne!(
            UppercaseOnly.identity("caf\u{e9}"),
            UppercaseOnly.identity("cafe\u{301}")
        );
    }
}
