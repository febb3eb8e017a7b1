//! Conflict names
//!
//! The losing side of a path collision is renamed by inserting
//! `-conflict-<timestamp>` before the extension. Renaming an already suffixed
//! path replaces the suffix.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

/// Longest base name kept in front of the suffix, in characters
pub const MAX_BASE_LEN: usize = 180;

fn suffix_regex() -> &'static Regex {
    static SUFFIX: OnceLock<Regex> = OnceLock::new();
    SUFFIX.get_or_init(|| {
        Regex::new(r"-conflict-\d{4}(-\d{2}){2}T(\d{2}_?){3}\.\d{3}Z").expect("valid regex")
    })
}

/// Path of the conflict copy of `path` at `now`
pub fn conflict_path(path: &str, now: DateTime<Utc>) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, path),
    };

    let name = suffix_regex().replace_all(name, "");
    // A leading dot starts a hidden name, not an extension
    let (base, ext) = match name.rfind('.') {
        Some(i) if i > 0 => name.split_at(i),
        _ => (name.as_ref(), ""),
    };
    let base: String = base.chars().take(MAX_BASE_LEN).collect();

    let stamp = now
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
        .replace(':', "_");
    let renamed = format!("{base}-conflict-{stamp}{ext}");

    match dir {
        Some(dir) => format!("{dir}/{renamed}"),
        None => renamed,
    }
}

/// Whether `path` already carries a conflict suffix
pub fn is_conflict_path(path: &str) -> bool {
    suffix_regex().is_match(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 3, 14, 15, 9, 26).unwrap() + chrono::Duration::milliseconds(535)
    }

    #[test]
    fn test_suffix_goes_before_extension() {
        assert_eq!(
            conflict_path("docs/report.txt", at()),
            "docs/report-conflict-2018-03-14T15_09_26.535Z.txt"
        );
        assert_eq!(
            conflict_path("README", at()),
            "README-conflict-2018-03-14T15_09_26.535Z"
        );
        assert_eq!(
            conflict_path(".bashrc", at()),
            ".bashrc-conflict-2018-03-14T15_09_26.535Z"
        );
    }

    #[test]
    fn test_deterministic_per_path_and_time() {
        assert_eq!(conflict_path("a/b.txt", at()), conflict_path("a/b.txt", at()));
    }

    #[test]
    fn test_suffix_does_not_stack() {
        let once = conflict_path("foo.txt", at());
        let later = at() + chrono::Duration::seconds(5);
        let twice = conflict_path(&once, later);
        assert_eq!(twice, "foo-conflict-2018-03-14T15_09_31.535Z.txt");
        assert_eq!(twice.matches("-conflict-").count(), 1);
        assert!(is_conflict_path(&twice));
        assert!(!is_conflict_path("foo.txt"));

        let bare = conflict_path(&conflict_path("README", at()), later);
        assert_eq!(bare, "README-conflict-2018-03-14T15_09_31.535Z");
    }

    #[test]
    fn test_long_names_are_truncated() {
        let long = "x".repeat(300);
        let renamed = conflict_path(&format!("dir/{long}.pdf"), at());
        let name = renamed.strip_prefix("dir/").unwrap();
        assert!(name.starts_with(&"x".repeat(MAX_BASE_LEN)));
        assert!(!name.starts_with(&"x".repeat(MAX_BASE_LEN + 1)));
        assert!(name.ends_with(".pdf"));
    }
}
