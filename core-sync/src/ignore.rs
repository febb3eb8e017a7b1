//! # Ignore Rules
//!
//! gitignore-style patterns naming local paths the engine never syncs.
//!
//! ## Syntax
//!
//! - Blank lines and lines starting with `#` are skipped
//! - `!` negates a rule, a trailing `/` restricts it to folders
//! - A leading `/` anchors the pattern to the sync root
//! - Patterns without a `/` match the name at any depth
//! - `*`, `?`, `[...]`, `{a,b}` and `**` glob as usual, `\` escapes
//!
//! A path is ignored when it or any of its ancestor folders matches.

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::error::{Result, SyncError};
use core_metadata::basename;

/// Rules applied before the user's own
pub const DEFAULT_RULES: &[&str] = &[
    ".*",
    ".dropbox",
    ".dropbox.attr",
    ".dropbox.cache",
    "*.tmp",
    "*.bak",
    "*~",
    "\\#*\\#",
    ".~lock.*#",
    ".fuse_hidden*",
    ".Trash-*",
    "~$*.{doc,xls,ppt}*",
    ".DS_Store",
    ".DocumentRevisions-V100",
    ".fseventsd",
    ".Spotlight-V100",
    ".TemporaryItems",
    ".Trashes",
    ".VolumeIcon.icns",
    "Icon\r",
    "*.sw[px]",
    "Thumbs.db",
    "ehthumbs.db",
];

#[derive(Debug, Clone)]
struct Rule {
    regex: Regex,
    negate: bool,
    folder_only: bool,
    match_base: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    rules: Vec<Rule>,
}

impl IgnoreRules {
    /// Parse rules, one pattern per item
    pub fn new<I, S>(lines: I, case_insensitive: bool) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        for line in lines {
            if let Some(rule) = parse_line(line.as_ref(), case_insensitive)? {
                rules.push(rule);
            }
        }
        debug!(count = rules.len(), "Loaded ignore rules");
        Ok(Self { rules })
    }

    /// [`DEFAULT_RULES`] followed by `extra` when `use_defaults` is set
    pub fn with_defaults(extra: &[String], use_defaults: bool, case_insensitive: bool) -> Result<Self> {
        let defaults: &[&str] = if use_defaults { DEFAULT_RULES } else { &[] };
        let lines = defaults
            .iter()
            .map(|s| s.to_string())
            .chain(extra.iter().cloned());
        Self::new(lines, case_insensitive)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn is_ignored(&self, path: &str, is_folder: bool) -> bool {
        let ancestor_ignored = path
            .match_indices('/')
            .map(|(i, _)| &path[..i])
            .any(|ancestor| self.matches(ancestor, true));
        ancestor_ignored || self.matches(path, is_folder)
    }

    fn matches(&self, path: &str, is_folder: bool) -> bool {
        let name = basename(path);
        let mut ignored = false;
        for rule in &self.rules {
            // A positive rule can only set, a negation can only clear
            if rule.negate != ignored {
                continue;
            }
            if rule.folder_only && !is_folder {
                continue;
            }
            let target = if rule.match_base { name } else { path };
            if rule.regex.is_match(target) {
                ignored = !rule.negate;
            }
        }
        ignored
    }
}

fn parse_line(line: &str, case_insensitive: bool) -> Result<Option<Rule>> {
    let line = line.trim_end_matches(&[' ', '\t'][..]);
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (negate, line) = match line.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, line),
    };
    let (folder_only, line) = match line.strip_suffix('/') {
        Some(rest) => (true, rest),
        None => (false, line),
    };
    let (anchored, line) = match line.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, line),
    };
    if line.is_empty() {
        return Ok(None);
    }

    let pattern = format!("^{}$", glob_to_regex(line));
    let regex = RegexBuilder::new(&pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| SyncError::validation("ignore rule", format!("{}: {}", line, e)))?;

    Ok(Some(Rule {
        regex,
        negate,
        folder_only,
        match_base: !anchored && !line.contains('/'),
    }))
}

fn escape(c: char) -> String {
    regex::escape(c.encode_utf8(&mut [0; 4]))
}

fn glob_to_regex(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::with_capacity(glob.len() * 2);
    let mut braces = 0;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                out.push_str(&escape(chars[i + 1]));
                i += 2;
                continue;
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                if let Some(close) = class_end(&chars, i) {
                    out.push('[');
                    let mut k = i + 1;
                    if matches!(chars[k], '!' | '^') {
                        out.push('^');
                        k += 1;
                    }
                    for &c in &chars[k..close] {
                        if matches!(c, '\\' | '[' | '&' | '~') {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push(']');
                    i = close + 1;
                    continue;
                }
                out.push_str(&escape('['));
            }
            '{' => {
                braces += 1;
                out.push_str("(?:");
            }
            '}' if braces > 0 => {
                braces -= 1;
                out.push(')');
            }
            ',' if braces > 0 => out.push('|'),
            c => out.push_str(&escape(c)),
        }
        i += 1;
    }
    out
}

/// Index of the `]` closing the class opened at `open`
fn class_end(chars: &[char], open: usize) -> Option<usize> {
    let mut k = open + 1;
    if matches!(chars.get(k), Some('!') | Some('^')) {
        k += 1;
    }
    // A `]` right after the opening is a literal member
    if chars.get(k) == Some(&']') {
        k += 1;
    }
    chars[k.min(chars.len())..]
        .iter()
        .position(|&c| c == ']')
        .map(|p| k + p)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(lines: &[&str]) -> IgnoreRules {
        IgnoreRules::new(lines.iter().copied(), false).unwrap()
    }

    #[test]
    fn test_default_rules() {
        let ignore = IgnoreRules::with_defaults(&[], true, false).unwrap();
        assert!(ignore.is_ignored(".DS_Store", false));
        assert!(ignore.is_ignored("docs/.cloudsync-tmp", true));
        assert!(ignore.is_ignored("docs/report.docx.tmp", false));
        assert!(ignore.is_ignored("docs/~$report.docx", false));
        assert!(ignore.is_ignored("notes.txt.swp", false));
        assert!(ignore.is_ignored("#draft#", false));
        assert!(ignore.is_ignored("Icon\r", false));
        assert!(!ignore.is_ignored("docs/report.docx", false));
        assert!(!ignore.is_ignored("Icon", false));
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let ignore = rules(&["# a comment", "", "   ", "*.log   "]);
        assert_eq!(ignore.len(), 1);
        assert!(ignore.is_ignored("debug.log", false));
    }

    #[test]
    fn test_negation_only_clears() {
        let ignore = rules(&["*.log", "!keep.log"]);
        assert!(ignore.is_ignored("x.log", false));
        assert!(!ignore.is_ignored("keep.log", false));

        let ignore = rules(&["!keep.log", "*.log"]);
        assert!(ignore.is_ignored("keep.log", false));
    }

    #[test]
    fn test_folder_only_rules() {
        let ignore = rules(&["build/"]);
        assert!(ignore.is_ignored("build", true));
        assert!(!ignore.is_ignored("build", false));
        assert!(ignore.is_ignored("build/output.bin", false));
        assert!(ignore.is_ignored("src/build/output.bin", false));
    }

    #[test]
    fn test_anchored_rules() {
        let ignore = rules(&["/tmp"]);
        assert!(ignore.is_ignored("tmp", true));
        assert!(ignore.is_ignored("tmp/a", false));
        assert!(!ignore.is_ignored("a/tmp", true));
    }

    #[test]
    fn test_globstar_and_braces() {
        let ignore = rules(&["docs/**/*.pdf", "**/cache", "*.{jpg,png}"]);
        assert!(ignore.is_ignored("docs/a.pdf", false));
        assert!(ignore.is_ignored("docs/x/y/a.pdf", false));
        assert!(!ignore.is_ignored("other/a.pdf", false));
        assert!(ignore.is_ignored("cache", true));
        assert!(ignore.is_ignored("x/y/cache", true));
        assert!(ignore.is_ignored("photos/cat.png", false));
        assert!(!ignore.is_ignored("photos/cat.gif", false));
    }

    #[test]
    fn test_character_classes_and_escapes() {
        let ignore = rules(&["file[0-9].txt", "[!a]*.md", "\\!important"]);
        assert!(ignore.is_ignored("file7.txt", false));
        assert!(!ignore.is_ignored("fileA.txt", false));
        assert!(ignore.is_ignored("readme.md", false));
        assert!(!ignore.is_ignored("about.md", false));
        assert!(ignore.is_ignored("!important", false));
    }

    #[test]
    fn test_case_insensitive_matching() {
        let ignore = IgnoreRules::new(["thumbs.db"], true).unwrap();
        assert!(ignore.is_ignored("Pictures/Thumbs.DB", false));
        let ignore = IgnoreRules::new(["thumbs.db"], false).unwrap();
        assert!(!ignore.is_ignored("Pictures/Thumbs.DB", false));
    }
}
