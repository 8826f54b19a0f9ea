//! Glob based exclusion of paths from the staged release
//!
//! Patterns are checked in two different places, with different rules:
//!
//! - [`MatchContext::Walk`]: while the copy-cache is walked, every entry is checked by its path
//!   relative to the cache root *and* by its basename. Wildcards match `/` here (`fnmatch`
//!   without a pathname flag), so `*.log` excludes `logs/debug.log` as well.
//! - [`MatchContext::Sweep`]: after the checkout/build, patterns are resolved against the
//!   destination root like a shell glob. `*` stops at `/`, so `*.log` only removes top level
//!   log files and `.git/*` only removes the direct children of `.git`.
//!
//! Multi-segment patterns can therefore give different results depending on the nesting of
//! the entries and on which step ran.
//!
//! In both contexts wildcards match dotfiles and entries named `.` or `..` are always excluded.
//!
//! # Examples
//!
//! ```
//! use common::exclude::{ExcludeSettings, MatchContext};
//! use std::path::Path;
//!
//! let mut settings = ExcludeSettings::new();
//! settings.add_exclude(".git/*").unwrap();
//!
//! assert!(settings.is_excluded(Path::new(".git/config"), MatchContext::Walk));
//! assert!(!settings.is_excluded(Path::new(".git"), MatchContext::Walk));
//! assert!(!settings.is_excluded(Path::new("src/app.rb"), MatchContext::Walk));
//! ```

use anyhow::{Context, anyhow};
use std::path::Path;

/// Where a pattern is being evaluated, see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchContext {
    Walk,
    Sweep,
}

/// A compiled exclusion pattern
#[derive(Debug, Clone)]
pub struct ExcludePattern {
    /// original pattern string, reported in logs
    pub original: String,
    /// `*` crosses directory separators
    walk_matcher: globset::GlobMatcher,
    /// `*` stops at directory separators
    sweep_matcher: globset::GlobMatcher,
}

impl ExcludePattern {
    pub fn parse(pattern: &str) -> Result<Self, anyhow::Error> {
        if pattern.is_empty() {
            return Err(anyhow!("empty exclude pattern is not allowed"));
        }
        let build = |literal_separator: bool| {
            globset::GlobBuilder::new(pattern)
                .literal_separator(literal_separator)
                .build()
                .map(|glob| glob.compile_matcher())
                .with_context(|| format!("invalid glob pattern: {}", pattern))
        };
        Ok(Self {
            original: pattern.to_string(),
            walk_matcher: build(false)?,
            sweep_matcher: build(true)?,
        })
    }
    pub fn matches(&self, relative_path: &Path, context: MatchContext) -> bool {
        match context {
            MatchContext::Walk => {
                if self.walk_matcher.is_match(relative_path) {
                    return true;
                }
                relative_path
                    .file_name()
                    .is_some_and(|name| self.walk_matcher.is_match(Path::new(name)))
            }
            MatchContext::Sweep => self.sweep_matcher.is_match(relative_path),
        }
    }
}

/// Why a path was (or wasn't) excluded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExcludeResult {
    Included,
    /// basename is `.` or `..`
    DotEntry,
    ExcludedByPattern(String),
}

/// Ordered set of exclusion patterns; any match excludes
#[derive(Debug, Clone, Default)]
pub struct ExcludeSettings {
    pub patterns: Vec<ExcludePattern>,
}

impl ExcludeSettings {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self, anyhow::Error> {
        let mut settings = Self::new();
        for pattern in patterns {
            settings.add_exclude(pattern.as_ref())?;
        }
        Ok(settings)
    }
    pub fn add_exclude(&mut self, pattern: &str) -> Result<(), anyhow::Error> {
        self.patterns.push(ExcludePattern::parse(pattern)?);
        Ok(())
    }
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
    /// Check a path relative to the root being walked or swept
    pub fn check(&self, relative_path: &Path, context: MatchContext) -> ExcludeResult {
        if is_dot_entry(relative_path) {
            return ExcludeResult::DotEntry;
        }
        for pattern in &self.patterns {
            if pattern.matches(relative_path, context) {
                return ExcludeResult::ExcludedByPattern(pattern.original.clone());
            }
        }
        ExcludeResult::Included
    }
    pub fn is_excluded(&self, relative_path: &Path, context: MatchContext) -> bool {
        self.check(relative_path, context) != ExcludeResult::Included
    }
}

/// `Path::file_name` normalizes trailing `.` away, so look at the raw last component.
fn is_dot_entry(path: &Path) -> bool {
    let raw = path.as_os_str().as_encoded_bytes();
    let last = raw.rsplit(|b| *b == b'/').next().unwrap_or(raw);
    last == b"." || last == b".."
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(patterns: &[&str]) -> ExcludeSettings {
        ExcludeSettings::from_patterns(patterns).unwrap()
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(ExcludePattern::parse("").is_err());
    }
    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(ExcludePattern::parse("[abc").is_err());
    }
    #[test]
    fn test_dot_entries_always_excluded() {
        let settings = ExcludeSettings::new();
        for context in [MatchContext::Walk, MatchContext::Sweep] {
            assert_eq!(settings.check(Path::new("."), context), ExcludeResult::DotEntry);
            assert_eq!(settings.check(Path::new(".."), context), ExcludeResult::DotEntry);
            assert_eq!(
                settings.check(Path::new("src/.."), context),
                ExcludeResult::DotEntry
            );
            assert_eq!(settings.check(Path::new(".hidden"), context), ExcludeResult::Included);
            assert_eq!(settings.check(Path::new("..x"), context), ExcludeResult::Included);
        }
    }
    #[test]
    fn test_wildcards_match_dotfiles() {
        let settings = settings(&["*rc"]);
        assert!(settings.is_excluded(Path::new(".bashrc"), MatchContext::Walk));
        assert!(settings.is_excluded(Path::new(".bashrc"), MatchContext::Sweep));
    }
    #[test]
    fn test_walk_matches_relative_path() {
        let settings = settings(&[".git/*"]);
        assert!(settings.is_excluded(Path::new(".git/config"), MatchContext::Walk));
        // in the walk context `*` crosses separators
        assert!(settings.is_excluded(Path::new(".git/objects/ab"), MatchContext::Walk));
        assert!(!settings.is_excluded(Path::new(".git"), MatchContext::Walk));
        assert!(!settings.is_excluded(Path::new("src/.git"), MatchContext::Walk));
    }
    #[test]
    fn test_walk_matches_basename() {
        let settings = settings(&["config"]);
        assert!(settings.is_excluded(Path::new(".git/config"), MatchContext::Walk));
        assert!(!settings.is_excluded(Path::new(".git/config"), MatchContext::Sweep));
        assert!(settings.is_excluded(Path::new("config"), MatchContext::Sweep));
    }
    #[test]
    fn test_sweep_star_stops_at_separator() {
        let settings = settings(&["*.log"]);
        assert!(settings.is_excluded(Path::new("debug.log"), MatchContext::Sweep));
        assert!(!settings.is_excluded(Path::new("logs/debug.log"), MatchContext::Sweep));
        // same path, walk context: excluded
        assert!(settings.is_excluded(Path::new("logs/debug.log"), MatchContext::Walk));
    }
    #[test]
    fn test_nested_pattern_differs_between_contexts() {
        let settings = settings(&[".git/*"]);
        assert!(settings.is_excluded(Path::new(".git/refs/heads"), MatchContext::Walk));
        assert!(!settings.is_excluded(Path::new(".git/refs/heads"), MatchContext::Sweep));
        assert!(settings.is_excluded(Path::new(".git/refs"), MatchContext::Sweep));
    }
    #[test]
    fn test_double_star_in_sweep() {
        let settings = settings(&["**/*.tmp"]);
        assert!(settings.is_excluded(Path::new("a/b/c.tmp"), MatchContext::Sweep));
        assert!(settings.is_excluded(Path::new("c.tmp"), MatchContext::Sweep));
    }
    #[test]
    fn test_reports_first_matching_pattern() {
        let settings = settings(&["*.rb", "src/*"]);
        assert_eq!(
            settings.check(Path::new("src/app.rb"), MatchContext::Walk),
            ExcludeResult::ExcludedByPattern("*.rb".to_string())
        );
        assert_eq!(
            settings.check(Path::new("src/app.py"), MatchContext::Walk),
            ExcludeResult::ExcludedByPattern("src/*".to_string())
        );
    }
}
