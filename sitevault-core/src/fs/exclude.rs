//! Exclusion rules for archive walks and restore copies.
//!
//! A pattern containing a glob metacharacter (`* ? [ {`) or a path
//! separator is compiled into a glob and matched against the path relative
//! to the walk root, with `*` allowed to cross `/`. Any other pattern
//! matches one whole path segment. A path is excluded when it or any of
//! its ancestors matches.

use globset::{GlobBuilder, GlobMatcher};
use std::path::{Component, Path, PathBuf};

use crate::utils::{Error, Result};

#[derive(Debug, Clone)]
pub enum ExcludeRule {
    Glob(GlobMatcher),
    Segment(String),
}

impl ExcludeRule {
    pub fn parse(pattern: &str) -> Result<Self> {
        let trimmed = pattern.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Err(Error::Configuration("empty exclusion pattern".to_string()));
        }

        if trimmed.contains(['*', '?', '[', '{', '/', '\\']) {
            let glob = GlobBuilder::new(&trimmed.replace('\\', "/"))
                .literal_separator(false)
                .build()
                .map_err(|e| {
                    Error::Configuration(format!("invalid exclusion pattern {pattern:?}: {e}"))
                })?;
            Ok(ExcludeRule::Glob(glob.compile_matcher()))
        } else {
            Ok(ExcludeRule::Segment(trimmed.to_string()))
        }
    }

    /// Match this rule against one relative path, ignoring its ancestors.
    fn matches_exact(&self, rel: &str) -> bool {
        match self {
            ExcludeRule::Glob(glob) => glob.is_match(rel),
            ExcludeRule::Segment(segment) => rel.rsplit('/').next() == Some(segment.as_str()),
        }
    }
}

/// Parsed patterns plus the absolute paths that are always skipped.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    rules: Vec<ExcludeRule>,
    absolute: Vec<PathBuf>,
}

impl ExcludeSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let rules = patterns
            .iter()
            .map(|p| ExcludeRule::parse(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            absolute: Vec::new(),
        })
    }

    pub fn with_absolute(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        for path in paths {
            let path = path.canonicalize().unwrap_or(path);
            self.absolute.push(path);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.absolute.is_empty()
    }

    /// `rel` is relative to the walk root.
    pub fn is_excluded(&self, rel: &Path) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        let segments = normal_segments(rel);
        let mut prefix = String::new();
        for segment in segments {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(&segment);
            if self.rules.iter().any(|r| r.matches_exact(&prefix)) {
                return true;
            }
        }
        false
    }

    /// True when `abs` is inside one of the always-skipped paths.
    pub fn is_self_path(&self, abs: &Path) -> bool {
        if self.absolute.is_empty() {
            return false;
        }
        self.absolute.iter().any(|p| abs.starts_with(p))
    }

    pub fn excludes(&self, abs: &Path, rel: &Path) -> bool {
        self.is_self_path(abs) || self.is_excluded(rel)
    }
}

fn normal_segments(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_segment_matches_whole_component_only() {
        let set = ExcludeSet::new(&["cache"]).unwrap();
        assert!(set.is_excluded(Path::new("cache")));
        assert!(set.is_excluded(Path::new("content/cache/page.html")));
        assert!(!set.is_excluded(Path::new("content/cached/page.html")));
        assert!(!set.is_excluded(Path::new("content/mycache")));
    }

    #[test]
    fn test_glob_crosses_separators() {
        let set = ExcludeSet::new(&["*/cache/*"]).unwrap();
        assert!(set.is_excluded(Path::new("content/cache/a.txt")));
        assert!(set.is_excluded(Path::new("a/b/cache/c/d.txt")));
        assert!(!set.is_excluded(Path::new("cache/a.txt")));
    }

    #[test]
    fn test_path_pattern_excludes_descendants() {
        let set = ExcludeSet::new(&["content/uploads"]).unwrap();
        assert!(set.is_excluded(Path::new("content/uploads")));
        assert!(set.is_excluded(Path::new("content/uploads/2024/a.jpg")));
        assert!(!set.is_excluded(Path::new("other/content/uploads")));
    }

    #[test]
    fn test_extension_glob() {
        let set = ExcludeSet::new(&["*.log"]).unwrap();
        assert!(set.is_excluded(Path::new("debug.log")));
        assert!(set.is_excluded(Path::new("content/debug.log")));
        assert!(!set.is_excluded(Path::new("content/log.txt")));
    }

    #[test]
    fn test_invalid_patterns_are_configuration_errors() {
        assert!(matches!(
            ExcludeRule::parse("   "),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            ExcludeRule::parse("a[b"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_absolute_self_paths() {
        let set = ExcludeSet::default().with_absolute(vec![PathBuf::from("/srv/site/data")]);
        assert!(set.is_self_path(Path::new("/srv/site/data/work/x")));
        assert!(!set.is_self_path(Path::new("/srv/site/database")));
    }

    fn segment() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["a", "b", "cache", "logs", "x"]).prop_map(String::from)
    }

    proptest! {
        #[test]
        fn prop_segment_rule_matches_iff_any_component_equal(
            parts in prop::collection::vec(segment(), 1..6),
            pattern in segment(),
        ) {
            let set = ExcludeSet::new(&[pattern.as_str()]).unwrap();
            let rel: PathBuf = parts.iter().collect();
            let expected = parts.iter().any(|p| p == &pattern);
            prop_assert_eq!(set.is_excluded(&rel), expected);
        }

        #[test]
        fn prop_excluded_ancestor_excludes_descendants(
            parts in prop::collection::vec(segment(), 1..4),
            tail in prop::collection::vec(segment(), 1..4),
            pattern in segment(),
        ) {
            let set = ExcludeSet::new(&[format!("*{pattern}")]).unwrap();
            let parent: PathBuf = parts.iter().collect();
            let child = parent.join(tail.iter().collect::<PathBuf>());
            if set.is_excluded(&parent) {
                prop_assert!(set.is_excluded(&child));
            }
        }
    }
}
