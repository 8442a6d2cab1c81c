use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};

use crate::Result;
use crate::alloc::TRACER_SOURCE_FILES;
use crate::snapshot::UNKNOWN_FILE;

/// A file-pattern rule applied to the most recent frame of every trace.
///
/// Patterns are globs (`*` also crosses `/`). An absolute filename matches a relative
/// pattern only below the rule's root or one of the root's ancestors, so `file!()`
/// paths match the absolute paths found in debug info without matching the same
/// relative path inside dependencies.
#[derive(Debug, Clone)]
pub struct FilterRule {
    include: bool,
    pattern: String,
    matcher: GlobMatcher,
    root: Option<PathBuf>,
}

impl FilterRule {
    /// A rule rooted at the current directory.
    pub fn include(pattern: &str) -> Result<Self> {
        Self::new(true, pattern)
    }

    pub fn exclude(pattern: &str) -> Result<Self> {
        Self::new(false, pattern)
    }

    fn new(include: bool, pattern: &str) -> Result<Self> {
        let pattern = normalize(pattern);
        let pattern = pattern.strip_prefix("./").unwrap_or(&pattern).to_string();
        Ok(Self {
            include,
            matcher: Glob::new(&pattern)?.compile_matcher(),
            pattern,
            root: std::env::current_dir().ok(),
        })
    }

    /// Anchor relative patterns at `root` instead of the current directory.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn is_include(&self) -> bool {
        self.include
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, filename: &str) -> bool {
        let filename = normalize(filename);
        if self.matcher.is_match(&filename) {
            return true;
        }

        if self.pattern.starts_with('/') {
            return false;
        }
        let Some(root) = &self.root else {
            return false;
        };
        let path = Path::new(&filename);
        root.ancestors()
            .filter_map(|anchor| path.strip_prefix(anchor).ok())
            .any(|relative| self.matcher.is_match(relative))
    }
}

impl PartialEq for FilterRule {
    fn eq(&self, other: &Self) -> bool {
        self.include == other.include && self.pattern == other.pattern && self.root == other.root
    }
}

impl Eq for FilterRule {}

/// Rules used by inclusive mode: everything except the tracer's own frames
/// and frames that could not be attributed to a file.
pub fn default_deny_rules() -> Vec<FilterRule> {
    TRACER_SOURCE_FILES
        .iter()
        .copied()
        .chain([UNKNOWN_FILE])
        .flat_map(|file| FilterRule::exclude(&globset::escape(file)))
        .collect()
}

/// `true` if the filename survives the rules: at least one include rule matches (when
/// there are include rules) and no exclude rule does.
pub(crate) fn accepts(rules: &[FilterRule], filename: &str) -> bool {
    let mut has_include = false;
    let mut included = false;
    for rule in rules {
        if rule.include {
            has_include = true;
            included |= rule.matches(filename);
        } else if rule.matches(filename) {
            return false;
        }
    }
    !has_include || included
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}
