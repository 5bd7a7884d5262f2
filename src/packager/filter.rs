// src/packager/filter.rs

//! Include filters over install-relative paths
//!
//! A filter list selects which files go into a pack or come out of an
//! ingredient. Patterns are globs (`*` stays within a path component, `**`
//! crosses them). A pattern naming a directory selects everything below
//! it. An empty list selects everything.

use crate::error::{Error, Result};
use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    patterns: Vec<Pattern>,
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/')
}

impl PathFilter {
    pub fn new<S: AsRef<str>>(filters: &[S]) -> Result<Self> {
        let patterns = filters
            .iter()
            .map(|f| normalize(f.as_ref()))
            .filter(|f| !f.is_empty())
            .map(|f| {
                Pattern::new(f).map_err(|e| {
                    Error::validation(format!("filter '{}'", f), e.msg.to_string())
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `path` or one of its parent directories is selected
    pub fn matches(&self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let path = normalize(path);
        let mut candidate = path;
        loop {
            if self
                .patterns
                .iter()
                .any(|p| p.matches_with(candidate, MATCH_OPTIONS))
            {
                return true;
            }
            match candidate.rsplit_once('/') {
                Some((parent, _)) => candidate = parent,
                None => return false,
            }
        }
    }

    /// Whether a directory may contain selected paths
    ///
    /// Used to decide whether to create directory entries; a directory is
    /// kept when it is selected itself or a pattern starts below it.
    pub fn may_contain(&self, dir: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let dir = normalize(dir);
        self.matches(dir)
            || self.patterns.iter().any(|p| {
                let text = p.as_str();
                text.strip_prefix(dir)
                    .is_some_and(|rest| rest.starts_with('/'))
                    || text.starts_with("**")
            })
    }
}
