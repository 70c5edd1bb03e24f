//! Path pattern matching.
//!
//! # Pattern Classes
//! - Exact: no `*`, the path must be equal
//! - Prefix: ends in `/**` with no other `*`; `/api/users/**` matches every
//!   path below `/api/users/`
//! - Wildcard: any other pattern with `*`; each `*` matches any run of
//!   characters, `/` included
//!
//! # Design Decisions
//! - Path matching is case-sensitive
//! - No regex; wildcard matching is a linear backtracking scan

use std::fmt;

/// A compiled route path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Exact(String),
    Wildcard(String),
    /// Stored with its trailing `/`.
    Prefix(String),
}

/// Precedence class of a pattern. Lower wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PatternClass {
    Exact,
    Wildcard,
    Prefix,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        if let Some(base) = pattern.strip_suffix("/**") {
            if !base.contains('*') {
                return PathPattern::Prefix(format!("{base}/"));
            }
        }
        if pattern.contains('*') {
            PathPattern::Wildcard(pattern.to_string())
        } else {
            PathPattern::Exact(pattern.to_string())
        }
    }

    pub fn class(&self) -> PatternClass {
        match self {
            PathPattern::Exact(_) => PatternClass::Exact,
            PathPattern::Wildcard(_) => PatternClass::Wildcard,
            PathPattern::Prefix(_) => PatternClass::Prefix,
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(expected) => path == expected,
            PathPattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathPattern::Wildcard(pattern) => glob_match(pattern.as_bytes(), path.as_bytes()),
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPattern::Exact(p) | PathPattern::Wildcard(p) => f.write_str(p),
            PathPattern::Prefix(p) => write!(f, "{p}**"),
        }
    }
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    // Position of the last `*` seen and the text index it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, tried)) = backtrack {
            p = star + 1;
            t = tried + 1;
            backtrack = Some((star, tried + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_pattern() {
        let pattern = PathPattern::parse("/api/users/**");
        assert_eq!(pattern.class(), PatternClass::Prefix);
        assert!(pattern.matches("/api/users/42"));
        assert!(pattern.matches("/api/users/42/orders"));
        assert!(!pattern.matches("/api/order/1"));
        assert!(!pattern.matches("/api/usersx/1"));
    }

    #[test]
    fn test_exact_pattern() {
        let pattern = PathPattern::parse("/health");
        assert_eq!(pattern.class(), PatternClass::Exact);
        assert!(pattern.matches("/health"));
        assert!(!pattern.matches("/health/"));
        assert!(!pattern.matches("/HEALTH"));
    }

    #[test]
    fn test_wildcard_pattern() {
        let pattern = PathPattern::parse("/api/*/profile");
        assert_eq!(pattern.class(), PatternClass::Wildcard);
        assert!(pattern.matches("/api/v1/profile"));
        assert!(pattern.matches("/api/v1/users/profile"));
        assert!(!pattern.matches("/api/v1/settings"));

        let trailing = PathPattern::parse("/static/*.css");
        assert!(trailing.matches("/static/site.css"));
        assert!(!trailing.matches("/static/site.js"));
    }

    #[test]
    fn double_star_inside_is_wildcard() {
        let pattern = PathPattern::parse("/a/**/b/**");
        assert_eq!(pattern.class(), PatternClass::Wildcard);
        assert!(pattern.matches("/a/x/y/b/z"));
    }
}
