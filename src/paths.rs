//! Canonical file keys for matching the same source file across two
//! coverage snapshots whose producers spelled paths differently.
//!
//! Normalization is best-effort: when a rule would be ambiguous the path is
//! left alone.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

/// A Go-style module or host prefix such as `github.com/org/repo/`.
static HOST_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9-]+\.)+[A-Za-z]{2,}(?::\d+)?/[^/]+/[^/]+/").unwrap()
});

/// Turns raw coverage paths into repository-relative keys.
#[derive(Debug, Clone, Default)]
pub struct PathNormalizer {
    strip_prefixes: Vec<String>,
}

impl PathNormalizer {
    pub fn new(strip_prefixes: &[String]) -> Self {
        let mut strip_prefixes: Vec<String> = strip_prefixes
            .iter()
            .map(|p| clean(p).trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect();
        // Longest first so nested prefixes win.
        strip_prefixes.sort_by_key(|p| std::cmp::Reverse(p.len()));
        Self { strip_prefixes }
    }

    /// Normalize a single path in isolation.
    #[must_use]
    pub fn normalize(&self, raw: &str) -> String {
        collapse_repeated_root(&self.strip(raw))
    }

    /// Normalize every path of one snapshot. A path keeps its repeated root
    /// when collapsing it would land on a key another path of the set
    /// already uses, or on one that a second path also collapses to.
    #[must_use]
    pub fn normalize_all<'a>(&self, raws: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let stripped: Vec<String> = raws.into_iter().map(|raw| self.strip(raw)).collect();
        let existing: HashSet<&str> = stripped.iter().map(String::as_str).collect();

        let collapsed: Vec<String> = stripped.iter().map(|p| collapse_repeated_root(p)).collect();
        let mut targets: HashMap<&str, usize> = HashMap::new();
        for (path, key) in stripped.iter().zip(&collapsed) {
            if path != key {
                *targets.entry(key.as_str()).or_default() += 1;
            }
        }

        stripped
            .iter()
            .zip(&collapsed)
            .map(|(path, key)| {
                let clash = existing.contains(key.as_str()) || targets.get(key.as_str()).is_some_and(|&n| n > 1);
                if path != key && clash {
                    path.clone()
                } else {
                    key.clone()
                }
            })
            .collect()
    }

    /// Separator cleanup plus prefix stripping, without the collapse.
    fn strip(&self, raw: &str) -> String {
        let mut path = clean(raw);

        if let Some(rest) = self
            .strip_prefixes
            .iter()
            .find_map(|p| path.strip_prefix(p.as_str())?.strip_prefix('/'))
        {
            path = rest.to_string();
        } else if let Some(m) = HOST_PREFIX_RE.find(&path) {
            if m.end() < path.len() {
                path = path[m.end()..].to_string();
            }
        }

        path
    }
}

/// Forward slashes, no leading `./` or `/`, no empty or `.` segments.
fn clean(raw: &str) -> String {
    raw.trim()
        .replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Drop the first directory when it reappears further down the directory
/// chain, e.g. `cli/internal/cli/x.go` → `internal/cli/x.go`. This is the
/// shape left behind when a module path ends in the repository name.
fn collapse_repeated_root(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() < 3 {
        return path.to_string();
    }
    let dirs = &segments[..segments.len() - 1];
    if dirs[1..].contains(&dirs[0]) {
        segments[1..].join("/")
    } else {
        path.to_string()
    }
}

/// True when `short` equals `long` or is a whole-segment suffix of it.
#[must_use]
pub fn is_segment_suffix(short: &str, long: &str) -> bool {
    long == short
        || (long.len() > short.len()
            && long.ends_with(short)
            && long.as_bytes()[long.len() - short.len() - 1] == b'/')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(raw: &str) -> String {
        PathNormalizer::default().normalize(raw)
    }

    #[test]
    fn test_clean_separators_and_dots() {
        assert_eq!(norm("./src/main.rs"), "src/main.rs");
        assert_eq!(norm("/src//lib.rs"), "src/lib.rs");
        assert_eq!(norm("src\\win\\file.cs"), "src/win/file.cs");
    }

    #[test]
    fn test_duplicated_segment_collapses() {
        assert_eq!(norm("cli/internal/cli/x.go"), "internal/cli/x.go");
        assert_eq!(norm("internal/cli/x.go"), "internal/cli/x.go");
    }

    #[test]
    fn test_collapse_skipped_when_key_is_taken() {
        let n = PathNormalizer::default();
        let keys = n.normalize_all(["api/v1/api/h.go", "v1/api/h.go", "cli/internal/cli/x.go"]);
        assert_eq!(keys, ["api/v1/api/h.go", "v1/api/h.go", "internal/cli/x.go"]);
    }

    #[test]
    fn test_collapse_skipped_when_two_paths_share_a_target() {
        let n = PathNormalizer::default();
        let keys = n.normalize_all(["x/a/x/y/f.go", "y/a/x/y/f.go"]);
        assert_eq!(keys, ["x/a/x/y/f.go", "y/a/x/y/f.go"]);
    }

    #[test]
    fn test_host_prefix_stripped() {
        assert_eq!(
            norm("github.com/acme/cli/internal/cli/x.go"),
            "internal/cli/x.go"
        );
        assert_eq!(norm("github.com/acme/tool/main.go"), "main.go");
    }

    #[test]
    fn test_ambiguous_paths_left_alone() {
        // File name equal to the first directory is not a repeated segment.
        assert_eq!(norm("cli/main/cli"), "cli/main/cli");
        assert_eq!(norm("a/b.go"), "a/b.go");
        // Host-looking path with nothing after the prefix.
        assert_eq!(norm("example.com/a/b/"), "example.com/a/b");
    }

    #[test]
    fn test_configured_prefix_wins_over_host_rule() {
        let n = PathNormalizer::new(&["example.org/mono/".to_string()]);
        assert_eq!(n.normalize("example.org/mono/svc/api/h.go"), "svc/api/h.go");
    }

    #[test]
    fn test_is_segment_suffix() {
        assert!(is_segment_suffix("src/x.rs", "home/ci/repo/src/x.rs"));
        assert!(is_segment_suffix("x.rs", "x.rs"));
        assert!(!is_segment_suffix("x.rs", "src/ax.rs"));
        assert!(!is_segment_suffix("src/x.rs", "x.rs"));
    }
}
