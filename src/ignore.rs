//! Ignore-pattern seam for both sync sides

/// Decides whether a path is excluded from replication. `context` names the
/// caller for logging; `action` is the action string being applied.
pub trait IgnorePolicy: Send + Sync {
    fn match_path(&self, path: &str, context: &str, action: &str) -> bool;
}

/// Matches nothing.
pub struct NoIgnore;

impl IgnorePolicy for NoIgnore {
    fn match_path(&self, _path: &str, _context: &str, _action: &str) -> bool {
        false
    }
}

/// Pattern list with `*` wildcards, matched against each path and its
/// forward-slash components.
pub struct GlobIgnore {
    patterns: Vec<String>,
}

impl GlobIgnore {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }
}

impl IgnorePolicy for GlobIgnore {
    fn match_path(&self, path: &str, context: &str, action: &str) -> bool {
        let normalized = path.replace('\\', "/");
        for pattern in &self.patterns {
            let hit = wildcard_match(pattern, &normalized)
                || normalized
                    .split('/')
                    .any(|component| wildcard_match(pattern, component));
            if hit {
                tracing::debug!(context, action, path, pattern = pattern.as_str(), "ignore match");
                return true;
            }
        }
        false
    }
}

/// `*` matches any run of characters (including none); everything else is
/// literal. Backtracks to the most recent star on mismatch, so patterns may
/// carry any number of stars.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((star_pi, star_ti)) = backtrack {
            // widen what the last star consumed and retry
            backtrack = Some((star_pi, star_ti + 1));
            pi = star_pi + 1;
            ti = star_ti + 1;
        } else {
            return false;
        }
    }
    // only trailing stars may remain
    p[pi..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_forms() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("*.log", "debug.log"));
        assert!(!wildcard_match("*.log", "debug.txt"));
        assert!(wildcard_match("tmp*", "tmpfile"));
        assert!(wildcard_match("*cache*", "my-cache-dir"));
        assert!(wildcard_match("a*z", "abcz"));
        assert!(wildcard_match("a*z", "az"));
        assert!(!wildcard_match("a*z", "az9"));
        assert!(wildcard_match("exact", "exact"));
        assert!(!wildcard_match("exact", "exactly"));
    }

    #[test]
    fn multiple_stars_backtrack() {
        assert!(wildcard_match("a*b*c", "a-x-b-y-c"));
        assert!(wildcard_match("a*b*c", "abc"));
        assert!(!wildcard_match("a*b*c", "acb"));
        assert!(wildcard_match("*.tar.*", "backup.tar.gz"));
        assert!(!wildcard_match("*.tar.*", "backup.tgz"));
    }

    #[test]
    fn component_matching() {
        let ig = GlobIgnore::new(vec!["logs".to_string()]);
        assert!(ig.match_path("/var/logs/debug.log", "test", "create"));
        assert!(!ig.match_path("/var/data/debug.log", "test", "create"));
    }

    #[test]
    fn pattern_with_slash_matches_whole_path() {
        let ig = GlobIgnore::new(vec!["logs/*".to_string()]);
        assert!(ig.match_path("logs/debug.log", "test", "write"));
        assert!(!ig.match_path("data/debug.log", "test", "write"));
    }

    #[test]
    fn no_ignore_matches_nothing() {
        assert!(!NoIgnore.match_path("/any/path", "test", "remove"));
    }
}
