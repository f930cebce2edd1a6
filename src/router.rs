//! Path pattern matching: compiled pattern set with most-specific-wins.
//!
//! Glob patterns translate to anchored regexes (`*` within one segment,
//! `**` across segments); anything that already looks like a regex is
//! compiled as written. Resolution is memoized per `(method, path)` in a
//! bounded LRU so steady-state traffic skips the match loop.

use crate::config::{ConfigError, RoutePolicy};
use http::Method;
use lru::LruCache;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

const MEMO_CAPACITY: usize = 4096;

/// Characters that mark a pattern as hand-written regex.
fn is_explicit_regex(pattern: &str) -> bool {
    pattern.starts_with('^')
        || pattern
            .chars()
            .any(|c| matches!(c, '(' | ')' | '[' | ']' | '{' | '}' | '|' | '+' | '?' | '$' | '\\'))
}

/// Translate a glob into an anchored regex source.
fn glob_to_regex(pattern: &str) -> String {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '*' {
            if chars.peek() == Some(&'*') {
                chars.next();
                source.push_str(".*");
            } else {
                source.push_str("[^/]*");
            }
        } else {
            source.push_str(&regex::escape(&c.to_string()));
        }
    }
    source.push('$');
    source
}

/// Length of the leading literal run, the primary specificity measure.
fn literal_prefix_len(pattern: &str) -> usize {
    let trimmed = pattern.strip_prefix('^').unwrap_or(pattern);
    trimmed
        .chars()
        .take_while(|c| {
            !matches!(
                c,
                '*' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '+' | '?' | '$' | '\\' | '.'
            )
        })
        .count()
}

/// Count of wildcard-ish tokens, the secondary specificity measure.
fn wildcard_count(pattern: &str) -> usize {
    let mut count = 0;
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                }
                count += 1;
            }
            '+' | '?' | '|' | '[' | '(' | '.' => count += 1,
            _ => {}
        }
    }
    count
}

struct CompiledPattern {
    regex: Regex,
    literal_prefix: usize,
    wildcards: usize,
    index: usize,
    policy: Arc<RoutePolicy>,
}

/// Resolves request paths to their route policy.
pub struct PathRouter {
    patterns: Vec<CompiledPattern>,
    default_policy: Arc<RoutePolicy>,
    memo: Mutex<LruCache<String, Arc<RoutePolicy>>>,
}

impl PathRouter {
    /// Compile `policies` in declaration order; `default_policy` applies
    /// when nothing matches.
    pub fn build(
        policies: Vec<RoutePolicy>,
        default_policy: RoutePolicy,
    ) -> Result<Self, ConfigError> {
        let mut patterns = Vec::with_capacity(policies.len());
        for (index, policy) in policies.into_iter().enumerate() {
            let source = if is_explicit_regex(&policy.pattern) {
                policy.pattern.clone()
            } else {
                glob_to_regex(&policy.pattern)
            };
            let regex = Regex::new(&source).map_err(|err| ConfigError::Pattern {
                pattern: policy.pattern.clone(),
                detail: err.to_string(),
            })?;
            patterns.push(CompiledPattern {
                regex,
                literal_prefix: literal_prefix_len(&policy.pattern),
                wildcards: wildcard_count(&policy.pattern),
                index,
                policy: Arc::new(policy),
            });
        }
        let capacity = NonZeroUsize::new(MEMO_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            patterns,
            default_policy: Arc::new(default_policy),
            memo: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Resolve `path` to the highest-specificity matching policy.
    ///
    /// Specificity: longest literal prefix, then fewest wildcards, then
    /// declaration order.
    pub fn resolve(&self, method: &Method, path: &str) -> Arc<RoutePolicy> {
        let memo_key = format!("{method} {path}");
        {
            let mut memo = self.memo.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(policy) = memo.get(&memo_key) {
                return Arc::clone(policy);
            }
        }

        let resolved = self
            .patterns
            .iter()
            .filter(|pattern| pattern.regex.is_match(path))
            .min_by_key(|pattern| {
                (usize::MAX - pattern.literal_prefix, pattern.wildcards, pattern.index)
            })
            .map(|pattern| Arc::clone(&pattern.policy))
            .unwrap_or_else(|| Arc::clone(&self.default_policy));

        let mut memo = self.memo.lock().unwrap_or_else(|p| p.into_inner());
        memo.put(memo_key, Arc::clone(&resolved));
        resolved
    }

    /// The policy applied when no pattern matches.
    pub fn default_policy(&self) -> Arc<RoutePolicy> {
        Arc::clone(&self.default_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompiledFeatures;

    fn policy(pattern: &str) -> RoutePolicy {
        RoutePolicy::new(pattern, CompiledFeatures::default())
    }

    fn router(patterns: &[&str]) -> PathRouter {
        let policies = patterns.iter().map(|pattern| policy(pattern)).collect();
        PathRouter::build(policies, policy("")).unwrap()
    }

    fn resolved(router: &PathRouter, path: &str) -> String {
        router.resolve(&Method::GET, path).pattern.clone()
    }

    #[test]
    fn glob_translation() {
        assert_eq!(glob_to_regex("/api/*"), "^/api/[^/]*$");
        assert_eq!(glob_to_regex("/api/**"), "^/api/.*$");
        assert_eq!(glob_to_regex("/v1.0/x"), r"^/v1\.0/x$");
    }

    #[test]
    fn single_star_stays_within_a_segment() {
        let router = router(&["/api/*", "/api/**"]);
        assert_eq!(resolved(&router, "/api/users"), "/api/*");
        assert_eq!(resolved(&router, "/api/users/42"), "/api/**");
    }

    #[test]
    fn longest_literal_prefix_wins() {
        let router = router(&["/api/**", "/api/users/*"]);
        assert_eq!(resolved(&router, "/api/users/42"), "/api/users/*");
        assert_eq!(resolved(&router, "/api/orders/42"), "/api/**");
    }

    #[test]
    fn fewer_wildcards_break_prefix_ties() {
        let router = router(&["/api/*/x/*", "/api/*/x/y"]);
        // Same literal prefix "/api/"; the explicit tail has one wildcard.
        assert_eq!(resolved(&router, "/api/a/x/y"), "/api/*/x/y");
    }

    #[test]
    fn declaration_order_breaks_remaining_ties() {
        let router = router(&["/api/a*", "/api/b*", "/api/*"]);
        // Both one-wildcard candidates lose to the longer literal prefixes.
        assert_eq!(resolved(&router, "/api/aX"), "/api/a*");
        assert_eq!(resolved(&router, "/api/bX"), "/api/b*");

        let tie = router_tie();
        assert_eq!(resolved(&tie, "/api/x"), "/api/*");
    }

    fn router_tie() -> PathRouter {
        // Two patterns with identical specificity; first declared wins.
        let policies = vec![policy("/api/*"), policy("/api/*")];
        PathRouter::build(policies, policy("")).unwrap()
    }

    #[test]
    fn explicit_regex_is_used_as_written() {
        let router = router(&[r"^/users/\d+$", "/users/**"]);
        assert_eq!(resolved(&router, "/users/42"), r"^/users/\d+$");
        assert_eq!(resolved(&router, "/users/alice"), "/users/**");
    }

    #[test]
    fn no_match_falls_back_to_default() {
        let router = router(&["/api/**"]);
        assert_eq!(resolved(&router, "/health"), "");
    }

    #[test]
    fn invalid_regex_is_a_config_error() {
        let result = PathRouter::build(vec![policy("^/api/(unclosed")], policy(""));
        assert!(matches!(result, Err(ConfigError::Pattern { .. })));
    }

    #[test]
    fn resolution_is_deterministic_and_memoized() {
        let router = router(&["/api/**", "/api/users/*"]);
        let first = router.resolve(&Method::GET, "/api/users/1");
        let second = router.resolve(&Method::GET, "/api/users/1");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn adding_a_less_specific_pattern_preserves_resolutions() {
        let before = router(&["/api/users/*"]);
        let after = router(&["/api/users/*", "/api/**"]);
        for path in ["/api/users/1", "/api/users/abc"] {
            assert_eq!(resolved(&before, path), resolved(&after, path));
        }
    }
}
