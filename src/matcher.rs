//! Wildcard host-name patterns
//!
//! A pattern is a dot-separated sequence of labels where any label may be the
//! wildcard `*`. A wildcard matches exactly one label — never zero, never a
//! dot — so a pattern with `n` labels only ever matches names with exactly
//! `n` labels.
//!
//! Matching produces a score rather than a boolean so that callers holding
//! several patterns can pick the most specific one: each literal label at
//! position `i` (0-based, left to right) of an `n`-label pattern contributes
//! `1 << (n - i)`, wildcards contribute nothing. The weights form a
//! geometric series, so a fully-literal match always outscores any match
//! containing a wildcard, and a wildcard further right always outscores one
//! further left.

use crate::error::{GatewayError, Result};
use crate::name::ServerName;

/// Match specificity; `0` means no match.
pub type MatchScore = u128;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Label {
    Literal(String),
    Wildcard,
}

/// A compiled host-name pattern.
#[derive(Debug, Clone)]
pub struct Matcher {
    labels: Vec<Label>,
    pattern: String,
}

impl Matcher {
    /// Compile a pattern string.
    ///
    /// Each label must be `*` or a valid DNS label; literal labels are
    /// canonicalised through the same IDNA path as server names. `_` is
    /// accepted as an alias for `*` so patterns can double as file names.
    pub fn compile(pattern: &str) -> Result<Matcher> {
        if pattern.is_empty() {
            return Err(GatewayError::Config("empty pattern".to_string()));
        }

        let mut labels = Vec::new();
        for raw in pattern.split('.') {
            if raw == "*" || raw == "_" {
                labels.push(Label::Wildcard);
            } else {
                let canonical = ServerName::try_parse(raw).map_err(|e| {
                    GatewayError::Config(format!("invalid pattern {:?}: {}", pattern, e))
                })?;
                labels.push(Label::Literal(canonical.punycode));
            }
        }

        Ok(Matcher {
            labels,
            pattern: pattern.to_string(),
        })
    }

    /// Score `name` against this pattern. Returns `0` on no match.
    pub fn match_score(&self, name: &ServerName) -> MatchScore {
        let n = self.labels.len();
        if name.label_count() != n {
            return 0;
        }

        let mut score: MatchScore = 0;
        for (i, (pattern_label, name_label)) in self.labels.iter().zip(name.labels()).enumerate() {
            match pattern_label {
                Label::Wildcard => {}
                Label::Literal(literal) => {
                    if literal != name_label {
                        return 0;
                    }
                    score += 1 << (n - i);
                }
            }
        }

        score
    }

    /// Whether `name` matches this pattern at all.
    pub fn matches(&self, name: &ServerName) -> bool {
        self.match_score(name) > 0
    }

    /// The original pattern string.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl std::fmt::Display for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(pattern: &str, name: &str) -> MatchScore {
        Matcher::compile(pattern)
            .unwrap()
            .match_score(&ServerName::parse(name))
    }

    #[test]
    fn test_literal_match() {
        assert!(score("api.example.com", "api.example.com") > 0);
        assert_eq!(score("api.example.com", "www.example.com"), 0);
    }

    #[test]
    fn test_wildcard_matches_exactly_one_label() {
        assert!(score("*.example.com", "api.example.com") > 0);
        assert_eq!(score("*.example.com", "example.com"), 0);
        assert_eq!(score("*.example.com", "a.b.example.com"), 0);
    }

    #[test]
    fn test_label_count_must_match() {
        assert_eq!(score("api.example.com", "example.com"), 0);
        assert_eq!(score("example.com", "api.example.com"), 0);
    }

    #[test]
    fn test_literal_outscores_wildcard() {
        let name = ServerName::parse("api.example.com");
        let literal = Matcher::compile("api.example.com").unwrap();
        let wildcard = Matcher::compile("*.example.com").unwrap();
        assert!(literal.match_score(&name) > wildcard.match_score(&name));
    }

    #[test]
    fn test_leftmost_literal_dominates() {
        // A literal in the leftmost position is worth more than literals
        // everywhere else combined.
        let left = score("api.*.com", "api.example.com");
        let right = score("*.example.com", "api.example.com");
        assert!(left > right);
    }

    #[test]
    fn test_underscore_is_wildcard_alias() {
        assert_eq!(
            score("_.example.com", "api.example.com"),
            score("*.example.com", "api.example.com"),
        );
    }

    #[test]
    fn test_pattern_is_canonicalised() {
        assert!(score("DØMÅIN.TLD", "dømåin.tld") > 0);
        assert!(score("bücher.tld", "xn--bcher-kva.tld") > 0);
    }

    #[test]
    fn test_literal_pattern_matches_itself() {
        for pattern in ["example.com", "a.b.c.d", "host.dømåin-name.tld"] {
            let matcher = Matcher::compile(pattern).unwrap();
            let name = ServerName::parse(pattern);
            assert!(matcher.match_score(&name) > 0, "pattern {}", pattern);
        }
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        for pattern in ["", "foo..bar", "-foo.com", "fo!o.com", "foo-.com"] {
            assert!(Matcher::compile(pattern).is_err(), "pattern {:?}", pattern);
        }
    }
}
