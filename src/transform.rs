// Ordered username rewrite rules. A client policy carries two chains, one
// applied before the first factor (what the directory sees) and one before
// the second factor (what the verifier sees).

use anyhow::{Context, Result};
use regex::Regex;

/// One rewrite rule: a pattern, a replacement (capture groups as `$1`), and
/// an optional cap on how many matches are substituted.
#[derive(Debug, Clone)]
pub struct TransformRule {
    pattern: Regex,
    replacement: String,
    count: Option<usize>,
}

impl TransformRule {
    pub fn new(pattern: &str, replacement: &str, count: Option<usize>) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .with_context(|| format!("invalid transform pattern {pattern:?}"))?;
        Ok(TransformRule {
            pattern,
            replacement: replacement.to_string(),
            count,
        })
    }

    /// Zero matches is a no-op, never an error.
    pub fn apply(&self, input: &str) -> String {
        match self.count {
            Some(n) => self
                .pattern
                .replacen(input, n, self.replacement.as_str())
                .into_owned(),
            None => self
                .pattern
                .replace_all(input, self.replacement.as_str())
                .into_owned(),
        }
    }
}

/// Apply rules in list order; each rule consumes the previous rule's output.
pub fn apply(username: &str, rules: &[TransformRule]) -> String {
    rules
        .iter()
        .fold(username.to_string(), |name, rule| rule.apply(&name))
}
