// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resource blacklister and configured tag replace rules.

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::model::{Span, Trace};

/// Rejects traces whose root resource matches any of the deny regexes.
pub struct Blacklister {
    list: Vec<Regex>,
}

impl Blacklister {
    /// Compiles the deny list. Invalid patterns are skipped with a log line
    /// so a single bad rule does not take the agent down.
    pub fn new(patterns: &[String]) -> Blacklister {
        let mut list = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            match Regex::new(pattern) {
                Ok(re) => list.push(re),
                Err(e) => debug!("invalid resource filter {pattern:?}, skipping: {e}"),
            }
        }
        Blacklister { list }
    }

    /// Returns true if the span passes the filter.
    pub fn allows(&self, span: &Span) -> bool {
        !self.list.iter().any(|re| re.is_match(&span.resource))
    }
}

#[derive(Deserialize)]
struct RawReplaceRule {
    name: String,
    pattern: String,
    repl: String,
}

/// A single tag replacement: `name` selects the target tag, with `"*"`
/// addressing all meta tags and the resource, and `"resource.name"` the
/// resource itself.
#[derive(Debug, Clone)]
pub struct ReplaceRule {
    name: String,
    re: Regex,
    repl: String,
}

impl ReplaceRule {
    fn apply(&self, value: &mut String) {
        let replaced = self.re.replace_all(value, self.repl.as_str());
        if let std::borrow::Cow::Owned(new) = replaced {
            *value = new;
        }
    }
}

/// Parses replace rules from their JSON representation, compiling the
/// regexes eagerly so bad configuration fails at startup.
pub fn parse_replace_rules(raw: &str) -> anyhow::Result<Vec<ReplaceRule>> {
    let raw_rules: Vec<RawReplaceRule> = serde_json::from_str(raw)?;
    let mut rules = Vec::with_capacity(raw_rules.len());
    for raw_rule in raw_rules {
        let re = Regex::new(&raw_rule.pattern)
            .map_err(|e| anyhow::anyhow!("error parsing rule for {:?}: {e}", raw_rule.name))?;
        rules.push(ReplaceRule {
            name: raw_rule.name,
            re,
            repl: raw_rule.repl,
        });
    }
    Ok(rules)
}

/// Applies configured replace rules to every span of a trace.
pub struct Replacer {
    rules: Vec<ReplaceRule>,
}

impl Replacer {
    pub fn new(rules: Vec<ReplaceRule>) -> Replacer {
        Replacer { rules }
    }

    pub fn replace(&self, trace: &mut Trace) {
        for span in trace.iter_mut() {
            for rule in &self.rules {
                match rule.name.as_str() {
                    "*" => {
                        for value in span.meta.values_mut() {
                            rule.apply(value);
                        }
                        rule.apply(&mut span.resource);
                    }
                    "resource.name" => rule.apply(&mut span.resource),
                    name => {
                        if let Some(value) = span.meta.get_mut(name) {
                            rule.apply(value);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span_with(resource: &str, meta: &[(&str, &str)]) -> Span {
        Span {
            resource: resource.to_string(),
            meta: meta
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_blacklister() {
        let bl = Blacklister::new(&["GET /health".to_string(), "^/metrics$".to_string()]);
        assert!(!bl.allows(&span_with("GET /healthcheck", &[])));
        assert!(!bl.allows(&span_with("/metrics", &[])));
        assert!(bl.allows(&span_with("GET /users", &[])));
    }

    #[test]
    fn test_blacklister_skips_invalid_pattern() {
        let bl = Blacklister::new(&["(".to_string(), "deny".to_string()]);
        assert!(!bl.allows(&span_with("deny this", &[])));
        assert!(bl.allows(&span_with("fine", &[])));
    }

    #[test]
    fn test_replace_named_tag() {
        let rules =
            parse_replace_rules(r#"[{"name":"http.url","pattern":"key=\\w+","repl":"key=?"}]"#)
                .expect("rules");
        let replacer = Replacer::new(rules);
        let mut trace = vec![span_with("res", &[("http.url", "/x?key=secret")])];
        replacer.replace(&mut trace);
        assert_eq!(trace[0].meta["http.url"], "/x?key=?");
    }

    #[test]
    fn test_replace_resource_and_wildcard() {
        let rules = parse_replace_rules(
            r#"[{"name":"resource.name","pattern":"/user/[0-9]+","repl":"/user/?"},
                {"name":"*","pattern":"secret","repl":"*"}]"#,
        )
        .expect("rules");
        let replacer = Replacer::new(rules);
        let mut trace = vec![span_with("/user/123 secret", &[("note", "a secret place")])];
        replacer.replace(&mut trace);
        assert_eq!(trace[0].resource, "/user/? *");
        assert_eq!(trace[0].meta["note"], "a * place");
    }

    #[test]
    fn test_parse_rejects_invalid_regex() {
        assert!(parse_replace_rules(r#"[{"name":"a","pattern":"(","repl":""}]"#).is_err());
    }
}
