// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-place span sanitization: obfuscation of sensitive fields and
//! truncation of oversized ones.
//!
//! The obfuscation rules here are deliberately small; the per-type rule
//! sets are plug-replaceable behind [`Obfuscator::obfuscate_span`].

use regex::Regex;

use crate::model::Span;
use crate::normalizer::truncate_utf8;

/// Maximum length of a span resource, ellipsis included.
const MAX_RESOURCE_LEN: usize = 5000;
/// Maximum length of a meta value, ellipsis included.
const MAX_META_VALUE_LEN: usize = 25000;

/// Obfuscates sensitive data in span fields, dispatching on the span type.
pub struct Obfuscator {
    sql_literals: Regex,
    redis_args: Regex,
    http_query: Regex,
}

impl Obfuscator {
    pub fn new() -> Obfuscator {
        Obfuscator {
            // String literals first so digits inside quotes are covered by
            // the string replacement, then bare numbers.
            sql_literals: Regex::new(r"('[^']*')|\b\d+(\.\d+)?\b").expect("static pattern"),
            redis_args: Regex::new(r"^(\s*\w+)(\s.*)$").expect("static pattern"),
            http_query: Regex::new(r"\?.*$").expect("static pattern"),
        }
    }

    pub fn obfuscate_span(&self, span: &mut Span) {
        match span.r#type.as_str() {
            "sql" | "cassandra" => {
                span.resource = self
                    .sql_literals
                    .replace_all(&span.resource, "?")
                    .into_owned();
                if let Some(query) = span.meta.get_mut("sql.query") {
                    *query = self.sql_literals.replace_all(query, "?").into_owned();
                }
            }
            "redis" => {
                span.resource = self
                    .redis_args
                    .replace_all(&span.resource, "$1")
                    .into_owned();
            }
            "http" | "web" => {
                if let Some(url) = span.meta.get_mut("http.url") {
                    *url = self.http_query.replace(url, "").into_owned();
                }
            }
            _ => {}
        }
    }
}

impl Default for Obfuscator {
    fn default() -> Self {
        Obfuscator::new()
    }
}

/// Enforces hard limits on span field sizes, truncating in place.
pub fn truncate_span(span: &mut Span) {
    if span.resource.len() > MAX_RESOURCE_LEN {
        truncate_utf8(&mut span.resource, MAX_RESOURCE_LEN - 3);
        span.resource.push_str("...");
    }
    for value in span.meta.values_mut() {
        if value.len() > MAX_META_VALUE_LEN {
            truncate_utf8(value, MAX_META_VALUE_LEN - 3);
            value.push_str("...");
        }
    }
}
