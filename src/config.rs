// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration, assembled from `DD_*` environment variables.
//!
//! Every knob has a default so the agent starts with an empty environment;
//! the API key is optional and only gates the outbound writers.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;

use crate::filters::{parse_replace_rules, ReplaceRule};

const DEFAULT_RECEIVER_PORT: u16 = 8126;
const DEFAULT_CONNECTION_LIMIT: usize = 2000;
const DEFAULT_RECEIVER_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_MEMORY: f64 = 500. * 1024. * 1024.;
const DEFAULT_MAX_CPU_PERCENT: f64 = 50.0;
const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 10;
const DEFAULT_BUCKET_INTERVAL_SECS: u64 = 10;
const DEFAULT_TARGET_TPS: f64 = 10.0;
const DEFAULT_ERROR_TPS: f64 = 10.0;
const DEFAULT_MAX_EPS: f64 = 200.0;
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;

/// Maximum accepted request body, in bytes.
pub const MAX_REQUEST_BODY_LENGTH: usize = 10 * 1024 * 1024;

#[derive(Debug)]
pub struct Config {
    pub receiver_host: String,
    pub receiver_port: u16,
    /// Optional unix domain socket path for a second listener.
    pub receiver_socket: Option<String>,
    pub receiver_timeout_secs: u64,
    pub connection_limit: usize,

    pub default_env: String,
    pub log_level: String,

    /// Memory ceiling in bytes watched by the watchdog. Zero disables.
    pub max_memory: f64,
    /// User CPU ceiling as a fraction of one core. Zero disables.
    pub max_cpu: f64,
    pub watchdog_interval_secs: u64,

    pub bucket_interval_secs: u64,

    pub extra_sample_rate: f64,
    pub target_tps: f64,
    pub error_tps: f64,
    pub max_eps: f64,

    /// Resource deny-list regexes for the blacklister.
    pub ignore_resources: Vec<String>,
    /// Compiled tag replace rules.
    pub replace_tags: Vec<ReplaceRule>,
    /// `service -> operation -> rate` for the fixed-rate event extractor.
    pub analyzed_spans_by_service: HashMap<String, HashMap<String, f64>>,
    /// Legacy `service -> rate` analyzed-span configuration.
    pub analyzed_rate_by_service: HashMap<String, f64>,

    /// When set, throttled requests are answered with 429 instead of 200.
    pub rate_limiter_429: bool,

    pub api_key: Option<String>,
    pub trace_intake_url: String,
    pub stats_intake_url: String,
    pub trace_flush_interval_secs: u64,
    pub stats_flush_interval_secs: u64,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Config> {
        let dd_site = env_string("DD_SITE", "datadoghq.com");
        let (mut trace_intake_url, mut stats_intake_url) = (
            format!("https://trace.agent.{dd_site}/api/v0.2/traces"),
            format!("https://trace.agent.{dd_site}/api/v0.2/stats"),
        );
        // DD_APM_DD_URL overrides the whole intake prefix, primarily for
        // integration tests.
        if let Ok(prefix) = env::var("DD_APM_DD_URL") {
            trace_intake_url = format!("{prefix}/api/v0.2/traces");
            stats_intake_url = format!("{prefix}/api/v0.2/stats");
        }

        let replace_tags = match env::var("DD_APM_REPLACE_TAGS") {
            Ok(raw) => parse_replace_rules(&raw)
                .map_err(|e| anyhow::anyhow!("invalid DD_APM_REPLACE_TAGS: {e}"))?,
            Err(_) => Vec::new(),
        };

        let ignore_resources = env::var("DD_APM_IGNORE_RESOURCES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let analyzed_spans_by_service = match env::var("DD_APM_ANALYZED_SPANS") {
            Ok(raw) => parse_analyzed_spans(&raw)
                .map_err(|e| anyhow::anyhow!("invalid DD_APM_ANALYZED_SPANS: {e}"))?,
            Err(_) => HashMap::new(),
        };
        let analyzed_rate_by_service = match env::var("DD_APM_ANALYZED_RATE_BY_SERVICE") {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("invalid DD_APM_ANALYZED_RATE_BY_SERVICE: {e}"))?,
            Err(_) => HashMap::new(),
        };

        let rate_limiter_429 = env::var("DD_APM_FEATURES")
            .map(|f| f.split(',').any(|v| v.trim() == "429"))
            .unwrap_or(false);

        Ok(Config {
            receiver_host: env_string("DD_APM_RECEIVER_HOST", "localhost"),
            receiver_port: env_parse("DD_APM_RECEIVER_PORT", DEFAULT_RECEIVER_PORT),
            receiver_socket: env::var("DD_APM_RECEIVER_SOCKET")
                .ok()
                .filter(|p| !p.is_empty()),
            receiver_timeout_secs: env_parse(
                "DD_APM_RECEIVER_TIMEOUT",
                DEFAULT_RECEIVER_TIMEOUT_SECS,
            ),
            connection_limit: env_parse("DD_APM_CONNECTION_LIMIT", DEFAULT_CONNECTION_LIMIT),
            default_env: env_string("DD_ENV", "none"),
            log_level: env_string("DD_LOG_LEVEL", "info"),
            max_memory: env_parse("DD_APM_MAX_MEMORY", DEFAULT_MAX_MEMORY),
            max_cpu: env_parse("DD_APM_MAX_CPU_PERCENT", DEFAULT_MAX_CPU_PERCENT) / 100.0,
            watchdog_interval_secs: env_parse(
                "DD_APM_WATCHDOG_INTERVAL",
                DEFAULT_WATCHDOG_INTERVAL_SECS,
            ),
            bucket_interval_secs: env_parse("DD_APM_BUCKET_INTERVAL", DEFAULT_BUCKET_INTERVAL_SECS),
            extra_sample_rate: env_parse("DD_APM_EXTRA_SAMPLE_RATE", 1.0),
            target_tps: env_parse("DD_APM_TARGET_TPS", DEFAULT_TARGET_TPS),
            error_tps: env_parse("DD_APM_ERROR_TPS", DEFAULT_ERROR_TPS),
            max_eps: env_parse("DD_APM_MAX_EPS", DEFAULT_MAX_EPS),
            ignore_resources,
            replace_tags,
            analyzed_spans_by_service,
            analyzed_rate_by_service,
            rate_limiter_429,
            api_key: env::var("DD_API_KEY").ok().filter(|k| !k.is_empty()),
            trace_intake_url,
            stats_intake_url,
            trace_flush_interval_secs: env_parse(
                "DD_APM_TRACE_FLUSH_INTERVAL",
                DEFAULT_FLUSH_INTERVAL_SECS,
            ),
            stats_flush_interval_secs: env_parse(
                "DD_APM_STATS_FLUSH_INTERVAL",
                DEFAULT_FLUSH_INTERVAL_SECS,
            ),
        })
    }
}

impl Default for Config {
    /// A configuration suitable for tests: all defaults, no intake key.
    fn default() -> Self {
        Config {
            receiver_host: "localhost".to_string(),
            receiver_port: DEFAULT_RECEIVER_PORT,
            receiver_socket: None,
            receiver_timeout_secs: DEFAULT_RECEIVER_TIMEOUT_SECS,
            connection_limit: DEFAULT_CONNECTION_LIMIT,
            default_env: "none".to_string(),
            log_level: "info".to_string(),
            max_memory: DEFAULT_MAX_MEMORY,
            max_cpu: DEFAULT_MAX_CPU_PERCENT / 100.0,
            watchdog_interval_secs: DEFAULT_WATCHDOG_INTERVAL_SECS,
            bucket_interval_secs: DEFAULT_BUCKET_INTERVAL_SECS,
            extra_sample_rate: 1.0,
            target_tps: DEFAULT_TARGET_TPS,
            error_tps: DEFAULT_ERROR_TPS,
            max_eps: DEFAULT_MAX_EPS,
            ignore_resources: Vec::new(),
            replace_tags: Vec::new(),
            analyzed_spans_by_service: HashMap::new(),
            analyzed_rate_by_service: HashMap::new(),
            rate_limiter_429: false,
            api_key: None,
            trace_intake_url: "https://trace.agent.datadoghq.com/api/v0.2/traces".to_string(),
            stats_intake_url: "https://trace.agent.datadoghq.com/api/v0.2/stats".to_string(),
            trace_flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            stats_flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
        }
    }
}

/// Parses the analyzed-spans mapping, keyed `"service|operation": rate`.
fn parse_analyzed_spans(raw: &str) -> anyhow::Result<HashMap<String, HashMap<String, f64>>> {
    let flat: HashMap<String, f64> = serde_json::from_str(raw)?;
    let mut nested: HashMap<String, HashMap<String, f64>> = HashMap::new();
    for (key, rate) in flat {
        let (service, operation) = key
            .split_once('|')
            .ok_or_else(|| anyhow::anyhow!("key {key:?} is not of the form service|operation"))?;
        if !(0.0..=1.0).contains(&rate) {
            anyhow::bail!("rate {rate} for {key:?} is outside [0, 1]");
        }
        nested
            .entry(service.to_string())
            .or_default()
            .insert(operation.to_lowercase(), rate);
    }
    Ok(nested)
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use std::env;

    use super::*;

    #[test]
    #[serial]
    fn test_defaults() {
        let config = Config::from_env().expect("config");
        assert_eq!(config.receiver_port, 8126);
        assert_eq!(config.default_env, "none");
        assert_eq!(config.connection_limit, 2000);
        assert!((config.max_cpu - 0.5).abs() < 1e-9);
        assert!(!config.rate_limiter_429);
        assert_eq!(
            config.trace_intake_url,
            "https://trace.agent.datadoghq.com/api/v0.2/traces"
        );
    }

    #[test]
    #[serial]
    fn test_intake_url_prefix_override() {
        env::set_var("DD_APM_DD_URL", "http://127.0.0.1:3333");
        let config = Config::from_env().expect("config");
        assert_eq!(
            config.trace_intake_url,
            "http://127.0.0.1:3333/api/v0.2/traces"
        );
        assert_eq!(
            config.stats_intake_url,
            "http://127.0.0.1:3333/api/v0.2/stats"
        );
        env::remove_var("DD_APM_DD_URL");
    }

    #[test]
    #[serial]
    fn test_feature_flag_429() {
        env::set_var("DD_APM_FEATURES", "config_endpoint, 429");
        let config = Config::from_env().expect("config");
        assert!(config.rate_limiter_429);
        env::remove_var("DD_APM_FEATURES");
    }

    #[test]
    #[serial]
    fn test_ignore_resources() {
        env::set_var("DD_APM_IGNORE_RESOURCES", "GET /health, ^/metrics$");
        let config = Config::from_env().expect("config");
        assert_eq!(
            config.ignore_resources,
            vec!["GET /health".to_string(), "^/metrics$".to_string()]
        );
        env::remove_var("DD_APM_IGNORE_RESOURCES");
    }

    #[test]
    #[serial]
    fn test_analyzed_spans() {
        env::set_var(
            "DD_APM_ANALYZED_SPANS",
            r#"{"api|Web.Request":0.5,"db|query":1.0}"#,
        );
        let config = Config::from_env().expect("config");
        assert_eq!(
            config
                .analyzed_spans_by_service
                .get("api")
                .and_then(|ops| ops.get("web.request")),
            Some(&0.5)
        );
        env::remove_var("DD_APM_ANALYZED_SPANS");
    }

    #[test]
    #[serial]
    fn test_analyzed_spans_rejects_bad_rate() {
        env::set_var("DD_APM_ANALYZED_SPANS", r#"{"api|op":3.0}"#);
        assert!(Config::from_env().is_err());
        env::remove_var("DD_APM_ANALYZED_SPANS");
    }

    #[test]
    #[serial]
    fn test_replace_tags() {
        env::set_var(
            "DD_APM_REPLACE_TAGS",
            r#"[{"name":"http.url","pattern":"token=[^&]+","repl":"token=?"}]"#,
        );
        let config = Config::from_env().expect("config");
        assert_eq!(config.replace_tags.len(), 1);
        env::remove_var("DD_APM_REPLACE_TAGS");
    }
}
