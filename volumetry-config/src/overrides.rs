//! Per-key environment overrides, applied after the file layer.
//!
//! Durations accept plain seconds (`300`) or humantime forms (`5m`, `1h`).
//! List values are comma-separated.

use std::env;

use anyhow::{anyhow, Context};

use crate::Settings;

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(key: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{key}: expected a boolean, got {other:?}")),
    }
}

fn parse_secs(key: &str, raw: &str) -> anyhow::Result<u64> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(secs);
    }
    humantime::parse_duration(raw)
        .map(|d| d.as_secs())
        .with_context(|| format!("{key}: expected seconds or a duration like \"5m\""))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Apply recognized environment variables on top of `settings`.
pub fn apply_env_overrides(settings: &mut Settings) -> anyhow::Result<()> {
    if let Some(v) = var("SERVER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = var("SERVER_PORT") {
        settings.server.port = v
            .trim()
            .parse()
            .with_context(|| "SERVER_PORT: expected a port number")?;
    }

    if let Some(v) = var("SCAN_ENABLED") {
        settings.scan.enabled = parse_bool("SCAN_ENABLED", &v)?;
    }
    if let Some(v) = var("SCAN_INTERVAL") {
        settings.scan.interval_secs = parse_secs("SCAN_INTERVAL", &v)?;
    }
    if let Some(v) = var("SCAN_CONCURRENCY") {
        settings.scan.concurrency = v
            .trim()
            .parse()
            .with_context(|| "SCAN_CONCURRENCY: expected an integer")?;
    }
    if let Some(v) = var("SCAN_TIMEOUT_PER_VOLUME") {
        settings.scan.timeout_per_volume_secs = parse_secs("SCAN_TIMEOUT_PER_VOLUME", &v)?;
    }
    if let Some(v) = var("SCAN_METHODS_ORDER") {
        settings.scan.methods_order = parse_list(&v);
    }
    if let Some(v) = var("SCAN_SKIP_PATTERN") {
        settings.scan.skip_pattern = Some(v);
    }
    if let Some(v) = var("SCAN_BIND_MOUNTS_ENABLED") {
        settings.scan.bind_mounts_enabled = parse_bool("SCAN_BIND_MOUNTS_ENABLED", &v)?;
    }
    if let Some(v) = var("SCAN_BIND_ALLOW_LIST") {
        settings.scan.bind_allow_list = parse_list(&v);
    }
    if let Some(v) = var("SCAN_MAX_CONCURRENT") {
        settings.scan.max_concurrent_scans = v
            .trim()
            .parse()
            .with_context(|| "SCAN_MAX_CONCURRENT: expected an integer")?;
    }

    if let Some(v) = var("CACHE_TTL") {
        settings.cache.ttl_secs = parse_secs("CACHE_TTL", &v)?;
    }
    if let Some(v) = var("CACHE_MAX_SIZE") {
        settings.cache.max_size = v
            .trim()
            .parse()
            .with_context(|| "CACHE_MAX_SIZE: expected an integer")?;
    }

    if let Some(v) = var("EVENTS_ENABLED") {
        settings.events.enabled = parse_bool("EVENTS_ENABLED", &v)?;
    }
    if let Some(v) = var("EVENTS_RECONCILE_INTERVAL") {
        settings.events.reconcile_interval_secs = parse_secs("EVENTS_RECONCILE_INTERVAL", &v)?;
    }

    // PERSISTENCE_DSN wins over the conventional DATABASE_URL.
    if let Some(v) = var("PERSISTENCE_DSN").or_else(|| var("DATABASE_URL")) {
        settings.persistence.dsn = v;
    }
    if let Some(v) = var("PERSISTENCE_MAX_CONNS") {
        settings.persistence.max_conns = v
            .trim()
            .parse()
            .with_context(|| "PERSISTENCE_MAX_CONNS: expected an integer")?;
    }
    if let Some(v) = var("PERSISTENCE_TIMEOUT") {
        settings.persistence.timeout_secs = parse_secs("PERSISTENCE_TIMEOUT", &v)?;
    }

    if let Some(v) = var("ORACLE_ENDPOINT").or_else(|| var("DOCKER_HOST")) {
        settings.oracle.endpoint = v;
    }
    if let Some(v) = var("ORACLE_TIMEOUT") {
        settings.oracle.timeout_secs = parse_secs("ORACLE_TIMEOUT", &v)?;
    }

    if let Some(v) = var("SYSTEM_VOLUME_PATTERN") {
        settings.volumes.system_pattern = Some(v);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booleans_parse_common_spellings() {
        assert!(parse_bool("K", "true").unwrap());
        assert!(parse_bool("K", "YES").unwrap());
        assert!(!parse_bool("K", "0").unwrap());
        assert!(parse_bool("K", "maybe").is_err());
    }

    #[test]
    fn durations_accept_seconds_and_humantime() {
        assert_eq!(parse_secs("K", "300").unwrap(), 300);
        assert_eq!(parse_secs("K", "5m").unwrap(), 300);
        assert_eq!(parse_secs("K", "1h").unwrap(), 3_600);
        assert!(parse_secs("K", "soon").is_err());
    }

    #[test]
    fn lists_split_on_commas() {
        assert_eq!(
            parse_list("fast, native,,portable "),
            vec!["fast", "native", "portable"]
        );
    }
}
