//! Post-load configuration validation.
//!
//! Unlike a fail-fast validator, every rule runs and every violation is
//! reported in a single [`ConfigError::Invalid`].

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: &[&str] = &["pretty", "compact", "json", "full"];

/// Validate a fully-loaded configuration.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] listing all violations found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    let mut violations = Vec::new();

    validate_log(config, &mut violations);
    validate_plugins(config, &mut violations);

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid { violations })
    }
}

fn validate_log(config: &Config, violations: &mut Vec<String>) {
    let log = &config.log;

    if !LOG_LEVELS.contains(&log.level.to_ascii_lowercase().as_str()) {
        violations.push(format!(
            "log.level: unsupported level '{}'; expected one of: {}",
            log.level,
            LOG_LEVELS.join(", ")
        ));
    }

    if !LOG_FORMATS.contains(&log.format.to_ascii_lowercase().as_str()) {
        violations.push(format!(
            "log.format: unsupported format '{}'; expected one of: {}",
            log.format,
            LOG_FORMATS.join(", ")
        ));
    }
}

fn validate_plugins(config: &Config, violations: &mut Vec<String>) {
    let p = &config.plugins;

    if p.cache_dir.as_os_str().is_empty() {
        violations.push("plugins.cache_dir: must not be empty".to_owned());
    }

    if p.restart_policy.threshold == 0 {
        violations.push("plugins.restart_policy.threshold: must be at least 1".to_owned());
    }

    for (field, value) in [
        ("plugins.startup_timeout_secs", p.startup_timeout_secs),
        ("plugins.handshake_timeout_secs", p.handshake_timeout_secs),
        ("plugins.health_check_interval_secs", p.health_check_interval_secs),
        ("plugins.shutdown_timeout_secs", p.shutdown_timeout_secs),
    ] {
        if value == 0 {
            violations.push(format!("{field}: must be at least 1 second"));
        }
    }

    for (name, repo) in &p.repositories {
        if name.trim().is_empty() {
            violations.push("plugins.repositories: repository name must not be empty".to_owned());
        }
        if repo.url.trim().is_empty() {
            violations.push(format!("plugins.repositories.{name}.url: must not be empty"));
        }
    }
}
