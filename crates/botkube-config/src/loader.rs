//! Config file discovery and layered loading.
//!
//! Implements the `Config::load()` algorithm:
//! 1. Parse `defaults.toml` → base
//! 2. Merge the config file (explicit path, `BOTKUBE_CONFIG`, or the
//!    platform config directory)
//! 3. Apply environment variable overrides
//! 4. Deserialize merged tree → `Config`
//! 5. Validate

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Env var naming the config file when no explicit path is given.
pub const CONFIG_PATH_ENV: &str = "BOTKUBE_CONFIG";

/// Env var overriding `plugins.cache_dir`.
pub const CACHE_DIR_ENV: &str = "BOTKUBE_PLUGINS_CACHE_DIR";

/// Env var overriding `plugins.force_update`.
pub const FORCE_UPDATE_ENV: &str = "BOTKUBE_PLUGINS_FORCE_UPDATE";

/// Env var overriding `log.level`.
pub const LOG_LEVEL_ENV: &str = "BOTKUBE_LOG_LEVEL";

/// Load the configuration using the process environment.
///
/// # Errors
///
/// Returns a [`ConfigError`] if a config file is malformed, an override is
/// invalid, or the final configuration fails validation.
pub fn load(path: Option<&Path>) -> ConfigResult<Config> {
    let env_vars: HashMap<String, String> = std::env::vars().collect();
    load_with_env(path, &env_vars)
}

/// Load the configuration against an explicit environment snapshot.
///
/// # Errors
///
/// See [`load`].
pub fn load_with_env(path: Option<&Path>, env_vars: &HashMap<String, String>) -> ConfigResult<Config> {
    // 1. Parse embedded defaults.
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;

    // 2. Config file.
    let file_path = path
        .map(Path::to_path_buf)
        .or_else(|| env_vars.get(CONFIG_PATH_ENV).map(PathBuf::from))
        .or_else(default_path);

    if let Some(file_path) = file_path {
        if let Some(overlay) = try_load_file(&file_path, path.is_some())? {
            deep_merge(&mut merged, overlay);
            info!(path = %file_path.display(), "loaded config file");
        }
    }

    // 3. Environment overrides.
    let env_count = apply_env_overrides(&mut merged, env_vars)?;
    if env_count > 0 {
        debug!(count = env_count, "applied environment variable overrides");
    }

    // 4. Deserialize.
    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    // 5. Validate.
    validate::validate(&config)?;
    Ok(config)
}

/// Load a config from a specific file path on top of the embedded defaults.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed, or fails
/// validation.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    load_with_env(Some(path), &HashMap::new())
}

/// The platform config location (`~/.config/botkube/config.toml` on Linux).
#[must_use]
pub fn default_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("io", "kubeshop", "botkube")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Read and parse a TOML file.
///
/// A missing file is only an error when the path was given explicitly.
fn try_load_file(path: &Path, required: bool) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if u64::try_from(content.len()).unwrap_or(u64::MAX) > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::Invalid {
            violations: vec![format!(
                "{}: config file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                path.display(),
                content.len(),
            )],
        });
    }

    let value: toml::Value = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(Some(value))
}

/// Recursively merge `overlay` into `base`. Tables merge key by key; any
/// other value in the overlay replaces the base value.
fn deep_merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_table.insert(key, value);
                    },
                }
            }
        },
        (base, overlay) => *base = overlay,
    }
}

/// Apply `BOTKUBE_*` overrides, returning how many were applied.
fn apply_env_overrides(
    merged: &mut toml::Value,
    env_vars: &HashMap<String, String>,
) -> ConfigResult<usize> {
    let mut applied = 0usize;

    if let Some(dir) = env_vars.get(CACHE_DIR_ENV) {
        set_path(merged, &["plugins", "cache_dir"], toml::Value::String(dir.clone()));
        applied = applied.saturating_add(1);
    }

    if let Some(raw) = env_vars.get(FORCE_UPDATE_ENV) {
        let value = parse_bool(raw).ok_or_else(|| ConfigError::EnvError {
            var_name: FORCE_UPDATE_ENV.to_owned(),
            message: format!("expected a boolean, got '{raw}'"),
        })?;
        set_path(merged, &["plugins", "force_update"], toml::Value::Boolean(value));
        applied = applied.saturating_add(1);
    }

    if let Some(level) = env_vars.get(LOG_LEVEL_ENV) {
        set_path(merged, &["log", "level"], toml::Value::String(level.clone()));
        applied = applied.saturating_add(1);
    }

    Ok(applied)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Set a nested value, creating intermediate tables as needed.
fn set_path(root: &mut toml::Value, path: &[&str], value: toml::Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut current = root;
    for segment in parents {
        let toml::Value::Table(table) = current else {
            return;
        };
        current = table
            .entry((*segment).to_owned())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    }

    if let toml::Value::Table(table) = current {
        table.insert((*last).to_owned(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RestartPolicyType;

    fn write_config(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn defaults_load_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let mut env = HashMap::new();
        env.insert(CONFIG_PATH_ENV.to_owned(), missing.display().to_string());

        let config = load_with_env(None, &env).unwrap();
        assert_eq!(config.plugins.restart_policy.threshold, 10);
        assert_eq!(
            config.plugins.restart_policy.policy_type,
            RestartPolicyType::DeactivatePlugin
        );
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn file_overrides_defaults_and_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[log]
level = "debug"

[plugins]
cache_dir = "/var/cache/botkube"
health_check_interval_secs = 3

[plugins.repositories.botkube]
url = "https://example.com/botkube.yaml"

[sources.k8s."botkube/kubernetes"]
enabled = true
"#,
        );

        let mut env = HashMap::new();
        env.insert(CACHE_DIR_ENV.to_owned(), "/srv/plugins".to_owned());
        env.insert(FORCE_UPDATE_ENV.to_owned(), "true".to_owned());

        let config = load_with_env(Some(&path), &env).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.plugins.cache_dir, PathBuf::from("/srv/plugins"));
        assert!(config.plugins.force_update);
        assert_eq!(config.plugins.health_check_interval_secs, 3);
        // Untouched defaults survive the merge.
        assert_eq!(config.plugins.handshake_timeout_secs, 60);
        assert_eq!(config.enabled_source_keys().len(), 1);
    }

    #[test]
    fn invalid_env_bool_is_rejected() {
        let mut env = HashMap::new();
        env.insert(FORCE_UPDATE_ENV.to_owned(), "maybe".to_owned());
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");

        let err = load_with_env(Some(&path), &env).unwrap_err();
        assert!(matches!(err, ConfigError::EnvError { .. }));
    }

    #[test]
    fn validation_runs_after_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[plugins.restart_policy]\nthreshold = 0\n");

        let err = load_file(&path).unwrap_err();
        assert!(err.to_string().contains("threshold"));
    }
}
