//! Configuration loading and validation.
//!
//! All settings come from environment variables, resolved once at
//! startup into an explicit [`Config`] value that is passed to the
//! pool, router, and auth middleware; nothing is read from global
//! state afterwards. Violations surface as [`ConfigError`] and the
//! process exits non-zero.

use std::path::Path;

use thiserror::Error;

/// Recognised log levels (the two above `error` map onto `error` for
/// the tracing filter).
const LOG_LEVELS: [&str; 6] = ["panic", "fatal", "error", "warn", "info", "debug"];

/// A configuration violation. Fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{var}: {message}")]
    Invalid { var: &'static str, message: String },
}

fn invalid(var: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        message: message.into(),
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// One of panic, fatal, error, warn, info, debug.
    pub level: String,
    /// Emit mozlog-style JSON records instead of text.
    pub mozlog: bool,
}

/// Resolved server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Pre-shared token secrets; the first is active, the rest are
    /// still accepted to cover rotation.
    pub secrets: Vec<String>,
    /// Root of the user database tree, or `":memory:"`.
    pub data_dir: String,
    /// Idle seconds before a user handler is evicted.
    pub ttl: u64,
    /// Handler pool size bound (one open database file per handler).
    pub max_open_files: usize,
    /// Hostname reported in logs.
    pub hostname: String,
    /// Logging settings.
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Config, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        let host = get("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = get("PORT").ok_or(ConfigError::Missing("PORT"))?;
        let port: u16 = port
            .parse()
            .ok()
            .filter(|p| *p >= 1)
            .ok_or_else(|| invalid("PORT", "must be an integer in 1-65535"))?;

        let secrets: Vec<String> = get("SECRETS")
            .ok_or(ConfigError::Missing("SECRETS"))?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if secrets.is_empty() {
            return Err(invalid("SECRETS", "at least one secret is required"));
        }

        let data_dir = get("DATA_DIR").ok_or(ConfigError::Missing("DATA_DIR"))?;
        if data_dir != ":memory:" {
            probe_data_dir(&data_dir)?;
        }

        let ttl = match get("TTL") {
            Some(v) => v
                .parse::<u64>()
                .ok()
                .filter(|t| *t > 0)
                .ok_or_else(|| invalid("TTL", "must be a positive integer"))?,
            None => 300,
        };

        let max_open_files = match get("MAX_OPEN_FILES") {
            Some(v) => v
                .parse::<usize>()
                .ok()
                .filter(|m| *m > 0)
                .ok_or_else(|| invalid("MAX_OPEN_FILES", "must be a positive integer"))?,
            None => 64,
        };

        let hostname = get("HOSTNAME")
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());

        let level = get("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(invalid(
                "LOG_LEVEL",
                format!("must be one of {}", LOG_LEVELS.join(", ")),
            ));
        }

        let mozlog = match get("LOG_MOZLOG").as_deref() {
            None | Some("") | Some("false") | Some("0") => false,
            Some("true") | Some("1") => true,
            Some(other) => {
                return Err(invalid("LOG_MOZLOG", format!("not a boolean: {other}")))
            }
        };

        Ok(Config {
            host,
            port,
            secrets,
            data_dir,
            ttl,
            max_open_files,
            hostname,
            log: LogConfig { level, mozlog },
        })
    }

    /// The tracing filter directive for the configured level.
    pub fn tracing_level(&self) -> &str {
        match self.log.level.as_str() {
            // tracing has no panic/fatal levels; error is the closest.
            "panic" | "fatal" => "error",
            other => other,
        }
    }
}

/// DATA_DIR must exist, be a directory, and be writable; proven by
/// creating and removing a sentinel file.
fn probe_data_dir(dir: &str) -> Result<(), ConfigError> {
    let path = Path::new(dir);
    if !path.exists() {
        return Err(invalid("DATA_DIR", "does not exist"));
    }
    if !path.is_dir() {
        return Err(invalid("DATA_DIR", "is not a directory"));
    }

    let sentinel = path.join("test.writable");
    std::fs::File::create(&sentinel)
        .map_err(|_| invalid("DATA_DIR", "is not writable"))?;
    let _ = std::fs::remove_file(&sentinel);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, String> {
        HashMap::from([
            ("PORT", "8000".to_string()),
            ("SECRETS", "s1,s2".to_string()),
            ("DATA_DIR", ":memory:".to_string()),
        ])
    }

    fn load(vars: &HashMap<&'static str, String>) -> Result<Config, ConfigError> {
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&base_vars()).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8000);
        assert_eq!(config.secrets, ["s1", "s2"]);
        assert_eq!(config.ttl, 300);
        assert_eq!(config.max_open_files, 64);
        assert_eq!(config.log.level, "info");
        assert!(!config.log.mozlog);
    }

    #[test]
    fn test_required_variables() {
        let mut vars = base_vars();
        vars.remove("PORT");
        assert_eq!(load(&vars), Err(ConfigError::Missing("PORT")));

        let mut vars = base_vars();
        vars.remove("SECRETS");
        assert_eq!(load(&vars), Err(ConfigError::Missing("SECRETS")));

        let mut vars = base_vars();
        vars.remove("DATA_DIR");
        assert_eq!(load(&vars), Err(ConfigError::Missing("DATA_DIR")));
    }

    #[test]
    fn test_invalid_port() {
        for bad in ["0", "65536", "http", ""] {
            let mut vars = base_vars();
            vars.insert("PORT", bad.to_string());
            assert!(load(&vars).is_err(), "PORT={bad} should be rejected");
        }
    }

    #[test]
    fn test_empty_secret_list_rejected() {
        let mut vars = base_vars();
        vars.insert("SECRETS", " , ,".to_string());
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_data_dir_probe() {
        let dir = tempfile::tempdir().unwrap();
        let mut vars = base_vars();
        vars.insert("DATA_DIR", dir.path().to_str().unwrap().to_string());
        assert!(load(&vars).is_ok());

        vars.insert("DATA_DIR", "/nonexistent/syncstore-test".to_string());
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut vars = base_vars();
        vars.insert("LOG_LEVEL", "debug".to_string());
        assert_eq!(load(&vars).unwrap().log.level, "debug");

        vars.insert("LOG_LEVEL", "verbose".to_string());
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_fatal_maps_to_error_filter() {
        let mut vars = base_vars();
        vars.insert("LOG_LEVEL", "fatal".to_string());
        assert_eq!(load(&vars).unwrap().tracing_level(), "error");
    }

    #[test]
    fn test_ttl_must_be_positive() {
        let mut vars = base_vars();
        vars.insert("TTL", "0".to_string());
        assert!(load(&vars).is_err());
    }
}
