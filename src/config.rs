use std::fmt;
use std::path::PathBuf;

use chrono::NaiveTime;
use chrono_tz::Tz;

use crate::finalizer::FinalizeSchedule;
use crate::location::{LocationRegistry, RegistryError};

#[derive(Debug)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    Registry(RegistryError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid {var}: {value:?}"),
            ConfigError::Registry(e) => write!(f, "branch table: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<RegistryError> for ConfigError {
    fn from(e: RegistryError) -> Self {
        ConfigError::Registry(e)
    }
}

/// Runtime settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub schedule: FinalizeSchedule,
    pub branches_file: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compact_threshold: 1000,
            schedule: FinalizeSchedule::default(),
            branches_file: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables take defaults, malformed
    /// ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(dir) = lookup("OFFICENO_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("OFFICENO_COMPACT_THRESHOLD") {
            config.compact_threshold = parse("OFFICENO_COMPACT_THRESHOLD", &raw, |s| s.parse().ok())?;
        }
        if let Some(raw) = lookup("OFFICENO_FINALIZE_AT") {
            config.schedule.at = parse("OFFICENO_FINALIZE_AT", &raw, |s| {
                NaiveTime::parse_from_str(s, "%H:%M").ok()
            })?;
        }
        if let Some(raw) = lookup("OFFICENO_TIMEZONE") {
            config.schedule.tz = parse("OFFICENO_TIMEZONE", &raw, |s| s.parse::<Tz>().ok())?;
        }
        config.branches_file = lookup("OFFICENO_BRANCHES").map(PathBuf::from);
        if let Some(raw) = lookup("OFFICENO_METRICS_PORT") {
            config.metrics_port = Some(parse("OFFICENO_METRICS_PORT", &raw, |s| s.parse().ok())?);
        }
        Ok(config)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("officeno.wal")
    }

    pub fn registry(&self) -> Result<LocationRegistry, ConfigError> {
        match &self.branches_file {
            Some(path) => Ok(LocationRegistry::from_json_file(path)?),
            None => Ok(LocationRegistry::builtin()),
        }
    }
}

fn parse<T>(var: &'static str, raw: &str, f: impl Fn(&str) -> Option<T>) -> Result<T, ConfigError> {
    f(raw.trim()).ok_or_else(|| ConfigError::Invalid {
        var,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.schedule, FinalizeSchedule::default());
        assert!(config.metrics_port.is_none());
        assert_eq!(config.registry().unwrap().len(), LocationRegistry::builtin().len());
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("OFFICENO_DATA_DIR", "/var/lib/officeno"),
            ("OFFICENO_COMPACT_THRESHOLD", "50"),
            ("OFFICENO_FINALIZE_AT", "01:30"),
            ("OFFICENO_TIMEZONE", "Europe/London"),
            ("OFFICENO_METRICS_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/officeno/officeno.wal"));
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.schedule.at, NaiveTime::from_hms_opt(1, 30, 0).unwrap());
        assert_eq!(config.schedule.tz, chrono_tz::Europe::London);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn malformed_values_are_errors() {
        for (var, value) in [
            ("OFFICENO_FINALIZE_AT", "25:00"),
            ("OFFICENO_TIMEZONE", "Mars/Olympus"),
            ("OFFICENO_COMPACT_THRESHOLD", "-1"),
            ("OFFICENO_METRICS_PORT", "http"),
        ] {
            let err = Config::from_lookup(lookup(&[(var, value)])).unwrap_err();
            assert!(err.to_string().contains(var), "{err}");
        }
    }

    #[test]
    fn missing_branch_file_is_an_error() {
        let config = Config::from_lookup(lookup(&[("OFFICENO_BRANCHES", "/nonexistent/branches.json")])).unwrap();
        assert!(matches!(config.registry(), Err(ConfigError::Registry(RegistryError::Io(_)))));
    }
}
