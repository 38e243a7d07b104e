use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use kr_core::dirs::KrDirs;
use kr_core::timeouts::Timeouts;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
    #[error("home directory not found")]
    NoHome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KrdConfig {
    pub run_dir: PathBuf,
    pub notify_dir: PathBuf,
    pub ssh_dir: PathBuf,

    // Mailbox
    pub mailbox_url: Option<String>,
    pub push_url: Option<String>,
    pub poll_wait_ms: u64,

    // Logging
    pub log_level: String,
    pub silence_warnings: bool,
    pub no_stderr: bool,
    pub log_syslog: bool,

    // Broker
    pub trusted_host_ttl_secs: u64,
    pub noop_interval_secs: u64,
    pub timeouts: Option<Timeouts>,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map_or(false, |v| !v.is_empty() && v != "0" && v != "false")
}

impl KrdConfig {
    pub fn with_dirs(dirs: KrDirs) -> Self {
        Self {
            run_dir: dirs.run_dir,
            notify_dir: dirs.notify_dir,
            ssh_dir: dirs.ssh_dir,
            mailbox_url: None,
            push_url: None,
            poll_wait_ms: 3000,
            log_level: "INFO".to_string(),
            silence_warnings: false,
            no_stderr: false,
            log_syslog: false,
            trusted_host_ttl_secs: 3600,
            noop_interval_secs: 60,
            timeouts: None,
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::parse(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML, filling unset paths from the invoking user's home.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let base = Self::with_dirs(KrDirs::resolve().map_err(|_| ConfigError::NoHome)?);
        let value: toml::Value =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let mut merged = toml::Value::try_from(&base)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        if let (Some(dst), toml::Value::Table(src)) = (merged.as_table_mut(), value) {
            for (k, v) in src {
                dst.insert(k, v);
            }
        }
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError(e.to_string()))
    }

    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = Self::with_dirs(KrDirs::resolve().map_err(|_| ConfigError::NoHome)?);
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(level) = std::env::var("KR_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(url) = std::env::var("KR_MAILBOX_URL") {
            self.mailbox_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Ok(url) = std::env::var("KR_PUSH_URL") {
            self.push_url = Some(url).filter(|u| !u.is_empty());
        }
        self.silence_warnings |= env_flag("KR_SILENCE_WARNINGS");
        self.no_stderr |= env_flag("KR_NO_STDERR");
        self.log_syslog |= env_flag("KR_LOG_SYSLOG");
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_wait_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_wait_ms must be > 0".to_string(),
            ));
        }
        for (name, path) in [
            ("run_dir", &self.run_dir),
            ("notify_dir", &self.notify_dir),
            ("ssh_dir", &self.ssh_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::ValidationError(format!("{} must not be empty", name)));
            }
        }
        if let Some(timeouts) = &self.timeouts {
            for (name, phases) in timeouts.phases() {
                if phases.alert >= phases.fail {
                    return Err(ConfigError::ValidationError(format!(
                        "{} alert timeout must be shorter than its fail timeout",
                        name
                    )));
                }
            }
        }
        if self.noop_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "noop_interval_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dirs(&self) -> KrDirs {
        KrDirs {
            run_dir: self.run_dir.clone(),
            notify_dir: self.notify_dir.clone(),
            ssh_dir: self.ssh_dir.clone(),
        }
    }

    pub fn broker_timeouts(&self) -> Timeouts {
        let mut timeouts = self.timeouts.unwrap_or_default();
        timeouts.noop_interval = Duration::from_secs(self.noop_interval_secs);
        timeouts
    }

    pub fn trusted_host_ttl(&self) -> Duration {
        Duration::from_secs(self.trusted_host_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KrdConfig {
        KrdConfig::with_dirs(KrDirs::from_home(Path::new("/home/alice")))
    }

    #[test]
    fn defaults_are_valid() {
        let c = config();
        c.validate().unwrap();
        assert_eq!(c.poll_wait_ms, 3000);
        assert_eq!(c.run_dir, PathBuf::from("/home/alice/.kr"));
        assert_eq!(c.broker_timeouts().noop_interval, Duration::from_secs(60));
    }

    #[test]
    fn zero_poll_wait_is_rejected() {
        let mut c = config();
        c.poll_wait_ms = 0;
        assert!(matches!(c.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn inverted_phases_are_rejected() {
        let mut c = config();
        let mut t = Timeouts::default();
        t.sign.alert = t.sign.fail;
        c.timeouts = Some(t);
        assert!(c.validate().is_err());
    }

    #[test]
    fn empty_path_is_rejected() {
        let mut c = config();
        c.ssh_dir = PathBuf::new();
        assert!(c.validate().is_err());
    }

    #[test]
    fn toml_overrides_merge_onto_defaults() {
        let c = KrdConfig::parse(
            "mailbox_url = \"https://mailbox.example\"\npoll_wait_ms = 500\nrun_dir = \"/tmp/kr\"\n",
        )
        .unwrap();
        assert_eq!(c.mailbox_url.as_deref(), Some("https://mailbox.example"));
        assert_eq!(c.poll_wait_ms, 500);
        assert_eq!(c.run_dir, PathBuf::from("/tmp/kr"));
        assert_eq!(c.trusted_host_ttl_secs, 3600);
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        assert!(matches!(KrdConfig::parse("poll_wait_ms = "), Err(ConfigError::ParseError(_))));
    }
}
