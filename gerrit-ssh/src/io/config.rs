//! Client configuration (TOML).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;

/// Recovery class used when no more specific class is configured.
pub const DEFAULT_CLASS: &str = "default";
/// Recovery class for one-shot `gerrit` commands.
pub const COMMAND_CLASS: &str = "gerrit";
/// Recovery class for the `stream-events` subscription.
pub const FEED_CLASS: &str = "gerrit_stream";

/// Connection and recovery settings.
///
/// Missing fields default to values that reproduce a stock OpenSSH setup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Private key loaded into the agent on connect.
    pub key_file: Option<PathBuf>,
    /// Backoff settings per operation class.
    pub recovery: BTreeMap<String, RecoveryClass>,
    pub transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let mut recovery = BTreeMap::new();
        recovery.insert(DEFAULT_CLASS.to_string(), RecoveryClass::default());
        Self {
            host: String::new(),
            port: 22,
            user: String::new(),
            key_file: None,
            recovery,
            transport: TransportConfig::default(),
        }
    }
}

/// Backoff settings for one operation class.
///
/// The base values are required in every table; `Default` is only the
/// built-in `default` class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryClass {
    /// Startup timeout for the first attempt.
    pub timeout_ms: u64,
    /// Unbounded when absent.
    #[serde(default)]
    pub max_timeout_ms: Option<u64>,
    pub retries: u32,
    /// Delay before the first retry.
    pub delay_ms: u64,
    /// Unbounded when absent.
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

impl Default for RecoveryClass {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            max_timeout_ms: Some(10_000),
            retries: 5,
            delay_ms: 250,
            max_delay_ms: Some(2000),
        }
    }
}

impl RecoveryClass {
    /// Fresh retry budget for one runner instance.
    pub fn policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::new(
            self.retries,
            Duration::from_millis(self.delay_ms),
            Duration::from_millis(self.timeout_ms),
        );
        if let Some(max) = self.max_delay_ms {
            policy = policy.with_max_delay(Duration::from_millis(max));
        }
        if let Some(max) = self.max_timeout_ms {
            policy = policy.with_max_timeout(Duration::from_millis(max));
        }
        policy
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(anyhow!("recovery.{name}.timeout_ms must be > 0"));
        }
        if let Some(max) = self.max_timeout_ms
            && max < self.timeout_ms
        {
            return Err(anyhow!(
                "recovery.{name}.max_timeout_ms must be >= timeout_ms"
            ));
        }
        if let Some(max) = self.max_delay_ms
            && max < self.delay_ms
        {
            return Err(anyhow!("recovery.{name}.max_delay_ms must be >= delay_ms"));
        }
        Ok(())
    }
}

/// External programs and keep-alive options for the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    pub ssh_program: PathBuf,
    pub agent_program: PathBuf,
    pub ssh_add_program: PathBuf,
    /// Directory for side-channel pipes. Defaults to the system temp dir.
    pub pipe_dir: Option<PathBuf>,
    pub server_alive_interval: u32,
    pub server_alive_count_max: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            agent_program: PathBuf::from("ssh-agent"),
            ssh_add_program: PathBuf::from("ssh-add"),
            pipe_dir: None,
            server_alive_interval: 10,
            server_alive_count_max: 1,
        }
    }
}

impl TransportConfig {
    pub fn pipe_dir(&self) -> PathBuf {
        self.pipe_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.recovery.contains_key(DEFAULT_CLASS) {
            return Err(anyhow!("recovery.{DEFAULT_CLASS} must be defined"));
        }
        for (name, class) in &self.recovery {
            class.validate(name)?;
        }
        if self.transport.ssh_program.as_os_str().is_empty() {
            return Err(anyhow!("transport.ssh_program must be non-empty"));
        }
        if self.transport.agent_program.as_os_str().is_empty() {
            return Err(anyhow!("transport.agent_program must be non-empty"));
        }
        Ok(())
    }

    /// Checks the fields needed to open a connection.
    pub fn validate_target(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("host must be set"));
        }
        if self.user.trim().is_empty() {
            return Err(anyhow!("user must be set"));
        }
        if self.port == 0 {
            return Err(anyhow!("port must be > 0"));
        }
        Ok(())
    }

    /// Recovery settings for `class`, falling back to `default`.
    pub fn recovery_for(&self, class: &str) -> RecoveryClass {
        self.recovery
            .get(class)
            .or_else(|| self.recovery.get(DEFAULT_CLASS))
            .copied()
            .unwrap_or_default()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ClientConfig::default()`.
pub fn load_config(path: &Path) -> Result<ClientConfig> {
    if !path.exists() {
        let cfg = ClientConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ClientConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ClientConfig::default());
    }

    #[test]
    fn parses_recovery_overrides() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("gerrit.toml");
        fs::write(
            &path,
            r#"
host = "review.example.org"
port = 29418
user = "ci-bot"
key_file = "/home/ci/.ssh/id_ed25519"

[recovery.default]
timeout_ms = 2000
max_timeout_ms = 10000
retries = 5
delay_ms = 250
max_delay_ms = 2000

[recovery.gerrit_stream]
timeout_ms = 5000
retries = 100
delay_ms = 1000
"#,
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.host, "review.example.org");
        assert_eq!(cfg.port, 29418);
        assert_eq!(cfg.user, "ci-bot");
        assert!(cfg.validate_target().is_ok());

        let feed = cfg.recovery_for(FEED_CLASS);
        assert_eq!(feed.retries, 100);
        assert_eq!(feed.max_delay_ms, None);

        let command = cfg.recovery_for(COMMAND_CLASS);
        assert_eq!(command, RecoveryClass::default());
    }

    #[test]
    fn unset_caps_stay_unbounded() {
        let cfg: ClientConfig = toml::from_str(
            r#"
[recovery.default]
timeout_ms = 100
retries = 3
delay_ms = 1500
"#,
        )
        .expect("parse");
        let class = cfg.recovery_for(DEFAULT_CLASS);
        assert_eq!(class.max_delay_ms, None);
        assert_eq!(class.max_timeout_ms, None);

        let mut policy = class.policy();
        for _ in 0..3 {
            policy.on_failure();
        }
        assert_eq!(policy.delay(), Duration::from_millis(12_000));
        assert_eq!(policy.timeout(), Duration::from_millis(800));
    }

    #[test]
    fn recovery_class_needs_base_values() {
        let err = toml::from_str::<ClientConfig>("[recovery.default]\nretries = 3\n")
            .expect_err("no timeout or delay");
        assert!(err.to_string().contains("timeout_ms"), "{err}");
    }

    #[test]
    fn default_class_is_required() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("gerrit.toml");
        fs::write(&path, "recovery = {}\n").expect("write");
        let err = load_config(&path).expect_err("missing default");
        assert!(err.to_string().contains("recovery.default"));
    }

    #[test]
    fn caps_below_base_are_rejected() {
        let mut cfg = ClientConfig::default();
        cfg.recovery.insert(
            COMMAND_CLASS.to_string(),
            RecoveryClass {
                timeout_ms: 5000,
                max_timeout_ms: Some(1000),
                ..RecoveryClass::default()
            },
        );
        let err = cfg.validate().expect_err("invalid cap");
        assert!(err.to_string().contains("recovery.gerrit.max_timeout_ms"));
    }

    #[test]
    fn missing_target_is_reported() {
        let cfg = ClientConfig::default();
        let err = cfg.validate_target().expect_err("no host");
        assert!(err.to_string().contains("host"));
    }

    #[test]
    fn policy_reflects_class() {
        let policy = RecoveryClass::default().policy();
        assert_eq!(policy.remaining(), 5);
        assert_eq!(policy.delay(), Duration::from_millis(250));
        assert_eq!(policy.timeout(), Duration::from_millis(2000));
    }
}
