//! Configuration loading.
//!
//! Configuration is assembled from three layers: a config file
//! (`backuper.{yaml|toml|json}`, discovered in `.`, `./config` or
//! `/etc/backuper` unless given explicitly), `BACKUPER_*` environment
//! variables and command line flags. Later layers win.

use crate::error::BackupError;
use clap::Parser;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_NAME: &str = "backuper";
const CONFIG_PATHS: &[&str] = &[".", "./config", "/etc/backuper"];

#[derive(Parser, Debug)]
#[command(author, version, about = "Containerized backup orchestrator", long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log output format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub docker: DockerConfig,
    pub mount: MountConfig,
    pub database: DatabaseConfig,
    pub transfer: HashMap<String, TransferEntry>,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub timeout: ServerTimeouts,
    pub log: ServerLog,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8000".into(),
            timeout: ServerTimeouts::default(),
            log: ServerLog::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerTimeouts {
    #[serde(deserialize_with = "de_duration")]
    pub read: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub write: Duration,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(5),
            write: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerLog {
    pub requests: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Daemon endpoint, e.g. `unix:///var/run/docker.sock` or `tcp://host:2375`.
    /// Empty selects the platform default.
    pub host: String,
    /// Docker API version, e.g. `1.41`. Empty selects the client default.
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Base directory for per-job scratch allocations.
    pub temp_directory: PathBuf,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            temp_directory: PathBuf::from("/tmp"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// Upper bound on pooled connections; one writer per rule plus the
    /// metrics reader is typically enough.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./db/sqlite3.db"),
            max_connections: 4,
        }
    }
}

/// One named storage backend under the `transfer` map.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub opts: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(deserialize_with = "de_duration")]
    pub timeout: Duration,
    pub cron_spec: String,
    pub storage_name: String,
    #[serde(default)]
    pub rotation_rules: Vec<RotationRule>,
    /// Legacy single-tier retention cap; ignored when `rotation_rules` is set.
    #[serde(default)]
    pub preserve_at_most: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RotationRule {
    /// Minimum spacing from the tier's newest member to admit a promotion.
    #[serde(default, deserialize_with = "de_duration")]
    pub period: Duration,
    pub preserve_at_most: usize,
}

impl Rule {
    /// Effective retention tiers. The legacy scalar `preserve_at_most` is a
    /// degenerate single tier: keep the newest N, discard the rest.
    pub fn rotation_tiers(&self) -> Vec<RotationRule> {
        if !self.rotation_rules.is_empty() {
            return self.rotation_rules.clone();
        }
        if self.preserve_at_most > 0 {
            return vec![RotationRule {
                period: Duration::ZERO,
                preserve_at_most: self.preserve_at_most,
            }];
        }
        Vec::new()
    }
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    humantime::parse_duration(&value).map_err(serde::de::Error::custom)
}

impl AppConfig {
    pub fn load(args: &Args) -> Result<Self, BackupError> {
        let mut config = match &args.config {
            // An explicitly requested config file must exist and parse.
            Some(path) => Self::from_file(path)?,
            None => match find_default_file() {
                Some(path) => Self::from_file(&path)?,
                None => AppConfig::default(),
            },
        };

        config.apply_env_overrides();

        if let Some(level) = &args.log_level {
            config.log.level = level.clone();
        }
        if let Some(format) = &args.log_format {
            config.log.format = format.clone();
        }

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, BackupError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BackupError::Config(format!("couldn't read {}: {}", path.display(), e)))?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext {
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .map_err(|e| BackupError::Config(format!("couldn't parse {}: {}", path.display(), e))),
            "toml" => toml::from_str(&content)
                .map_err(|e| BackupError::Config(format!("couldn't parse {}: {}", path.display(), e))),
            "json" => serde_json::from_str(&content)
                .map_err(|e| BackupError::Config(format!("couldn't parse {}: {}", path.display(), e))),
            other => Err(BackupError::Config(format!(
                "unsupported config format '{}' for {}",
                other,
                path.display()
            ))),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BACKUPER_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("BACKUPER_LOG_FORMAT") {
            self.log.format = v;
        }
        if let Ok(v) = std::env::var("BACKUPER_SERVER_ADDRESS") {
            self.server.address = v;
        }
        if let Ok(v) = std::env::var("BACKUPER_SERVER_LOG_REQUESTS") {
            self.server.log.requests = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("BACKUPER_SERVER_TIMEOUT_READ") {
            if let Ok(d) = humantime::parse_duration(&v) {
                self.server.timeout.read = d;
            }
        }
        if let Ok(v) = std::env::var("BACKUPER_SERVER_TIMEOUT_WRITE") {
            if let Ok(d) = humantime::parse_duration(&v) {
                self.server.timeout.write = d;
            }
        }
        if let Ok(v) = std::env::var("BACKUPER_DOCKER_HOST") {
            self.docker.host = v;
        }
        if let Ok(v) = std::env::var("BACKUPER_DOCKER_VERSION") {
            self.docker.version = v;
        }
        if let Ok(v) = std::env::var("BACKUPER_MOUNT_TEMP_DIRECTORY") {
            self.mount.temp_directory = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BACKUPER_DATABASE_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BACKUPER_DATABASE_MAX_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                self.database.max_connections = n;
            }
        }
    }
}

fn find_default_file() -> Option<PathBuf> {
    for dir in CONFIG_PATHS {
        for ext in ["yaml", "yml", "toml", "json"] {
            let candidate = Path::new(dir).join(format!("{}.{}", CONFIG_NAME, ext));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backuper.yaml");
        std::fs::write(
            &path,
            r#"
log:
  level: debug
  format: text
server:
  address: "127.0.0.1:9000"
  log:
    requests: true
mount:
  temp_directory: /var/tmp
transfer:
  primary:
    type: local
    root: /backups
  offsite:
    type: yadisk
    root: /app/backups
    opts:
      access_token: "secret"
rules:
  - name: daily
    image: postgres-dumper
    command: ["pg_dump", "--all"]
    timeout: 30m
    cron_spec: "0 0 3 * * *"
    storage_name: primary
    rotation_rules:
      - period: 0s
        preserve_at_most: 3
      - period: 24h
        preserve_at_most: 2
"#,
        )
        .unwrap();

        let config = AppConfig::from_file(&path).unwrap();

        assert_eq!(config.log.level, "debug");
        assert_eq!(config.server.address, "127.0.0.1:9000");
        assert!(config.server.log.requests);
        assert_eq!(config.mount.temp_directory, PathBuf::from("/var/tmp"));
        assert_eq!(config.transfer.len(), 2);
        assert_eq!(config.transfer["offsite"].opts["access_token"], "secret");

        let rule = &config.rules[0];
        assert_eq!(rule.timeout, Duration::from_secs(30 * 60));
        assert_eq!(rule.rotation_rules.len(), 2);
        assert_eq!(rule.rotation_rules[1].period, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn parses_toml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backuper.toml");
        std::fs::write(
            &path,
            r#"
[log]
level = "warn"

[[rules]]
name = "weekly"
image = "dumper"
timeout = "1h"
cron_spec = "0 0 4 * * Sun"
storage_name = "primary"
preserve_at_most = 4
"#,
        )
        .unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.log.level, "warn");
        assert_eq!(config.log.format, "json");
        assert_eq!(config.rules[0].preserve_at_most, 4);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backuper.ini");
        std::fs::write(&path, "whatever").unwrap();

        assert!(AppConfig::from_file(&path).is_err());
    }

    #[test]
    fn legacy_scalar_becomes_single_tier() {
        let rule = Rule {
            name: "r".into(),
            image: "img".into(),
            command: vec![],
            timeout: Duration::from_secs(60),
            cron_spec: "* * * * * *".into(),
            storage_name: "s".into(),
            rotation_rules: vec![],
            preserve_at_most: 5,
        };

        let tiers = rule.rotation_tiers();
        assert_eq!(tiers.len(), 1);
        assert_eq!(tiers[0].period, Duration::ZERO);
        assert_eq!(tiers[0].preserve_at_most, 5);
    }

    #[test]
    fn explicit_tiers_win_over_scalar() {
        let rule = Rule {
            name: "r".into(),
            image: "img".into(),
            command: vec![],
            timeout: Duration::from_secs(60),
            cron_spec: "* * * * * *".into(),
            storage_name: "s".into(),
            rotation_rules: vec![RotationRule {
                period: Duration::from_secs(3600),
                preserve_at_most: 2,
            }],
            preserve_at_most: 9,
        };

        let tiers = rule.rotation_tiers();
        assert_eq!(tiers.len(), 1);
        assert_eq!(tiers[0].preserve_at_most, 2);
    }

    #[test]
    fn no_retention_configured_means_no_tiers() {
        let rule = Rule {
            name: "r".into(),
            image: "img".into(),
            command: vec![],
            timeout: Duration::from_secs(60),
            cron_spec: "* * * * * *".into(),
            storage_name: "s".into(),
            rotation_rules: vec![],
            preserve_at_most: 0,
        };

        assert!(rule.rotation_tiers().is_empty());
    }
}
