//! Agent configuration.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `config.yaml` but can be given with `-f` or the `SHAREDFS_CONFIG` environment
//! variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `SHAREDFS_` override YAML values
//!
//! Nested values use double underscores, e.g. `SHAREDFS_COMMANDS__TIMEOUT=10s` or
//! `SHAREDFS_DATABASE__TYPE=memory`.
//!
//! ## Example
//!
//! ```yaml
//! agent_name: sharedfs-agent-0
//! agent_dns_address: sharedfs-0.example.internal
//! firewall_allow_rules:
//!   - 10.0.16.0/24
//! home_root: /var/vcap/store/sharedfs/home
//! database:
//!   type: sqlite
//!   url: sqlite:/var/vcap/store/sharedfs/sharedfs.sqlite3
//! commands:
//!   mode: suspended
//!   timeout: 5s
//!   retry:
//!     max_attempts: 3
//!     delay: 2s
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::Error;
use crate::exec::{ExecutionMode, RetryPolicy};

/// Simple CLI args - just for specifying the config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "SHAREDFS_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Reported as `name` in every response
    pub agent_name: String,
    /// Hostname handed to clients in credentials
    pub agent_dns_address: String,
    /// CIDRs the broker should open for SSH, joined with `,` in credentials
    pub firewall_allow_rules: Option<Vec<String>>,
    /// Directory holding one home per provisioned account
    pub home_root: PathBuf,
    /// Mount point probed by `discover` for free space
    pub storage_volume: PathBuf,
    /// Login shell of provisioned accounts
    pub login_shell: String,
    /// Repair missing OS accounts before serving
    pub reconcile_on_startup: bool,
    /// How many random usernames to try before giving up on a provision
    pub username_attempts: u32,
    pub database: DatabaseConfig,
    pub commands: CommandsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9292,
            agent_name: "sharedfs-agent".to_string(),
            agent_dns_address: "localhost".to_string(),
            firewall_allow_rules: None,
            home_root: PathBuf::from("/var/vcap/store/sharedfs/home"),
            storage_volume: PathBuf::from("/var/vcap/store"),
            login_shell: "/bin/bash".to_string(),
            reconcile_on_startup: true,
            username_attempts: 5,
            database: DatabaseConfig::default(),
            commands: CommandsConfig::default(),
        }
    }
}

/// Where service records are kept.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatabaseConfig {
    /// SQLite database file, created and migrated on startup
    Sqlite { url: String },
    /// Process-local map; records do not survive a restart
    Memory,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig::Sqlite {
            url: "sqlite:/var/vcap/store/sharedfs/sharedfs.sqlite3".to_string(),
        }
    }
}

/// How external commands are run.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CommandsConfig {
    pub mode: ExecutionMode,
    /// Deadline for a single command
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<(), Error> {
        if !self.home_root.is_absolute() {
            return Err(Error::InvalidConfig {
                message: format!("home_root must be an absolute path, got {}", self.home_root.display()),
            });
        }
        if self.commands.retry.max_attempts == 0 {
            return Err(Error::InvalidConfig {
                message: "commands.retry.max_attempts must be at least 1".to_string(),
            });
        }
        if self.commands.timeout.is_zero() {
            return Err(Error::InvalidConfig {
                message: "commands.timeout must be greater than zero".to_string(),
            });
        }
        if self.username_attempts == 0 {
            return Err(Error::InvalidConfig {
                message: "username_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // SHAREDFS_CONFIG names the file itself, not a setting
            .merge(Env::prefixed("SHAREDFS_").ignore(&["config"]).split("__"))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Comma-separated allow-list as handed out in credentials.
    pub fn firewall_allow_rules_joined(&self) -> Option<String> {
        self.firewall_allow_rules.as_ref().map(|rules| rules.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn args(path: &str) -> Args {
        Args {
            config: path.to_string(),
            validate: false,
        }
    }

    #[test]
    fn test_defaults_when_file_is_missing() {
        Jail::expect_with(|_jail| {
            let config = Config::load(&args("missing.yaml"))?;

            assert_eq!(config.home_root, PathBuf::from("/var/vcap/store/sharedfs/home"));
            assert_eq!(config.login_shell, "/bin/bash");
            assert_eq!(config.commands.timeout, Duration::from_secs(5));
            assert_eq!(config.commands.mode, ExecutionMode::Suspended);
            assert_eq!(config.commands.retry.max_attempts, 1);
            assert_eq!(config.commands.retry.delay, Duration::from_secs(2));
            assert!(config.reconcile_on_startup);
            assert!(matches!(config.database, DatabaseConfig::Sqlite { .. }));
            Ok(())
        });
    }

    #[test]
    fn test_yaml_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
agent_name: sharedfs-agent-3
agent_dns_address: sharedfs-3.example.internal
firewall_allow_rules:
  - 10.0.16.0/24
  - 10.0.17.0/24
home_root: /srv/sharedfs/home
database:
  type: memory
commands:
  mode: blocking
  timeout: 10s
  retry:
    max_attempts: 3
    delay: 500ms
"#,
            )?;

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.agent_name, "sharedfs-agent-3");
            assert_eq!(config.agent_dns_address, "sharedfs-3.example.internal");
            assert_eq!(config.firewall_allow_rules_joined().as_deref(), Some("10.0.16.0/24,10.0.17.0/24"));
            assert_eq!(config.home_root, PathBuf::from("/srv/sharedfs/home"));
            assert_eq!(config.database, DatabaseConfig::Memory);
            assert_eq!(config.commands.mode, ExecutionMode::Blocking);
            assert_eq!(config.commands.timeout, Duration::from_secs(10));
            assert_eq!(config.commands.retry, RetryPolicy::new(3, Duration::from_millis(500)));
            Ok(())
        });
    }

    #[test]
    fn test_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "agent_name: from-file\n")?;
            jail.set_env("SHAREDFS_CONFIG", "test.yaml");
            jail.set_env("SHAREDFS_AGENT_NAME", "from-env");
            jail.set_env("SHAREDFS_PORT", "8080");
            jail.set_env("SHAREDFS_COMMANDS__TIMEOUT", "30s");

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.agent_name, "from-env");
            assert_eq!(config.port, 8080);
            assert_eq!(config.commands.timeout, Duration::from_secs(30));
            Ok(())
        });
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "agent_nme: typo\n")?;
            assert!(Config::load(&args("test.yaml")).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_validation() {
        let relative = Config {
            home_root: PathBuf::from("home"),
            ..Default::default()
        };
        assert!(relative.validate().is_err());

        let mut no_attempts = Config::default();
        no_attempts.commands.retry.max_attempts = 0;
        assert!(no_attempts.validate().is_err());

        let mut no_timeout = Config::default();
        no_timeout.commands.timeout = Duration::ZERO;
        assert!(no_timeout.validate().is_err());

        let no_usernames = Config {
            username_attempts: 0,
            ..Default::default()
        };
        assert!(no_usernames.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }
}
