//! 配置系统
//!
//! 加载顺序：内置默认值 -> 配置文件（TOML，可选）-> 环境变量（前缀 `FLEET_`，层级分隔符 `__`）。
//! 例如 `FLEET_FLEET__CONCURRENCY_LIMIT=4`、`FLEET_SSH__HOST_KEY_POLICY=pinned`。

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::RunError;
use crate::models::{HostDescriptor, Inventory};
use crate::ssh::HostKeyPolicy;

/// 默认配置文件路径（不存在时忽略）
pub const DEFAULT_CONFIG_FILE: &str = "fleet.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty, compact
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshSettings {
    /// 默认登录用户名
    pub username: String,
    /// TCP 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// SSH 握手与认证超时（秒）
    pub handshake_timeout_secs: u64,
    /// 命令执行默认超时（秒）
    pub command_timeout_secs: u64,
    /// 堡垒机会话保活间隔（秒），0 表示关闭
    pub keepalive_interval_secs: u64,
    /// 主机密钥验证策略（trust_on_first_use/pinned/skip）
    pub host_key_policy: String,
    /// known_hosts 文件路径（每行 `host:port SHA256:...`）
    #[serde(default)]
    pub known_hosts_file: Option<String>,
    /// 预置的主机指纹：`host:port` -> `SHA256:...`
    #[serde(default)]
    pub known_hosts: HashMap<String, String>,
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    pub fn policy(&self) -> Result<HostKeyPolicy, ConfigError> {
        self.host_key_policy
            .parse::<HostKeyPolicy>()
            .map_err(ConfigError::Message)
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            username: "ubuntu".to_string(),
            connect_timeout_secs: 5,
            handshake_timeout_secs: 10,
            command_timeout_secs: 300,
            keepalive_interval_secs: 30,
            host_key_policy: "trust_on_first_use".to_string(),
            known_hosts_file: None,
            known_hosts: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    /// 同时执行的目标主机上限
    pub concurrency_limit: usize,
    /// 整次运行的截止时间（秒），不设置表示不限制
    #[serde(default)]
    pub run_deadline_secs: Option<u64>,
    /// 堡垒机角色名
    pub bastion_role: String,
}

impl FleetConfig {
    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }
}

/// 密钥后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretBackendKind {
    Directory,
    Env,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretsConfig {
    pub backend: SecretBackendKind,
    /// directory 后端的根目录
    pub directory: String,
    /// env 后端的变量前缀
    pub env_prefix: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InventoryConfig {
    #[serde(default)]
    pub hosts: Vec<HostDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub ssh: SshSettings,
    pub fleet: FleetConfig,
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
}

impl AppConfig {
    /// 只从默认值和环境变量加载
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// 加载配置；显式指定的文件必须存在，默认文件不存在时忽略
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut settings = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .set_default("ssh.username", "ubuntu")?
            .set_default("ssh.connect_timeout_secs", 5)?
            .set_default("ssh.handshake_timeout_secs", 10)?
            .set_default("ssh.command_timeout_secs", 300)?
            .set_default("ssh.keepalive_interval_secs", 30)?
            .set_default("ssh.host_key_policy", "trust_on_first_use")?
            .set_default("fleet.concurrency_limit", 10)?
            .set_default("fleet.bastion_role", "bastion")?
            .set_default("secrets.backend", "directory")?
            .set_default("secrets.directory", "keys")?
            .set_default("secrets.env_prefix", "FLEET_KEY_")?;

        settings = match path {
            Some(path) => settings.add_source(File::new(path, FileFormat::Toml).required(true)),
            None => settings.add_source(
                File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml).required(false),
            ),
        };

        settings = settings.add_source(
            Environment::with_prefix("FLEET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty, compact",
                    self.logging.format
                )))
            }
        }

        if self.fleet.concurrency_limit == 0 {
            return Err(ConfigError::Message(
                "fleet.concurrency_limit must be at least 1".to_string(),
            ));
        }

        if self.fleet.run_deadline_secs == Some(0) {
            return Err(ConfigError::Message(
                "fleet.run_deadline_secs must be greater than 0".to_string(),
            ));
        }

        if self.fleet.bastion_role.trim().is_empty() {
            return Err(ConfigError::Message("fleet.bastion_role must not be empty".to_string()));
        }

        if self.ssh.connect_timeout_secs == 0
            || self.ssh.handshake_timeout_secs == 0
            || self.ssh.command_timeout_secs == 0
        {
            return Err(ConfigError::Message("ssh timeouts must be greater than 0".to_string()));
        }

        self.ssh.policy()?;

        Ok(())
    }

    /// 由配置中的主机列表构建清单
    pub fn build_inventory(&self) -> Result<Inventory, RunError> {
        Inventory::new(self.inventory.hosts.clone(), self.fleet.bastion_role.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        for key in [
            "FLEET_LOGGING__LEVEL",
            "FLEET_LOGGING__FORMAT",
            "FLEET_FLEET__CONCURRENCY_LIMIT",
            "FLEET_SSH__HOST_KEY_POLICY",
            "FLEET_SSH__USERNAME",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        clear_env();

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.ssh.username, "ubuntu");
        assert_eq!(config.fleet.concurrency_limit, 10);
        assert_eq!(config.fleet.bastion_role, "bastion");
        assert_eq!(config.secrets.backend, SecretBackendKind::Directory);
        assert_eq!(config.ssh.policy().unwrap(), HostKeyPolicy::TrustOnFirstUse);
        assert!(config.fleet.run_deadline().is_none());
    }

    #[test]
    #[serial]
    fn test_config_env_override() {
        clear_env();
        std::env::set_var("FLEET_FLEET__CONCURRENCY_LIMIT", "3");
        std::env::set_var("FLEET_SSH__HOST_KEY_POLICY", "pinned");

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.fleet.concurrency_limit, 3);
        assert_eq!(config.ssh.policy().unwrap(), HostKeyPolicy::Pinned);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_validation_invalid_log_level() {
        clear_env();
        std::env::set_var("FLEET_LOGGING__LEVEL", "invalid");

        assert!(AppConfig::from_env().is_err());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_validation_zero_concurrency() {
        clear_env();
        std::env::set_var("FLEET_FLEET__CONCURRENCY_LIMIT", "0");

        assert!(AppConfig::from_env().is_err());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_file_with_inventory() {
        clear_env();

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[fleet]
concurrency_limit = 4
run_deadline_secs = 120

[[inventory.hosts]]
role = "bastion"
address = "203.0.113.10"
credential_id = "bastion-key"

[[inventory.hosts]]
role = "api"
address = "10.0.1.10"
port = 2222
credential_id = "api-key"
username = "deploy"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.fleet.concurrency_limit, 4);
        assert_eq!(config.fleet.run_deadline(), Some(Duration::from_secs(120)));

        let inventory = config.build_inventory().unwrap();
        let api = inventory.get("api").unwrap();
        assert_eq!(api.port, 2222);
        assert_eq!(api.username.as_deref(), Some("deploy"));
        assert_eq!(inventory.target_count(), 1);
    }

    #[test]
    #[serial]
    fn test_config_missing_explicit_file() {
        clear_env();
        assert!(AppConfig::load(Some("/nonexistent/fleet.toml")).is_err());
    }
}
