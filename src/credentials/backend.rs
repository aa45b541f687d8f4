//! 密钥后端
//!
//! 后端只负责按标识取回原始密钥材料，传输中的解密由后端自身负责。

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret, SecretVec};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::config::{SecretBackendKind, SecretsConfig};
use crate::error::SecretError;

/// 按标识获取密钥材料的接口
#[async_trait]
pub trait SecretBackend: Send + Sync {
    async fn fetch(&self, identifier: &str) -> Result<SecretVec<u8>, SecretError>;

    /// 后端名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 根据配置创建后端
pub fn backend_from_config(config: &SecretsConfig) -> Arc<dyn SecretBackend> {
    match config.backend {
        SecretBackendKind::Directory => {
            Arc::new(DirectorySecretBackend::new(config.directory.clone()))
        }
        SecretBackendKind::Env => Arc::new(EnvSecretBackend::new(config.env_prefix.clone())),
    }
}

/// 从目录读取密钥文件：`<root>/<identifier>`
#[derive(Debug, Clone)]
pub struct DirectorySecretBackend {
    root: PathBuf,
}

impl DirectorySecretBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve_path(&self, identifier: &str) -> Result<PathBuf, SecretError> {
        let relative = Path::new(identifier);
        let contained = !identifier.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));

        if !contained {
            return Err(SecretError::access_denied(format!(
                "identifier '{}' escapes the secret directory",
                identifier
            )));
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl SecretBackend for DirectorySecretBackend {
    async fn fetch(&self, identifier: &str) -> Result<SecretVec<u8>, SecretError> {
        let path = self.resolve_path(identifier)?;
        debug!(identifier = %identifier, path = %path.display(), "Reading key file");

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Secret::new(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SecretError::unavailable(identifier))
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(SecretError::access_denied(identifier))
            }
            Err(e) => Err(SecretError::unavailable(format!("{}: {}", identifier, e))),
        }
    }

    fn name(&self) -> &'static str {
        "directory"
    }
}

/// 从环境变量读取密钥：`<PREFIX><IDENTIFIER>`
///
/// 标识会转为大写，非字母数字字符替换为 `_`；值中的字面量 `\n` 会还原为换行，
/// 便于在单行变量里存放 PEM。
#[derive(Debug, Clone)]
pub struct EnvSecretBackend {
    prefix: String,
}

impl EnvSecretBackend {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_name(&self, identifier: &str) -> String {
        let suffix: String = identifier
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

#[async_trait]
impl SecretBackend for EnvSecretBackend {
    async fn fetch(&self, identifier: &str) -> Result<SecretVec<u8>, SecretError> {
        let name = self.variable_name(identifier);
        match std::env::var(&name) {
            Ok(value) => {
                let value = Secret::new(value);
                Ok(Secret::new(
                    value.expose_secret().replace("\\n", "\n").into_bytes(),
                ))
            }
            Err(std::env::VarError::NotPresent) => Err(SecretError::unavailable(format!(
                "{} (variable {})",
                identifier, name
            ))),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::malformed(format!(
                "{} (variable {} is not valid unicode)",
                identifier, name
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "env"
    }
}

/// 内存中的密钥后端（嵌入调用方或测试使用）
#[derive(Default)]
pub struct StaticSecretBackend {
    secrets: HashMap<String, SecretVec<u8>>,
    denied: Vec<String>,
}

impl StaticSecretBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, identifier: impl Into<String>, material: impl Into<Vec<u8>>) -> Self {
        self.secrets
            .insert(identifier.into(), Secret::new(material.into()));
        self
    }

    /// 标记某个标识为无权访问
    pub fn with_denied(mut self, identifier: impl Into<String>) -> Self {
        self.denied.push(identifier.into());
        self
    }
}

#[async_trait]
impl SecretBackend for StaticSecretBackend {
    async fn fetch(&self, identifier: &str) -> Result<SecretVec<u8>, SecretError> {
        if self.denied.iter().any(|d| d == identifier) {
            return Err(SecretError::access_denied(identifier));
        }
        self.secrets
            .get(identifier)
            .map(|s| Secret::new(s.expose_secret().clone()))
            .ok_or_else(|| SecretError::unavailable(identifier))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
