//! 主机密钥验证策略

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use russh::client;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::SshSettings;

/// 主机密钥验证策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// 首次连接时记录指纹，之后必须一致
    #[default]
    TrustOnFirstUse,
    /// 只接受预先登记的指纹
    Pinned,
    /// 不验证（不安全，仅用于隔离的测试环境）
    Skip,
}

impl std::str::FromStr for HostKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trust_on_first_use" | "tofu" | "accept" => Ok(Self::TrustOnFirstUse),
            "pinned" | "strict" => Ok(Self::Pinned),
            "skip" | "disabled" | "none" => Ok(Self::Skip),
            _ => Err(format!("Unknown host key policy: {}", s)),
        }
    }
}

/// OpenSSH 格式的指纹：`SHA256:<base64 无填充>`
pub fn fingerprint_of(key_blob: &[u8]) -> String {
    let digest = Sha256::digest(key_blob);
    format!("SHA256:{}", general_purpose::STANDARD_NO_PAD.encode(digest))
}

pub fn fingerprint(key: &PublicKey) -> String {
    fingerprint_of(&key.public_key_bytes())
}

/// 按策略校验主机指纹；在同一次运行的所有会话间共享
#[derive(Debug, Clone)]
pub struct HostKeyVerifier {
    policy: HostKeyPolicy,
    known: Arc<DashMap<String, String>>,
}

impl HostKeyVerifier {
    pub fn new(policy: HostKeyPolicy) -> Self {
        Self {
            policy,
            known: Arc::new(DashMap::new()),
        }
    }

    pub fn with_known_hosts(self, hosts: HashMap<String, String>) -> Self {
        for (endpoint, fingerprint) in hosts {
            self.known.insert(endpoint, fingerprint);
        }
        self
    }

    /// 由 SSH 配置构建：策略、预置指纹与 known_hosts 文件
    pub fn from_settings(settings: &SshSettings) -> Result<Self, config::ConfigError> {
        let verifier = Self::new(settings.policy()?).with_known_hosts(settings.known_hosts.clone());

        if let Some(path) = &settings.known_hosts_file {
            let loaded = verifier.load_known_hosts_file(path).map_err(|e| {
                config::ConfigError::Message(format!("Failed to read known hosts {}: {}", path, e))
            })?;
            debug!(path = %path, entries = loaded, "Known hosts loaded");
        }

        Ok(verifier)
    }

    /// 读取 `host:port SHA256:...` 格式的文件，`#` 开头为注释
    pub fn load_known_hosts_file(&self, path: impl AsRef<Path>) -> std::io::Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let mut loaded = 0;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            if let (Some(endpoint), Some(fingerprint)) = (parts.next(), parts.next()) {
                self.known.insert(endpoint.to_string(), fingerprint.to_string());
                loaded += 1;
            }
        }

        Ok(loaded)
    }

    pub fn policy(&self) -> HostKeyPolicy {
        self.policy
    }

    pub fn known_fingerprint(&self, endpoint: &str) -> Option<String> {
        self.known.get(endpoint).map(|f| f.value().clone())
    }

    /// 校验指纹，返回是否接受
    pub fn verify(&self, endpoint: &str, fingerprint: &str) -> bool {
        match self.policy {
            HostKeyPolicy::Skip => {
                warn!(
                    host = %endpoint,
                    fingerprint = %fingerprint,
                    "Host key verification skipped - accepting key"
                );
                true
            }
            HostKeyPolicy::TrustOnFirstUse => match self.known.entry(endpoint.to_string()) {
                Entry::Occupied(entry) => self.compare(endpoint, entry.get(), fingerprint),
                Entry::Vacant(entry) => {
                    info!(
                        host = %endpoint,
                        fingerprint = %fingerprint,
                        "First time connecting - recording host key"
                    );
                    entry.insert(fingerprint.to_string());
                    true
                }
            },
            HostKeyPolicy::Pinned => match self.known.get(endpoint) {
                Some(expected) => self.compare(endpoint, expected.value(), fingerprint),
                None => {
                    error!(host = %endpoint, "Unknown host with pinned policy - rejecting");
                    false
                }
            },
        }
    }

    fn compare(&self, endpoint: &str, expected: &str, actual: &str) -> bool {
        if expected == actual {
            debug!(host = %endpoint, "Host key verified");
            true
        } else {
            error!(
                host = %endpoint,
                expected = %expected,
                actual = %actual,
                "Host key mismatch - rejecting connection"
            );
            false
        }
    }
}

/// russh 会话处理器，把服务端密钥交给 [`HostKeyVerifier`]
///
/// 拒绝时置位 `rejected`，调用方据此区分“密钥被拒”与传输错误。
pub(crate) struct VerifyingHandler {
    verifier: HostKeyVerifier,
    endpoint: String,
    rejected: Arc<AtomicBool>,
}

impl VerifyingHandler {
    pub(crate) fn new(verifier: HostKeyVerifier, endpoint: String) -> (Self, Arc<AtomicBool>) {
        let rejected = Arc::new(AtomicBool::new(false));
        (
            Self {
                verifier,
                endpoint,
                rejected: rejected.clone(),
            },
            rejected,
        )
    }
}

#[async_trait]
impl client::Handler for VerifyingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let accepted = self
            .verifier
            .verify(&self.endpoint, &fingerprint(server_public_key));
        if !accepted {
            self.rejected.store(true, Ordering::SeqCst);
        }
        Ok(accepted)
    }
}
