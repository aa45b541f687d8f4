//! 凭据解析
//!
//! [`CredentialStore`] 把凭据标识解析为私钥材料，并在本次运行内缓存。
//! 同一标识的并发解析只会触发一次后端读取（single-flight），
//! 解析结果（包括失败）在运行期间保持不变。

pub mod backend;

pub use backend::{
    backend_from_config, DirectorySecretBackend, EnvSecretBackend, SecretBackend,
    StaticSecretBackend,
};

use dashmap::DashMap;
use russh_keys::key::KeyPair;
use secrecy::{ExposeSecret, SecretVec};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::SecretError;

/// 已解析的凭据
///
/// 密钥材料只存在于内存中，释放时清零；`Debug` 输出不包含材料本身。
#[derive(Clone)]
pub struct Credential {
    identifier: Arc<str>,
    material: Arc<SecretVec<u8>>,
}

impl Credential {
    pub fn new(identifier: impl Into<Arc<str>>, material: SecretVec<u8>) -> Self {
        Self {
            identifier: identifier.into(),
            material: Arc::new(material),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// 解码为 SSH 密钥对，调用方在握手完成后即应释放
    pub fn key_pair(&self) -> Result<KeyPair, SecretError> {
        let text = std::str::from_utf8(self.material.expose_secret()).map_err(|_| {
            SecretError::malformed(format!("{}: key material is not valid UTF-8", self.identifier))
        })?;

        russh_keys::decode_secret_key(text, None)
            .map_err(|e| SecretError::malformed(format!("{}: {}", self.identifier, e)))
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("identifier", &self.identifier)
            .field("material", &"[REDACTED]")
            .finish()
    }
}

type CacheSlot = Arc<OnceCell<Result<Credential, SecretError>>>;

/// 带 single-flight 缓存的凭据仓库
pub struct CredentialStore {
    backend: Arc<dyn SecretBackend>,
    cache: DashMap<String, CacheSlot>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        Self {
            backend,
            cache: DashMap::new(),
        }
    }

    /// 解析凭据
    pub async fn resolve(&self, identifier: &str) -> Result<Credential, SecretError> {
        let slot = self
            .cache
            .entry(identifier.to_string())
            .or_default()
            .value()
            .clone();

        slot.get_or_init(|| self.fetch(identifier)).await.clone()
    }

    /// 已解析的结果（不触发后端读取）
    pub fn cached(&self, identifier: &str) -> Option<Result<Credential, SecretError>> {
        self.cache
            .get(identifier)
            .and_then(|slot| slot.get().cloned())
    }

    /// 并发预取一组凭据，返回成功数量
    pub async fn prefetch(&self, identifiers: &[String]) -> usize {
        let outcomes =
            futures::future::join_all(identifiers.iter().map(|id| self.resolve(id))).await;
        outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    async fn fetch(&self, identifier: &str) -> Result<Credential, SecretError> {
        debug!(
            identifier = %identifier,
            backend = self.backend.name(),
            "Fetching credential"
        );
        metrics::counter!("fleet_secret_fetches_total", "backend" => self.backend.name())
            .increment(1);

        let material = self.backend.fetch(identifier).await.map_err(|e| {
            warn!(identifier = %identifier, error = %e, "Credential fetch failed");
            e
        })?;

        let credential = Credential::new(identifier, material);
        // 只校验能否解码，解码出的密钥立即释放
        credential.key_pair().map_err(|e| {
            warn!(identifier = %identifier, error = %e, "Credential is not a usable private key");
            e
        })?;

        info!(identifier = %identifier, "Credential resolved");
        Ok(credential)
    }
}
