//! 堡垒机隧道
//!
//! [`TunnelManager`] 建立唯一一条到堡垒机的 SSH 会话（[`BastionSession`]），
//! 之后每台目标主机通过 `direct-tcpip` 通道复用这条连接。
//! 通道 ID 由 russh 会话任务串行分配，中继登记表使用并发 map，
//! 打开或关闭一个通道不会阻塞其他通道。

use async_trait::async_trait;
use dashmap::DashMap;
use russh::client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::SshSettings;
use crate::credentials::Credential;
use crate::error::{HostError, RunError};
use crate::models::HostDescriptor;
use crate::ssh::host_key::{HostKeyVerifier, VerifyingHandler};

/// 中继字节流需要满足的能力
pub trait RelayIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> RelayIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

type RelayRegistry = Arc<DashMap<u64, Arc<RelayState>>>;

#[derive(Debug, Default)]
struct RelayState {
    closed: AtomicBool,
}

impl RelayState {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// 观察中继通道是否已关闭
#[derive(Debug, Clone)]
pub struct RelayWatch {
    state: Arc<RelayState>,
}

impl RelayWatch {
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

/// 通道的生命周期守卫，释放时标记通道关闭并从会话登记表中移除
#[derive(Debug)]
pub struct RelayGuard {
    id: u64,
    state: Arc<RelayState>,
    registry: Option<RelayRegistry>,
}

impl RelayGuard {
    pub fn watch(&self) -> RelayWatch {
        RelayWatch {
            state: self.state.clone(),
        }
    }

    /// 会话已失效（堡垒机断开）
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.state.close();
        if let Some(registry) = &self.registry {
            registry.remove(&self.id);
        }
    }
}

/// 经堡垒机复用的、指向单台目标主机的字节流
pub struct RelayChannel {
    target: String,
    stream: Box<dyn RelayIo>,
    guard: RelayGuard,
}

impl RelayChannel {
    /// 不隶属任何会话登记表的通道
    pub fn new(id: u64, target: impl Into<String>, stream: impl RelayIo) -> Self {
        Self {
            target: target.into(),
            stream: Box::new(stream),
            guard: RelayGuard {
                id,
                state: Arc::new(RelayState::default()),
                registry: None,
            },
        }
    }

    fn registered(
        id: u64,
        target: String,
        stream: impl RelayIo,
        registry: &RelayRegistry,
    ) -> Self {
        let state = Arc::new(RelayState::default());
        registry.insert(id, state.clone());
        Self {
            target,
            stream: Box::new(stream),
            guard: RelayGuard {
                id,
                state,
                registry: Some(registry.clone()),
            },
        }
    }

    pub fn id(&self) -> u64 {
        self.guard.id
    }

    /// `host:port`
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn watch(&self) -> RelayWatch {
        self.guard.watch()
    }

    /// 拆出字节流与守卫；守卫释放即视为通道关闭
    pub fn into_parts(self) -> (Box<dyn RelayIo>, RelayGuard) {
        (self.stream, self.guard)
    }
}

impl std::fmt::Debug for RelayChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayChannel")
            .field("id", &self.guard.id)
            .field("target", &self.target)
            .field("closed", &self.guard.is_closed())
            .finish()
    }
}

/// 已认证的堡垒机会话（对 FleetRunner 的抽象）
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// 打开一条到目标主机的中继通道
    async fn relay(&self, target: &HostDescriptor) -> Result<RelayChannel, HostError>;

    fn is_closed(&self) -> bool;

    /// 关闭会话；所有中继通道随之失效
    async fn close(&self);
}

/// 建立堡垒机会话
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn connect(
        &self,
        bastion: &HostDescriptor,
        credential: &Credential,
    ) -> Result<Arc<dyn Tunnel>, RunError>;
}

/// 基于 russh 的隧道管理器
pub struct TunnelManager {
    settings: SshSettings,
    verifier: HostKeyVerifier,
}

impl TunnelManager {
    pub fn new(settings: SshSettings, verifier: HostKeyVerifier) -> Self {
        Self { settings, verifier }
    }

    fn client_config(&self) -> Arc<client::Config> {
        Arc::new(client::Config {
            keepalive_interval: self.settings.keepalive_interval(),
            ..Default::default()
        })
    }

    /// 拨号并认证堡垒机；失败均为运行级致命错误
    pub async fn open_session(
        &self,
        bastion: &HostDescriptor,
        credential: &Credential,
    ) -> Result<BastionSession, RunError> {
        let endpoint = bastion.endpoint();
        let username = bastion
            .username
            .clone()
            .unwrap_or_else(|| self.settings.username.clone());

        debug!(host = %endpoint, user = %username, "Dialing bastion");

        let stream = timeout(
            self.settings.connect_timeout(),
            TcpStream::connect((bastion.address.as_str(), bastion.port)),
        )
        .await
        .map_err(|_| RunError::unreachable(format!("TCP connect to {} timed out", endpoint)))?
        .map_err(|e| {
            error!(host = %endpoint, error = %e, "Bastion TCP connect failed");
            RunError::unreachable(format!("{}: {}", endpoint, e))
        })?;

        let (handler, rejected) = VerifyingHandler::new(self.verifier.clone(), endpoint.clone());

        let mut handle = timeout(
            self.settings.handshake_timeout(),
            client::connect_stream(self.client_config(), stream, handler),
        )
        .await
        .map_err(|_| RunError::unreachable(format!("SSH handshake with {} timed out", endpoint)))?
        .map_err(|e| {
            if rejected.load(Ordering::SeqCst) {
                RunError::auth_failed(format!("host key for {} rejected", endpoint))
            } else {
                error!(host = %endpoint, error = %e, "Bastion SSH handshake failed");
                RunError::unreachable(format!("SSH handshake with {} failed: {}", endpoint, e))
            }
        })?;

        let key = Arc::new(credential.key_pair()?);

        let authenticated = timeout(
            self.settings.handshake_timeout(),
            handle.authenticate_publickey(username.clone(), key),
        )
        .await
        .map_err(|_| RunError::unreachable(format!("authentication with {} timed out", endpoint)))?
        .map_err(|e| RunError::unreachable(format!("authentication with {} failed: {}", endpoint, e)))?;

        if !authenticated {
            error!(host = %endpoint, user = %username, "Bastion rejected public key");
            return Err(RunError::auth_failed(format!(
                "public key for {}@{} rejected",
                username, endpoint
            )));
        }

        info!(host = %endpoint, user = %username, "Bastion session established");

        Ok(BastionSession {
            handle,
            endpoint,
            connect_timeout: self.settings.connect_timeout(),
            next_relay_id: AtomicU64::new(1),
            relays: Arc::new(DashMap::new()),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl TunnelConnector for TunnelManager {
    async fn connect(
        &self,
        bastion: &HostDescriptor,
        credential: &Credential,
    ) -> Result<Arc<dyn Tunnel>, RunError> {
        let session = self.open_session(bastion, credential).await?;
        Ok(Arc::new(session))
    }
}

/// 到堡垒机的唯一会话
pub struct BastionSession {
    handle: client::Handle<VerifyingHandler>,
    endpoint: String,
    connect_timeout: std::time::Duration,
    next_relay_id: AtomicU64,
    relays: RelayRegistry,
    closed: AtomicBool,
}

impl BastionSession {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn open_relay(&self, target: &HostDescriptor) -> Result<RelayChannel, HostError> {
        if self.is_closed() {
            return Err(HostError::channel_closed("bastion session is closed"));
        }

        let endpoint = target.endpoint();
        debug!(bastion = %self.endpoint, target = %endpoint, "Opening relay channel");

        let channel = timeout(
            self.connect_timeout,
            self.handle.channel_open_direct_tcpip(
                target.address.clone(),
                u32::from(target.port),
                "127.0.0.1",
                0,
            ),
        )
        .await
        .map_err(|_| {
            metrics::counter!("fleet_relays_refused_total").increment(1);
            HostError::relay_refused(format!("relay to {} timed out", endpoint))
        })?
        .map_err(|e| {
            if self.is_closed() {
                HostError::channel_closed(format!("bastion session lost: {}", e))
            } else {
                warn!(target = %endpoint, error = %e, "Bastion refused relay");
                metrics::counter!("fleet_relays_refused_total").increment(1);
                HostError::relay_refused(format!("{}: {}", endpoint, e))
            }
        })?;

        let id = self.next_relay_id.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("fleet_relays_opened_total").increment(1);
        debug!(relay_id = id, target = %endpoint, "Relay channel opened");

        Ok(RelayChannel::registered(
            id,
            endpoint,
            channel.into_stream(),
            &self.relays,
        ))
    }

    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for relay in self.relays.iter() {
            relay.value().close();
        }

        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;

        info!(host = %self.endpoint, "Bastion session closed");
    }
}

#[async_trait]
impl Tunnel for BastionSession {
    async fn relay(&self, target: &HostDescriptor) -> Result<RelayChannel, HostError> {
        self.open_relay(target).await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handle.is_closed()
    }

    async fn close(&self) {
        self.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_channel_closes_on_drop() {
        let (near, _far) = tokio::io::duplex(64);
        let channel = RelayChannel::new(7, "10.0.1.10:22", near);
        let watch = channel.watch();

        assert_eq!(channel.id(), 7);
        assert_eq!(channel.target(), "10.0.1.10:22");
        assert!(!watch.is_closed());

        drop(channel);
        assert!(watch.is_closed());
    }

    #[test]
    fn test_relay_guard_controls_lifetime() {
        let (near, _far) = tokio::io::duplex(64);
        let channel = RelayChannel::new(1, "10.0.1.10:22", near);
        let watch = channel.watch();

        let (stream, guard) = channel.into_parts();
        drop(stream);
        assert!(!watch.is_closed());

        drop(guard);
        assert!(watch.is_closed());
    }

    #[test]
    fn test_registered_relay_leaves_registry() {
        let registry: RelayRegistry = Arc::new(DashMap::new());
        let (near, _far) = tokio::io::duplex(64);

        let channel = RelayChannel::registered(3, "10.0.1.20:22".to_string(), near, &registry);
        assert_eq!(registry.len(), 1);

        drop(channel);
        assert!(registry.is_empty());
    }
}
