//! 测试公共模块
//! 提供内存中的隧道、执行器与密钥后端替身

#![allow(dead_code)]

use async_trait::async_trait;
use bastion_fleet::{
    credentials::{Credential, CredentialStore, SecretBackend, StaticSecretBackend},
    error::{HostError, RunError, SecretError},
    fleet::{FleetOptions, FleetRunner},
    models::{CommandSpec, ExecutionResult, HostDescriptor, Inventory},
    ssh::{CommandRunner, RelayChannel, RelayWatch, Tunnel, TunnelConnector},
};
use secrecy::SecretVec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_KEY: &str = include_str!("../fixtures/id_ed25519_test");
pub const OTHER_KEY: &str = include_str!("../fixtures/id_ed25519_other");

/// 构建清单：堡垒机加上给定角色，凭据标识为 `<role>-key`
pub fn inventory(roles: &[&str]) -> Inventory {
    let mut hosts = vec![HostDescriptor::new("bastion", "203.0.113.10", "bastion-key")];
    for (i, role) in roles.iter().enumerate() {
        hosts.push(HostDescriptor::new(
            *role,
            format!("10.0.1.{}", 10 + i),
            format!("{}-key", role),
        ));
    }
    Inventory::new(hosts, "bastion").expect("valid inventory")
}

/// 为清单中所有凭据提供合法密钥，`missing` 中的标识除外
pub fn backend_for(inventory: &Inventory, missing: &[&str]) -> StaticSecretBackend {
    inventory
        .credential_ids()
        .into_iter()
        .filter(|id| !missing.contains(&id.as_str()))
        .fold(StaticSecretBackend::new(), |backend, id| {
            backend.with_secret(id, TEST_KEY)
        })
}

/// 统计调用次数并可注入延迟的后端
pub struct CountingBackend {
    inner: StaticSecretBackend,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl CountingBackend {
    pub fn new(inner: StaticSecretBackend, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl SecretBackend for CountingBackend {
    async fn fetch(&self, identifier: &str) -> Result<SecretVec<u8>, SecretError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.fetch(identifier).await
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

/// 内存隧道
#[derive(Default)]
pub struct MockTunnel {
    /// 堡垒机拒绝转发的角色
    refused: HashSet<String>,
    /// 成功打开这么多通道后会话断开
    lose_after: Option<usize>,
    opened: AtomicUsize,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    watches: Mutex<HashMap<String, RelayWatch>>,
}

impl MockTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing(mut self, role: &str) -> Self {
        self.refused.insert(role.to_string());
        self
    }

    pub fn losing_after(mut self, relays: usize) -> Self {
        self.lose_after = Some(relays);
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn watch(&self, role: &str) -> Option<RelayWatch> {
        self.watches.lock().unwrap().get(role).cloned()
    }
}

#[async_trait]
impl Tunnel for MockTunnel {
    async fn relay(&self, target: &HostDescriptor) -> Result<RelayChannel, HostError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HostError::channel_closed("bastion session is closed"));
        }
        if self.refused.contains(&target.role) {
            return Err(HostError::relay_refused(format!(
                "{}: connection refused",
                target.endpoint()
            )));
        }
        if let Some(limit) = self.lose_after {
            if self.opened.load(Ordering::SeqCst) >= limit {
                self.closed.store(true, Ordering::SeqCst);
                return Err(HostError::channel_closed("bastion session lost"));
            }
        }

        let id = self.opened.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let (near, _far) = tokio::io::duplex(1024);
        let channel = RelayChannel::new(id, target.endpoint(), near);
        self.watches
            .lock()
            .unwrap()
            .insert(target.role.clone(), channel.watch());
        Ok(channel)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// 内存连接器；`reject` 时模拟堡垒机拒绝公钥
pub struct MockConnector {
    tunnel: Arc<MockTunnel>,
    reject: bool,
    connects: AtomicUsize,
    credential: Mutex<Option<String>>,
}

impl MockConnector {
    pub fn new(tunnel: Arc<MockTunnel>) -> Self {
        Self {
            tunnel,
            reject: false,
            connects: AtomicUsize::new(0),
            credential: Mutex::new(None),
        }
    }

    pub fn rejecting(tunnel: Arc<MockTunnel>) -> Self {
        Self {
            reject: true,
            ..Self::new(tunnel)
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn credential_used(&self) -> Option<String> {
        self.credential.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunnelConnector for MockConnector {
    async fn connect(
        &self,
        bastion: &HostDescriptor,
        credential: &Credential,
    ) -> Result<Arc<dyn Tunnel>, RunError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.credential.lock().unwrap() = Some(credential.identifier().to_string());

        if self.reject {
            return Err(RunError::auth_failed(format!(
                "public key for ubuntu@{} rejected",
                bastion.endpoint()
            )));
        }
        Ok(self.tunnel.clone())
    }
}

/// 执行器替身的行为
#[derive(Debug, Clone)]
pub enum Behavior {
    /// 退出码 0，输出给定内容
    Echo(String),
    /// 以给定退出码结束，输出写到 stderr
    Exit(u32, String),
    /// 运行一段时间后成功
    Sleep(Duration),
    /// 一直不结束，直到调用方超时
    Hang,
    Panic,
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockRunner {
    default: Behavior,
    overrides: HashMap<String, Behavior>,
    calls: AtomicUsize,
    active: Arc<AtomicUsize>,
    max_active: AtomicUsize,
    credentials: Mutex<Vec<(String, String)>>,
}

impl MockRunner {
    pub fn new(default: Behavior) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
            calls: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: AtomicUsize::new(0),
            credentials: Mutex::new(Vec::new()),
        }
    }

    pub fn echo_ok() -> Self {
        Self::new(Behavior::Echo("ok\n".to_string()))
    }

    pub fn with(mut self, role: &str, behavior: Behavior) -> Self {
        self.overrides.insert(role.to_string(), behavior);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// (角色, 使用的凭据标识)
    pub fn credentials(&self) -> Vec<(String, String)> {
        self.credentials.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(
        &self,
        channel: RelayChannel,
        target: &HostDescriptor,
        credential: Credential,
        _command: &CommandSpec,
        timeout: Duration,
    ) -> ExecutionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.credentials
            .lock()
            .unwrap()
            .push((target.role.clone(), credential.identifier().to_string()));

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let _active = ActiveGuard(self.active.clone());

        let behavior = self
            .overrides
            .get(&target.role)
            .cloned()
            .unwrap_or_else(|| self.default.clone());

        let result = match behavior {
            Behavior::Echo(out) => {
                ExecutionResult::completed(&target.role, 0, out.into_bytes(), Vec::new(), 0.01)
            }
            Behavior::Exit(code, err) => {
                ExecutionResult::completed(&target.role, code, Vec::new(), err.into_bytes(), 0.01)
            }
            Behavior::Sleep(d) => {
                tokio::time::sleep(d).await;
                ExecutionResult::completed(&target.role, 0, b"done\n".to_vec(), Vec::new(), d.as_secs_f64())
            }
            Behavior::Hang => {
                tokio::time::sleep(timeout).await;
                ExecutionResult::failed(
                    &target.role,
                    HostError::timeout("command exceeded the timeout"),
                    timeout.as_secs_f64(),
                )
            }
            Behavior::Panic => panic!("runner exploded on {}", target.role),
        };

        drop(channel);
        result
    }
}

/// 组装 FleetRunner
pub fn fleet_runner(
    backend: impl SecretBackend + 'static,
    connector: Arc<MockConnector>,
    runner: Arc<MockRunner>,
    options: FleetOptions,
) -> FleetRunner {
    FleetRunner::new(
        Arc::new(CredentialStore::new(Arc::new(backend))),
        connector,
        runner,
        options,
    )
}

pub fn options(concurrency_limit: usize) -> FleetOptions {
    FleetOptions {
        concurrency_limit,
        run_deadline: None,
    }
}
