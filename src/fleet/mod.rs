//! 批量执行
//!
//! [`FleetRunner`] 在堡垒机会话建立后，为每台目标主机启动一个任务，
//! 通过信号量限制并发；单台主机的任何失败都只体现在它自己的执行结果中。

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{AppConfig, FleetConfig};
use crate::credentials::{backend_from_config, CredentialStore};
use crate::error::{ErrorKind, HostError, RunError};
use crate::models::{CommandSpec, ExecutionResult, FleetReport, HostDescriptor, Inventory};
use crate::ssh::{CommandRunner, HostKeyVerifier, RemoteExecutor, Tunnel, TunnelConnector, TunnelManager};

/// 批量执行参数
#[derive(Debug, Clone)]
pub struct FleetOptions {
    /// 同时执行的主机上限
    pub concurrency_limit: usize,
    /// 整次运行的截止时间
    pub run_deadline: Option<Duration>,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 10,
            run_deadline: None,
        }
    }
}

impl From<&FleetConfig> for FleetOptions {
    fn from(config: &FleetConfig) -> Self {
        Self {
            concurrency_limit: config.concurrency_limit.max(1),
            run_deadline: config.run_deadline(),
        }
    }
}

/// 单台主机任务需要的共享上下文
#[derive(Clone)]
struct HostContext {
    store: Arc<CredentialStore>,
    tunnel: Arc<dyn Tunnel>,
    runner: Arc<dyn CommandRunner>,
    semaphore: Arc<Semaphore>,
    command: Arc<CommandSpec>,
    timeout: Duration,
}

pub struct FleetRunner {
    store: Arc<CredentialStore>,
    connector: Arc<dyn TunnelConnector>,
    runner: Arc<dyn CommandRunner>,
    options: FleetOptions,
    shutdown: CancellationToken,
}

impl FleetRunner {
    pub fn new(
        store: Arc<CredentialStore>,
        connector: Arc<dyn TunnelConnector>,
        runner: Arc<dyn CommandRunner>,
        options: FleetOptions,
    ) -> Self {
        Self {
            store,
            connector,
            runner,
            options,
            shutdown: CancellationToken::new(),
        }
    }

    /// 按配置组装 russh 实现
    pub fn from_config(config: &AppConfig) -> Result<Self, config::ConfigError> {
        let verifier = HostKeyVerifier::from_settings(&config.ssh)?;
        let store = Arc::new(CredentialStore::new(backend_from_config(&config.secrets)));
        let connector = Arc::new(TunnelManager::new(config.ssh.clone(), verifier.clone()));
        let runner = Arc::new(RemoteExecutor::new(config.ssh.clone(), verifier));

        Ok(Self::new(
            store,
            connector,
            runner,
            FleetOptions::from(&config.fleet),
        ))
    }

    /// 取消令牌；取消后未完成的主机按超时处理
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 在清单中的所有目标主机上执行命令
    ///
    /// 只有堡垒机相关的失败和非法输入会返回 `Err`；其余失败都记录在报告里。
    /// 截止时间从调用开始计算，覆盖凭据读取与堡垒机连接阶段。
    pub async fn execute(
        &self,
        inventory: &Inventory,
        command: &CommandSpec,
        timeout: Duration,
    ) -> Result<FleetReport, RunError> {
        command.validate().map_err(RunError::InvalidCommand)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();

        let cancel = self.shutdown.child_token();
        let deadline = DeadlineTimer::arm(self.options.run_deadline, cancel.clone());

        info!(
            run_id = %run_id,
            bastion = %inventory.bastion().endpoint(),
            targets = inventory.target_count(),
            concurrency_limit = self.options.concurrency_limit,
            "Fleet run started"
        );

        let tunnel = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            connected = self.connect_bastion(run_id, inventory) => Some(connected?),
        };

        let Some(tunnel) = tunnel else {
            warn!(run_id = %run_id, "Run cancelled before the bastion session was ready");
            let mut report = FleetReport::new(run_id, inventory.bastion_role(), started_at);
            let elapsed = started.elapsed().as_secs_f64();
            for target in inventory.targets() {
                let result = ExecutionResult::failed(
                    &target.role,
                    HostError::timeout(deadline.reason()),
                    elapsed,
                );
                metrics::counter!("fleet_host_results_total", "kind" => result_label(&result))
                    .increment(1);
                report.insert(result);
            }
            report.deadline_exceeded = deadline.fired();
            report.finished_at = Utc::now();
            return Ok(report);
        };

        let ctx = HostContext {
            store: self.store.clone(),
            tunnel: tunnel.clone(),
            runner: self.runner.clone(),
            semaphore: Arc::new(Semaphore::new(self.options.concurrency_limit.max(1))),
            command: Arc::new(command.clone()),
            timeout,
        };

        let mut handles = Vec::with_capacity(inventory.target_count());
        for target in inventory.targets() {
            let target = target.clone();
            let role = target.role.clone();
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            let fired = deadline.flag();
            let span = info_span!("host", run_id = %run_id, role = %role);

            let handle = tokio::spawn(
                async move {
                    let started = Instant::now();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            warn!("Run cancelled before host finished");
                            ExecutionResult::failed(
                                &target.role,
                                HostError::timeout(cancel_reason(&fired)),
                                started.elapsed().as_secs_f64(),
                            )
                        }
                        result = run_host(&ctx, &target) => result,
                    }
                }
                .instrument(span),
            );
            handles.push((role, handle));
        }

        let mut report = FleetReport::new(run_id, inventory.bastion_role(), started_at);

        for (role, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(run_id = %run_id, role = %role, error = %e, "Host task aborted");
                    ExecutionResult::failed(
                        &role,
                        HostError::new(ErrorKind::TaskAborted, format!("task aborted: {}", e)),
                        0.0,
                    )
                }
            };

            metrics::counter!("fleet_host_results_total", "kind" => result_label(&result))
                .increment(1);

            if !report.insert(result) {
                warn!(run_id = %run_id, role = %role, "Duplicate result ignored");
            }
        }

        report.deadline_exceeded = deadline.fired();
        drop(deadline);
        report.bastion_lost = tunnel.is_closed();

        tunnel.close().await;
        report.finished_at = Utc::now();

        let summary = report.summary();
        info!(
            run_id = %run_id,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            errored = summary.errored,
            deadline_exceeded = report.deadline_exceeded,
            bastion_lost = report.bastion_lost,
            duration_secs = started.elapsed().as_secs_f64(),
            "Fleet run finished"
        );

        Ok(report)
    }

    /// 预取凭据并建立堡垒机会话
    async fn connect_bastion(
        &self,
        run_id: Uuid,
        inventory: &Inventory,
    ) -> Result<Arc<dyn Tunnel>, RunError> {
        let bastion = inventory.bastion();

        let ids = inventory.credential_ids();
        let resolved = self.store.prefetch(&ids).await;
        debug!(run_id = %run_id, resolved = resolved, requested = ids.len(), "Credentials prefetched");

        let credential = self.store.resolve(&bastion.credential_id).await.map_err(|e| {
            error!(run_id = %run_id, error = %e, "Bastion credential unavailable");
            RunError::from(e)
        })?;

        self.connector
            .connect(bastion, &credential)
            .await
            .map_err(|e| {
                error!(run_id = %run_id, error = %e, "Bastion connection failed");
                e
            })
    }
}

/// 整次运行的截止计时器；释放时停止计时
struct DeadlineTimer {
    fired: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl DeadlineTimer {
    fn arm(limit: Option<Duration>, cancel: CancellationToken) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let task = limit.map(|limit| {
            let fired = fired.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                fired.store(true, Ordering::SeqCst);
                cancel.cancel();
            })
        });
        Self { fired, task }
    }

    fn flag(&self) -> Arc<AtomicBool> {
        self.fired.clone()
    }

    fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    fn reason(&self) -> &'static str {
        cancel_reason(&self.fired)
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn cancel_reason(fired: &AtomicBool) -> &'static str {
    if fired.load(Ordering::SeqCst) {
        "run deadline exceeded"
    } else {
        "run cancelled"
    }
}

/// 单台主机：凭据 -> 中继通道 -> 远程执行
async fn run_host(ctx: &HostContext, target: &HostDescriptor) -> ExecutionResult {
    let _permit = match ctx.semaphore.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return ExecutionResult::failed(
                &target.role,
                HostError::new(ErrorKind::TaskAborted, "concurrency limiter closed"),
                0.0,
            )
        }
    };
    let started = Instant::now();

    if ctx.tunnel.is_closed() {
        return ExecutionResult::failed(
            &target.role,
            HostError::channel_closed("bastion session closed before host was attempted"),
            0.0,
        );
    }

    let credential = match ctx.store.resolve(&target.credential_id).await {
        Ok(credential) => credential,
        Err(e) => {
            warn!(credential_id = %target.credential_id, error = %e, "Target credential unavailable");
            return ExecutionResult::failed(
                &target.role,
                HostError::from(e),
                started.elapsed().as_secs_f64(),
            );
        }
    };

    let channel = match ctx.tunnel.relay(target).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(target = %target.endpoint(), error = %e, "Relay channel not opened");
            return ExecutionResult::failed(&target.role, e, started.elapsed().as_secs_f64());
        }
    };

    ctx.runner
        .run(channel, target, credential, &ctx.command, ctx.timeout)
        .await
}

fn result_label(result: &ExecutionResult) -> &'static str {
    match (result.error_kind(), result.exit_status) {
        (Some(kind), _) => kind.as_str(),
        (None, Some(0)) => "success",
        (None, _) => "nonzero_exit",
    }
}
