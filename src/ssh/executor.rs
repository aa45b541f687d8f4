//! 远程命令执行
//!
//! 在中继通道上与目标主机做第二跳 SSH 握手（使用目标自己的凭据），
//! 执行命令并分别采集 stdout / stderr / 退出码。

use async_trait::async_trait;
use russh::{client, ChannelMsg};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::SshSettings;
use crate::credentials::Credential;
use crate::error::HostError;
use crate::models::{CommandSpec, ExecutionResult, HostDescriptor};
use crate::ssh::host_key::{HostKeyVerifier, VerifyingHandler};
use crate::ssh::tunnel::{RelayChannel, RelayIo};

/// 断开第二跳会话时最多等待的时间
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// 在一条中继通道上执行命令（对 FleetRunner 的抽象）
///
/// 实现不返回错误：任何失败都转换成带 `error` 的 [`ExecutionResult`]。
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        channel: RelayChannel,
        target: &HostDescriptor,
        credential: Credential,
        command: &CommandSpec,
        timeout: Duration,
    ) -> ExecutionResult;
}

/// 命令通道上的消息来源
#[async_trait]
pub trait ExecChannel: Send {
    /// 下一条消息；通道结束时返回 `None`
    async fn next_message(&mut self) -> Option<ChannelMsg>;

    /// 强制关闭通道
    async fn shutdown(&mut self);
}

#[async_trait]
impl ExecChannel for russh::Channel<client::Msg> {
    async fn next_message(&mut self) -> Option<ChannelMsg> {
        self.wait().await
    }

    async fn shutdown(&mut self) {
        let _ = self.close().await;
    }
}

/// 采集到的命令输出
#[derive(Debug, Default)]
pub struct CapturedOutput {
    pub exit_status: Option<u32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub error: Option<HostError>,
}

/// 读取通道直到命令结束或截止时间到达
///
/// 超时时强制关闭通道，并且不记录退出码；通道在收到退出码前结束视为中继断开。
pub async fn collect_output<C>(channel: &mut C, deadline: Instant) -> CapturedOutput
where
    C: ExecChannel + ?Sized,
{
    let mut output = CapturedOutput::default();
    let mut eof = false;
    let mut signal = None;

    loop {
        let msg = match timeout_at(deadline, channel.next_message()).await {
            Ok(msg) => msg,
            Err(_) => {
                warn!("Command timed out, closing channel");
                channel.shutdown().await;
                output.exit_status = None;
                output.error = Some(HostError::timeout("command exceeded the timeout"));
                return output;
            }
        };

        match msg {
            Some(ChannelMsg::Data { ref data }) => {
                output.stdout.extend_from_slice(data);
            }
            Some(ChannelMsg::ExtendedData { ref data, ext }) => {
                // SSH_EXTENDED_DATA_STDERR
                if ext == 1 {
                    output.stderr.extend_from_slice(data);
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                output.exit_status = Some(exit_status);
                if eof {
                    break;
                }
            }
            Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                signal = Some(format!("{:?}", signal_name));
            }
            Some(ChannelMsg::Eof) => {
                eof = true;
                if output.exit_status.is_some() {
                    break;
                }
            }
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    if output.exit_status.is_none() {
        let reason = match signal {
            Some(sig) => format!("command terminated by signal {}", sig),
            None => "channel closed before the command finished".to_string(),
        };
        output.error = Some(HostError::channel_closed(reason));
    }

    output
}

/// 基于 russh 的远程执行器
pub struct RemoteExecutor {
    settings: SshSettings,
    verifier: HostKeyVerifier,
}

impl RemoteExecutor {
    pub fn new(settings: SshSettings, verifier: HostKeyVerifier) -> Self {
        Self { settings, verifier }
    }

    fn client_config(&self) -> Arc<client::Config> {
        Arc::new(client::Config::default())
    }

    /// 第二跳握手与认证；凭据在认证结束后释放
    async fn handshake(
        &self,
        stream: Box<dyn RelayIo>,
        target: &HostDescriptor,
        credential: Credential,
    ) -> Result<client::Handle<VerifyingHandler>, HostError> {
        let endpoint = target.endpoint();
        let username = target
            .username
            .clone()
            .unwrap_or_else(|| self.settings.username.clone());

        let (handler, rejected) = VerifyingHandler::new(self.verifier.clone(), endpoint.clone());

        let mut handle = client::connect_stream(self.client_config(), stream, handler)
            .await
            .map_err(|e| {
                if rejected.load(Ordering::SeqCst) {
                    HostError::auth_failed(format!("host key for {} rejected", endpoint))
                } else {
                    error!(host = %endpoint, error = %e, "Target SSH handshake failed");
                    HostError::channel_closed(format!("handshake with {} failed: {}", endpoint, e))
                }
            })?;

        let key = Arc::new(credential.key_pair()?);
        drop(credential);

        let authenticated = handle
            .authenticate_publickey(username.clone(), key)
            .await
            .map_err(|e| {
                HostError::channel_closed(format!("authentication with {} failed: {}", endpoint, e))
            })?;

        if !authenticated {
            error!(host = %endpoint, user = %username, "Target rejected public key");
            return Err(HostError::auth_failed(format!(
                "public key for {}@{} rejected",
                username, endpoint
            )));
        }

        debug!(host = %endpoint, user = %username, "Target session authenticated");
        Ok(handle)
    }

    async fn exec(
        &self,
        handle: &client::Handle<VerifyingHandler>,
        command: &CommandSpec,
        deadline: Instant,
    ) -> CapturedOutput {
        let opened = timeout_at(deadline, async {
            let channel = handle.channel_open_session().await?;
            channel.exec(true, command.render()).await?;
            Ok::<_, russh::Error>(channel)
        })
        .await;

        let mut channel = match opened {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                return CapturedOutput {
                    error: Some(HostError::channel_closed(format!("exec failed: {}", e))),
                    ..Default::default()
                }
            }
            Err(_) => {
                return CapturedOutput {
                    error: Some(HostError::timeout("command exceeded the timeout")),
                    ..Default::default()
                }
            }
        };

        collect_output(&mut channel, deadline).await
    }
}

#[async_trait]
impl CommandRunner for RemoteExecutor {
    async fn run(
        &self,
        channel: RelayChannel,
        target: &HostDescriptor,
        credential: Credential,
        command: &CommandSpec,
        limit: Duration,
    ) -> ExecutionResult {
        let started = Instant::now();
        let deadline = started + limit;
        let relay_id = channel.id();
        let (stream, guard) = channel.into_parts();

        debug!(
            role = %target.role,
            relay_id = relay_id,
            command = %command.command,
            "Executing remote command"
        );

        let handle = match timeout_at(deadline, self.handshake(stream, target, credential)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                drop(guard);
                return ExecutionResult::failed(&target.role, e, started.elapsed().as_secs_f64());
            }
            Err(_) => {
                drop(guard);
                return ExecutionResult::failed(
                    &target.role,
                    HostError::timeout("handshake exceeded the command timeout"),
                    started.elapsed().as_secs_f64(),
                );
            }
        };

        let mut captured = self.exec(&handle, command, deadline).await;

        let _ = timeout(
            DISCONNECT_GRACE,
            handle.disconnect(russh::Disconnect::ByApplication, "", ""),
        )
        .await;
        drop(handle);

        // 执行期间堡垒机会话断开：中继通道已失效
        if guard.is_closed() && captured.exit_status.is_none() && captured.error.is_none() {
            captured.error = Some(HostError::channel_closed("bastion session closed"));
        }
        drop(guard);

        let duration_secs = started.elapsed().as_secs_f64();
        metrics::histogram!("fleet_command_duration_seconds").record(duration_secs);

        info!(
            role = %target.role,
            exit_status = ?captured.exit_status,
            duration_secs = duration_secs,
            stdout_len = captured.stdout.len(),
            stderr_len = captured.stderr.len(),
            error = ?captured.error.as_ref().map(|e| e.kind),
            "Command finished"
        );

        match captured.error {
            Some(error) => ExecutionResult::failed(&target.role, error, duration_secs)
                .with_partial_output(captured.stdout, captured.stderr),
            None => ExecutionResult::completed(
                &target.role,
                captured.exit_status.unwrap_or_default(),
                captured.stdout,
                captured.stderr,
                duration_secs,
            ),
        }
    }
}
