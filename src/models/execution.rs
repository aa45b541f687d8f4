//! 执行命令与执行结果模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::borrow::Cow;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{ErrorKind, HostError};

/// 下发到每台目标主机的命令（所有主机相同）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Shell 命令
    pub command: String,

    /// 工作目录
    #[serde(default)]
    pub working_dir: Option<String>,

    /// 环境变量覆盖
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// 校验命令与环境变量名
    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("command must not be empty".to_string());
        }
        for key in self.env_vars.keys() {
            if !is_valid_env_key(key) {
                return Err(format!("invalid environment variable name: {}", key));
            }
        }
        Ok(())
    }

    /// 生成远端实际执行的命令行
    pub fn render(&self) -> String {
        let mut line = String::new();

        for (key, value) in &self.env_vars {
            line.push_str(&format!(
                "export {}={}; ",
                key,
                shell_escape::unix::escape(Cow::Borrowed(value.as_str()))
            ));
        }

        if let Some(dir) = &self.working_dir {
            line.push_str(&format!(
                "cd {} && ",
                shell_escape::unix::escape(Cow::Borrowed(dir.as_str()))
            ));
        }

        line.push_str(&self.command);
        line
    }
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn serialize_lossy<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

/// 单台主机的执行结果
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// 主机角色
    pub role: String,

    /// 退出码；超时或通道异常时为空（命令未完成）
    pub exit_status: Option<u32>,

    /// 标准输出
    #[serde(serialize_with = "serialize_lossy")]
    pub stdout: Vec<u8>,

    /// 标准错误
    #[serde(serialize_with = "serialize_lossy")]
    pub stderr: Vec<u8>,

    /// 执行时长（秒）
    pub duration_secs: f64,

    /// 主机级错误
    pub error: Option<HostError>,
}

impl ExecutionResult {
    /// 命令已执行完毕（退出码可能非零）
    pub fn completed(
        role: impl Into<String>,
        exit_status: u32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        duration_secs: f64,
    ) -> Self {
        Self {
            role: role.into(),
            exit_status: Some(exit_status),
            stdout,
            stderr,
            duration_secs,
            error: None,
        }
    }

    /// 命令未能完成
    pub fn failed(role: impl Into<String>, error: HostError, duration_secs: f64) -> Self {
        Self {
            role: role.into(),
            exit_status: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            duration_secs,
            error: Some(error),
        }
    }

    /// 保留已采集的部分输出
    pub fn with_partial_output(mut self, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.exit_status == Some(0)
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn timed_out(&self) -> bool {
        self.error_kind() == Some(ErrorKind::CommandTimeout)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// 报告统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub total: usize,
    /// 退出码为 0
    pub succeeded: usize,
    /// 执行完毕但退出码非零
    pub failed: usize,
    /// 未能完成（有主机级错误）
    pub errored: usize,
    pub by_error: BTreeMap<ErrorKind, usize>,
}

/// 一次运行的汇总报告，按角色索引
#[derive(Debug, Clone, Serialize)]
pub struct FleetReport {
    pub run_id: Uuid,
    pub bastion: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// 整体截止时间已到
    pub deadline_exceeded: bool,
    /// 运行过程中堡垒机会话断开
    pub bastion_lost: bool,
    pub results: BTreeMap<String, ExecutionResult>,
}

impl FleetReport {
    pub fn new(run_id: Uuid, bastion: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            bastion: bastion.into(),
            started_at,
            finished_at: started_at,
            deadline_exceeded: false,
            bastion_lost: false,
            results: BTreeMap::new(),
        }
    }

    /// 记录结果；同一角色重复记录时返回 false 并保留先到的结果
    pub fn insert(&mut self, result: ExecutionResult) -> bool {
        if self.results.contains_key(&result.role) {
            return false;
        }
        self.results.insert(result.role.clone(), result);
        true
    }

    pub fn get(&self, role: &str) -> Option<&ExecutionResult> {
        self.results.get(role)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.values().all(ExecutionResult::is_success)
    }

    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary {
            total: self.results.len(),
            ..Default::default()
        };

        for result in self.results.values() {
            match (&result.error, result.exit_status) {
                (Some(err), _) => {
                    summary.errored += 1;
                    *summary.by_error.entry(err.kind).or_insert(0) += 1;
                }
                (None, Some(0)) => summary.succeeded += 1,
                (None, _) => summary.failed += 1,
            }
        }

        summary
    }
}
