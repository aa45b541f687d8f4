//! 数据模型模块
//! 主机清单、执行命令与执行结果

pub mod execution;
pub mod host;

pub use execution::{CommandSpec, ExecutionResult, FleetReport, ReportSummary};
pub use host::{HostDescriptor, Inventory, DEFAULT_BASTION_ROLE};
