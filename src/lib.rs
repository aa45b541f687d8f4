//! 经堡垒机的批量部署执行库
//! 凭据解析、堡垒机隧道复用与并发远程执行

pub mod config;
pub mod credentials;
pub mod error;
pub mod fleet;
pub mod models;
pub mod ssh;
pub mod telemetry;

pub use error::{ErrorKind, HostError, Result, RunError, SecretError};
pub use fleet::{FleetOptions, FleetRunner};
pub use models::{CommandSpec, ExecutionResult, FleetReport, HostDescriptor, Inventory};
