//! SSH 模块
//!
//! 经堡垒机的两跳 SSH：隧道管理、主机密钥验证与远程命令执行。

pub mod executor;
pub mod host_key;
pub mod tunnel;

pub use executor::{collect_output, CapturedOutput, CommandRunner, ExecChannel, RemoteExecutor};
pub use host_key::{fingerprint, fingerprint_of, HostKeyPolicy, HostKeyVerifier};
pub use tunnel::{
    BastionSession, RelayChannel, RelayGuard, RelayIo, RelayWatch, Tunnel, TunnelConnector,
    TunnelManager,
};
