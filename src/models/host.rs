//! 主机清单模型

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::RunError;

/// 默认的堡垒机角色名
pub const DEFAULT_BASTION_ROLE: &str = "bastion";

fn default_ssh_port() -> u16 {
    22
}

/// 主机连接描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDescriptor {
    /// 角色名（清单内唯一）
    pub role: String,

    /// 主机地址（从堡垒机视角可达的地址）
    pub address: String,

    /// SSH 端口
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// 凭据标识，对应密钥后端中的一条记录
    pub credential_id: String,

    /// 登录用户名，缺省时使用全局 SSH 配置
    #[serde(default)]
    pub username: Option<String>,
}

impl HostDescriptor {
    pub fn new(
        role: impl Into<String>,
        address: impl Into<String>,
        credential_id: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            address: address.into(),
            port: default_ssh_port(),
            credential_id: credential_id.into(),
            username: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// `host:port` 形式的地址，同时用作 known_hosts 的键
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    fn validate(&self) -> Result<(), RunError> {
        if self.role.trim().is_empty() {
            return Err(RunError::inventory("host role must not be empty"));
        }
        if self.address.trim().is_empty() {
            return Err(RunError::inventory(format!("host '{}' has no address", self.role)));
        }
        if self.port == 0 {
            return Err(RunError::inventory(format!("host '{}' has port 0", self.role)));
        }
        if self.credential_id.trim().is_empty() {
            return Err(RunError::inventory(format!(
                "host '{}' has no credential id",
                self.role
            )));
        }
        Ok(())
    }
}

/// 静态主机清单：角色名 -> 主机描述
///
/// 构造时保证角色唯一，且存在堡垒机条目。
#[derive(Debug, Clone)]
pub struct Inventory {
    hosts: BTreeMap<String, HostDescriptor>,
    bastion_role: String,
}

impl Inventory {
    pub fn new(
        hosts: impl IntoIterator<Item = HostDescriptor>,
        bastion_role: impl Into<String>,
    ) -> Result<Self, RunError> {
        let bastion_role = bastion_role.into();
        let mut map = BTreeMap::new();

        for host in hosts {
            host.validate()?;
            if map.contains_key(&host.role) {
                return Err(RunError::inventory(format!("duplicate role '{}'", host.role)));
            }
            map.insert(host.role.clone(), host);
        }

        if !map.contains_key(&bastion_role) {
            return Err(RunError::inventory(format!(
                "no host tagged with bastion role '{}'",
                bastion_role
            )));
        }

        Ok(Self {
            hosts: map,
            bastion_role,
        })
    }

    /// 堡垒机条目
    pub fn bastion(&self) -> &HostDescriptor {
        // 构造时已校验存在
        &self.hosts[&self.bastion_role]
    }

    pub fn bastion_role(&self) -> &str {
        &self.bastion_role
    }

    pub fn get(&self, role: &str) -> Option<&HostDescriptor> {
        self.hosts.get(role)
    }

    /// 所有需要执行命令的目标主机（不含堡垒机）
    pub fn targets(&self) -> impl Iterator<Item = &HostDescriptor> {
        self.hosts
            .values()
            .filter(move |h| h.role != self.bastion_role)
    }

    pub fn target_count(&self) -> usize {
        self.hosts.len() - 1
    }

    /// 所有主机引用的凭据标识（去重）
    pub fn credential_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.hosts.values().map(|h| h.credential_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// 只保留指定角色（及堡垒机）
    pub fn retain_roles(&self, roles: &[String]) -> Result<Self, RunError> {
        for role in roles {
            if !self.hosts.contains_key(role) {
                return Err(RunError::inventory(format!("unknown role '{}'", role)));
            }
        }

        let hosts = self
            .hosts
            .values()
            .filter(|h| h.role == self.bastion_role || roles.contains(&h.role))
            .cloned();

        Self::new(hosts, self.bastion_role.clone())
    }
}
