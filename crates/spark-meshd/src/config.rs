//! 守护进程配置：网格参数平铺在根节点，另有 TCP 传输段与可选的主题节点段。
//!
//! ```toml
//! [registry]
//! id = 1
//! pub_endpoint = "tcp://0.0.0.0:5550"
//! router_endpoint = "tcp://0.0.0.0:5551"
//!
//! [tcp]
//! nodelay = true
//!
//! [spot_node]
//! bind = "tcp://0.0.0.0:5560"
//! service = "spot"
//! topics = [{ name = "prices", mode = "RING_BUFFER" }]
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use spark_mesh::{MeshConfig, TopicMode};
use spark_wire_tcp::TcpSocketConfig;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    #[serde(flatten)]
    pub mesh: MeshConfig,
    pub tcp: TcpSocketConfig,
    pub spot_node: Option<SpotNodeConfig>,
}

/// 与注册中心同进程运行的主题节点。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotNodeConfig {
    pub bind: String,
    /// 对外公布的端点；为空时使用绑定端点。
    pub advertise: String,
    /// 登记与自动发现使用的服务名。
    pub service: String,
    pub weight: u32,
    /// 额外手工连接的对端广播端点。
    pub peers: Vec<String>,
    /// 是否经本进程的注册中心自动发现其他节点。
    pub discover: bool,
    pub topics: Vec<TopicConfig>,
}

impl Default for SpotNodeConfig {
    fn default() -> Self {
        Self {
            bind: String::new(),
            advertise: String::new(),
            service: "spot".to_owned(),
            weight: 1,
            peers: Vec::new(),
            discover: true,
            topics: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    #[serde(default)]
    pub mode: TopicMode,
}

impl DaemonConfig {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(raw).context("解析守护进程配置失败")?;
        config.mesh.validate()?;
        if let Some(node) = &config.spot_node {
            anyhow::ensure!(!node.bind.is_empty(), "spot_node.bind 不能为空");
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置文件 {} 失败", path.display()))?;
        Self::from_toml_str(&raw)
    }
}
