//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 以 TOML 描述网格各组件的可调参数，守护进程与测试共享同一套默认值；
//! - 所有段落都带 `#[serde(default)]`，配置文件只需写出需要覆盖的字段。
//!
//! ## 契约（What）
//! - [`MeshConfig::from_toml_str`] 解析后立即执行 [`MeshConfig::validate`]；
//! - 校验失败统一返回 [`MeshError::Validation`]，`field` 指向出错的配置项。

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spark_wire::WireOptions;

use crate::error::MeshError;
use crate::gateway::Strategy;

/// 网格配置根节点。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub wire: WireOptions,
    pub registry: RegistryConfig,
    pub discovery: DiscoveryConfig,
    pub gateway: GatewayConfig,
    pub provider: ProviderConfig,
    pub spot: SpotConfig,
}

impl MeshConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, MeshError> {
        let config: MeshConfig =
            toml::from_str(raw).map_err(|err| MeshError::validation("config", err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            MeshError::validation("config", format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        self.registry.validate()?;
        self.discovery.validate()?;
        self.provider.validate()?;
        self.spot.validate()?;
        if self.wire.reconnect_interval_ms == 0 {
            return Err(MeshError::validation(
                "wire.reconnect_interval_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// 注册中心参数。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 固定的注册中心标识；缺省时随机生成。
    pub id: Option<u32>,
    pub pub_endpoint: String,
    pub router_endpoint: String,
    pub peers: Vec<String>,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub broadcast_interval_ms: u64,
    pub snapshot_interval_ms: u64,
    pub tombstone_horizon_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            id: None,
            pub_endpoint: String::new(),
            router_endpoint: String::new(),
            peers: Vec::new(),
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            broadcast_interval_ms: 100,
            snapshot_interval_ms: 5_000,
            tombstone_horizon_ms: 60_000,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn tombstone_horizon(&self) -> Duration {
        Duration::from_millis(self.tombstone_horizon_ms)
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        validate_heartbeat(self.heartbeat_interval_ms, self.heartbeat_timeout_ms)?;
        positive("registry.broadcast_interval_ms", self.broadcast_interval_ms)?;
        positive("registry.snapshot_interval_ms", self.snapshot_interval_ms)?;
        positive("registry.tombstone_horizon_ms", self.tombstone_horizon_ms)?;
        if self.id == Some(0) {
            return Err(MeshError::validation("registry.id", "must be non-zero"));
        }
        Ok(())
    }
}

pub(crate) fn validate_heartbeat(interval_ms: u64, timeout_ms: u64) -> Result<(), MeshError> {
    positive("registry.heartbeat_interval_ms", interval_ms)?;
    positive("registry.heartbeat_timeout_ms", timeout_ms)?;
    if timeout_ms < interval_ms {
        return Err(MeshError::validation(
            "registry.heartbeat_timeout_ms",
            "timeout must not be shorter than the interval",
        ));
    }
    Ok(())
}

pub(crate) fn positive(field: &'static str, value: u64) -> Result<(), MeshError> {
    if value == 0 {
        Err(MeshError::validation(field, "must be greater than zero"))
    } else {
        Ok(())
    }
}

/// 发现端参数。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// 需要订阅的注册中心广播端点。
    pub registries: Vec<String>,
    /// 关注的服务名；为空时镜像全部服务。
    pub services: Vec<String>,
    /// 检查上游存活与清理墓碑的周期。
    pub sweep_interval_ms: u64,
    /// 上游未公布快照周期前采用的默认值。
    pub default_snapshot_interval_ms: u64,
    pub tombstone_horizon_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            registries: Vec::new(),
            services: Vec::new(),
            sweep_interval_ms: 500,
            default_snapshot_interval_ms: 5_000,
            tombstone_horizon_ms: 60_000,
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<(), MeshError> {
        positive("discovery.sweep_interval_ms", self.sweep_interval_ms)?;
        positive(
            "discovery.default_snapshot_interval_ms",
            self.default_snapshot_interval_ms,
        )?;
        positive("discovery.tombstone_horizon_ms", self.tombstone_horizon_ms)
    }
}

/// 网关参数。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub default_strategy: Strategy,
    /// 按服务覆盖的负载均衡策略。
    pub strategies: BTreeMap<String, Strategy>,
}

/// 服务实例（及主题节点）的登记参数。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// 收到注册中心公布的心跳周期前，用于重发登记请求的周期。
    pub heartbeat_interval_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
        }
    }
}

impl ProviderConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        positive("provider.heartbeat_interval_ms", self.heartbeat_interval_ms)
    }
}

/// 主题网格参数。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotConfig {
    /// RINGBUFFER 模式下每个主题保留的消息数。
    pub ring_capacity: usize,
    /// 每个 Spot 接收队列的高水位。
    pub queue_hwm: usize,
}

impl Default for SpotConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1_024,
            queue_hwm: 100_000,
        }
    }
}

impl SpotConfig {
    pub fn validate(&self) -> Result<(), MeshError> {
        positive("spot.ring_capacity", self.ring_capacity as u64)?;
        positive("spot.queue_hwm", self.queue_hwm as u64)
    }
}
