//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为网格各组件暴露统一的错误语义：本地校验失败、生命周期次序错误、实体缺失或冲突、
//!   服务不可用以及底层套接字故障；
//! - 注册中心拒绝请求时只通过结果槽把状态码交给服务实例，本模块负责状态码与错误之间的互转。
//!
//! ## 设计要求（What）
//! - 所有变体实现 `Clone + Eq`，结果槽与测试断言可以直接比较；
//! - [`MeshError::code`] 返回 `mesh.*` 命名空间下的稳定错误码，与日志字段保持一致。

use std::fmt;

use spark_wire::WireError;
use thiserror::Error;

use crate::protocol::status;

/// 服务暂不可用的具体原因。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Unavailable {
    /// 发现缓存中没有任何可选实例。
    NoProviders,
    /// 实例存在，但没有一条已建立的连接。
    NoConnection,
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unavailable::NoProviders => f.write_str("no providers"),
            Unavailable::NoConnection => f.write_str("no live connection"),
        }
    }
}

/// 网格错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：调用方据此区分“参数有误，重试无益”（`Validation`/`Conflict`）与
///   “稍后重试即可”（`NotReady`/`Unavailable`/`WouldBlock`）；
/// - **契约 (What)**：
///   - 套接字层的 `WouldBlock`/`Closed` 会被提升为同名网格错误，端点与路由标识的解析错误提升为
///     `Validation`，其余保留在 [`MeshError::Wire`] 中；
///   - [`MeshError::status`] 给出注册协议中的状态码；
/// - **设计权衡 (Trade-offs)**：上下文只保存字符串与静态标签，牺牲少量分配换取可克隆性。
#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum MeshError {
    /// 名称、端点、权重或配置项不合法，请求不会被发送。
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// 操作发生在 `start`/`bind`/`connect_registry` 之前，或组件正在关闭。
    #[error("{component} is not ready: {reason}")]
    NotReady {
        component: &'static str,
        reason: &'static str,
    },

    /// 查询、注销或主题操作的目标不存在。
    #[error("{entity} `{name}` not found")]
    NotFound { entity: &'static str, name: String },

    /// 重复创建或与现有登记冲突。
    #[error("{entity} `{name}` conflicts: {reason}")]
    Conflict {
        entity: &'static str,
        name: String,
        reason: String,
    },

    /// 调用方设定的等待时间耗尽。
    #[error("timed out after {waited_ms} ms waiting for {operation}")]
    Timeout {
        operation: &'static str,
        waited_ms: u64,
    },

    /// 网关无法为服务选出目标实例。
    #[error("service `{service}` unavailable: {reason}")]
    Unavailable {
        service: String,
        reason: Unavailable,
    },

    /// 注册中心以非零状态码拒绝了请求。
    #[error("registry rejected `{service}` with status {status}: {message}")]
    Rejected {
        service: String,
        status: i32,
        message: String,
    },

    /// 非阻塞接收时没有可读消息。
    #[error("operation would block")]
    WouldBlock,

    /// 句柄已关闭。
    #[error("handle is closed")]
    Closed,

    /// 套接字层故障，例如绑定失败。
    #[error(transparent)]
    Wire(WireError),
}

impl MeshError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        MeshError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(entity: &'static str, name: impl Into<String>) -> Self {
        MeshError::NotFound {
            entity,
            name: name.into(),
        }
    }

    pub(crate) fn conflict(
        entity: &'static str,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        MeshError::Conflict {
            entity,
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            MeshError::Validation { .. } => "mesh.validation",
            MeshError::NotReady { .. } => "mesh.not_ready",
            MeshError::NotFound { .. } => "mesh.not_found",
            MeshError::Conflict { .. } => "mesh.conflict",
            MeshError::Timeout { .. } => "mesh.timeout",
            MeshError::Unavailable {
                reason: Unavailable::NoProviders,
                ..
            } => "mesh.unavailable.no_providers",
            MeshError::Unavailable {
                reason: Unavailable::NoConnection,
                ..
            } => "mesh.unavailable.no_connection",
            MeshError::Rejected { .. } => "mesh.registry.rejected",
            MeshError::WouldBlock => "mesh.would_block",
            MeshError::Closed => "mesh.closed",
            MeshError::Wire(err) => err.code(),
        }
    }

    /// 注册协议中的状态码；无对应状态时返回 `None`。
    pub fn status(&self) -> Option<i32> {
        match self {
            MeshError::Validation { .. } => Some(status::MALFORMED),
            MeshError::NotReady { .. } => Some(status::NOT_READY),
            MeshError::NotFound { .. } => Some(status::NOT_FOUND),
            MeshError::Conflict { .. } => Some(status::CONFLICT),
            MeshError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<WireError> for MeshError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::WouldBlock => MeshError::WouldBlock,
            WireError::Closed => MeshError::Closed,
            WireError::InvalidEndpoint { endpoint, reason } => MeshError::Validation {
                field: "endpoint",
                reason: format!("`{endpoint}`: {reason}"),
            },
            WireError::UnsupportedScheme { scheme } => MeshError::Validation {
                field: "endpoint",
                reason: format!("unsupported scheme `{scheme}`"),
            },
            WireError::InvalidRoutingId { reason } => MeshError::Validation {
                field: "routing_id",
                reason,
            },
            other => MeshError::Wire(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_errors_are_lifted() {
        assert_eq!(MeshError::from(WireError::WouldBlock), MeshError::WouldBlock);
        assert_eq!(MeshError::from(WireError::Closed), MeshError::Closed);
        let invalid = MeshError::from(WireError::invalid_endpoint("x", "missing scheme"));
        assert_eq!(invalid.status(), Some(status::MALFORMED));
        let in_use = MeshError::from(WireError::AddressInUse {
            endpoint: "inproc://a".to_owned(),
        });
        assert_eq!(in_use.code(), "spark.wire.bind.address_in_use");
    }

    #[test]
    fn unavailable_codes_are_distinct() {
        let none = MeshError::Unavailable {
            service: "svc".to_owned(),
            reason: Unavailable::NoProviders,
        };
        let dead = MeshError::Unavailable {
            service: "svc".to_owned(),
            reason: Unavailable::NoConnection,
        };
        assert_ne!(none.code(), dead.code());
        assert!(dead.to_string().contains("no live connection"));
    }
}
