//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为套接字层暴露统一的错误语义，使网格控制面可以区分“可重试的链路抖动”与“调用方参数错误”；
//! - 具体传输实现（如 `spark-wire-tcp`）通过 [`OperationKind`] 声明稳定错误码，再经由
//!   [`WireError::io`] 将 `std::io::Error` 归类。
//!
//! ## 设计要求（What）
//! - 所有变体实现 `Clone + Eq`，便于在结果槽、测试断言之间复制；
//! - 错误码采用 `spark.wire.*` 命名空间，保持与日志字段一致。

use std::io;

use thiserror::Error;

use crate::frame::RoutingId;
use crate::socket::SocketKind;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

/// 套接字层错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合端点解析、绑定冲突、对端寻址与 IO 失败等路径，供控制面统一映射；
/// - **契约 (What)**：[`WireError::code`] 返回稳定错误码，[`WireError::is_retryable`] 指示调用方是否值得重试；
/// - **设计权衡 (Trade-offs)**：IO 错误只保留文本描述而非原始 `io::Error`，以换取 `Clone`，代价是丢失
///   原始 `raw_os_error`。
#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum WireError {
    /// 端点字符串无法解析或超出长度限制。
    #[error("invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// 端点协议没有注册对应的传输实现。
    #[error("no transport registered for scheme `{scheme}`")]
    UnsupportedScheme { scheme: String },

    /// 端点已被其他套接字占用。
    #[error("endpoint `{endpoint}` is already bound")]
    AddressInUse { endpoint: String },

    /// 路由标识为空或超过 255 字节。
    #[error("invalid routing identity: {reason}")]
    InvalidRoutingId { reason: String },

    /// ROUTER 按标识寻址时对端不在线。
    #[error("no connected peer with routing identity {identity}")]
    UnknownPeer { identity: RoutingId },

    /// 需要至少一个已连接对端的操作（DEALER 发送等）。
    #[error("socket has no connected peer")]
    NoPeer,

    /// 当前套接字类型不支持该操作。
    #[error("{kind:?} socket does not support {operation}")]
    Unsupported {
        kind: SocketKind,
        operation: &'static str,
    },

    /// 非阻塞接收时队列为空。
    #[error("operation would block")]
    WouldBlock,

    /// 套接字已关闭。
    #[error("socket is closed")]
    Closed,

    /// 握手或帧格式不符合约定。
    #[error("protocol violation: {detail}")]
    Protocol { detail: String },

    /// 底层 IO 失败。
    #[error("{operation} failed: {detail}")]
    Io {
        code: &'static str,
        operation: &'static str,
        detail: String,
        retryable: bool,
    },
}

impl WireError {
    /// 将 IO 错误映射为套接字层错误，并附带可重试分类。
    pub fn io(kind: OperationKind, error: io::Error) -> Self {
        WireError::Io {
            code: kind.code,
            operation: kind.message,
            retryable: is_retryable_io(&error),
            detail: error.to_string(),
        }
    }

    /// 构造端点解析错误的便捷方法。
    pub fn invalid_endpoint(endpoint: &str, reason: impl Into<String>) -> Self {
        WireError::InvalidEndpoint {
            endpoint: endpoint.to_owned(),
            reason: reason.into(),
        }
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            WireError::InvalidEndpoint { .. } => "spark.wire.endpoint.invalid",
            WireError::UnsupportedScheme { .. } => "spark.wire.endpoint.unsupported_scheme",
            WireError::AddressInUse { .. } => "spark.wire.bind.address_in_use",
            WireError::InvalidRoutingId { .. } => "spark.wire.routing_id.invalid",
            WireError::UnknownPeer { .. } => "spark.wire.peer.unknown",
            WireError::NoPeer => "spark.wire.peer.none",
            WireError::Unsupported { .. } => "spark.wire.socket.unsupported",
            WireError::WouldBlock => "spark.wire.socket.would_block",
            WireError::Closed => "spark.wire.socket.closed",
            WireError::Protocol { .. } => "spark.wire.protocol",
            WireError::Io { code, .. } => code,
        }
    }

    /// 调用方稍后重试是否可能成功。
    pub fn is_retryable(&self) -> bool {
        match self {
            WireError::UnknownPeer { .. } | WireError::NoPeer | WireError::WouldBlock => true,
            WireError::Io { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

fn is_retryable_io(error: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrInUse
            | ErrorKind::AddrNotAvailable
            | ErrorKind::BrokenPipe
            | ErrorKind::WriteZero
            | ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNECT: OperationKind = OperationKind {
        code: "spark.wire.test.connect_failed",
        message: "test connect",
    };

    #[test]
    fn io_errors_keep_code_and_retry_class() {
        let refused = WireError::io(
            CONNECT,
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(refused.code(), "spark.wire.test.connect_failed");
        assert!(refused.is_retryable());

        let denied = WireError::io(
            CONNECT,
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!denied.is_retryable());
        assert!(denied.to_string().starts_with("test connect failed"));
    }
}
