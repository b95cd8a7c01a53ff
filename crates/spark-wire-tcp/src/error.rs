use std::io;
use std::time::Duration;

use spark_wire::{OperationKind, WireError};

/// TCP 传输层错误映射工具。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 将标准库 IO 错误转换为 [`WireError`]，附带稳定错误码与可重试分类，
///   让连接任务据此决定退避或放弃；
/// - 所有错误码遵循 `spark.wire.tcp.*` 命名约定。
///
/// ## 契约（What）
/// - `map_io_error`：通用映射；`AddrInUse` 在绑定阶段被单独识别为 [`WireError::AddressInUse`]；
/// - `timeout_error`：握手等有界等待超时；
/// - `protocol_error`：握手或帧格式不合法。
pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.wire.tcp.bind_failed",
    message: "tcp bind",
};

pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.wire.tcp.accept_failed",
    message: "tcp accept",
};

pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.wire.tcp.connect_failed",
    message: "tcp connect",
};

pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.wire.tcp.configure_failed",
    message: "tcp configure",
};

pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.wire.tcp.handshake_failed",
    message: "tcp handshake",
};

pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.wire.tcp.read_failed",
    message: "tcp read",
};

pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.wire.tcp.write_failed",
    message: "tcp write",
};

pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> WireError {
    WireError::io(kind, error)
}

pub(crate) fn map_bind_error(endpoint: &str, error: io::Error) -> WireError {
    if error.kind() == io::ErrorKind::AddrInUse {
        return WireError::AddressInUse {
            endpoint: endpoint.to_owned(),
        };
    }
    map_io_error(BIND, error)
}

pub(crate) fn timeout_error(kind: OperationKind, after: Duration) -> WireError {
    WireError::Io {
        code: kind.code,
        operation: kind.message,
        detail: format!("timed out after {after:?}"),
        retryable: true,
    }
}

pub(crate) fn protocol_error(detail: impl Into<String>) -> WireError {
    WireError::Protocol {
        detail: detail.into(),
    }
}
