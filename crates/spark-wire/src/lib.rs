#![doc = r#"
# spark-wire

## 设计目的（Why）
- 为服务网格控制面与数据面提供统一的消息套接字：`PUB`/`SUB` 广播与 `ROUTER`/`DEALER` 寻址；
- 把“如何建链”隔离在 [`Transport`] 之后，控制面代码对 `inproc://` 与 `tcp://` 一视同仁。

## 核心契约（What）
- 消息是多帧（[`Frames`]），帧边界在传输中保持不变；
- `connect` 从不因目标未就绪而失败，链路在后台建立并自动重连；
- PUB 端按首帧前缀过滤，并把下游订阅暴露为 [`SocketEvent::Subscribed`] 事件；
- ROUTER 端以 [`RoutingId`] 寻址，未知标识返回 [`WireError::UnknownPeer`]。

## 使用方式（How）
- 通过 [`WireContext`] 创建套接字，同一上下文内的套接字可以用 `inproc://` 互联；
- TCP 等外部传输由独立 crate 实现 [`Transport`] 并注册到上下文。
"#]

mod context;
mod endpoint;
mod error;
mod frame;
mod inproc;
mod socket;
mod transport;

pub use context::{WireContext, WireOptions};
pub use endpoint::{Endpoint, MAX_ENDPOINT_LEN};
pub use error::{OperationKind, WireError};
pub use frame::{Command, Flags, Frames, MAX_ROUTING_ID_LEN, PipeId, RoutingId};
pub use socket::{
    DealerSocket, LinkSpec, LinkState, PubSocket, RouterSocket, SocketEvent, SocketHandle,
    SocketKind, SubSocket, WeakSocket,
};
pub use transport::{Binding, PeerSink, Transport};
