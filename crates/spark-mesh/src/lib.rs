#![doc = r#"
# spark-mesh

## 设计目的（Why）
- 在 [`spark_wire`] 的消息套接字之上搭建服务网格：服务实例向注册中心登记，
  客户端经服务发现获得实例列表，网关按负载均衡策略把请求转发到具体实例；
- 同一套登记与发现机制也服务于主题广播网格：[`SpotNode`] 互相发现并组成对等网络，
  应用通过 [`Spot`] 发布与订阅主题。

## 组件一览（What）
- [`Registry`]：持有权威服务表，处理登记、心跳与撤回，批量广播增量并周期发布快照，
  多个注册中心之间互相订阅以复制状态；
- [`Discovery`]：订阅注册中心广播，维护本地只读副本，并通知服务变更；
- [`Gateway`]：以 `ROUTER` 连接服务实例，支持轮询与加权随机两种策略；
- [`Provider`] / [`Receiver`]：服务实例，负责绑定请求端点并维持登记；
- [`SpotNode`] / [`Spot`]：主题网格节点与收发句柄，支持 `QUEUE` 与 `RING_BUFFER` 保留模式。

## 一致性模型
- 每条登记记录携带 `(registered_at, revision, origin)` 时间戳，所有副本按“最后写入者获胜”合并；
- 撤回留下墓碑，迟到的旧登记不会复活已撤回的记录；
- 快照用于纠正丢失的增量，序号回退视为对端重启。

## 使用方式（How）
- 所有组件共享一个 [`spark_wire::WireContext`]，`inproc://` 端点只在同一上下文内可见；
- 参数可以逐个设置，也可以从 [`MeshConfig`] 的 TOML 文本加载。
"#]

mod config;
mod discovery;
mod error;
mod gateway;
mod gossip;
mod protocol;
mod provider;
mod registration;
mod registry;
mod spot;
mod table;
mod validate;

pub use config::{
    DiscoveryConfig, GatewayConfig, MeshConfig, ProviderConfig, RegistryConfig, SpotConfig,
};
pub use discovery::Discovery;
pub use error::{MeshError, Unavailable};
pub use gateway::{Gateway, Strategy};
pub use protocol::{
    Change, DecodeError, Delta, Message, RegisterAck, RegisterRequest, Snapshot, message_id,
    status,
};
pub use provider::{Provider, Receiver};
pub use registration::{RegistrationResult, RegistrationState};
pub use registry::Registry;
pub use spot::{Spot, SpotNode, TopicMode};
pub use table::{ProviderRecord, RegistryId, ServiceKind, ServiceTable, Stamp, Upsert};
pub use validate::MAX_NAME_LEN;
