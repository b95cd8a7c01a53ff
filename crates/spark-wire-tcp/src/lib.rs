#![doc = r#"
# spark-wire-tcp

## 设计动机（Why）
- **定位**：为 `spark-wire` 套接字提供基于 Tokio 的 `tcp://` 传输，
  让注册中心、网关与服务实例可以跨进程、跨主机互联；
- **架构角色**：实现 [`spark_wire::Transport`]，通过 [`TcpTransport::install`]
  注册到 [`spark_wire::WireContext`] 后，套接字即可绑定或连接 TCP 端点。

## 核心契约（What）
- 每条 TCP 连接承载一条链路：建链后双方交换问候报文（类型与路由标识），
  之后以长度前缀帧传递消息与订阅指令；
- 主动连接方在连接失败或链路断开后按上下文的退避参数自动重连；
- 错误统一映射为 [`spark_wire::WireError`]，错误码位于 `spark.wire.tcp.*` 命名空间。

## 实现策略（How）
- 监听端为每个入站连接派生独立任务完成握手；
- 每条链路拆分读写半部，分别由读任务与写任务驱动，出站指令经无界队列排队；
- 套接字参数（`TCP_NODELAY`、`SO_KEEPALIVE`、`SO_LINGER`）通过 `socket2` 设置。

## 风险与考量（Trade-offs）
- 出站队列无界，慢消费者会积压内存；上层以业务级高水位控制流量；
- 问候报文不含鉴权信息，仅适用于受信网络。
"#]

mod channel;
mod codec;
mod config;
mod error;
mod listener;
mod transport;

pub use config::TcpSocketConfig;
pub use listener::TcpListener;
pub use transport::TcpTransport;
