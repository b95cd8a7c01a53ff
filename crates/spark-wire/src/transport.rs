//! 传输实现与套接字核心之间的接缝。
//!
//! - [`Transport`] 负责按协议前缀绑定与连接；
//! - [`PeerSink`] 是单条链路的出站方向；
//! - [`Binding`] 在释放时撤销绑定。

use std::fmt;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::endpoint::Endpoint;
use crate::error::WireError;
use crate::frame::Command;
use crate::socket::{SocketHandle, WeakSocket};

/// 单条链路的出站方向。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `deliver` 返回 `false` 表示链路已不可用，调用方会随即拆除该链路；
///   - `close` 需幂等，并负责通知对端拆除其一侧；
/// - **风险 (Trade-offs)**：两个方法都是同步的，实现不得在其中阻塞等待网络。
pub trait PeerSink: Send + Sync + 'static {
    fn deliver(&self, command: Command) -> bool;

    fn close(&self);
}

/// 按协议前缀注册到 [`crate::WireContext`] 的传输实现。
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// 协议前缀，例如 `"tcp"`。
    fn scheme(&self) -> &'static str;

    /// 在端点上接受入站链路；返回的 [`Binding`] 携带实际生效的端点。
    async fn bind(&self, socket: SocketHandle, endpoint: &Endpoint) -> Result<Binding, WireError>;

    /// 启动后台连接任务。任务负责建链、断线重连，并在套接字释放后退出。
    fn connect(&self, socket: WeakSocket, endpoint: &Endpoint)
    -> Result<JoinHandle<()>, WireError>;
}

/// 一次成功绑定；释放时执行撤销动作。
pub struct Binding {
    endpoint: Endpoint,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Binding {
    pub fn new(endpoint: Endpoint, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            endpoint,
            release: Some(Box::new(release)),
        }
    }

    /// 实际生效的端点（例如端口 `0` 被替换为系统分配的端口）。
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}
