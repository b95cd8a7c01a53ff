use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{SocketCore, SocketEvent, SocketHandle, SocketKind};
use crate::context::WireContext;
use crate::endpoint::Endpoint;
use crate::error::WireError;
use crate::frame::{Flags, Frames, PipeId, RoutingId};

/// 广播端：只发送，按下游声明的前缀过滤。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - [`PubSocket::publish`] 以首帧为主题，对每条链路做前缀匹配，无订阅者时消息被静默丢弃；
///   - [`PubSocket::monitor`] 暴露 `Subscribed` 事件，上层据此向新订阅者补发快照或历史消息；
///   - [`PubSocket::send_to_subscriber`] 绕过过滤器，只投递给指定链路。
pub struct PubSocket {
    core: Arc<SocketCore>,
}

impl PubSocket {
    pub(crate) fn new(context: WireContext) -> Self {
        Self {
            core: SocketCore::new(context, SocketKind::Pub, RoutingId::random()),
        }
    }

    pub async fn bind(&self, endpoint: &str) -> Result<Endpoint, WireError> {
        self.core.bind(endpoint).await
    }

    pub fn connect(&self, endpoint: &str) -> Result<Endpoint, WireError> {
        self.core.connect(endpoint)
    }

    /// 广播多帧消息，返回命中的下游数量。
    pub fn publish(&self, frames: Frames) -> Result<usize, WireError> {
        if self.core.is_closed() {
            return Err(WireError::Closed);
        }
        Ok(self.core.publish(frames))
    }

    pub fn send_to_subscriber(&self, pipe: PipeId, frames: Frames) -> Result<(), WireError> {
        if self.core.is_closed() {
            return Err(WireError::Closed);
        }
        self.core.send_to_pipe(pipe, frames)
    }

    /// 订阅生命周期事件；重复调用会替换旧的接收端。
    pub fn monitor(&self) -> mpsc::UnboundedReceiver<SocketEvent> {
        self.core.monitor()
    }

    pub fn subscriber_count(&self) -> usize {
        self.core.peer_count()
    }

    pub fn handle(&self) -> SocketHandle {
        SocketHandle {
            core: Arc::clone(&self.core),
        }
    }

    pub fn close(&self) {
        self.core.close();
    }
}

/// 订阅端：只接收，前缀过滤器在每次（重新）建链时同步给上游。
///
/// 同一前缀可以多次订阅，引用计数归零后才真正向上游退订。
pub struct SubSocket {
    core: Arc<SocketCore>,
}

impl SubSocket {
    pub(crate) fn new(context: WireContext) -> Self {
        Self {
            core: SocketCore::new(context, SocketKind::Sub, RoutingId::random()),
        }
    }

    pub async fn bind(&self, endpoint: &str) -> Result<Endpoint, WireError> {
        self.core.bind(endpoint).await
    }

    pub fn connect(&self, endpoint: &str) -> Result<Endpoint, WireError> {
        self.core.connect(endpoint)
    }

    pub fn disconnect(&self, endpoint: &str) -> Result<bool, WireError> {
        self.core.disconnect(endpoint)
    }

    /// 当前是否存在一条通往 `endpoint` 的已建立链路。
    pub fn is_connected_to(&self, endpoint: &Endpoint) -> bool {
        self.core.is_connected_to(endpoint)
    }

    /// 订阅前缀；空前缀匹配所有消息。每次调用都会向所有上游重新声明该前缀。
    pub fn subscribe(&self, prefix: impl Into<Bytes>) -> Result<(), WireError> {
        if self.core.is_closed() {
            return Err(WireError::Closed);
        }
        self.core.subscribe(prefix.into());
        Ok(())
    }

    /// 返回 `false` 表示此前并未订阅该前缀。
    pub fn unsubscribe(&self, prefix: impl Into<Bytes>) -> Result<bool, WireError> {
        if self.core.is_closed() {
            return Err(WireError::Closed);
        }
        Ok(self.core.unsubscribe(&prefix.into()))
    }

    pub async fn recv(&self, flags: Flags) -> Result<Frames, WireError> {
        self.core.recv(flags).await.map(|received| received.frames)
    }

    pub fn monitor(&self) -> mpsc::UnboundedReceiver<SocketEvent> {
        self.core.monitor()
    }

    pub fn publisher_count(&self) -> usize {
        self.core.peer_count()
    }

    pub fn handle(&self) -> SocketHandle {
        SocketHandle {
            core: Arc::clone(&self.core),
        }
    }

    pub fn close(&self) {
        self.core.close();
    }
}
