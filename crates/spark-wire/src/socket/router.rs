use std::sync::Arc;

use tokio::sync::mpsc;

use super::{SocketCore, SocketEvent, SocketHandle, SocketKind};
use crate::context::WireContext;
use crate::endpoint::Endpoint;
use crate::error::WireError;
use crate::frame::{Flags, Frames, RoutingId};

/// 按标识寻址的双向套接字。
///
/// # 教案式说明
/// - **意图 (Why)**：注册中心、网关与服务实例都需要“知道消息来自谁、应答发给谁”；
/// - **契约 (What)**：
///   - [`RouterSocket::recv`] 返回 `(发送方标识, 帧)`；
///   - [`RouterSocket::send_to`] 在标识离线时返回 [`WireError::UnknownPeer`]；
///   - 同一标识多次建链时以最新链路为准；
/// - **风险 (Trade-offs)**：标识由对端自报，不做鉴权。
pub struct RouterSocket {
    core: Arc<SocketCore>,
}

impl RouterSocket {
    pub(crate) fn new(context: WireContext, identity: RoutingId) -> Self {
        Self {
            core: SocketCore::new(context, SocketKind::Router, identity),
        }
    }

    pub fn identity(&self) -> &RoutingId {
        self.core.identity()
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

    pub fn send_to(&self, identity: &RoutingId, frames: Frames) -> Result<(), WireError> {
        if self.core.is_closed() {
            return Err(WireError::Closed);
        }
        self.core.send_to_identity(identity, frames)
    }

    pub async fn recv(&self, flags: Flags) -> Result<(RoutingId, Frames), WireError> {
        self.core
            .recv(flags)
            .await
            .map(|received| (received.identity, received.frames))
    }

    /// 指定标识当前是否有在线链路。
    pub fn is_connected(&self, identity: &RoutingId) -> bool {
        self.core.has_peer(identity)
    }

    pub fn peer_count(&self) -> usize {
        self.core.peer_count()
    }

    pub fn monitor(&self) -> mpsc::UnboundedReceiver<SocketEvent> {
        self.core.monitor()
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

/// 无状态请求端：发送时在已连接的对端之间轮询。
pub struct DealerSocket {
    core: Arc<SocketCore>,
}

impl DealerSocket {
    pub(crate) fn new(context: WireContext, identity: RoutingId) -> Self {
        Self {
            core: SocketCore::new(context, SocketKind::Dealer, identity),
        }
    }

    pub fn identity(&self) -> &RoutingId {
        self.core.identity()
    }

    pub fn connect(&self, endpoint: &str) -> Result<Endpoint, WireError> {
        self.core.connect(endpoint)
    }

    pub fn disconnect(&self, endpoint: &str) -> Result<bool, WireError> {
        self.core.disconnect(endpoint)
    }

    /// 无已连接对端时返回 [`WireError::NoPeer`]。
    pub fn send(&self, frames: Frames) -> Result<(), WireError> {
        if self.core.is_closed() {
            return Err(WireError::Closed);
        }
        self.core.send_round_robin(frames)
    }

    pub async fn recv(&self, flags: Flags) -> Result<Frames, WireError> {
        self.core.recv(flags).await.map(|received| received.frames)
    }

    pub fn peer_count(&self) -> usize {
        self.core.peer_count()
    }

    pub fn monitor(&self) -> mpsc::UnboundedReceiver<SocketEvent> {
        self.core.monitor()
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
