//! # socket 模块说明
//!
//! ## 角色定位（Why）
//! - 提供网格所需的四种套接字：`PUB`/`SUB` 负责广播，`ROUTER`/`DEALER` 负责按标识寻址的请求/应答；
//! - 所有套接字共享同一个 [`SocketCore`]：链路表、接收队列、订阅过滤器与生命周期事件。
//!
//! ## 链路模型（How）
//! - 每条对端连接在本地表现为一个 `PipeId` 与一个 [`PeerSink`]（出站方向）；
//! - 入站方向由传输实现调用 [`SocketHandle::deliver`] 注入；
//! - 任何时候都不在持有链路表锁的情况下调用 `PeerSink`，以免两个套接字互相回调时形成锁环。
//!
//! ## 契约（What）
//! - `connect` 永不因对端不可达而失败：链路在后台建立，断开后按退避策略重连；
//! - `close` 会唤醒所有阻塞中的 `recv`，并以 [`WireError::Closed`] 返回。

mod pubsub;
mod router;

pub use pubsub::{PubSocket, SubSocket};
pub use router::{DealerSocket, RouterSocket};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::context::{WireContext, WireOptions};
use crate::endpoint::Endpoint;
use crate::error::WireError;
use crate::frame::{Command, Flags, Frames, PipeId, RoutingId};
use crate::transport::{Binding, PeerSink};

/// 套接字类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Pub,
    Sub,
    Router,
    Dealer,
}

impl SocketKind {
    /// 两端套接字类型能否建立链路。
    pub fn compatible_with(self, peer: SocketKind) -> bool {
        use SocketKind::*;
        matches!(
            (self, peer),
            (Pub, Sub)
                | (Sub, Pub)
                | (Router, Router)
                | (Router, Dealer)
                | (Dealer, Router)
                | (Dealer, Dealer)
        )
    }

    /// 握手报文中的单字节编码。
    pub fn to_wire(self) -> u8 {
        match self {
            SocketKind::Pub => 1,
            SocketKind::Sub => 2,
            SocketKind::Router => 3,
            SocketKind::Dealer => 4,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(SocketKind::Pub),
            2 => Some(SocketKind::Sub),
            3 => Some(SocketKind::Router),
            4 => Some(SocketKind::Dealer),
            _ => None,
        }
    }
}

/// 套接字生命周期与订阅事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    /// 新链路就绪；`endpoint` 仅在本端主动连接时存在。
    Connected {
        pipe: PipeId,
        identity: RoutingId,
        endpoint: Option<Endpoint>,
    },
    Disconnected {
        pipe: PipeId,
        identity: RoutingId,
    },
    /// PUB 端收到下游订阅（重复订阅同一前缀也会产生事件）。
    Subscribed { pipe: PipeId, prefix: Bytes },
    Unsubscribed { pipe: PipeId, prefix: Bytes },
}

/// 单条链路（或整个套接字）的关闭信号。
///
/// - `close` 幂等，只有第一次调用会唤醒等待者；
/// - `closed().await` 在已关闭时立即返回。
#[derive(Debug, Default)]
pub struct LinkState {
    closed: AtomicBool,
    notify: Notify,
}

impl LinkState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn closed(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// 传输实现挂接新链路时提交的描述。
pub struct LinkSpec {
    pub identity: RoutingId,
    pub kind: SocketKind,
    /// 本端主动连接的目标端点；被动接受的链路为 `None`。
    pub endpoint: Option<Endpoint>,
    pub sink: Arc<dyn PeerSink>,
    pub state: Arc<LinkState>,
}

struct PeerLink {
    identity: RoutingId,
    kind: SocketKind,
    endpoint: Option<Endpoint>,
    sink: Arc<dyn PeerSink>,
    state: Arc<LinkState>,
    /// PUB 端记录的下游前缀过滤器。
    filters: BTreeSet<Bytes>,
}

#[derive(Default)]
struct LinkTable {
    links: BTreeMap<PipeId, PeerLink>,
    routes: HashMap<RoutingId, PipeId>,
    cursor: usize,
}

pub(crate) struct Received {
    pub(crate) pipe: PipeId,
    pub(crate) identity: RoutingId,
    pub(crate) frames: Frames,
}

pub(crate) struct SocketCore {
    kind: SocketKind,
    identity: RoutingId,
    context: WireContext,
    links: Mutex<LinkTable>,
    subscriptions: Mutex<BTreeMap<Bytes, usize>>,
    inbox_tx: mpsc::UnboundedSender<Received>,
    inbox_rx: AsyncMutex<mpsc::UnboundedReceiver<Received>>,
    monitor: Mutex<Option<mpsc::UnboundedSender<SocketEvent>>>,
    bindings: Mutex<Vec<Binding>>,
    connectors: Mutex<HashMap<Endpoint, JoinHandle<()>>>,
    closed: Arc<LinkState>,
    next_pipe: AtomicU64,
    weak_self: Weak<SocketCore>,
}

/// 交给传输实现使用的强引用句柄。
#[derive(Clone)]
pub struct SocketHandle {
    core: Arc<SocketCore>,
}

/// [`SocketHandle`] 的弱引用，供后台任务持有而不延长套接字寿命。
#[derive(Clone)]
pub struct WeakSocket {
    core: Weak<SocketCore>,
}

impl WeakSocket {
    pub fn upgrade(&self) -> Option<SocketHandle> {
        self.core.upgrade().map(|core| SocketHandle { core })
    }

    pub fn ptr_eq(&self, other: &WeakSocket) -> bool {
        self.core.ptr_eq(&other.core)
    }
}

impl SocketHandle {
    pub fn identity(&self) -> &RoutingId {
        &self.core.identity
    }

    pub fn kind(&self) -> SocketKind {
        self.core.kind
    }

    pub fn options(&self) -> &WireOptions {
        self.core.context.options()
    }

    pub fn downgrade(&self) -> WeakSocket {
        WeakSocket {
            core: Arc::downgrade(&self.core),
        }
    }

    pub fn ptr_eq(&self, other: &SocketHandle) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.is_closed()
    }

    /// 分配本地链路编号。
    pub fn reserve_pipe(&self) -> PipeId {
        self.core.next_pipe.fetch_add(1, Ordering::Relaxed)
    }

    /// 登记链路但暂不激活，供需要两端同时登记后再交换订阅的传输使用。
    pub fn insert_link(&self, pipe: PipeId, spec: LinkSpec) -> Result<(), WireError> {
        self.core.insert_link(pipe, spec)
    }

    /// 激活已登记的链路：发出 `Connected` 事件，SUB 端向上游补发全部订阅。
    pub fn activate_link(&self, pipe: PipeId) {
        self.core.activate_link(pipe);
    }

    /// 登记并立即激活链路。
    pub fn attach(&self, pipe: PipeId, spec: LinkSpec) -> Result<(), WireError> {
        self.core.insert_link(pipe, spec)?;
        self.core.activate_link(pipe);
        Ok(())
    }

    /// 注入从 `pipe` 收到的指令。
    pub fn deliver(&self, pipe: PipeId, command: Command) {
        self.core.deliver(pipe, command);
    }

    /// 拆除链路；对已拆除的编号调用无副作用。
    pub fn detach(&self, pipe: PipeId) {
        self.core.detach(pipe);
    }
}

impl SocketCore {
    pub(crate) fn new(context: WireContext, kind: SocketKind, identity: RoutingId) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|weak_self| SocketCore {
            kind,
            identity,
            context,
            links: Mutex::new(LinkTable::default()),
            subscriptions: Mutex::new(BTreeMap::new()),
            inbox_tx,
            inbox_rx: AsyncMutex::new(inbox_rx),
            monitor: Mutex::new(None),
            bindings: Mutex::new(Vec::new()),
            connectors: Mutex::new(HashMap::new()),
            closed: LinkState::new(),
            next_pipe: AtomicU64::new(1),
            weak_self: weak_self.clone(),
        })
    }

    fn handle(&self) -> Option<SocketHandle> {
        self.weak_self.upgrade().map(|core| SocketHandle { core })
    }

    pub(crate) fn kind(&self) -> SocketKind {
        self.kind
    }

    pub(crate) fn identity(&self) -> &RoutingId {
        &self.identity
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    pub(crate) async fn bind(&self, endpoint: &str) -> Result<Endpoint, WireError> {
        let endpoint: Endpoint = endpoint.parse()?;
        if self.is_closed() {
            return Err(WireError::Closed);
        }
        let transport = self.context.transport(endpoint.scheme())?;
        let handle = self.handle().ok_or(WireError::Closed)?;
        let binding = transport.bind(handle, &endpoint).await?;
        let resolved = binding.endpoint().clone();
        debug!(
            socket = ?self.kind,
            identity = %self.identity,
            endpoint = %resolved,
            "socket bound"
        );
        self.bindings.lock().push(binding);
        Ok(resolved)
    }

    pub(crate) fn connect(&self, endpoint: &str) -> Result<Endpoint, WireError> {
        let endpoint: Endpoint = endpoint.parse()?;
        if self.is_closed() {
            return Err(WireError::Closed);
        }
        let mut connectors = self.connectors.lock();
        if connectors.contains_key(&endpoint) {
            return Ok(endpoint);
        }
        let transport = self.context.transport(endpoint.scheme())?;
        let handle = self.handle().ok_or(WireError::Closed)?;
        let task = transport.connect(handle.downgrade(), &endpoint)?;
        debug!(
            socket = ?self.kind,
            identity = %self.identity,
            endpoint = %endpoint,
            "socket connecting"
        );
        connectors.insert(endpoint.clone(), task);
        Ok(endpoint)
    }

    /// 断开主动连接；返回该端点此前是否处于连接状态。
    pub(crate) fn disconnect(&self, endpoint: &str) -> Result<bool, WireError> {
        let endpoint: Endpoint = endpoint.parse()?;
        let Some(task) = self.connectors.lock().remove(&endpoint) else {
            return Ok(false);
        };
        task.abort();
        let pipes: Vec<PipeId> = self
            .links
            .lock()
            .links
            .iter()
            .filter(|(_, link)| link.endpoint.as_ref() == Some(&endpoint))
            .map(|(pipe, _)| *pipe)
            .collect();
        for pipe in pipes {
            self.detach(pipe);
        }
        Ok(true)
    }

    pub(crate) fn is_connected_to(&self, endpoint: &Endpoint) -> bool {
        self.links
            .lock()
            .links
            .values()
            .any(|link| link.endpoint.as_ref() == Some(endpoint))
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.links.lock().links.len()
    }

    pub(crate) fn has_peer(&self, identity: &RoutingId) -> bool {
        self.links.lock().routes.contains_key(identity)
    }

    pub(crate) fn monitor(&self) -> mpsc::UnboundedReceiver<SocketEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.monitor.lock() = Some(tx);
        rx
    }

    fn emit(&self, event: SocketEvent) {
        let mut monitor = self.monitor.lock();
        if let Some(tx) = monitor.as_ref()
            && tx.send(event).is_err()
        {
            *monitor = None;
        }
    }

    fn insert_link(&self, pipe: PipeId, spec: LinkSpec) -> Result<(), WireError> {
        if self.is_closed() {
            return Err(WireError::Closed);
        }
        if !self.kind.compatible_with(spec.kind) {
            return Err(WireError::Protocol {
                detail: format!("{:?} socket cannot link with {:?} peer", self.kind, spec.kind),
            });
        }
        let mut table = self.links.lock();
        table.routes.insert(spec.identity.clone(), pipe);
        table.links.insert(
            pipe,
            PeerLink {
                identity: spec.identity,
                kind: spec.kind,
                endpoint: spec.endpoint,
                sink: spec.sink,
                state: spec.state,
                filters: BTreeSet::new(),
            },
        );
        Ok(())
    }

    fn activate_link(&self, pipe: PipeId) {
        let (identity, endpoint, sink) = {
            let table = self.links.lock();
            let Some(link) = table.links.get(&pipe) else {
                return;
            };
            (link.identity.clone(), link.endpoint.clone(), Arc::clone(&link.sink))
        };
        trace!(
            socket = ?self.kind,
            pipe,
            peer = %identity,
            "link activated"
        );
        if self.kind == SocketKind::Sub {
            let prefixes: Vec<Bytes> = self.subscriptions.lock().keys().cloned().collect();
            for prefix in prefixes {
                sink.deliver(Command::Subscribe(prefix));
            }
        }
        self.emit(SocketEvent::Connected {
            pipe,
            identity,
            endpoint,
        });
    }

    fn deliver(&self, pipe: PipeId, command: Command) {
        match (self.kind, command) {
            (SocketKind::Pub, Command::Subscribe(prefix)) => {
                {
                    let mut table = self.links.lock();
                    let Some(link) = table.links.get_mut(&pipe) else {
                        return;
                    };
                    link.filters.insert(prefix.clone());
                }
                self.emit(SocketEvent::Subscribed { pipe, prefix });
            }
            (SocketKind::Pub, Command::Unsubscribe(prefix)) => {
                {
                    let mut table = self.links.lock();
                    let Some(link) = table.links.get_mut(&pipe) else {
                        return;
                    };
                    link.filters.remove(&prefix);
                }
                self.emit(SocketEvent::Unsubscribed { pipe, prefix });
            }
            (SocketKind::Sub | SocketKind::Router | SocketKind::Dealer, Command::Message(frames)) => {
                if self.kind == SocketKind::Sub && !self.matches_subscription(&frames) {
                    return;
                }
                let identity = {
                    let table = self.links.lock();
                    match table.links.get(&pipe) {
                        Some(link) => link.identity.clone(),
                        None => return,
                    }
                };
                let _ = self.inbox_tx.send(Received {
                    pipe,
                    identity,
                    frames,
                });
            }
            (kind, command) => {
                trace!(socket = ?kind, pipe, ?command, "command not applicable, dropped");
            }
        }
    }

    fn matches_subscription(&self, frames: &Frames) -> bool {
        let topic: &[u8] = frames.first().map(|frame| frame.as_ref()).unwrap_or_default();
        self.subscriptions
            .lock()
            .keys()
            .any(|prefix| topic.starts_with(prefix))
    }

    pub(crate) fn detach(&self, pipe: PipeId) {
        let link = {
            let mut table = self.links.lock();
            let Some(link) = table.links.remove(&pipe) else {
                return;
            };
            if table.routes.get(&link.identity) == Some(&pipe) {
                table.routes.remove(&link.identity);
                if let Some((other_pipe, _)) = table
                    .links
                    .iter()
                    .find(|(_, other)| other.identity == link.identity)
                {
                    let other_pipe = *other_pipe;
                    table.routes.insert(link.identity.clone(), other_pipe);
                }
            }
            link
        };
        link.state.close();
        link.sink.close();
        trace!(
            socket = ?self.kind,
            pipe,
            peer = %link.identity,
            peer_kind = ?link.kind,
            "link detached"
        );
        self.emit(SocketEvent::Disconnected {
            pipe,
            identity: link.identity,
        });
    }

    /// 按前缀过滤广播；返回投递到的下游数量。
    pub(crate) fn publish(&self, frames: Frames) -> usize {
        let topic: &[u8] = frames.first().map(|frame| frame.as_ref()).unwrap_or_default();
        let sinks: Vec<Arc<dyn PeerSink>> = self
            .links
            .lock()
            .links
            .values()
            .filter(|link| link.filters.iter().any(|prefix| topic.starts_with(prefix)))
            .map(|link| Arc::clone(&link.sink))
            .collect();
        sinks
            .iter()
            .filter(|sink| sink.deliver(Command::Message(frames.clone())))
            .count()
    }

    pub(crate) fn send_to_pipe(&self, pipe: PipeId, frames: Frames) -> Result<(), WireError> {
        let sink = self
            .links
            .lock()
            .links
            .get(&pipe)
            .map(|link| Arc::clone(&link.sink))
            .ok_or(WireError::NoPeer)?;
        if sink.deliver(Command::Message(frames)) {
            Ok(())
        } else {
            self.detach(pipe);
            Err(WireError::NoPeer)
        }
    }

    pub(crate) fn send_to_identity(
        &self,
        identity: &RoutingId,
        frames: Frames,
    ) -> Result<(), WireError> {
        let found = {
            let table = self.links.lock();
            table
                .routes
                .get(identity)
                .and_then(|pipe| table.links.get(pipe).map(|link| (*pipe, Arc::clone(&link.sink))))
        };
        let Some((pipe, sink)) = found else {
            return Err(WireError::UnknownPeer {
                identity: identity.clone(),
            });
        };
        if sink.deliver(Command::Message(frames)) {
            Ok(())
        } else {
            self.detach(pipe);
            Err(WireError::UnknownPeer {
                identity: identity.clone(),
            })
        }
    }

    /// 轮询选择一条链路发送。
    pub(crate) fn send_round_robin(&self, frames: Frames) -> Result<(), WireError> {
        let (pipe, sink) = {
            let mut table = self.links.lock();
            let count = table.links.len();
            if count == 0 {
                return Err(WireError::NoPeer);
            }
            let index = table.cursor % count;
            table.cursor = table.cursor.wrapping_add(1);
            let (pipe, link) = table
                .links
                .iter()
                .nth(index)
                .ok_or(WireError::NoPeer)?;
            (*pipe, Arc::clone(&link.sink))
        };
        if sink.deliver(Command::Message(frames)) {
            Ok(())
        } else {
            self.detach(pipe);
            Err(WireError::NoPeer)
        }
    }

    pub(crate) fn subscribe(&self, prefix: Bytes) {
        *self.subscriptions.lock().entry(prefix.clone()).or_insert(0) += 1;
        for sink in self.all_sinks() {
            sink.deliver(Command::Subscribe(prefix.clone()));
        }
    }

    /// 返回 `false` 表示此前并未订阅该前缀。
    pub(crate) fn unsubscribe(&self, prefix: &Bytes) -> bool {
        let removed = {
            let mut subscriptions = self.subscriptions.lock();
            let Some(count) = subscriptions.get_mut(prefix) else {
                return false;
            };
            *count -= 1;
            if *count == 0 {
                subscriptions.remove(prefix);
                true
            } else {
                false
            }
        };
        if removed {
            for sink in self.all_sinks() {
                sink.deliver(Command::Unsubscribe(prefix.clone()));
            }
        }
        true
    }

    fn all_sinks(&self) -> Vec<Arc<dyn PeerSink>> {
        self.links
            .lock()
            .links
            .values()
            .map(|link| Arc::clone(&link.sink))
            .collect()
    }

    pub(crate) async fn recv(&self, flags: Flags) -> Result<Received, WireError> {
        if flags.is_nonblocking() {
            let Ok(mut rx) = self.inbox_rx.try_lock() else {
                return Err(WireError::WouldBlock);
            };
            return match rx.try_recv() {
                Ok(received) => Ok(received),
                Err(mpsc::error::TryRecvError::Empty) if !self.is_closed() => {
                    Err(WireError::WouldBlock)
                }
                Err(_) => Err(WireError::Closed),
            };
        }
        let mut rx = self.inbox_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.closed() => Err(WireError::Closed),
            received = rx.recv() => received.ok_or(WireError::Closed),
        }
    }

    pub(crate) fn close(&self) {
        if self.closed.is_closed() {
            return;
        }
        self.closed.close();
        for (_, task) in self.connectors.lock().drain() {
            task.abort();
        }
        let bindings: Vec<Binding> = self.bindings.lock().drain(..).collect();
        drop(bindings);
        let pipes: Vec<PipeId> = self.links.lock().links.keys().copied().collect();
        for pipe in pipes {
            self.detach(pipe);
        }
        debug!(socket = ?self.kind, identity = %self.identity, "socket closed");
        *self.monitor.lock() = None;
    }
}

impl Drop for SocketCore {
    fn drop(&mut self) {
        self.close();
    }
}
