//! # spot 模块说明
//!
//! ## 角色定位（Why）
//! - [`SpotNode`] 持有节点的一对 PUB/SUB 套接字：PUB 对外广播本节点发布的主题消息，
//!   SUB 连接其他节点的 PUB 形成对等网格；拓扑可以手工维护，也可以经服务发现自动维护；
//! - [`Spot`] 是应用侧句柄，拥有独立的订阅集合与接收队列，同一节点上可以创建多个。
//!
//! ## 帧格式（What）
//! - `[主题, 头部(origin u64, seq u64), 业务帧…]`；
//! - `origin` 为节点启动时随机生成的标识，`seq` 在节点内按主题递增，主题销毁后也不回退；
//! - 接收端按 `(origin, 主题)` 记录已交付的最大序号，重放与重复投递据此丢弃。
//!
//! ## 保留模式
//! - `QUEUE`：不保留，晚到的订阅者看不到之前的消息；
//! - `RING_BUFFER`：每个主题保留最近 `ring_capacity` 条，新订阅者（本地或远端）会收到重放。
//!
//! ## 模式订阅
//! - 模式写作 `前缀*`，只支持末尾一个 `*`；单独的 `*` 匹配所有主题。

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use spark_wire::{
    Endpoint, Flags, Frames, LinkState, PubSocket, RoutingId, SocketEvent, SubSocket, WireContext,
    WireError,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ProviderConfig, SpotConfig};
use crate::discovery::Discovery;
use crate::error::MeshError;
use crate::provider::advertise_endpoint;
use crate::registration::{RegistrationClient, RegistrationResult, RegistrationState};
use crate::table::ServiceKind;
use crate::validate;

const COMPONENT: &str = "spot_node";
const HEADER_LEN: usize = 16;

/// 主题的保留模式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TopicMode {
    #[default]
    Queue,
    RingBuffer,
}

struct TopicState {
    mode: TopicMode,
    ring: VecDeque<Frames>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Matcher {
    Exact(String),
    Prefix(String),
}

impl Matcher {
    fn parse(text: &str) -> Self {
        match text.strip_suffix('*') {
            Some(prefix) => Matcher::Prefix(prefix.to_owned()),
            None => Matcher::Exact(text.to_owned()),
        }
    }

    fn matches(&self, topic: &str) -> bool {
        match self {
            Matcher::Exact(exact) => exact == topic,
            Matcher::Prefix(prefix) => topic.starts_with(prefix.as_str()),
        }
    }

    /// 传给 SUB 套接字的前缀过滤器。
    fn filter(&self) -> Bytes {
        match self {
            Matcher::Exact(text) | Matcher::Prefix(text) => Bytes::copy_from_slice(text.as_bytes()),
        }
    }
}

/// 一条解析后的主题消息。
struct TopicMessage {
    topic: String,
    origin: u64,
    seq: u64,
    parts: Frames,
}

impl TopicMessage {
    fn encode(&self) -> Frames {
        let mut header = BytesMut::with_capacity(HEADER_LEN);
        header.put_u64(self.origin);
        header.put_u64(self.seq);
        let mut frames = Vec::with_capacity(self.parts.len() + 2);
        frames.push(Bytes::copy_from_slice(self.topic.as_bytes()));
        frames.push(header.freeze());
        frames.extend(self.parts.iter().cloned());
        frames
    }

    fn decode(mut frames: Frames) -> Option<Self> {
        if frames.len() < 2 || frames[1].len() != HEADER_LEN {
            return None;
        }
        let parts = frames.split_off(2);
        let mut header = frames.pop()?;
        let topic = String::from_utf8(frames.pop()?.to_vec()).ok()?;
        let origin = header.get_u64();
        let seq = header.get_u64();
        Some(Self {
            topic,
            origin,
            seq,
            parts,
        })
    }
}

#[derive(Default)]
struct Peers {
    manual: BTreeSet<Endpoint>,
    discovered: BTreeSet<Endpoint>,
}

struct NodeInner {
    origin: u64,
    pub_socket: PubSocket,
    sub: SubSocket,
    client: RegistrationClient,
    config: SpotConfig,
    binding: AtomicBool,
    bound: Mutex<Option<Endpoint>>,
    registry_connected: AtomicBool,
    topics: Mutex<HashMap<String, TopicState>>,
    next_seq: Mutex<HashMap<String, u64>>,
    spots: Mutex<Vec<Weak<SpotShared>>>,
    peers: Mutex<Peers>,
    identity: RoutingId,
}

/// 主题网格节点。
///
/// # 教案式说明
/// - **意图 (Why)**：节点负责网格层面的事务：绑定广播端点、向注册中心登记、维护对等连接、
///   把收到的主题消息分发给本地的 [`Spot`] 句柄，并为新订阅者重放环形缓冲；
/// - **契约 (What)**：
///   - 登记语义与 `Provider` 相同，记录类型为 `SpotNode`，公布的是广播端点；
///   - [`SpotNode::connect_peer_pub`] 与经 [`SpotNode::set_discovery`] 自动发现的对端可以并存，
///     两者都撤销后才断开连接；
///   - 自动发现会排除节点自身的登记记录；
/// - **风险 (Trade-offs)**：投递是尽力而为：订阅声明到达对端之前发布的 `QUEUE` 消息不会被收到，
///   重放与实时消息交错时较早的重放消息可能因序号落后被丢弃。
pub struct SpotNode {
    inner: Arc<NodeInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SpotNode {
    pub fn new(wire: &WireContext) -> Self {
        Self::with_config(wire, &SpotConfig::default(), &ProviderConfig::default())
    }

    pub fn with_config(wire: &WireContext, config: &SpotConfig, provider: &ProviderConfig) -> Self {
        let identity = RoutingId::random();
        let pub_socket = wire.pub_socket();
        let events = pub_socket.monitor();
        let inner = Arc::new(NodeInner {
            origin: rand::rng().random(),
            pub_socket,
            sub: wire.sub_socket(),
            client: RegistrationClient::new(
                wire,
                identity.clone(),
                ServiceKind::SpotNode,
                COMPONENT,
                provider.heartbeat_interval(),
            ),
            config: config.clone(),
            binding: AtomicBool::new(false),
            bound: Mutex::new(None),
            registry_connected: AtomicBool::new(false),
            topics: Mutex::new(HashMap::new()),
            next_seq: Mutex::new(HashMap::new()),
            spots: Mutex::new(Vec::new()),
            peers: Mutex::new(Peers::default()),
            identity,
        });
        let receiver = tokio::spawn(Arc::clone(&inner).receive_loop());
        let replayer = tokio::spawn(Arc::clone(&inner).replay_loop(events));
        Self {
            inner,
            tasks: Mutex::new(vec![receiver, replayer]),
        }
    }

    /// 节点消息头中的来源标识。
    pub fn origin(&self) -> u64 {
        self.inner.origin
    }

    /// 登记记录使用的路由标识。
    pub fn routing_id(&self) -> &RoutingId {
        &self.inner.identity
    }

    /// 绑定广播端点，返回实际端点。每个节点只能绑定一次。
    pub async fn bind(&self, endpoint: &str) -> Result<Endpoint, MeshError> {
        validate::endpoint(endpoint)?;
        if self.inner.binding.swap(true, Ordering::AcqRel) {
            return Err(MeshError::conflict(
                "spot node",
                self.inner.identity.to_string(),
                "already bound",
            ));
        }
        match self.inner.pub_socket.bind(endpoint).await {
            Ok(resolved) => {
                self.inner.client.set_bind_epoch(rand::rng().random());
                *self.inner.bound.lock() = Some(resolved.clone());
                info!(origin = self.inner.origin, endpoint = %resolved, "spot node bound");
                Ok(resolved)
            }
            Err(err) => {
                self.inner.binding.store(false, Ordering::Release);
                Err(err.into())
            }
        }
    }

    pub fn bound_endpoint(&self) -> Option<Endpoint> {
        self.inner.bound.lock().clone()
    }

    pub fn connect_registry(&self, endpoint: &str) -> Result<(), MeshError> {
        self.inner.client.connect(endpoint)?;
        self.inner.registry_connected.store(true, Ordering::Release);
        Ok(())
    }

    /// 以 `SpotNode` 类型登记广播端点；公布端点为空时使用绑定端点。
    pub fn register(&self, service: &str, advertise: &str, weight: u32) -> Result<(), MeshError> {
        validate::service_name(service)?;
        let endpoint = advertise_endpoint(advertise, self.bound_endpoint(), COMPONENT)?;
        if !self.inner.registry_connected.load(Ordering::Acquire) {
            return Err(MeshError::NotReady {
                component: COMPONENT,
                reason: "connect_registry has not been called",
            });
        }
        self.inner.client.register(service, endpoint, weight);
        Ok(())
    }

    pub fn register_result(&self, service: &str) -> Result<RegistrationState, MeshError> {
        self.inner.client.result(service)
    }

    pub async fn wait_registered(
        &self,
        service: &str,
        timeout: Duration,
    ) -> Result<RegistrationResult, MeshError> {
        self.inner.client.wait(service, timeout).await
    }

    pub fn unregister(&self, service: &str) -> Result<(), MeshError> {
        self.inner.client.unregister(service)
    }

    /// 手工连接对端节点的广播端点。
    pub fn connect_peer_pub(&self, endpoint: &str) -> Result<(), MeshError> {
        let endpoint = validate::endpoint(endpoint)?;
        let mut peers = self.inner.peers.lock();
        if !peers.manual.insert(endpoint.clone()) || peers.discovered.contains(&endpoint) {
            return Ok(());
        }
        self.inner.sub.connect(&endpoint.to_string())?;
        info!(origin = self.inner.origin, peer = %endpoint, "peer connected");
        Ok(())
    }

    pub fn disconnect_peer_pub(&self, endpoint: &str) -> Result<(), MeshError> {
        let endpoint = validate::endpoint(endpoint)?;
        let mut peers = self.inner.peers.lock();
        if !peers.manual.remove(&endpoint) {
            return Err(MeshError::not_found("peer", endpoint.to_string()));
        }
        if !peers.discovered.contains(&endpoint) {
            self.inner.sub.disconnect(&endpoint.to_string())?;
            info!(origin = self.inner.origin, peer = %endpoint, "peer disconnected");
        }
        Ok(())
    }

    /// 当前连接的全部对端（手工与自动发现的并集）。
    pub fn peers(&self) -> Vec<Endpoint> {
        let peers = self.inner.peers.lock();
        peers.manual.union(&peers.discovered).cloned().collect()
    }

    /// 经服务发现自动维护对端：连接新出现的节点，断开被撤回的节点。
    pub fn set_discovery(&self, discovery: Discovery, service: &str) -> Result<(), MeshError> {
        validate::service_name(service)?;
        discovery.subscribe(service)?;
        let updates = discovery.updates();
        let task = tokio::spawn(Arc::clone(&self.inner).follow_discovery(
            discovery,
            service.to_owned(),
            updates,
        ));
        self.tasks.lock().push(task);
        Ok(())
    }

    pub fn pub_socket(&self) -> &PubSocket {
        &self.inner.pub_socket
    }

    pub fn sub_socket(&self) -> &SubSocket {
        &self.inner.sub
    }

    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.client.close();
        self.inner.sub.close();
        self.inner.pub_socket.close();
        for spot in self.inner.live_spots() {
            spot.close();
        }
    }
}

impl Drop for SpotNode {
    fn drop(&mut self) {
        self.close();
    }
}

impl NodeInner {
    fn live_spots(&self) -> Vec<Arc<SpotShared>> {
        let mut spots = self.spots.lock();
        spots.retain(|spot| spot.strong_count() > 0);
        spots.iter().filter_map(Weak::upgrade).collect()
    }

    fn fan_out(&self, message: &TopicMessage) {
        for spot in self.live_spots() {
            if spot.matches(&message.topic) {
                spot.offer(message.origin, &message.topic, message.seq, message.parts.clone());
            }
        }
    }

    /// 取出环形缓冲中主题满足 `keep` 的消息，按主题内顺序排列。
    fn retained(&self, mut keep: impl FnMut(&str) -> bool) -> Vec<Frames> {
        self.topics
            .lock()
            .iter()
            .filter(|(topic, state)| state.mode == TopicMode::RingBuffer && keep(topic))
            .flat_map(|(_, state)| state.ring.iter().cloned())
            .collect()
    }

    /// 持有主题表锁完成编号、保留、本地分发与广播，同一主题的消息按序号出站。
    fn publish(&self, topic: &str, parts: Frames) -> Result<usize, MeshError> {
        let mut topics = self.topics.lock();
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| MeshError::not_found("topic", topic))?;
        let seq = {
            let mut next = self.next_seq.lock();
            let seq = next.entry(topic.to_owned()).or_default();
            *seq += 1;
            *seq
        };
        let message = TopicMessage {
            topic: topic.to_owned(),
            origin: self.origin,
            seq,
            parts,
        };
        let frames = message.encode();
        if state.mode == TopicMode::RingBuffer {
            state.ring.push_back(frames.clone());
            while state.ring.len() > self.config.ring_capacity {
                state.ring.pop_front();
            }
        }
        self.fan_out(&message);
        Ok(self.pub_socket.publish(frames)?)
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            let frames = match self.sub.recv(Flags::NONE).await {
                Ok(frames) => frames,
                Err(WireError::Closed) => break,
                Err(err) => {
                    warn!(origin = self.origin, error = %err, "spot receive failed");
                    continue;
                }
            };
            let Some(message) = TopicMessage::decode(frames) else {
                warn!(origin = self.origin, "malformed topic message dropped");
                continue;
            };
            if message.origin != self.origin {
                self.fan_out(&message);
            }
        }
        debug!(origin = self.origin, "spot receive loop stopped");
    }

    /// 远端订阅到达时，把匹配前缀的保留消息定向发给该订阅者。
    async fn replay_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
        while let Some(event) = events.recv().await {
            let SocketEvent::Subscribed { pipe, prefix } = event else {
                continue;
            };
            let retained = self.retained(|topic| topic.as_bytes().starts_with(&prefix));
            if retained.is_empty() {
                continue;
            }
            debug!(origin = self.origin, pipe, messages = retained.len(), "replaying retained messages");
            for frames in retained {
                if let Err(err) = self.pub_socket.send_to_subscriber(pipe, frames) {
                    debug!(origin = self.origin, pipe, error = %err, "replay interrupted");
                    break;
                }
            }
        }
    }

    async fn follow_discovery(
        self: Arc<Self>,
        discovery: Discovery,
        service: String,
        mut updates: tokio::sync::broadcast::Receiver<String>,
    ) {
        self.reconcile_peers(&discovery, &service);
        loop {
            match updates.recv().await {
                Ok(changed) if changed == service => self.reconcile_peers(&discovery, &service),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => self.reconcile_peers(&discovery, &service),
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn reconcile_peers(&self, discovery: &Discovery, service: &str) {
        let wanted: BTreeSet<Endpoint> = discovery
            .get_providers(service)
            .into_iter()
            .filter(|record| record.kind == ServiceKind::SpotNode && record.routing_id != self.identity)
            .filter_map(|record| record.endpoint.parse().ok())
            .collect();
        let mut peers = self.peers.lock();
        let added: Vec<Endpoint> = wanted.difference(&peers.discovered).cloned().collect();
        let removed: Vec<Endpoint> = peers.discovered.difference(&wanted).cloned().collect();
        for endpoint in added {
            if !peers.manual.contains(&endpoint) {
                if let Err(err) = self.sub.connect(&endpoint.to_string()) {
                    warn!(origin = self.origin, peer = %endpoint, error = %err, "discovered peer not connected");
                    continue;
                }
            }
            info!(origin = self.origin, peer = %endpoint, "discovered peer connected");
            peers.discovered.insert(endpoint);
        }
        for endpoint in removed {
            peers.discovered.remove(&endpoint);
            if !peers.manual.contains(&endpoint) {
                let _ = self.sub.disconnect(&endpoint.to_string());
            }
            info!(origin = self.origin, peer = %endpoint, "retracted peer disconnected");
        }
    }
}

struct SpotShared {
    matchers: Mutex<BTreeSet<Matcher>>,
    queue: Mutex<VecDeque<(String, Frames)>>,
    seen: Mutex<HashMap<(u64, String), u64>>,
    arrived: Notify,
    closed: Arc<LinkState>,
    hwm: usize,
}

impl SpotShared {
    fn matches(&self, topic: &str) -> bool {
        self.matchers.lock().iter().any(|matcher| matcher.matches(topic))
    }

    fn offer(&self, origin: u64, topic: &str, seq: u64, parts: Frames) {
        if self.closed.is_closed() {
            return;
        }
        {
            let mut seen = self.seen.lock();
            let high = seen.entry((origin, topic.to_owned())).or_default();
            if seq <= *high {
                return;
            }
            *high = seq;
        }
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.hwm {
                warn!(topic, hwm = self.hwm, "spot queue full, message dropped");
                return;
            }
            queue.push_back((topic.to_owned(), parts));
        }
        self.arrived.notify_waiters();
    }

    fn close(&self) {
        self.closed.close();
        self.queue.lock().clear();
    }
}

/// 主题收发句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：应用通过 Spot 创建主题、发布消息、声明订阅并接收匹配的消息；
/// - **契约 (What)**：
///   - 主题表属于节点，同一节点上的所有 Spot 共享；订阅集合与接收队列属于各自的 Spot；
///   - 精确订阅与模式订阅都会向已连接的对端声明前缀，对端据此过滤并重放保留消息；
///   - 接收队列达到高水位后丢弃新消息并告警；
///   - [`Spot::close`] 唤醒阻塞中的 [`Spot::recv`] 并返回 [`MeshError::Closed`]。
pub struct Spot {
    node: Arc<NodeInner>,
    shared: Arc<SpotShared>,
}

impl Spot {
    pub fn new(node: &SpotNode) -> Self {
        let shared = Arc::new(SpotShared {
            matchers: Mutex::new(BTreeSet::new()),
            queue: Mutex::new(VecDeque::new()),
            seen: Mutex::new(HashMap::new()),
            arrived: Notify::new(),
            closed: LinkState::new(),
            hwm: node.inner.config.queue_hwm,
        });
        node.inner.spots.lock().push(Arc::downgrade(&shared));
        Self {
            node: Arc::clone(&node.inner),
            shared,
        }
    }

    pub fn topic_create(&self, topic: &str, mode: TopicMode) -> Result<(), MeshError> {
        validate::topic(topic)?;
        let mut topics = self.node.topics.lock();
        if topics.contains_key(topic) {
            return Err(MeshError::conflict("topic", topic, "already exists"));
        }
        topics.insert(
            topic.to_owned(),
            TopicState {
                mode,
                ring: VecDeque::new(),
            },
        );
        debug!(topic, ?mode, "topic created");
        Ok(())
    }

    pub fn topic_destroy(&self, topic: &str) -> Result<(), MeshError> {
        self.node
            .topics
            .lock()
            .remove(topic)
            .map(|_| debug!(topic, "topic destroyed"))
            .ok_or_else(|| MeshError::not_found("topic", topic))
    }

    pub fn topic_mode(&self, topic: &str) -> Option<TopicMode> {
        self.node.topics.lock().get(topic).map(|state| state.mode)
    }

    /// 发布到本节点创建的主题，返回投递到的远端订阅链路数。
    pub fn publish(&self, topic: &str, parts: Frames) -> Result<usize, MeshError> {
        if self.shared.closed.is_closed() {
            return Err(MeshError::Closed);
        }
        if parts.is_empty() {
            return Err(MeshError::validation("parts", "message has no frames"));
        }
        self.node.publish(topic, parts)
    }

    pub fn subscribe(&self, topic: &str) -> Result<(), MeshError> {
        validate::topic(topic)?;
        self.add_matcher(Matcher::Exact(topic.to_owned()))
    }

    /// 订阅 `前缀*` 形式的模式。
    pub fn subscribe_pattern(&self, pattern: &str) -> Result<(), MeshError> {
        let valid = pattern
            .strip_suffix('*')
            .is_some_and(|prefix| !prefix.contains('*') && prefix.len() < validate::MAX_NAME_LEN);
        if !valid {
            return Err(MeshError::validation(
                "pattern",
                "patterns are a prefix followed by a single trailing `*`",
            ));
        }
        self.add_matcher(Matcher::parse(pattern))
    }

    /// 取消精确订阅或模式订阅（模式需带末尾 `*`）。
    pub fn unsubscribe(&self, topic_or_pattern: &str) -> Result<(), MeshError> {
        let matcher = Matcher::parse(topic_or_pattern);
        if !self.shared.matchers.lock().remove(&matcher) {
            return Err(MeshError::not_found("subscription", topic_or_pattern));
        }
        self.node.sub.unsubscribe(matcher.filter())?;
        debug!(subscription = topic_or_pattern, "spot unsubscribed");
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.shared
            .matchers
            .lock()
            .iter()
            .map(|matcher| match matcher {
                Matcher::Exact(topic) => topic.clone(),
                Matcher::Prefix(prefix) => format!("{prefix}*"),
            })
            .collect()
    }

    /// 接收下一条匹配的消息，返回 `(主题, 业务帧)`。
    pub async fn recv(&self, flags: Flags) -> Result<(String, Frames), MeshError> {
        loop {
            let arrived = self.shared.arrived.notified();
            if self.shared.closed.is_closed() {
                return Err(MeshError::Closed);
            }
            if let Some(message) = self.shared.queue.lock().pop_front() {
                return Ok(message);
            }
            if flags.is_nonblocking() {
                return Err(MeshError::WouldBlock);
            }
            tokio::select! {
                _ = arrived => {}
                _ = self.shared.closed.closed() => {}
            }
        }
    }

    pub fn close(&self) {
        let filters: Vec<Bytes> = self
            .shared
            .matchers
            .lock()
            .iter()
            .map(Matcher::filter)
            .collect();
        if self.shared.closed.is_closed() {
            return;
        }
        self.shared.close();
        self.shared.matchers.lock().clear();
        for filter in filters {
            let _ = self.node.sub.unsubscribe(filter);
        }
    }

    fn add_matcher(&self, matcher: Matcher) -> Result<(), MeshError> {
        if self.shared.closed.is_closed() {
            return Err(MeshError::Closed);
        }
        if !self.shared.matchers.lock().insert(matcher.clone()) {
            return Ok(());
        }
        self.node.sub.subscribe(matcher.filter())?;
        for frames in self.node.retained(|topic| matcher.matches(topic)) {
            if let Some(message) = TopicMessage::decode(frames) {
                self.shared
                    .offer(message.origin, &message.topic, message.seq, message.parts);
            }
        }
        debug!(subscription = ?matcher, "spot subscribed");
        Ok(())
    }
}

impl Drop for Spot {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matchers_distinguish_exact_and_prefix() {
        assert!(Matcher::parse("a").matches("a"));
        assert!(!Matcher::parse("a").matches("ab"));
        assert!(Matcher::parse("a*").matches("ab"));
        assert!(Matcher::parse("*").matches("anything"));
        assert!(!Matcher::parse("b*").matches("a"));
    }

    #[test]
    fn topic_frames_carry_origin_and_sequence() {
        let message = TopicMessage {
            topic: "t".to_owned(),
            origin: 7,
            seq: 3,
            parts: vec![Bytes::from_static(b"m")],
        };
        let decoded = TopicMessage::decode(message.encode()).expect("解码主题消息");
        assert_eq!(decoded.topic, "t");
        assert_eq!((decoded.origin, decoded.seq), (7, 3));
        assert_eq!(decoded.parts, vec![Bytes::from_static(b"m")]);
        assert!(TopicMessage::decode(vec![Bytes::from_static(b"t")]).is_none());
        assert!(
            TopicMessage::decode(vec![Bytes::from_static(b"t"), Bytes::from_static(b"short")])
                .is_none()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_spots_receive_matching_topics_only() {
        let wire = WireContext::new();
        let node = SpotNode::new(&wire);
        let publisher = Spot::new(&node);
        let exact = Spot::new(&node);
        let pattern = Spot::new(&node);
        publisher.topic_create("a", TopicMode::Queue).expect("创建主题 a");
        publisher.topic_create("ab", TopicMode::Queue).expect("创建主题 ab");
        exact.subscribe("b").expect("订阅 b");
        pattern.subscribe_pattern("a*").expect("订阅 a*");

        publisher.publish("a", vec![Bytes::from_static(b"1")]).expect("发布到 a");
        publisher.publish("ab", vec![Bytes::from_static(b"2")]).expect("发布到 ab");

        assert!(matches!(exact.recv(Flags::DONTWAIT).await, Err(MeshError::WouldBlock)));
        let (topic, _) = pattern.recv(Flags::DONTWAIT).await.expect("收到 a");
        assert_eq!(topic, "a");
        let (topic, _) = pattern.recv(Flags::DONTWAIT).await.expect("收到 ab");
        assert_eq!(topic, "ab");
        node.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn topic_lifecycle_errors() {
        let wire = WireContext::new();
        let node = SpotNode::new(&wire);
        let spot = Spot::new(&node);
        assert!(matches!(
            spot.publish("missing", vec![Bytes::from_static(b"x")]),
            Err(MeshError::NotFound { .. })
        ));
        spot.topic_create("t", TopicMode::RingBuffer).expect("创建主题");
        assert!(matches!(
            spot.topic_create("t", TopicMode::Queue),
            Err(MeshError::Conflict { .. })
        ));
        assert_eq!(spot.topic_mode("t"), Some(TopicMode::RingBuffer));
        spot.topic_destroy("t").expect("销毁主题");
        assert!(matches!(spot.topic_destroy("t"), Err(MeshError::NotFound { .. })));
        assert!(matches!(spot.unsubscribe("t"), Err(MeshError::NotFound { .. })));
        assert!(matches!(
            spot.subscribe_pattern("a*b"),
            Err(MeshError::Validation { .. })
        ));
        assert!(matches!(spot.subscribe("a*"), Err(MeshError::Validation { .. })));
        assert!(matches!(
            node.disconnect_peer_pub("inproc://nobody"),
            Err(MeshError::NotFound { .. })
        ));
        node.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ring_buffer_replays_to_late_local_subscriber() {
        let wire = WireContext::new();
        let node = SpotNode::with_config(
            &wire,
            &SpotConfig {
                ring_capacity: 2,
                ..SpotConfig::default()
            },
            &ProviderConfig::default(),
        );
        let spot = Spot::new(&node);
        spot.topic_create("r", TopicMode::RingBuffer).expect("创建主题");
        for body in [b"1", b"2", b"3"] {
            spot.publish("r", vec![Bytes::copy_from_slice(body)]).expect("发布");
        }
        let late = Spot::new(&node);
        late.subscribe("r").expect("订阅");
        let (_, first) = late.recv(Flags::DONTWAIT).await.expect("重放第一条");
        let (_, second) = late.recv(Flags::DONTWAIT).await.expect("重放第二条");
        assert_eq!(first, vec![Bytes::from_static(b"2")]);
        assert_eq!(second, vec![Bytes::from_static(b"3")]);
        assert!(matches!(late.recv(Flags::DONTWAIT).await, Err(MeshError::WouldBlock)));
        late.close();
        assert!(matches!(late.recv(Flags::NONE).await, Err(MeshError::Closed)));
        node.close();
    }
}
