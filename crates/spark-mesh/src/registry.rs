//! # registry 模块说明
//!
//! ## 角色定位（Why）
//! - 注册中心是服务目录的权威来源：ROUTER 端点接收服务实例的登记、注销、权重更新与心跳，
//!   PUB 端点向发现端与其他注册中心广播目录变化；
//! - 多个注册中心通过 SUB 端点互相订阅，按 LWW 规则合并彼此的记录，最终收敛到同一目录。
//!
//! ## 运行模型（How）
//! - `start` 之后所有状态只由一个后台任务修改：控制请求、对端广播、订阅事件与各类定时器
//!   在同一个 `select!` 循环中串行处理，目录表额外放在互斥锁后面供只读查询；
//! - 变更先进入待发送队列，广播间隔到期后合并成一条增量；
//! - 周期快照同时作为信标，新订阅者会立即收到一份定向快照。
//!
//! ## 契约（What）
//! - `set_*` 类配置只能在 `start` 之前调用，之后返回 [`MeshError::NotReady`]；`add_peer` 例外；
//! - 心跳超时的实例被驱逐并广播撤回；
//! - 对端沉默超过三个快照周期，其担保的记录被移除。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use spark_wire::{
    Endpoint, Flags, Frames, PipeId, PubSocket, RouterSocket, RoutingId, SocketEvent, SubSocket,
    WireContext, WireError,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, info, trace, warn};

use crate::config::{self, RegistryConfig};
use crate::error::MeshError;
use crate::gossip::{Sequence, SourceTracker};
use crate::protocol::{
    Change, Delta, Message, RegisterAck, RegisterRequest, Snapshot, message_id, status,
};
use crate::table::{ProviderRecord, RegistryId, ServiceTable, Stamp, wall_clock_ms};
use crate::validate;

const COMPONENT: &str = "registry";

/// 服务注册中心。
///
/// # 教案式说明
/// - **意图 (Why)**：为服务实例提供登记入口，为发现端与其他注册中心提供目录广播；
/// - **契约 (What)**：
///   - 生命周期为“配置 → [`Registry::start`] → [`Registry::close`]”，关闭后不可重启；
///   - 所有查询方法在任何阶段都可调用，未启动时目录为空；
/// - **风险 (Trade-offs)**：登记时间取挂钟毫秒，注册中心之间的时钟偏差会影响 LWW 判定，
///   修订号与注册中心标识只在登记时间相同时参与比较。
pub struct Registry {
    wire: WireContext,
    state: Mutex<Lifecycle>,
    table: Arc<Mutex<ServiceTable>>,
    closing: Arc<AtomicBool>,
    id: Mutex<RegistryId>,
}

enum Lifecycle {
    Configuring(RegistryConfig),
    Starting,
    Running(Running),
    Closed,
}

struct Running {
    pub_endpoint: Endpoint,
    router_endpoint: Endpoint,
    peers: BTreeSet<Endpoint>,
    pub_socket: Arc<PubSocket>,
    router: Arc<RouterSocket>,
    sub: Arc<SubSocket>,
    task: JoinHandle<()>,
}

impl Registry {
    pub fn new(wire: &WireContext) -> Self {
        Self {
            wire: wire.clone(),
            state: Mutex::new(Lifecycle::Configuring(RegistryConfig::default())),
            table: Arc::new(Mutex::new(ServiceTable::new())),
            closing: Arc::new(AtomicBool::new(false)),
            id: Mutex::new(rand::rng().random_range(1..=u32::MAX)),
        }
    }

    /// 按配置段构造；端点为空时仍需在启动前调用 [`Registry::set_endpoints`]。
    pub fn from_config(wire: &WireContext, config: &RegistryConfig) -> Result<Self, MeshError> {
        config.validate()?;
        for peer in &config.peers {
            validate::endpoint(peer)?;
        }
        let registry = Self::new(wire);
        if let Some(id) = config.id {
            *registry.id.lock() = id;
        }
        if !config.pub_endpoint.is_empty() || !config.router_endpoint.is_empty() {
            validate::endpoint(&config.pub_endpoint)?;
            validate::endpoint(&config.router_endpoint)?;
        }
        *registry.state.lock() = Lifecycle::Configuring(config.clone());
        Ok(registry)
    }

    pub fn id(&self) -> RegistryId {
        *self.id.lock()
    }

    /// 固定注册中心标识，`0` 保留不用。
    pub fn set_id(&self, id: RegistryId) -> Result<(), MeshError> {
        if id == 0 {
            return Err(MeshError::validation("registry.id", "must be non-zero"));
        }
        self.configure(|config| config.id = Some(id))?;
        *self.id.lock() = id;
        Ok(())
    }

    pub fn set_endpoints(&self, pub_endpoint: &str, router_endpoint: &str) -> Result<(), MeshError> {
        validate::endpoint(pub_endpoint)?;
        validate::endpoint(router_endpoint)?;
        self.configure(|config| {
            config.pub_endpoint = pub_endpoint.to_owned();
            config.router_endpoint = router_endpoint.to_owned();
        })
    }

    pub fn set_heartbeat(&self, interval_ms: u64, timeout_ms: u64) -> Result<(), MeshError> {
        config::validate_heartbeat(interval_ms, timeout_ms)?;
        self.configure(|config| {
            config.heartbeat_interval_ms = interval_ms;
            config.heartbeat_timeout_ms = timeout_ms;
        })
    }

    pub fn set_broadcast_interval(&self, interval_ms: u64) -> Result<(), MeshError> {
        config::positive("registry.broadcast_interval_ms", interval_ms)?;
        self.configure(|config| config.broadcast_interval_ms = interval_ms)
    }

    pub fn set_snapshot_interval(&self, interval_ms: u64) -> Result<(), MeshError> {
        config::positive("registry.snapshot_interval_ms", interval_ms)?;
        self.configure(|config| config.snapshot_interval_ms = interval_ms)
    }

    /// 订阅另一注册中心的广播端点。启动前后均可调用，重复添加无副作用。
    pub fn add_peer(&self, endpoint: &str) -> Result<(), MeshError> {
        let parsed = validate::endpoint(endpoint)?;
        let mut state = self.state.lock();
        match &mut *state {
            Lifecycle::Configuring(config) => {
                if !config.peers.iter().any(|peer| peer == endpoint) {
                    config.peers.push(endpoint.to_owned());
                }
                Ok(())
            }
            Lifecycle::Running(running) => {
                if running.peers.insert(parsed.clone()) {
                    running.sub.connect(endpoint)?;
                    info!(registry = self.id(), peer = %parsed, "peer registry added");
                }
                Ok(())
            }
            Lifecycle::Starting => Err(MeshError::NotReady {
                component: COMPONENT,
                reason: "registry is starting",
            }),
            Lifecycle::Closed => Err(MeshError::Closed),
        }
    }

    /// 绑定广播与控制端点、连接已知对端并启动事件循环。
    pub async fn start(&self) -> Result<(), MeshError> {
        let config = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, Lifecycle::Starting) {
                Lifecycle::Configuring(config) => {
                    if config.pub_endpoint.is_empty() || config.router_endpoint.is_empty() {
                        *state = Lifecycle::Configuring(config);
                        return Err(MeshError::NotReady {
                            component: COMPONENT,
                            reason: "endpoints are not set",
                        });
                    }
                    config
                }
                Lifecycle::Closed => {
                    *state = Lifecycle::Closed;
                    return Err(MeshError::Closed);
                }
                other => {
                    *state = other;
                    return Err(MeshError::NotReady {
                        component: COMPONENT,
                        reason: "registry is already started",
                    });
                }
            }
        };

        match self.launch(&config).await {
            Ok(running) => {
                let mut state = self.state.lock();
                if matches!(*state, Lifecycle::Closed) {
                    running.shutdown();
                    return Err(MeshError::Closed);
                }
                info!(
                    registry = self.id(),
                    pub_endpoint = %running.pub_endpoint,
                    router_endpoint = %running.router_endpoint,
                    peers = running.peers.len(),
                    "registry started"
                );
                *state = Lifecycle::Running(running);
                Ok(())
            }
            Err(err) => {
                let mut state = self.state.lock();
                if matches!(*state, Lifecycle::Starting) {
                    *state = Lifecycle::Configuring(config);
                }
                Err(err)
            }
        }
    }

    async fn launch(&self, config: &RegistryConfig) -> Result<Running, MeshError> {
        let id = self.id();
        let pub_socket = Arc::new(self.wire.pub_socket());
        let events = pub_socket.monitor();
        let router = Arc::new(
            self.wire
                .router_socket(RoutingId::try_from(format!("registry-{id:08x}").as_str())?),
        );
        let sub = Arc::new(self.wire.sub_socket());

        let bound = async {
            let pub_endpoint = pub_socket.bind(&config.pub_endpoint).await?;
            let router_endpoint = router.bind(&config.router_endpoint).await?;
            sub.subscribe("")?;
            let mut peers = BTreeSet::new();
            for peer in &config.peers {
                peers.insert(sub.connect(peer)?);
            }
            Ok::<_, WireError>((pub_endpoint, router_endpoint, peers))
        }
        .await;
        let (pub_endpoint, router_endpoint, peers) = match bound {
            Ok(bound) => bound,
            Err(err) => {
                pub_socket.close();
                router.close();
                sub.close();
                warn!(registry = id, error = %err, code = err.code(), "registry failed to start");
                return Err(err.into());
            }
        };

        let core = RegistryLoop {
            id,
            incarnation: rand::rng().random(),
            seq: 0,
            revision: 0,
            config: config.clone(),
            table: Arc::clone(&self.table),
            owned: HashMap::new(),
            liveness: HashMap::new(),
            peers: SourceTracker::new(config.snapshot_interval()),
            silenced: HashSet::new(),
            pending: Vec::new(),
            flush_at: None,
            snapshot_due: false,
            pub_socket: Arc::clone(&pub_socket),
            router: Arc::clone(&router),
            sub: Arc::clone(&sub),
            closing: Arc::clone(&self.closing),
        };
        let task = tokio::spawn(core.run(events).in_current_span());
        Ok(Running {
            pub_endpoint,
            router_endpoint,
            peers,
            pub_socket,
            router,
            sub,
            task,
        })
    }

    /// 广播端点的实际地址（TCP 端口为 0 时已替换为内核分配的端口）。
    pub fn pub_endpoint(&self) -> Option<Endpoint> {
        match &*self.state.lock() {
            Lifecycle::Running(running) => Some(running.pub_endpoint.clone()),
            _ => None,
        }
    }

    pub fn router_endpoint(&self) -> Option<Endpoint> {
        match &*self.state.lock() {
            Lifecycle::Running(running) => Some(running.router_endpoint.clone()),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), Lifecycle::Running(_))
    }

    pub fn provider_count(&self, service: &str) -> usize {
        self.table.lock().provider_count(service)
    }

    pub fn providers(&self, service: &str) -> Vec<ProviderRecord> {
        self.table.lock().providers(service)
    }

    pub fn services(&self) -> Vec<String> {
        self.table.lock().services()
    }

    /// 停止事件循环并关闭所有端点。幂等。
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
        let previous = std::mem::replace(&mut *self.state.lock(), Lifecycle::Closed);
        if let Lifecycle::Running(running) = previous {
            running.shutdown();
            info!(registry = self.id(), "registry closed");
        }
    }

    fn configure(&self, apply: impl FnOnce(&mut RegistryConfig)) -> Result<(), MeshError> {
        match &mut *self.state.lock() {
            Lifecycle::Configuring(config) => {
                apply(config);
                Ok(())
            }
            Lifecycle::Closed => Err(MeshError::Closed),
            _ => Err(MeshError::NotReady {
                component: COMPONENT,
                reason: "settings cannot change after start",
            }),
        }
    }
}

impl Running {
    fn shutdown(self) {
        self.router.close();
        self.sub.close();
        self.pub_socket.close();
        self.task.abort();
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.close();
    }
}

/// 本注册中心直接接受的登记所附带的元数据。
#[derive(Clone, Copy, Debug)]
struct Owned {
    bind_epoch: u64,
}

/// 事件循环持有的全部可变状态。
struct RegistryLoop {
    id: RegistryId,
    incarnation: u64,
    seq: u64,
    revision: u64,
    config: RegistryConfig,
    table: Arc<Mutex<ServiceTable>>,
    owned: HashMap<(String, RoutingId), Owned>,
    liveness: HashMap<RoutingId, Instant>,
    peers: SourceTracker,
    /// 因沉默被判定失联的注册中心；其起源的记录不再接受，直到它重新出现。
    silenced: HashSet<RegistryId>,
    pending: Vec<Change>,
    flush_at: Option<Instant>,
    snapshot_due: bool,
    pub_socket: Arc<PubSocket>,
    router: Arc<RouterSocket>,
    sub: Arc<SubSocket>,
    closing: Arc<AtomicBool>,
}

impl RegistryLoop {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
        let router = Arc::clone(&self.router);
        let sub = Arc::clone(&self.sub);
        // 对端失联按快照周期判定，清扫不能比快照更稀疏。
        let sweep_every = self
            .config
            .heartbeat_interval()
            .min(self.config.snapshot_interval());
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut snapshots = tokio::time::interval(self.config.snapshot_interval());
        snapshots.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flush_at = self.flush_at;
            tokio::select! {
                received = router.recv(Flags::NONE) => match received {
                    Ok((identity, frames)) => self.on_control(identity, &frames),
                    Err(WireError::Closed) => break,
                    Err(err) => warn!(registry = self.id, error = %err, "control receive failed"),
                },
                received = sub.recv(Flags::NONE) => match received {
                    Ok(frames) => self.on_gossip(&frames),
                    Err(WireError::Closed) => break,
                    Err(err) => warn!(registry = self.id, error = %err, "gossip receive failed"),
                },
                Some(event) = events.recv() => self.on_event(event),
                _ = wait_until(flush_at) => self.flush(),
                _ = sweep.tick() => self.sweep(),
                _ = snapshots.tick() => self.publish_snapshot(None),
            }
        }
        debug!(registry = self.id, "registry loop stopped");
    }

    fn on_control(&mut self, identity: RoutingId, frames: &Frames) {
        let now = Instant::now();
        self.liveness.insert(identity.clone(), now);
        let message = match Message::from_frames(frames) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    registry = self.id,
                    peer = %identity,
                    error = %err,
                    "malformed control message dropped"
                );
                return;
            }
        };
        match message {
            Message::Register(request) => self.on_register(identity, request),
            Message::Unregister { service } => self.on_unregister(identity, service, now),
            Message::UpdateWeight { service, weight } => {
                self.on_update_weight(identity, service, weight)
            }
            Message::Heartbeat => self.on_heartbeat(identity),
            other => warn!(
                registry = self.id,
                peer = %identity,
                message_id = other.id(),
                "unexpected control message dropped"
            ),
        }
    }

    fn on_register(&mut self, identity: RoutingId, request: RegisterRequest) {
        let op = message_id::REGISTER;
        if self.closing.load(Ordering::Acquire) {
            self.reply(&identity, op, &request.service, status::NOT_READY, "", "registry is closing");
            return;
        }
        if let Err(err) = validate::service_name(&request.service)
            .and_then(|()| validate::endpoint(&request.endpoint).map(drop))
        {
            self.reply(
                &identity,
                op,
                &request.service,
                status::MALFORMED,
                "",
                &err.to_string(),
            );
            return;
        }

        let key = (request.service.clone(), identity.clone());
        let displaced = self
            .table
            .lock()
            .find_endpoint(&request.service, &request.endpoint)
            .filter(|holder| holder.routing_id != identity)
            .cloned();
        if let Some(holder) = displaced {
            self.owned
                .remove(&(holder.service.clone(), holder.routing_id.clone()));
            self.retract_record(&holder, Instant::now());
            info!(
                registry = self.id,
                service = %holder.service,
                endpoint = %holder.endpoint,
                old_routing_id = %holder.routing_id,
                new_routing_id = %identity,
                "endpoint taken over by newer registration"
            );
        }

        let record = {
            let mut table = self.table.lock();
            let existing = table.get(&request.service, &identity).cloned();
            let tombstone = table.tombstone(&request.service, &identity);
            let same_bind = self
                .owned
                .get(&key)
                .is_some_and(|owned| owned.bind_epoch == request.bind_epoch);
            self.revision += 1;
            let mut record = ProviderRecord {
                service: request.service.clone(),
                endpoint: request.endpoint.clone(),
                routing_id: identity.clone(),
                weight: request.weight,
                registered_at: match (&existing, same_bind) {
                    (Some(existing), true) => existing.registered_at,
                    _ => wall_clock_ms(),
                },
                kind: request.kind,
                origin: self.id,
                revision: self.revision,
            };
            let floor = existing
                .as_ref()
                .map(ProviderRecord::stamp)
                .into_iter()
                .chain(tombstone)
                .max();
            if let Some(floor) = floor {
                if record.stamp() <= floor {
                    record.registered_at = floor.registered_at + 1;
                }
            }
            if let Some(existing) = &existing {
                if existing.endpoint != record.endpoint || existing.weight != record.weight {
                    info!(
                        registry = self.id,
                        service = %record.service,
                        routing_id = %identity,
                        old_endpoint = %existing.endpoint,
                        new_endpoint = %record.endpoint,
                        "registration replaced by newer register"
                    );
                }
            }
            table.upsert(record.clone(), self.id);
            record
        };

        self.owned.insert(
            key,
            Owned {
                bind_epoch: request.bind_epoch,
            },
        );
        info!(
            registry = self.id,
            service = %record.service,
            endpoint = %record.endpoint,
            routing_id = %identity,
            weight = record.weight,
            "provider registered"
        );
        self.reply(&identity, op, &record.service, status::OK, &record.endpoint, "");
        self.schedule(Change::Upsert(record));
    }

    fn on_unregister(&mut self, identity: RoutingId, service: String, now: Instant) {
        let op = message_id::UNREGISTER;
        let key = (service.clone(), identity.clone());
        if self.owned.remove(&key).is_none() {
            self.reply(&identity, op, &service, status::NOT_FOUND, "", "service is not registered");
            return;
        }
        match self.retract_owned(&service, &identity, now) {
            Some(record) => {
                info!(
                    registry = self.id,
                    service = %service,
                    routing_id = %identity,
                    "provider unregistered"
                );
                self.reply(&identity, op, &service, status::OK, &record.endpoint, "");
            }
            None => {
                self.reply(&identity, op, &service, status::NOT_FOUND, "", "service is not registered");
            }
        }
    }

    fn on_update_weight(&mut self, identity: RoutingId, service: String, weight: u32) {
        let op = message_id::UPDATE_WEIGHT;
        let key = (service.clone(), identity.clone());
        let updated = if self.owned.contains_key(&key) {
            let mut table = self.table.lock();
            match table.get(&service, &identity).filter(|r| r.origin == self.id).cloned() {
                Some(mut record) => {
                    self.revision += 1;
                    record.weight = weight;
                    record.revision = self.revision;
                    table.upsert(record.clone(), self.id);
                    Some(record)
                }
                None => None,
            }
        } else {
            None
        };
        match updated {
            Some(record) => {
                debug!(
                    registry = self.id,
                    service = %service,
                    routing_id = %identity,
                    weight,
                    "provider weight updated"
                );
                self.reply(&identity, op, &service, status::OK, &record.endpoint, "");
                self.schedule(Change::Upsert(record));
            }
            None => {
                self.reply(&identity, op, &service, status::NOT_FOUND, "", "service is not registered");
            }
        }
    }

    fn on_heartbeat(&mut self, identity: RoutingId) {
        let known = self.owned.keys().any(|(_, owner)| *owner == identity);
        if !known {
            trace!(registry = self.id, peer = %identity, "heartbeat from unknown identity");
            self.reply(
                &identity,
                message_id::HEARTBEAT,
                "",
                status::NOT_FOUND,
                "",
                "no registrations for this identity",
            );
        }
    }

    fn reply(&self, identity: &RoutingId, op: u16, service: &str, code: i32, endpoint: &str, error: &str) {
        let ack = Message::Ack(RegisterAck {
            op,
            service: service.to_owned(),
            status: code,
            endpoint: endpoint.to_owned(),
            error: error.to_owned(),
            heartbeat_interval_ms: u32::try_from(self.config.heartbeat_interval_ms)
                .unwrap_or(u32::MAX),
        });
        if let Err(err) = self.router.send_to(identity, ack.to_frames()) {
            debug!(registry = self.id, peer = %identity, error = %err, "reply not delivered");
        }
    }

    /// 撤回本注册中心持有的记录并排队广播。
    fn retract_owned(
        &mut self,
        service: &str,
        identity: &RoutingId,
        now: Instant,
    ) -> Option<ProviderRecord> {
        let record = self
            .table
            .lock()
            .get(service, identity)
            .filter(|record| record.origin == self.id)
            .cloned()?;
        self.retract_record(&record, now);
        Some(record)
    }

    /// 以本注册中心的名义撤回任意起源的记录，撤回版本压过该记录。
    fn retract_record(&mut self, record: &ProviderRecord, now: Instant) {
        self.revision = self.revision.max(record.revision) + 1;
        let stamp = Stamp {
            registered_at: record.registered_at,
            revision: self.revision,
            origin: self.id,
        };
        self.table
            .lock()
            .retract(&record.service, &record.routing_id, stamp, now);
        self.schedule(Change::Retract {
            service: record.service.clone(),
            routing_id: record.routing_id.clone(),
            stamp,
        });
    }

    fn schedule(&mut self, change: Change) {
        self.pending.push(change);
        self.arm_flush();
    }

    fn arm_flush(&mut self) {
        if self.flush_at.is_none() {
            self.flush_at = Some(Instant::now() + self.config.broadcast_interval());
        }
    }

    fn flush(&mut self) {
        self.flush_at = None;
        if !self.pending.is_empty() {
            self.seq += 1;
            let delta = Message::Delta(Delta {
                registry_id: self.id,
                incarnation: self.incarnation,
                seq: self.seq,
                changes: std::mem::take(&mut self.pending),
            });
            match self.pub_socket.publish(delta.to_frames()) {
                Ok(reached) => {
                    trace!(registry = self.id, seq = self.seq, subscribers = reached, "delta published")
                }
                Err(err) => debug!(registry = self.id, seq = self.seq, error = %err, "delta not published"),
            }
        }
        if std::mem::take(&mut self.snapshot_due) {
            self.publish_snapshot(None);
        }
    }

    /// 发布全量快照；`target` 为空时广播给所有订阅者。
    fn publish_snapshot(&mut self, target: Option<PipeId>) {
        self.seq += 1;
        let records: Vec<ProviderRecord> = self.table.lock().records().cloned().collect();
        let count = records.len();
        let snapshot = Message::Snapshot(Snapshot {
            registry_id: self.id,
            incarnation: self.incarnation,
            seq: self.seq,
            snapshot_interval_ms: u32::try_from(self.config.snapshot_interval_ms)
                .unwrap_or(u32::MAX),
            records,
        });
        match target {
            Some(pipe) => {
                if let Err(err) = self.pub_socket.send_to_subscriber(pipe, snapshot.to_frames()) {
                    debug!(registry = self.id, pipe, error = %err, "snapshot replay not delivered");
                } else {
                    debug!(registry = self.id, pipe, records = count, "snapshot replayed to new subscriber");
                }
            }
            None => match self.pub_socket.publish(snapshot.to_frames()) {
                Ok(reached) => trace!(
                    registry = self.id,
                    seq = self.seq,
                    records = count,
                    subscribers = reached,
                    "snapshot published"
                ),
                Err(err) => debug!(registry = self.id, seq = self.seq, error = %err, "snapshot not published"),
            },
        }
    }

    fn on_event(&mut self, event: SocketEvent) {
        if let SocketEvent::Subscribed { pipe, .. } = event {
            self.publish_snapshot(Some(pipe));
        }
    }

    fn on_gossip(&mut self, frames: &Frames) {
        match Message::from_frames(frames) {
            Ok(Message::Snapshot(snapshot)) => self.on_peer_snapshot(snapshot),
            Ok(Message::Delta(delta)) => self.on_peer_delta(delta),
            Ok(other) => warn!(
                registry = self.id,
                message_id = other.id(),
                "unexpected gossip message dropped"
            ),
            Err(err) => warn!(registry = self.id, error = %err, "malformed gossip message dropped"),
        }
    }

    fn on_peer_delta(&mut self, delta: Delta) {
        if delta.registry_id == self.id {
            return;
        }
        let now = Instant::now();
        let sequence = self.peers.observe(delta.registry_id, delta.incarnation, delta.seq, now);
        if !sequence.accepted() {
            trace!(registry = self.id, peer = delta.registry_id, seq = delta.seq, "duplicate delta dropped");
            return;
        }
        self.heard_from(delta.registry_id);
        let mut forward = Vec::new();
        {
            let mut table = self.table.lock();
            for change in delta.changes {
                match change {
                    Change::Upsert(record) => {
                        if self.merge_record(&mut table, record.clone(), delta.registry_id) {
                            forward.push(Change::Upsert(record));
                        }
                    }
                    Change::Retract {
                        service,
                        routing_id,
                        stamp,
                    } => {
                        if stamp.origin == self.id {
                            continue;
                        }
                        if table.retract(&service, &routing_id, stamp, now).is_some() {
                            forward.push(Change::Retract {
                                service,
                                routing_id,
                                stamp,
                            });
                        }
                    }
                }
            }
        }
        debug!(
            registry = self.id,
            peer = delta.registry_id,
            seq = delta.seq,
            applied = forward.len(),
            "peer delta merged"
        );
        for change in forward {
            self.schedule(change);
        }
    }

    fn on_peer_snapshot(&mut self, snapshot: Snapshot) {
        if snapshot.registry_id == self.id {
            return;
        }
        let now = Instant::now();
        let peer = snapshot.registry_id;
        let sequence = self.peers.observe(peer, snapshot.incarnation, snapshot.seq, now);
        if !sequence.accepted() {
            return;
        }
        if sequence == Sequence::First {
            info!(registry = self.id, peer, "peer registry discovered");
        }
        self.heard_from(peer);
        self.peers.set_interval(
            peer,
            Duration::from_millis(u64::from(snapshot.snapshot_interval_ms.max(1))),
        );

        let mut listed = HashSet::with_capacity(snapshot.records.len());
        let mut forward = Vec::new();
        let removed = {
            let mut table = self.table.lock();
            for record in snapshot.records {
                listed.insert((record.service.clone(), record.routing_id.clone()));
                if self.merge_record(&mut table, record.clone(), peer) {
                    forward.push(Change::Upsert(record));
                }
            }
            table.withdraw_source(peer, |record| {
                listed.contains(&(record.service.clone(), record.routing_id.clone()))
            })
        };
        for change in forward {
            self.schedule(change);
        }
        if !removed.is_empty() {
            info!(
                registry = self.id,
                peer,
                removed = removed.len(),
                "records no longer vouched by peer dropped"
            );
            self.snapshot_due = true;
            self.arm_flush();
        }
    }

    /// 合并一条对端记录，返回是否需要继续转发。
    ///
    /// 起源可直接观测时只认起源担保，否则由转发者担保；失联起源的记录一律丢弃。
    fn merge_record(&self, table: &mut ServiceTable, record: ProviderRecord, relay: RegistryId) -> bool {
        let origin = record.origin;
        if origin == self.id || self.silenced.contains(&origin) {
            return false;
        }
        let voucher = if self.peers.knows(origin) { origin } else { relay };
        let (service, routing_id) = (record.service.clone(), record.routing_id.clone());
        let won = table.upsert(record, voucher).won();
        if voucher == origin {
            table.adopt(&service, &routing_id, origin);
        }
        won
    }

    fn heard_from(&mut self, peer: RegistryId) {
        if self.silenced.remove(&peer) {
            info!(registry = self.id, peer, "silent peer registry is back");
        }
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let timeout = self.config.heartbeat_timeout();

        let expired: Vec<(String, RoutingId)> = self
            .owned
            .keys()
            .filter(|(_, identity)| {
                self.liveness
                    .get(identity)
                    .is_none_or(|seen| now.saturating_duration_since(*seen) > timeout)
            })
            .cloned()
            .collect();
        for key in expired {
            self.owned.remove(&key);
            let (service, identity) = key;
            if self.retract_owned(&service, &identity, now).is_some() {
                warn!(
                    registry = self.id,
                    service = %service,
                    routing_id = %identity,
                    timeout_ms = self.config.heartbeat_timeout_ms,
                    "provider evicted after heartbeat timeout"
                );
            }
        }

        {
            let table = self.table.lock();
            let id = self.id;
            self.owned.retain(|(service, identity), _| {
                table
                    .get(service, identity)
                    .is_some_and(|record| record.origin == id)
            });
        }
        let owned = &self.owned;
        self.liveness.retain(|identity, seen| {
            owned.keys().any(|(_, owner)| owner == identity)
                || now.saturating_duration_since(*seen) <= timeout
        });

        for peer in self.peers.expire(now) {
            self.silenced.insert(peer);
            let removed = {
                let mut table = self.table.lock();
                let mut removed = table.withdraw_source(peer, |_| false);
                removed.extend(table.drop_origin(peer));
                removed
            };
            warn!(
                registry = self.id,
                peer,
                removed = removed.len(),
                "peer registry silent, its records dropped"
            );
            if !removed.is_empty() {
                self.snapshot_due = true;
                self.arm_flush();
            }
        }

        let purged = self
            .table
            .lock()
            .purge_tombstones(now, self.config.tombstone_horizon());
        if purged > 0 {
            trace!(registry = self.id, purged, "tombstones purged");
        }
    }
}

/// 截止时间为空时永不完成。
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn settings_are_frozen_after_start() {
        let wire = WireContext::new();
        let registry = Registry::new(&wire);
        assert!(matches!(
            registry.start().await,
            Err(MeshError::NotReady { .. })
        ));
        registry
            .set_endpoints("inproc://reg-frozen-pub", "inproc://reg-frozen-router")
            .expect("设置端点");
        registry.set_heartbeat(100, 300).expect("设置心跳");
        registry.start().await.expect("启动注册中心");
        assert!(registry.is_running());
        assert!(matches!(
            registry.set_heartbeat(100, 300),
            Err(MeshError::NotReady { .. })
        ));
        assert!(matches!(
            registry.start().await,
            Err(MeshError::NotReady { .. })
        ));
        registry.add_peer("inproc://reg-frozen-peer").expect("启动后仍可添加对端");
        registry.close();
        assert!(matches!(registry.start().await, Err(MeshError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_settings_are_rejected() {
        let wire = WireContext::new();
        let registry = Registry::new(&wire);
        assert!(matches!(
            registry.set_endpoints("nowhere", "inproc://r"),
            Err(MeshError::Validation { .. })
        ));
        assert!(registry.set_heartbeat(500, 100).is_err());
        assert!(registry.set_broadcast_interval(0).is_err());
        assert!(registry.set_id(0).is_err());
        registry.set_id(42).expect("设置标识");
        assert_eq!(registry.id(), 42);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_bind_keeps_registry_configurable() {
        let wire = WireContext::new();
        let holder = wire.pub_socket();
        holder.bind("inproc://reg-taken").await.expect("占用端点");

        let registry = Registry::new(&wire);
        registry
            .set_endpoints("inproc://reg-taken", "inproc://reg-taken-router")
            .expect("设置端点");
        let err = registry.start().await.expect_err("端点被占用时启动失败");
        assert_eq!(err.code(), "spark.wire.bind.address_in_use");
        registry
            .set_endpoints("inproc://reg-free", "inproc://reg-free-router")
            .expect("失败后仍可重新配置");
        registry.start().await.expect("换端点后启动");
        registry.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    #[tracing_test::traced_test]
    async fn malformed_control_frames_are_dropped() {
        let wire = WireContext::new();
        let registry = Registry::new(&wire);
        registry
            .set_endpoints("inproc://reg-garbage-pub", "inproc://reg-garbage-router")
            .expect("设置端点");
        registry.start().await.expect("启动注册中心");

        let dealer = wire.dealer_socket(RoutingId::random());
        dealer.connect("inproc://reg-garbage-router").expect("连接控制端点");
        tokio::time::timeout(Duration::from_secs(5), async {
            while dealer.peer_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("等待链路建立");
        dealer
            .send(vec![bytes::Bytes::from_static(b"\xff\xfegarbage")])
            .expect("发送垃圾帧");

        tokio::time::timeout(Duration::from_secs(5), async {
            while !logs_contain("malformed control message dropped") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("等待告警日志");
        assert!(registry.is_running());
        assert!(registry.services().is_empty());
        registry.close();
    }

    fn detached_loop(wire: &WireContext, id: RegistryId) -> RegistryLoop {
        let config = RegistryConfig::default();
        RegistryLoop {
            id,
            incarnation: 1,
            seq: 0,
            revision: 0,
            peers: SourceTracker::new(config.snapshot_interval()),
            config,
            table: Arc::new(Mutex::new(ServiceTable::new())),
            owned: HashMap::new(),
            liveness: HashMap::new(),
            silenced: HashSet::new(),
            pending: Vec::new(),
            flush_at: None,
            snapshot_due: false,
            pub_socket: Arc::new(wire.pub_socket()),
            router: Arc::new(wire.router_socket(RoutingId::random())),
            sub: Arc::new(wire.sub_socket()),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    fn remote_record(origin: RegistryId) -> ProviderRecord {
        ProviderRecord {
            service: "svc".to_owned(),
            endpoint: "inproc://remote".to_owned(),
            routing_id: RoutingId::try_from("remote").expect("构造标识"),
            weight: 1,
            registered_at: 10,
            kind: crate::table::ServiceKind::Receiver,
            origin,
            revision: 1,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn silenced_origins_are_refused_until_heard_again() {
        let wire = WireContext::new();
        let mut core = detached_loop(&wire, 1);
        let table = Arc::clone(&core.table);
        let now = Instant::now();
        core.peers.observe(2, 1, 1, now);

        // 起源可见时，中继的副本不增加担保者。
        assert!(core.merge_record(&mut table.lock(), remote_record(2), 3));
        assert!(table.lock().withdraw_source(3, |_| false).is_empty());
        assert_eq!(table.lock().provider_count("svc"), 1);

        core.silenced.insert(2);
        assert_eq!(table.lock().drop_origin(2).len(), 1);
        assert!(!core.merge_record(&mut table.lock(), remote_record(2), 3));
        assert!(table.lock().is_empty());

        core.heard_from(2);
        assert!(core.merge_record(&mut table.lock(), remote_record(2), 2));
        assert!(!core.merge_record(&mut table.lock(), remote_record(1), 2));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[tracing_test::traced_test]
    async fn failed_snapshot_publish_is_logged() {
        let wire = WireContext::new();
        let mut core = detached_loop(&wire, 5);
        core.pub_socket.close();
        core.publish_snapshot(None);
        assert!(logs_contain("snapshot not published"));
    }
}
