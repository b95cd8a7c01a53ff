//! # discovery 模块说明
//!
//! ## 角色定位（Why）
//! - 订阅一个或多个注册中心的广播，在本地维护服务目录的镜像，供网关与主题节点做同步查询；
//! - 查询只读本地缓存，不产生网络往返，可以放在请求热路径上。
//!
//! ## 一致性（What）
//! - 缓存与注册中心最终一致，滞后上限约为广播间隔加网络延迟；
//! - 每条广播在写锁内整体应用，读者看到的是某一时刻的完整切片；
//! - 乱序与重复的增量依靠 LWW 版本戳与 `(代际, 序号)` 去重容忍。
//!
//! ## 订阅范围
//! - 关注集合为空时镜像全部服务；非空时只缓存集合内的服务。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use spark_wire::{Endpoint, Flags, SubSocket, WireContext, WireError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::DiscoveryConfig;
use crate::error::MeshError;
use crate::gossip::SourceTracker;
use crate::protocol::{Change, Delta, Message, Snapshot};
use crate::table::{ProviderRecord, ServiceKind, ServiceTable};
use crate::validate;

const UPDATE_CAPACITY: usize = 256;

/// 服务发现客户端。克隆得到的句柄共享同一份缓存。
///
/// # 教案式说明
/// - **意图 (Why)**：把“订阅广播、应用增量、清理失联上游”封装为后台任务，对外只暴露查询；
/// - **契约 (What)**：
///   - [`Discovery::connect_registry`] 对同一端点幂等；
///   - [`Discovery::subscribe`] 会向上游重新声明订阅，注册中心随即补发一份快照；
///   - [`Discovery::unsubscribe`] 立即丢弃对应切片，不等待任何确认；
///   - [`Discovery::updates`] 推送发生变化的服务名，接收端落后时会收到 `Lagged`；
/// - **风险 (Trade-offs)**：上游沉默判定依赖其公布的快照周期，
///   快照周期配置过长会延迟失联注册中心记录的清理。
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<DiscoveryInner>,
}

struct DiscoveryInner {
    sub: Arc<SubSocket>,
    state: Arc<RwLock<Cache>>,
    registries: Mutex<BTreeSet<Endpoint>>,
    updates: broadcast::Sender<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Cache {
    kind: Option<ServiceKind>,
    interest: BTreeSet<String>,
    table: ServiceTable,
    versions: HashMap<String, u64>,
    sources: SourceTracker,
}

impl Discovery {
    /// 镜像全部记录类型。
    pub fn new(wire: &WireContext) -> Self {
        Self::build(wire, None, &DiscoveryConfig::default())
    }

    /// 只镜像指定类型的记录。
    pub fn with_kind(wire: &WireContext, kind: ServiceKind) -> Self {
        Self::build(wire, Some(kind), &DiscoveryConfig::default())
    }

    /// 按配置段构造，并连接其中列出的注册中心、订阅其中列出的服务。
    pub fn from_config(
        wire: &WireContext,
        kind: Option<ServiceKind>,
        config: &DiscoveryConfig,
    ) -> Result<Self, MeshError> {
        config.validate()?;
        let discovery = Self::build(wire, kind, config);
        for service in &config.services {
            discovery.subscribe(service)?;
        }
        for registry in &config.registries {
            discovery.connect_registry(registry)?;
        }
        Ok(discovery)
    }

    fn build(wire: &WireContext, kind: Option<ServiceKind>, config: &DiscoveryConfig) -> Self {
        let sub = Arc::new(wire.sub_socket());
        let _ = sub.subscribe("");
        let state = Arc::new(RwLock::new(Cache {
            kind,
            interest: BTreeSet::new(),
            table: ServiceTable::new(),
            versions: HashMap::new(),
            sources: SourceTracker::new(Duration::from_millis(
                config.default_snapshot_interval_ms,
            )),
        }));
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);

        let receiver = tokio::spawn(receive_loop(
            Arc::clone(&sub),
            Arc::clone(&state),
            updates.clone(),
        ));
        let sweeper = tokio::spawn(sweep_loop(
            Arc::clone(&state),
            updates.clone(),
            Duration::from_millis(config.sweep_interval_ms),
            Duration::from_millis(config.tombstone_horizon_ms),
        ));
        Self {
            inner: Arc::new(DiscoveryInner {
                sub,
                state,
                registries: Mutex::new(BTreeSet::new()),
                updates,
                tasks: Mutex::new(vec![receiver, sweeper]),
            }),
        }
    }

    /// 订阅注册中心的广播端点。
    pub fn connect_registry(&self, endpoint: &str) -> Result<(), MeshError> {
        let endpoint = validate::endpoint(endpoint)?;
        let mut registries = self.inner.registries.lock();
        if registries.contains(&endpoint) {
            return Ok(());
        }
        self.inner.sub.connect(&endpoint.to_string())?;
        info!(registry = %endpoint, "discovery connected to registry");
        registries.insert(endpoint);
        Ok(())
    }

    pub fn registries(&self) -> Vec<Endpoint> {
        self.inner.registries.lock().iter().cloned().collect()
    }

    /// 把服务加入关注集合。
    pub fn subscribe(&self, service: &str) -> Result<(), MeshError> {
        validate::service_name(service)?;
        let changed = {
            let mut cache = self.inner.state.write();
            if !cache.interest.insert(service.to_owned()) {
                return Ok(());
            }
            let mut changed = BTreeSet::new();
            if cache.interest.len() == 1 {
                for other in cache.table.services() {
                    if other != service {
                        cache.table.remove_service(&other);
                        changed.insert(other);
                    }
                }
            }
            cache.bump(&changed);
            changed
        };
        debug!(service, "discovery subscribed");
        self.publish_updates(changed);
        self.request_snapshot()
    }

    /// 从关注集合移除服务并立即丢弃其切片。
    pub fn unsubscribe(&self, service: &str) -> Result<(), MeshError> {
        let mirror_all = {
            let mut cache = self.inner.state.write();
            if !cache.interest.remove(service) {
                return Err(MeshError::not_found("subscription", service));
            }
            cache.table.remove_service(service);
            cache.bump(&BTreeSet::from([service.to_owned()]));
            cache.interest.is_empty()
        };
        debug!(service, "discovery unsubscribed");
        let _ = self.inner.updates.send(service.to_owned());
        if mirror_all {
            self.request_snapshot()?;
        }
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.state.read().interest.iter().cloned().collect()
    }

    pub fn service_available(&self, service: &str) -> bool {
        self.inner.state.read().table.provider_count(service) > 0
    }

    pub fn provider_count(&self, service: &str) -> usize {
        self.inner.state.read().table.provider_count(service)
    }

    /// 某服务的全部实例，按路由标识排序。
    pub fn get_providers(&self, service: &str) -> Vec<ProviderRecord> {
        self.inner.state.read().table.providers(service)
    }

    /// 原子读取服务的版本号与实例列表；版本号在切片每次变化时递增。
    pub fn snapshot(&self, service: &str) -> (u64, Vec<ProviderRecord>) {
        let cache = self.inner.state.read();
        (
            cache.versions.get(service).copied().unwrap_or_default(),
            cache.table.providers(service),
        )
    }

    pub fn services(&self) -> Vec<String> {
        self.inner.state.read().table.services()
    }

    /// 订阅缓存变化通知，每条通知是一个发生变化的服务名。
    pub fn updates(&self) -> broadcast::Receiver<String> {
        self.inner.updates.subscribe()
    }

    /// 停止接收广播。缓存保留最后状态。
    pub fn close(&self) {
        self.inner.shutdown();
    }

    /// 重新声明订阅：每次声明都会让上游注册中心补发一份定向快照。
    fn request_snapshot(&self) -> Result<(), MeshError> {
        self.inner.sub.subscribe("")?;
        self.inner.sub.unsubscribe("")?;
        Ok(())
    }

    fn publish_updates(&self, services: BTreeSet<String>) {
        for service in services {
            let _ = self.inner.updates.send(service);
        }
    }
}

impl DiscoveryInner {
    fn shutdown(&self) {
        self.sub.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for DiscoveryInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Cache {
    fn wants(&self, service: &str, kind: ServiceKind) -> bool {
        self.kind.is_none_or(|wanted| wanted == kind)
            && (self.interest.is_empty() || self.interest.contains(service))
    }

    fn interested(&self, service: &str) -> bool {
        self.interest.is_empty() || self.interest.contains(service)
    }

    fn bump(&mut self, services: &BTreeSet<String>) {
        for service in services {
            *self.versions.entry(service.clone()).or_default() += 1;
        }
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot, now: Instant) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        let registry = snapshot.registry_id;
        if !self
            .sources
            .observe(registry, snapshot.incarnation, snapshot.seq, now)
            .accepted()
        {
            return changed;
        }
        self.sources.set_interval(
            registry,
            Duration::from_millis(u64::from(snapshot.snapshot_interval_ms.max(1))),
        );
        let mut listed = HashSet::with_capacity(snapshot.records.len());
        for record in snapshot.records {
            listed.insert((record.service.clone(), record.routing_id.clone()));
            if !self.wants(&record.service, record.kind) {
                continue;
            }
            let service = record.service.clone();
            if self.table.upsert(record, registry).won() {
                changed.insert(service);
            }
        }
        for removed in self.table.withdraw_source(registry, |record| {
            listed.contains(&(record.service.clone(), record.routing_id.clone()))
        }) {
            changed.insert(removed.service);
        }
        self.bump(&changed);
        changed
    }

    fn apply_delta(&mut self, delta: Delta, now: Instant) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        let registry = delta.registry_id;
        if !self
            .sources
            .observe(registry, delta.incarnation, delta.seq, now)
            .accepted()
        {
            return changed;
        }
        for change in delta.changes {
            match change {
                Change::Upsert(record) => {
                    if !self.wants(&record.service, record.kind) {
                        continue;
                    }
                    let service = record.service.clone();
                    if self.table.upsert(record, registry).won() {
                        changed.insert(service);
                    }
                }
                Change::Retract {
                    service,
                    routing_id,
                    stamp,
                } => {
                    if !self.interested(&service) {
                        continue;
                    }
                    if self.table.retract(&service, &routing_id, stamp, now).is_some() {
                        changed.insert(service);
                    }
                }
            }
        }
        self.bump(&changed);
        changed
    }
}

async fn receive_loop(
    sub: Arc<SubSocket>,
    state: Arc<RwLock<Cache>>,
    updates: broadcast::Sender<String>,
) {
    loop {
        let frames = match sub.recv(Flags::NONE).await {
            Ok(frames) => frames,
            Err(WireError::Closed) => break,
            Err(err) => {
                warn!(error = %err, "discovery receive failed");
                continue;
            }
        };
        let now = Instant::now();
        let changed = match Message::from_frames(&frames) {
            Ok(Message::Snapshot(snapshot)) => {
                trace!(registry = snapshot.registry_id, records = snapshot.records.len(), "snapshot received");
                state.write().apply_snapshot(snapshot, now)
            }
            Ok(Message::Delta(delta)) => state.write().apply_delta(delta, now),
            Ok(other) => {
                warn!(message_id = other.id(), "unexpected registry broadcast dropped");
                continue;
            }
            Err(err) => {
                warn!(error = %err, "malformed registry broadcast dropped");
                continue;
            }
        };
        for service in changed {
            debug!(service = %service, "discovery cache updated");
            let _ = updates.send(service);
        }
    }
    debug!("discovery receive loop stopped");
}

async fn sweep_loop(
    state: Arc<RwLock<Cache>>,
    updates: broadcast::Sender<String>,
    period: Duration,
    horizon: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let now = Instant::now();
        let changed = {
            let mut cache = state.write();
            let mut changed = BTreeSet::new();
            for registry in cache.sources.expire(now) {
                let removed = cache.table.withdraw_source(registry, |_| false);
                warn!(registry, removed = removed.len(), "registry silent, its records dropped");
                changed.extend(removed.into_iter().map(|record| record.service));
            }
            cache.table.purge_tombstones(now, horizon);
            cache.bump(&changed);
            changed
        };
        for service in changed {
            let _ = updates.send(service);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Stamp;
    use spark_wire::RoutingId;

    fn record(service: &str, id: &str, registered_at: u64) -> ProviderRecord {
        ProviderRecord {
            service: service.to_owned(),
            endpoint: format!("inproc://{id}"),
            routing_id: RoutingId::try_from(id).expect("构造标识"),
            weight: 1,
            registered_at,
            kind: ServiceKind::Receiver,
            origin: 9,
            revision: 1,
        }
    }

    fn cache(kind: Option<ServiceKind>) -> Cache {
        Cache {
            kind,
            interest: BTreeSet::new(),
            table: ServiceTable::new(),
            versions: HashMap::new(),
            sources: SourceTracker::new(Duration::from_secs(5)),
        }
    }

    #[test]
    fn duplicate_deltas_are_ignored() {
        let mut cache = cache(None);
        let now = Instant::now();
        let delta = Delta {
            registry_id: 9,
            incarnation: 1,
            seq: 1,
            changes: vec![Change::Upsert(record("svc", "a", 10))],
        };
        assert_eq!(cache.apply_delta(delta.clone(), now).len(), 1);
        assert!(cache.apply_delta(delta, now).is_empty());
        assert_eq!(cache.versions.get("svc"), Some(&1));
    }

    #[test]
    fn snapshot_removes_unlisted_records_of_that_registry() {
        let mut cache = cache(None);
        let now = Instant::now();
        cache.apply_delta(
            Delta {
                registry_id: 9,
                incarnation: 1,
                seq: 1,
                changes: vec![
                    Change::Upsert(record("svc", "a", 10)),
                    Change::Upsert(record("svc", "b", 10)),
                ],
            },
            now,
        );
        let changed = cache.apply_snapshot(
            Snapshot {
                registry_id: 9,
                incarnation: 1,
                seq: 2,
                snapshot_interval_ms: 1_000,
                records: vec![record("svc", "a", 10)],
            },
            now,
        );
        assert!(changed.contains("svc"));
        assert_eq!(cache.table.provider_count("svc"), 1);
    }

    #[test]
    fn retraction_before_upsert_keeps_record_out() {
        let mut cache = cache(None);
        let now = Instant::now();
        let late = record("svc", "a", 10);
        cache.apply_delta(
            Delta {
                registry_id: 9,
                incarnation: 1,
                seq: 2,
                changes: vec![Change::Retract {
                    service: "svc".to_owned(),
                    routing_id: late.routing_id.clone(),
                    stamp: Stamp {
                        registered_at: 10,
                        revision: 2,
                        origin: 9,
                    },
                }],
            },
            now,
        );
        cache.apply_delta(
            Delta {
                registry_id: 7,
                incarnation: 1,
                seq: 1,
                changes: vec![Change::Upsert(late)],
            },
            now,
        );
        assert_eq!(cache.table.provider_count("svc"), 0);
    }

    #[test]
    fn kind_and_interest_filter_records() {
        let mut cache = cache(Some(ServiceKind::SpotNode));
        cache.interest.insert("spot".to_owned());
        let mut spot = record("spot", "n1", 10);
        spot.kind = ServiceKind::SpotNode;
        let changed = cache.apply_delta(
            Delta {
                registry_id: 9,
                incarnation: 1,
                seq: 1,
                changes: vec![
                    Change::Upsert(record("spot", "r1", 10)),
                    Change::Upsert(record("other", "r2", 10)),
                    Change::Upsert(spot),
                ],
            },
            Instant::now(),
        );
        assert_eq!(changed.len(), 1);
        assert_eq!(cache.table.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unsubscribe_requires_a_subscription() {
        let wire = WireContext::new();
        let discovery = Discovery::new(&wire);
        assert!(matches!(
            discovery.unsubscribe("svc"),
            Err(MeshError::NotFound { .. })
        ));
        discovery.subscribe("svc").expect("订阅");
        discovery.subscribe("svc").expect("重复订阅无副作用");
        assert_eq!(discovery.subscriptions(), vec!["svc".to_owned()]);
        discovery.unsubscribe("svc").expect("取消订阅");
        assert!(discovery.subscriptions().is_empty());
        assert!(matches!(
            discovery.connect_registry("nowhere"),
            Err(MeshError::Validation { .. })
        ));
        discovery.close();
    }
}
