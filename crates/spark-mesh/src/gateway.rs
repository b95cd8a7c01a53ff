//! # gateway 模块说明
//!
//! ## 角色定位（Why）
//! - 网关把“按服务名发送”翻译为“选出一个实例并经 ROUTER 链路投递”，调用方无需感知拓扑；
//! - 连接池按发现缓存惰性建立、随实例撤回及时拆除，应答按来源实例归属到服务名。
//!
//! ## 一致性（How）
//! - 连接池只有一把锁：维护任务与发送路径都在锁内按发现端的版本号刷新池子；
//! - 发送前先比较版本号再选择实例，保证不会投递到已被撤回的端点。
//!
//! ## 负载均衡（What）
//! - `ROUND_ROBIN`：按路由标识排序后轮转，忽略权重；
//! - `WEIGHTED`：按权重累加后二分查找随机落点，权重为 0 的实例永不被选中。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use spark_wire::{Flags, Frames, RouterSocket, RoutingId, WireContext, WireError};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::discovery::Discovery;
use crate::error::{MeshError, Unavailable};
use crate::table::{ProviderRecord, ServiceKind};
use crate::validate;

/// 已不在池中的实例仍保留“最后所属服务”的条数上限，用于归属迟到的应答。
const RETIRED_CAPACITY: usize = 1_024;

/// 负载均衡策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    #[default]
    RoundRobin,
    Weighted,
}

#[derive(Clone, Debug, Default)]
struct Strategies {
    default: Strategy,
    per_service: BTreeMap<String, Strategy>,
}

impl Strategies {
    fn for_service(&self, service: &str) -> Strategy {
        self.per_service
            .get(service)
            .copied()
            .unwrap_or(self.default)
    }
}

#[derive(Clone, Debug)]
struct PoolEntry {
    endpoint: String,
    weight: u32,
}

#[derive(Debug, Default)]
struct ServicePool {
    version: u64,
    entries: BTreeMap<RoutingId, PoolEntry>,
    cursor: usize,
}

#[derive(Debug, Default)]
struct Pool {
    services: HashMap<String, ServicePool>,
    /// 端点被多少个池条目引用；归零时断开连接。
    connections: HashMap<String, usize>,
    /// 每个实例最近一次被发送时所属的服务。
    last_sent: HashMap<RoutingId, String>,
    retired: VecDeque<RoutingId>,
}

/// 负载均衡网关。
///
/// # 教案式说明
/// - **意图 (Why)**：为共享同一网关的多个服务提供统一的发送与接收入口；
/// - **契约 (What)**：
///   - [`Gateway::send`] 是本地非阻塞检查：缓存里没有实例时返回 `NoProviders`，
///     有实例但没有已建立的连接时返回 `NoConnection`，调用方自行重试；
///   - [`Gateway::recv`] 返回 `(服务名, 帧)`；无法归属的应答服务名为空串；
///   - [`Gateway::set_load_balancing_strategy`] 随时生效于下一次发送；
/// - **风险 (Trade-offs)**：同一实例同时服务多个服务名时，应答按该实例最近一次被发送的服务归属。
pub struct Gateway {
    inner: Arc<GatewayInner>,
    maintenance: JoinHandle<()>,
}

struct GatewayInner {
    discovery: Discovery,
    router: RouterSocket,
    strategies: ArcSwap<Strategies>,
    pool: Mutex<Pool>,
}

impl Gateway {
    pub fn new(wire: &WireContext, discovery: Discovery) -> Self {
        Self::with_config(wire, discovery, RoutingId::random(), &GatewayConfig::default())
    }

    pub fn with_routing_id(wire: &WireContext, discovery: Discovery, routing_id: RoutingId) -> Self {
        Self::with_config(wire, discovery, routing_id, &GatewayConfig::default())
    }

    pub fn with_config(
        wire: &WireContext,
        discovery: Discovery,
        routing_id: RoutingId,
        config: &GatewayConfig,
    ) -> Self {
        let updates = discovery.updates();
        let inner = Arc::new(GatewayInner {
            discovery,
            router: wire.router_socket(routing_id),
            strategies: ArcSwap::from_pointee(Strategies {
                default: config.default_strategy,
                per_service: config.strategies.clone(),
            }),
            pool: Mutex::new(Pool::default()),
        });
        let maintenance = tokio::spawn(Arc::clone(&inner).maintain(updates));
        Self { inner, maintenance }
    }

    /// 按策略选择实例并发送。链路写入是非阻塞的，因此发送没有 `DONTWAIT` 变体。
    pub fn send(&self, service: &str, frames: Frames) -> Result<(), MeshError> {
        validate::service_name(service)?;
        if frames.is_empty() {
            return Err(MeshError::validation("parts", "message has no frames"));
        }
        let strategy = self.inner.strategies.load().for_service(service);
        let mut pool = self.inner.pool.lock();
        self.inner.refresh(&mut pool, service);
        let target = {
            let Some(slice) = pool.services.get_mut(service) else {
                return Err(unavailable(service, Unavailable::NoProviders));
            };
            select(slice, strategy, &self.inner.router)
                .map_err(|reason| unavailable(service, reason))?
        };
        self.inner.deliver(&mut pool, service, &target, frames)
    }

    /// 发送给服务中的指定实例。
    pub fn send_to(
        &self,
        service: &str,
        routing_id: &RoutingId,
        frames: Frames,
    ) -> Result<(), MeshError> {
        validate::service_name(service)?;
        if frames.is_empty() {
            return Err(MeshError::validation("parts", "message has no frames"));
        }
        let mut pool = self.inner.pool.lock();
        self.inner.refresh(&mut pool, service);
        let known = pool
            .services
            .get(service)
            .is_some_and(|slice| slice.entries.contains_key(routing_id));
        if !known {
            return Err(MeshError::not_found("provider", routing_id.to_string()));
        }
        if !self.inner.router.is_connected(routing_id) {
            return Err(unavailable(service, Unavailable::NoConnection));
        }
        self.inner.deliver(&mut pool, service, routing_id, frames)
    }

    /// 接收任一实例的应答，返回其所属服务名。
    pub async fn recv(&self, flags: Flags) -> Result<(String, Frames), MeshError> {
        let (identity, frames) = self.inner.router.recv(flags).await?;
        let service = self.inner.pool.lock().owner_of(&identity);
        if service.is_empty() {
            debug!(peer = %identity, "reply from unknown provider");
        }
        Ok((service, frames))
    }

    pub fn set_load_balancing_strategy(&self, service: &str, strategy: Strategy) {
        self.inner.strategies.rcu(|current| {
            let mut next = Strategies::clone(current);
            next.per_service.insert(service.to_owned(), strategy);
            next
        });
        debug!(service, ?strategy, "load balancing strategy updated");
    }

    pub fn load_balancing_strategy(&self, service: &str) -> Strategy {
        self.inner.strategies.load().for_service(service)
    }

    /// 服务当前已建立的连接数；读取时会按发现缓存刷新连接池。
    pub fn connection_count(&self, service: &str) -> usize {
        let mut pool = self.inner.pool.lock();
        self.inner.refresh(&mut pool, service);
        pool.services.get(service).map_or(0, |slice| {
            slice
                .entries
                .keys()
                .filter(|id| self.inner.router.is_connected(id))
                .count()
        })
    }

    pub fn router_socket(&self) -> &RouterSocket {
        &self.inner.router
    }

    pub fn close(&self) {
        self.maintenance.abort();
        self.inner.router.close();
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.close();
    }
}

impl GatewayInner {
    async fn maintain(self: Arc<Self>, mut updates: tokio::sync::broadcast::Receiver<String>) {
        loop {
            match updates.recv().await {
                Ok(service) => {
                    let mut pool = self.pool.lock();
                    if pool.services.contains_key(&service) {
                        self.refresh(&mut pool, &service);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "gateway fell behind discovery updates, refreshing all pools");
                    let mut pool = self.pool.lock();
                    let services: Vec<String> = pool.services.keys().cloned().collect();
                    for service in services {
                        self.refresh(&mut pool, &service);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// 版本号变化时按发现缓存重建服务的池条目；没有实例的服务不留池子。
    fn refresh(&self, pool: &mut Pool, service: &str) {
        let (version, records) = self.discovery.snapshot(service);
        if pool
            .services
            .get(service)
            .is_some_and(|slice| slice.version == version)
        {
            return;
        }
        let wanted: BTreeMap<RoutingId, ProviderRecord> = records
            .into_iter()
            .filter(|record| record.kind == ServiceKind::Receiver)
            .map(|record| (record.routing_id.clone(), record))
            .collect();

        let mut slice = pool.services.remove(service).unwrap_or_default();
        let mut released = Vec::new();
        slice.entries.retain(|id, entry| match wanted.get(id) {
            Some(record) if record.endpoint == entry.endpoint => true,
            _ => {
                released.push((id.clone(), entry.endpoint.clone()));
                false
            }
        });
        for (id, endpoint) in released {
            pool.release(&self.router, &endpoint);
            pool.retire(id.clone());
            info!(service, routing_id = %id, endpoint = %endpoint, "pool entry torn down");
        }
        for (id, record) in wanted {
            match slice.entries.get_mut(&id) {
                Some(entry) => entry.weight = record.weight,
                None => {
                    pool.acquire(&self.router, &record.endpoint);
                    debug!(service, routing_id = %id, endpoint = %record.endpoint, "pool entry added");
                    slice.entries.insert(
                        id,
                        PoolEntry {
                            endpoint: record.endpoint,
                            weight: record.weight,
                        },
                    );
                }
            }
        }
        if slice.entries.is_empty() {
            return;
        }
        slice.version = version;
        pool.services.insert(service.to_owned(), slice);
    }

    fn deliver(
        &self,
        pool: &mut Pool,
        service: &str,
        target: &RoutingId,
        frames: Frames,
    ) -> Result<(), MeshError> {
        match self.router.send_to(target, frames) {
            Ok(()) => {
                pool.last_sent.insert(target.clone(), service.to_owned());
                Ok(())
            }
            Err(WireError::UnknownPeer { .. }) => Err(unavailable(service, Unavailable::NoConnection)),
            Err(err) => Err(err.into()),
        }
    }
}

impl Pool {
    fn acquire(&mut self, router: &RouterSocket, endpoint: &str) {
        let count = self.connections.entry(endpoint.to_owned()).or_default();
        *count += 1;
        if *count == 1 {
            if let Err(err) = router.connect(endpoint) {
                warn!(endpoint, error = %err, "gateway cannot connect to provider");
            }
        }
    }

    fn release(&mut self, router: &RouterSocket, endpoint: &str) {
        let Some(count) = self.connections.get_mut(endpoint) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.connections.remove(endpoint);
            if let Err(err) = router.disconnect(endpoint) {
                debug!(endpoint, error = %err, "gateway disconnect failed");
            }
        }
    }

    /// 记住被拆除实例的归属，迟到的应答仍能找到服务名。
    fn retire(&mut self, id: RoutingId) {
        self.retired.push_back(id);
        while self.retired.len() > RETIRED_CAPACITY {
            if let Some(old) = self.retired.pop_front() {
                let still_pooled = self
                    .services
                    .values()
                    .any(|slice| slice.entries.contains_key(&old));
                if !still_pooled {
                    self.last_sent.remove(&old);
                }
            }
        }
    }

    fn owner_of(&self, identity: &RoutingId) -> String {
        if let Some(service) = self.last_sent.get(identity) {
            return service.clone();
        }
        self.services
            .iter()
            .find(|(_, slice)| slice.entries.contains_key(identity))
            .map(|(service, _)| service.clone())
            .unwrap_or_default()
    }
}

fn unavailable(service: &str, reason: Unavailable) -> MeshError {
    MeshError::Unavailable {
        service: service.to_owned(),
        reason,
    }
}

/// 按策略在池条目中选出目标实例。
fn select(
    slice: &mut ServicePool,
    strategy: Strategy,
    router: &RouterSocket,
) -> Result<RoutingId, Unavailable> {
    select_with(slice, strategy, |id| router.is_connected(id))
}

fn select_with(
    slice: &mut ServicePool,
    strategy: Strategy,
    is_live: impl Fn(&RoutingId) -> bool,
) -> Result<RoutingId, Unavailable> {
    if slice.entries.is_empty() {
        return Err(Unavailable::NoProviders);
    }
    match strategy {
        Strategy::RoundRobin => {
            let live: Vec<&RoutingId> = slice.entries.keys().filter(|id| is_live(id)).collect();
            if live.is_empty() {
                return Err(Unavailable::NoConnection);
            }
            let chosen = live[slice.cursor % live.len()].clone();
            slice.cursor = slice.cursor.wrapping_add(1);
            Ok(chosen)
        }
        Strategy::Weighted => {
            if slice.entries.values().all(|entry| entry.weight == 0) {
                return Err(Unavailable::NoProviders);
            }
            let mut total = 0u64;
            let mut ids = Vec::new();
            let mut cumulative = Vec::new();
            for (id, entry) in &slice.entries {
                if entry.weight == 0 || !is_live(id) {
                    continue;
                }
                total += u64::from(entry.weight);
                ids.push(id);
                cumulative.push(total);
            }
            if total == 0 {
                return Err(Unavailable::NoConnection);
            }
            let point = rand::rng().random_range(0..total);
            let index = cumulative.partition_point(|bound| *bound <= point);
            Ok(ids[index].clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(weights: &[u32]) -> ServicePool {
        let mut slice = ServicePool::default();
        for (index, weight) in weights.iter().enumerate() {
            slice.entries.insert(
                RoutingId::try_from(format!("p{index}").as_str()).expect("构造标识"),
                PoolEntry {
                    endpoint: format!("inproc://p{index}"),
                    weight: *weight,
                },
            );
        }
        slice
    }

    #[test]
    fn round_robin_cycles_in_identity_order() {
        let mut slice = slice(&[5, 1, 0]);
        let picks: Vec<String> = (0..6)
            .map(|_| {
                select_with(&mut slice, Strategy::RoundRobin, |_| true)
                    .expect("选择实例")
                    .to_string()
            })
            .collect();
        assert_eq!(picks[0..3], picks[3..6]);
        assert_ne!(picks[0], picks[1]);
        assert_ne!(picks[1], picks[2]);
    }

    #[test]
    fn weighted_never_picks_zero_weight() {
        let mut slice = slice(&[0, 2]);
        let zero = RoutingId::try_from("p0").expect("构造标识");
        for _ in 0..500 {
            let chosen = select_with(&mut slice, Strategy::Weighted, |_| true).expect("选择实例");
            assert_ne!(chosen, zero);
        }
    }

    #[test]
    fn weighted_follows_weights() {
        let mut slice = slice(&[1, 3]);
        let heavy = RoutingId::try_from("p1").expect("构造标识");
        let hits = (0..4_000)
            .filter(|_| {
                select_with(&mut slice, Strategy::Weighted, |_| true).expect("选择实例") == heavy
            })
            .count();
        let share = hits as f64 / 4_000.0;
        assert!((0.70..=0.80).contains(&share), "share = {share}");
    }

    #[test]
    fn unavailable_reasons_are_distinguished() {
        let mut empty = ServicePool::default();
        assert_eq!(
            select_with(&mut empty, Strategy::RoundRobin, |_| true),
            Err(Unavailable::NoProviders)
        );
        let mut zero = slice(&[0, 0]);
        assert_eq!(
            select_with(&mut zero, Strategy::Weighted, |_| true),
            Err(Unavailable::NoProviders)
        );
        let mut dead = slice(&[1, 1]);
        assert_eq!(
            select_with(&mut dead, Strategy::RoundRobin, |_| false),
            Err(Unavailable::NoConnection)
        );
        assert_eq!(
            select_with(&mut dead, Strategy::Weighted, |_| false),
            Err(Unavailable::NoConnection)
        );
    }

    #[test]
    fn strategy_names_follow_wire_spelling() {
        let parsed: BTreeMap<String, Strategy> =
            toml::from_str("a = \"ROUND_ROBIN\"\nb = \"WEIGHTED\"").expect("解析策略");
        assert_eq!(parsed["a"], Strategy::RoundRobin);
        assert_eq!(parsed["b"], Strategy::Weighted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_services_leave_no_pool_behind() {
        let wire = WireContext::new();
        let gateway = Gateway::new(&wire, Discovery::new(&wire));
        for index in 0..16 {
            let service = format!("ghost-{index}");
            assert!(matches!(
                gateway.send(&service, vec![bytes::Bytes::from_static(b"ping")]),
                Err(MeshError::Unavailable {
                    reason: Unavailable::NoProviders,
                    ..
                })
            ));
            assert_eq!(gateway.connection_count(&service), 0);
        }
        assert!(gateway.inner.pool.lock().services.is_empty());
        gateway.close();
    }
}
