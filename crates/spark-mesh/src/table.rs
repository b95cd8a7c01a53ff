//! # table 模块说明
//!
//! ## 角色定位（Why）
//! - [`ServiceTable`] 是注册中心的权威目录，也是发现端缓存的底座：同一套“最后写入者胜出”
//!   （LWW）规则同时用于本地登记、注册中心之间的增量同步以及发现端的增量应用；
//! - 纯数据结构，不持有锁、不感知网络，调用方负责串行化访问。
//!
//! ## 核心契约（What）
//! - 以 `(服务名, 路由标识)` 为键，同一服务下标识唯一；
//! - 记录的新旧由 [`Stamp`] 决定：`(registered_at, revision, origin)` 字典序比较；
//! - 撤回会留下墓碑，墓碑期内不会被更旧的写入复活；
//! - 每条记录记录“哪些注册中心为它担保”（来源集合），来源全部撤销后记录被移除，但不留墓碑；
//! - 注册中心之间复制时，起源可直接观测的记录只由起源担保，见 [`ServiceTable::adopt`]。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use spark_wire::RoutingId;
use tokio::time::Instant;

/// 注册中心标识。
pub type RegistryId = u32;

/// 当前挂钟时间（Unix 纪元毫秒）。
pub(crate) fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// 记录所代表的实例类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// 处理网关转发请求的实例。
    Receiver,
    /// 主题网格中的节点，对外公布的是其广播端点。
    SpotNode,
}

impl ServiceKind {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            ServiceKind::Receiver => 1,
            ServiceKind::SpotNode => 2,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(ServiceKind::Receiver),
            2 => Some(ServiceKind::SpotNode),
            _ => None,
        }
    }
}

/// 记录版本戳，字段顺序即比较顺序。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp {
    pub registered_at: u64,
    pub revision: u64,
    pub origin: RegistryId,
}

/// 一个服务实例的登记信息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderRecord {
    pub service: String,
    pub endpoint: String,
    pub routing_id: RoutingId,
    pub weight: u32,
    /// 首次登记（或重新绑定后登记）时的挂钟毫秒。
    pub registered_at: u64,
    pub kind: ServiceKind,
    /// 接受该登记的注册中心。
    pub origin: RegistryId,
    /// 在 `origin` 处每次变更都会递增。
    pub revision: u64,
}

impl ProviderRecord {
    pub fn stamp(&self) -> Stamp {
        Stamp {
            registered_at: self.registered_at,
            revision: self.revision,
            origin: self.origin,
        }
    }
}

/// [`ServiceTable::upsert`] 的结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Upsert {
    /// 新键。
    Inserted,
    /// 覆盖了更旧的版本。
    Replaced(ProviderRecord),
    /// 版本相同，仅把来源加入担保集合。
    Confirmed,
    /// 比现有记录或墓碑更旧，被忽略。
    Stale,
}

impl Upsert {
    /// 是否严格胜出（需要向下游转发）。
    pub fn won(&self) -> bool {
        matches!(self, Upsert::Inserted | Upsert::Replaced(_))
    }
}

#[derive(Clone, Debug)]
struct Entry {
    record: ProviderRecord,
    sources: BTreeSet<RegistryId>,
}

#[derive(Clone, Copy, Debug)]
struct Tombstone {
    stamp: Stamp,
    since: Instant,
}

/// 服务名到实例集合的映射。
#[derive(Clone, Debug, Default)]
pub struct ServiceTable {
    services: BTreeMap<String, BTreeMap<RoutingId, Entry>>,
    tombstones: HashMap<(String, RoutingId), Tombstone>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按 LWW 规则写入记录，`source` 为担保该版本的注册中心。
    pub fn upsert(&mut self, record: ProviderRecord, source: RegistryId) -> Upsert {
        let stamp = record.stamp();
        let key = (record.service.clone(), record.routing_id.clone());
        if let Some(tombstone) = self.tombstones.get(&key) {
            if stamp <= tombstone.stamp {
                return Upsert::Stale;
            }
        }
        let slice = self.services.entry(record.service.clone()).or_default();
        match slice.get_mut(&record.routing_id) {
            Some(entry) => match stamp.cmp(&entry.record.stamp()) {
                std::cmp::Ordering::Less => Upsert::Stale,
                std::cmp::Ordering::Equal => {
                    entry.sources.insert(source);
                    Upsert::Confirmed
                }
                std::cmp::Ordering::Greater => {
                    let previous = std::mem::replace(&mut entry.record, record);
                    entry.sources = BTreeSet::from([source]);
                    self.tombstones.remove(&key);
                    Upsert::Replaced(previous)
                }
            },
            None => {
                slice.insert(
                    record.routing_id.clone(),
                    Entry {
                        record,
                        sources: BTreeSet::from([source]),
                    },
                );
                self.tombstones.remove(&key);
                Upsert::Inserted
            }
        }
    }

    /// 撤回 `stamp` 及更旧的版本并留下墓碑；现有记录更新时不做任何事。
    pub fn retract(
        &mut self,
        service: &str,
        routing_id: &RoutingId,
        stamp: Stamp,
        now: Instant,
    ) -> Option<ProviderRecord> {
        let key = (service.to_owned(), routing_id.clone());
        let newer_exists = self
            .services
            .get(service)
            .and_then(|slice| slice.get(routing_id))
            .is_some_and(|entry| entry.record.stamp() > stamp);
        if newer_exists {
            return None;
        }
        let tombstone = self.tombstones.entry(key).or_insert(Tombstone { stamp, since: now });
        if stamp > tombstone.stamp {
            *tombstone = Tombstone { stamp, since: now };
        }
        self.remove_entry(service, routing_id)
    }

    /// 撤销 `source` 对记录的担保；`keep` 返回 `true` 的记录保留担保。
    ///
    /// 担保集合变空的记录被移除，返回被移除的记录。
    pub fn withdraw_source(
        &mut self,
        source: RegistryId,
        mut keep: impl FnMut(&ProviderRecord) -> bool,
    ) -> Vec<ProviderRecord> {
        let mut removed = Vec::new();
        for slice in self.services.values_mut() {
            slice.retain(|_, entry| {
                if !entry.sources.contains(&source) || keep(&entry.record) {
                    return true;
                }
                entry.sources.remove(&source);
                if entry.sources.is_empty() {
                    removed.push(entry.record.clone());
                    false
                } else {
                    true
                }
            });
        }
        self.services.retain(|_, slice| !slice.is_empty());
        removed
    }

    /// 把记录的担保集合收拢为其起源注册中心；仅在现有版本与起源一致时生效。
    pub fn adopt(&mut self, service: &str, routing_id: &RoutingId, origin: RegistryId) {
        if let Some(entry) = self
            .services
            .get_mut(service)
            .and_then(|slice| slice.get_mut(routing_id))
        {
            if entry.record.origin == origin {
                entry.sources = BTreeSet::from([origin]);
            }
        }
    }

    /// 移除起源为 `origin` 的全部记录（不留墓碑），无论谁在担保。
    pub fn drop_origin(&mut self, origin: RegistryId) -> Vec<ProviderRecord> {
        let mut removed = Vec::new();
        for slice in self.services.values_mut() {
            slice.retain(|_, entry| {
                if entry.record.origin == origin {
                    removed.push(entry.record.clone());
                    false
                } else {
                    true
                }
            });
        }
        self.services.retain(|_, slice| !slice.is_empty());
        removed
    }

    /// 移除整个服务切片（不留墓碑）。
    pub fn remove_service(&mut self, service: &str) -> Vec<ProviderRecord> {
        self.tombstones.retain(|(name, _), _| name != service);
        self.services
            .remove(service)
            .map(|slice| slice.into_values().map(|entry| entry.record).collect())
            .unwrap_or_default()
    }

    /// 清理超过 `horizon` 的墓碑。
    pub fn purge_tombstones(&mut self, now: Instant, horizon: Duration) -> usize {
        let before = self.tombstones.len();
        self.tombstones
            .retain(|_, tombstone| now.saturating_duration_since(tombstone.since) < horizon);
        before - self.tombstones.len()
    }

    pub fn get(&self, service: &str, routing_id: &RoutingId) -> Option<&ProviderRecord> {
        self.services
            .get(service)
            .and_then(|slice| slice.get(routing_id))
            .map(|entry| &entry.record)
    }

    pub fn tombstone(&self, service: &str, routing_id: &RoutingId) -> Option<Stamp> {
        self.tombstones
            .get(&(service.to_owned(), routing_id.clone()))
            .map(|tombstone| tombstone.stamp)
    }

    /// 某服务的全部记录，按路由标识排序。
    pub fn providers(&self, service: &str) -> Vec<ProviderRecord> {
        self.services
            .get(service)
            .map(|slice| slice.values().map(|entry| entry.record.clone()).collect())
            .unwrap_or_default()
    }

    pub fn provider_count(&self, service: &str) -> usize {
        self.services.get(service).map_or(0, BTreeMap::len)
    }

    pub fn services(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &ProviderRecord> {
        self.services
            .values()
            .flat_map(|slice| slice.values().map(|entry| &entry.record))
    }

    /// 查找同一服务下占用 `endpoint` 的记录。
    pub fn find_endpoint(&self, service: &str, endpoint: &str) -> Option<&ProviderRecord> {
        self.services.get(service).and_then(|slice| {
            slice
                .values()
                .map(|entry| &entry.record)
                .find(|record| record.endpoint == endpoint)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.values().map(BTreeMap::len).sum()
    }

    fn remove_entry(&mut self, service: &str, routing_id: &RoutingId) -> Option<ProviderRecord> {
        let slice = self.services.get_mut(service)?;
        let removed = slice.remove(routing_id).map(|entry| entry.record);
        if slice.is_empty() {
            self.services.remove(service);
        }
        removed
    }
}
