use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::table::RegistryId;

/// 对端沉默多少个快照周期后视为失联。
pub(crate) const SILENCE_FACTOR: u32 = 3;

/// 收到一条带序号的广播后的判定。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Sequence {
    /// 首次见到该注册中心。
    First,
    /// 同一代际内的新消息。
    Fresh,
    /// 已处理过的序号，应丢弃。
    Duplicate,
    /// 注册中心重启（代际变化），跟踪状态已重置。
    Restarted,
}

impl Sequence {
    pub(crate) fn accepted(self) -> bool {
        !matches!(self, Sequence::Duplicate)
    }
}

#[derive(Clone, Copy, Debug)]
struct SourceState {
    incarnation: u64,
    last_seq: u64,
    last_seen: Instant,
    snapshot_interval: Duration,
}

/// 跟踪每个上游注册中心的代际、序号与存活时间。
///
/// # 教案式说明
/// - **意图 (Why)**：注册中心之间的增量会经多条路径到达，序号用于丢弃重复消息；
///   快照同时充当信标，长时间沉默的上游被判定失联，其担保的记录随之撤销；
/// - **契约 (What)**：
///   - [`SourceTracker::observe`] 在同一代际内只接受严格递增的序号；
///   - 代际变化时视为重启，序号从头开始；
///   - [`SourceTracker::expire`] 移除沉默超过 `3 ×` 快照周期的上游并返回其标识；
/// - **风险 (Trade-offs)**：跨代际不比较大小，若旧进程的消息晚于新进程到达，会短暂把状态切回旧代际，
///   下一条新代际消息到达后恢复。
#[derive(Debug)]
pub(crate) struct SourceTracker {
    sources: HashMap<RegistryId, SourceState>,
    default_interval: Duration,
}

impl SourceTracker {
    pub(crate) fn new(default_interval: Duration) -> Self {
        Self {
            sources: HashMap::new(),
            default_interval,
        }
    }

    pub(crate) fn observe(
        &mut self,
        registry: RegistryId,
        incarnation: u64,
        seq: u64,
        now: Instant,
    ) -> Sequence {
        match self.sources.get_mut(&registry) {
            None => {
                self.sources.insert(
                    registry,
                    SourceState {
                        incarnation,
                        last_seq: seq,
                        last_seen: now,
                        snapshot_interval: self.default_interval,
                    },
                );
                Sequence::First
            }
            Some(state) if state.incarnation != incarnation => {
                state.incarnation = incarnation;
                state.last_seq = seq;
                state.last_seen = now;
                Sequence::Restarted
            }
            Some(state) => {
                state.last_seen = now;
                if seq <= state.last_seq {
                    Sequence::Duplicate
                } else {
                    state.last_seq = seq;
                    Sequence::Fresh
                }
            }
        }
    }

    /// 记录上游公布的快照周期。
    pub(crate) fn set_interval(&mut self, registry: RegistryId, interval: Duration) {
        if let Some(state) = self.sources.get_mut(&registry) {
            state.snapshot_interval = interval;
        }
    }

    /// 是否正在直接跟踪该注册中心。
    pub(crate) fn knows(&self, registry: RegistryId) -> bool {
        self.sources.contains_key(&registry)
    }

    pub(crate) fn expire(&mut self, now: Instant) -> Vec<RegistryId> {
        let mut expired = Vec::new();
        self.sources.retain(|registry, state| {
            let limit = state.snapshot_interval * SILENCE_FACTOR;
            let alive = now.saturating_duration_since(state.last_seen) <= limit;
            if !alive {
                expired.push(*registry);
            }
            alive
        });
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_and_restarts_are_detected() {
        let now = Instant::now();
        let mut tracker = SourceTracker::new(Duration::from_secs(5));
        assert_eq!(tracker.observe(7, 1, 1, now), Sequence::First);
        assert_eq!(tracker.observe(7, 1, 2, now), Sequence::Fresh);
        assert_eq!(tracker.observe(7, 1, 2, now), Sequence::Duplicate);
        assert_eq!(tracker.observe(7, 1, 1, now), Sequence::Duplicate);
        assert_eq!(tracker.observe(7, 2, 1, now), Sequence::Restarted);
        assert_eq!(tracker.observe(7, 2, 2, now), Sequence::Fresh);
    }

    #[test]
    fn silent_sources_expire_after_three_intervals() {
        let start = Instant::now();
        let mut tracker = SourceTracker::new(Duration::from_secs(5));
        tracker.observe(1, 1, 1, start);
        tracker.observe(2, 1, 1, start);
        tracker.set_interval(2, Duration::from_millis(100));
        assert!(tracker.expire(start + Duration::from_millis(300)).is_empty());
        assert_eq!(tracker.expire(start + Duration::from_millis(301)), vec![2]);
        assert!(tracker.knows(1));
        assert!(!tracker.knows(2));
        assert_eq!(tracker.expire(start + Duration::from_secs(16)), vec![1]);
    }
}
