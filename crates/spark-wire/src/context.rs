use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::frame::RoutingId;
use crate::inproc::InprocTransport;
use crate::socket::{DealerSocket, PubSocket, RouterSocket, SubSocket};
use crate::transport::Transport;

/// 套接字层的可调参数。
///
/// 字段缺省时使用 [`WireOptions::default`]，因此配置文件可以只写需要覆盖的项。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireOptions {
    /// 首次重连等待时间（毫秒）。
    pub reconnect_interval_ms: u64,
    /// 指数退避的上限（毫秒）。
    pub reconnect_interval_max_ms: u64,
}

impl Default for WireOptions {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 100,
            reconnect_interval_max_ms: 2_000,
        }
    }
}

impl WireOptions {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// 第 `attempt` 次失败后的等待时间：`interval * 2^attempt`，不超过上限。
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
        let millis = self
            .reconnect_interval_ms
            .saturating_mul(factor)
            .min(self.reconnect_interval_max_ms.max(self.reconnect_interval_ms));
        Duration::from_millis(millis)
    }
}

/// 套接字工厂与传输注册表。
///
/// # 教案式说明
/// - **意图 (Why)**：同一进程内的所有套接字共享一份 inproc 名称表与传输集合，
///   `inproc://` 端点只在同一个上下文内可见；
/// - **契约 (What)**：
///   - 新建上下文时自动注册 `inproc` 传输，其余协议通过 [`WireContext::register_transport`] 追加；
///   - 克隆开销为一次引用计数；
/// - **风险 (Trade-offs)**：同一协议重复注册时后者覆盖前者，已存在的绑定不受影响。
#[derive(Clone)]
pub struct WireContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    transports: DashMap<&'static str, Arc<dyn Transport>>,
    options: WireOptions,
}

impl Default for WireContext {
    fn default() -> Self {
        Self::new()
    }
}

impl WireContext {
    pub fn new() -> Self {
        Self::with_options(WireOptions::default())
    }

    pub fn with_options(options: WireOptions) -> Self {
        let context = Self {
            inner: Arc::new(ContextInner {
                transports: DashMap::new(),
                options,
            }),
        };
        context.register_transport(Arc::new(InprocTransport::new()));
        context
    }

    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        self.inner.transports.insert(transport.scheme(), transport);
    }

    pub fn options(&self) -> &WireOptions {
        &self.inner.options
    }

    pub(crate) fn transport(&self, scheme: &str) -> Result<Arc<dyn Transport>, WireError> {
        self.inner
            .transports
            .get(scheme)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| WireError::UnsupportedScheme {
                scheme: scheme.to_owned(),
            })
    }

    pub fn pub_socket(&self) -> PubSocket {
        PubSocket::new(self.clone())
    }

    pub fn sub_socket(&self) -> SubSocket {
        SubSocket::new(self.clone())
    }

    pub fn router_socket(&self, identity: RoutingId) -> RouterSocket {
        RouterSocket::new(self.clone(), identity)
    }

    pub fn dealer_socket(&self, identity: RoutingId) -> DealerSocket {
        DealerSocket::new(self.clone(), identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let options = WireOptions::default();
        assert_eq!(options.backoff(0), Duration::from_millis(100));
        assert_eq!(options.backoff(1), Duration::from_millis(200));
        assert_eq!(options.backoff(3), Duration::from_millis(800));
        assert_eq!(options.backoff(10), Duration::from_millis(2_000));
        assert_eq!(options.backoff(u32::MAX), Duration::from_millis(2_000));
    }

    #[test]
    fn unknown_scheme_is_reported() {
        let context = WireContext::new();
        assert!(context.transport("inproc").is_ok());
        assert!(matches!(
            context.transport("tcp"),
            Err(WireError::UnsupportedScheme { .. })
        ));
    }
}
