//! # registration 模块说明
//!
//! ## 角色定位（Why）
//! - 服务实例与主题节点共用的登记客户端：经 DEALER 套接字向注册中心发送登记、注销、
//!   权重更新与心跳，并把注册中心的应答写入每个服务的结果槽；
//! - 结果槽以 `tokio::sync::watch` 承载，调用方既可轮询最新状态，也可异步等待终态。
//!
//! ## 行为约定（How）
//! - 登记请求在等待应答期间按心跳周期重发，链路（重新）建立时立即重发；
//! - 收到第一次成功应答后按注册中心公布的周期发送心跳；
//! - 注册中心以 `NOT_FOUND` 回应心跳，说明它已丢失本实例的登记（重启或驱逐），
//!   客户端随即重新登记全部服务，结果槽保持不变；
//! - 注销请求在收到注册中心应答前按心跳周期重发，期间该服务对调用方已不可见。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use spark_wire::{DealerSocket, Flags, Frames, RoutingId, SocketEvent, WireContext, WireError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::MeshError;
use crate::protocol::{Message, RegisterAck, RegisterRequest, message_id, status};
use crate::table::ServiceKind;

/// 注册中心给出的登记结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationResult {
    /// `0` 表示成功，负数为失败码。
    pub status: i32,
    pub resolved_endpoint: String,
    pub error: String,
}

/// 结果槽的状态。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistrationState {
    Pending,
    Ok(RegistrationResult),
    Err(RegistrationResult),
}

impl RegistrationState {
    pub fn is_pending(&self) -> bool {
        matches!(self, RegistrationState::Pending)
    }
}

struct Entry {
    endpoint: String,
    weight: u32,
    slot: watch::Sender<RegistrationState>,
    /// 已发出注销、尚未收到应答。
    retracting: bool,
}

impl Entry {
    fn is_live(&self) -> bool {
        !self.retracting
    }
}

struct ClientInner {
    dealer: DealerSocket,
    kind: ServiceKind,
    component: &'static str,
    bind_epoch: AtomicU64,
    entries: Mutex<BTreeMap<String, Entry>>,
    heartbeat: Mutex<Duration>,
}

/// 登记客户端。
///
/// # 教案式说明
/// - **意图 (Why)**：把“发出请求、等待异步应答、维持心跳”收拢在一处，
///   `Provider` 与 `SpotNode` 只负责参数校验与端点解析；
/// - **契约 (What)**：
///   - [`RegistrationClient::register`] 立即返回，结果经 [`RegistrationClient::result`] 或
///     [`RegistrationClient::wait`] 读取；
///   - 同一服务再次登记会把结果槽重置为 `Pending`；
///   - 已存在的 `watch` 订阅者在重置后仍然有效；
/// - **风险 (Trade-offs)**：DEALER 在多个注册中心之间轮询发送，同时连接多个注册中心时
///   每个注册中心只看到部分心跳，需保证心跳超时至少覆盖“连接数 × 心跳周期”。
pub(crate) struct RegistrationClient {
    inner: Arc<ClientInner>,
    task: JoinHandle<()>,
}

impl RegistrationClient {
    pub(crate) fn new(
        wire: &WireContext,
        identity: RoutingId,
        kind: ServiceKind,
        component: &'static str,
        heartbeat: Duration,
    ) -> Self {
        let dealer = wire.dealer_socket(identity);
        let events = dealer.monitor();
        let inner = Arc::new(ClientInner {
            dealer,
            kind,
            component,
            bind_epoch: AtomicU64::new(0),
            entries: Mutex::new(BTreeMap::new()),
            heartbeat: Mutex::new(heartbeat),
        });
        let task = tokio::spawn(Arc::clone(&inner).run(events));
        Self { inner, task }
    }

    pub(crate) fn set_bind_epoch(&self, epoch: u64) {
        self.inner.bind_epoch.store(epoch, Ordering::Release);
    }

    pub(crate) fn connect(&self, endpoint: &str) -> Result<(), MeshError> {
        let endpoint = self.inner.dealer.connect(endpoint)?;
        debug!(component = self.inner.component, registry = %endpoint, "registry connection requested");
        Ok(())
    }

    pub(crate) fn has_registry(&self) -> bool {
        self.inner.dealer.peer_count() > 0
    }

    pub(crate) fn register(&self, service: &str, endpoint: String, weight: u32) {
        {
            let mut entries = self.inner.entries.lock();
            match entries.get_mut(service) {
                Some(entry) => {
                    entry.endpoint = endpoint;
                    entry.weight = weight;
                    entry.retracting = false;
                    entry.slot.send_replace(RegistrationState::Pending);
                }
                None => {
                    let (slot, _) = watch::channel(RegistrationState::Pending);
                    entries.insert(
                        service.to_owned(),
                        Entry {
                            endpoint,
                            weight,
                            slot,
                            retracting: false,
                        },
                    );
                }
            }
        }
        self.inner.send_register(service);
    }

    pub(crate) fn result(&self, service: &str) -> Result<RegistrationState, MeshError> {
        self.inner
            .entries
            .lock()
            .get(service)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.slot.borrow().clone())
            .ok_or_else(|| MeshError::not_found("service", service))
    }

    /// 等待结果槽进入终态；失败应答转换为 [`MeshError::Rejected`]。
    pub(crate) async fn wait(
        &self,
        service: &str,
        timeout: Duration,
    ) -> Result<RegistrationResult, MeshError> {
        let mut receiver = self
            .inner
            .entries
            .lock()
            .get(service)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.slot.subscribe())
            .ok_or_else(|| MeshError::not_found("service", service))?;
        let waited = tokio::time::timeout(timeout, async {
            receiver
                .wait_for(|state| !state.is_pending())
                .await
                .map(|state| (*state).clone())
        })
        .await;
        match waited {
            Ok(Ok(RegistrationState::Ok(result))) => Ok(result),
            Ok(Ok(RegistrationState::Err(result))) => Err(MeshError::Rejected {
                service: service.to_owned(),
                status: result.status,
                message: result.error,
            }),
            Ok(Ok(RegistrationState::Pending)) | Ok(Err(_)) => {
                Err(MeshError::not_found("service", service))
            }
            Err(_) => Err(MeshError::Timeout {
                operation: "registration",
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub(crate) fn update_weight(&self, service: &str, weight: u32) -> Result<(), MeshError> {
        {
            let mut entries = self.inner.entries.lock();
            let entry = entries
                .get_mut(service)
                .filter(|entry| entry.is_live())
                .ok_or_else(|| MeshError::not_found("service", service))?;
            entry.weight = weight;
        }
        self.inner.send(Message::UpdateWeight {
            service: service.to_owned(),
            weight,
        })
    }

    /// 发出注销；应答到达前该服务保留为“注销中”，由心跳周期重发。
    pub(crate) fn unregister(&self, service: &str) -> Result<(), MeshError> {
        let live = self
            .inner
            .entries
            .lock()
            .get(service)
            .is_some_and(Entry::is_live);
        if !live {
            return Err(MeshError::not_found("service", service));
        }
        self.inner.send(Message::Unregister {
            service: service.to_owned(),
        })?;
        if let Some(entry) = self.inner.entries.lock().get_mut(service) {
            entry.retracting = true;
        }
        info!(component = self.inner.component, service, "unregister requested");
        Ok(())
    }

    pub(crate) fn services(&self) -> Vec<String> {
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.is_live())
            .map(|(service, _)| service.clone())
            .collect()
    }

    pub(crate) fn close(&self) {
        self.inner.dealer.close();
        self.task.abort();
    }
}

impl Drop for RegistrationClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl ClientInner {
    async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
        let mut period = *self.heartbeat.lock();
        let mut ticker = heartbeat_ticker(period);
        loop {
            tokio::select! {
                received = self.dealer.recv(Flags::NONE) => match received {
                    Ok(frames) => self.on_reply(&frames),
                    Err(WireError::Closed) => break,
                    Err(err) => warn!(component = self.component, error = %err, "registration receive failed"),
                },
                Some(event) = events.recv() => {
                    if let SocketEvent::Connected { endpoint, .. } = event {
                        debug!(component = self.component, registry = ?endpoint, "registry link up, re-sending registrations");
                        self.resend_all();
                    }
                },
                _ = ticker.tick() => self.on_tick(),
            }
            let current = *self.heartbeat.lock();
            if current != period {
                period = current;
                ticker = heartbeat_ticker(period);
            }
        }
    }

    fn on_reply(&self, frames: &Frames) {
        let ack = match Message::from_frames(frames) {
            Ok(Message::Ack(ack)) => ack,
            Ok(other) => {
                warn!(component = self.component, message_id = other.id(), "unexpected registry message dropped");
                return;
            }
            Err(err) => {
                warn!(component = self.component, error = %err, "malformed registry reply dropped");
                return;
            }
        };
        if ack.heartbeat_interval_ms > 0 {
            *self.heartbeat.lock() = Duration::from_millis(u64::from(ack.heartbeat_interval_ms));
        }
        match ack.op {
            message_id::REGISTER => self.on_register_ack(ack),
            message_id::HEARTBEAT if ack.status == status::NOT_FOUND => {
                info!(component = self.component, "registry lost our registrations, re-registering");
                self.entries.lock().retain(|_, entry| entry.is_live());
                self.resend_all();
            }
            message_id::UNREGISTER => self.on_unregister_ack(ack),
            message_id::UPDATE_WEIGHT if ack.status != status::OK => {
                warn!(
                    component = self.component,
                    service = %ack.service,
                    op = ack.op,
                    status = ack.status,
                    error = %ack.error,
                    "registry refused request"
                );
            }
            _ => debug!(component = self.component, service = %ack.service, op = ack.op, "registry acknowledged"),
        }
    }

    fn on_register_ack(&self, ack: RegisterAck) {
        let entries = self.entries.lock();
        let Some(entry) = entries.get(&ack.service) else {
            debug!(component = self.component, service = %ack.service, "ack for unknown service ignored");
            return;
        };
        let result = RegistrationResult {
            status: ack.status,
            resolved_endpoint: ack.endpoint,
            error: ack.error,
        };
        if result.status == status::OK {
            if entry.slot.borrow().is_pending() {
                info!(
                    component = self.component,
                    service = %ack.service,
                    endpoint = %result.resolved_endpoint,
                    "registration acknowledged"
                );
            }
            entry.slot.send_replace(RegistrationState::Ok(result));
        } else {
            warn!(
                component = self.component,
                service = %ack.service,
                status = result.status,
                error = %result.error,
                "registration rejected"
            );
            entry.slot.send_replace(RegistrationState::Err(result));
        }
    }

    /// 注销应答（成功或注册中心已无此登记）结束“注销中”状态。
    fn on_unregister_ack(&self, ack: RegisterAck) {
        let removed = {
            let mut entries = self.entries.lock();
            let retracting = entries
                .get(&ack.service)
                .is_some_and(|entry| entry.retracting);
            retracting && entries.remove(&ack.service).is_some()
        };
        if ack.status != status::OK && ack.status != status::NOT_FOUND {
            warn!(
                component = self.component,
                service = %ack.service,
                status = ack.status,
                error = %ack.error,
                "registry refused unregister"
            );
        } else if removed {
            debug!(component = self.component, service = %ack.service, "unregister acknowledged");
        }
    }

    fn on_tick(&self) {
        let (pending, retracting, registered): (Vec<String>, Vec<String>, bool) = {
            let entries = self.entries.lock();
            let pending = entries
                .iter()
                .filter(|(_, entry)| entry.is_live() && entry.slot.borrow().is_pending())
                .map(|(service, _)| service.clone())
                .collect();
            let retracting = entries
                .iter()
                .filter(|(_, entry)| entry.retracting)
                .map(|(service, _)| service.clone())
                .collect();
            let registered = entries.values().any(|entry| {
                entry.is_live() && matches!(*entry.slot.borrow(), RegistrationState::Ok(_))
            });
            (pending, retracting, registered)
        };
        for service in pending {
            self.send_register(&service);
        }
        for service in retracting {
            if let Err(err) = self.send(Message::Unregister {
                service: service.clone(),
            }) {
                trace!(component = self.component, service = %service, error = %err, "unregister re-send deferred");
            }
        }
        if registered {
            let _ = self.send(Message::Heartbeat);
        }
    }

    /// 重新发送所有未被拒绝的登记。
    fn resend_all(&self) {
        let services: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| {
                entry.is_live() && !matches!(*entry.slot.borrow(), RegistrationState::Err(_))
            })
            .map(|(service, _)| service.clone())
            .collect();
        for service in services {
            self.send_register(&service);
        }
    }

    fn send_register(&self, service: &str) {
        let request = {
            let entries = self.entries.lock();
            let Some(entry) = entries.get(service) else {
                return;
            };
            RegisterRequest {
                service: service.to_owned(),
                endpoint: entry.endpoint.clone(),
                weight: entry.weight,
                kind: self.kind,
                bind_epoch: self.bind_epoch.load(Ordering::Acquire),
            }
        };
        if let Err(err) = self.send(Message::Register(request)) {
            debug!(component = self.component, service, error = %err, "register deferred until a registry is connected");
        }
    }

    fn send(&self, message: Message) -> Result<(), MeshError> {
        self.dealer.send(message.to_frames()).map_err(|err| match err {
            WireError::NoPeer => MeshError::NotReady {
                component: self.component,
                reason: "no registry connection",
            },
            other => other.into(),
        })
    }
}

fn heartbeat_ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
