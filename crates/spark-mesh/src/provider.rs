//! # provider 模块说明
//!
//! ## 角色定位（Why）
//! - [`Provider`]（别名 [`Receiver`]）代表一个服务实例：ROUTER 套接字承接网关转发来的请求，
//!   登记客户端负责向注册中心公布自己；
//! - 请求与应答完全由宿主程序通过 [`Provider::router_socket`] 处理，本模块只管控制面。
//!
//! ## 契约（What）
//! - 顺序为 `bind` → `connect_registry` → `register`，提前调用返回 [`MeshError::NotReady`]；
//! - 名称与端点在本地校验，不合法的请求不会发往注册中心；
//! - 公布端点为空时使用绑定端点，通配主机替换为回环地址。

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use spark_wire::{Endpoint, RouterSocket, RoutingId, WireContext};
use tracing::info;

use crate::config::ProviderConfig;
use crate::error::MeshError;
use crate::registration::{RegistrationClient, RegistrationResult, RegistrationState};
use crate::table::ServiceKind;
use crate::validate;

const COMPONENT: &str = "provider";

/// 服务实例。
pub struct Provider {
    routing_id: RoutingId,
    router: RouterSocket,
    binding: AtomicBool,
    bound: Mutex<Option<Endpoint>>,
    registry_connected: AtomicBool,
    client: RegistrationClient,
}

/// 与 [`Provider`] 是同一角色。
pub type Receiver = Provider;

impl Provider {
    pub fn new(wire: &WireContext) -> Self {
        Self::with_config(wire, RoutingId::random(), &ProviderConfig::default())
    }

    pub fn with_routing_id(wire: &WireContext, routing_id: RoutingId) -> Self {
        Self::with_config(wire, routing_id, &ProviderConfig::default())
    }

    pub fn with_config(wire: &WireContext, routing_id: RoutingId, config: &ProviderConfig) -> Self {
        Self {
            router: wire.router_socket(routing_id.clone()),
            client: RegistrationClient::new(
                wire,
                routing_id.clone(),
                ServiceKind::Receiver,
                COMPONENT,
                config.heartbeat_interval(),
            ),
            routing_id,
            binding: AtomicBool::new(false),
            bound: Mutex::new(None),
            registry_connected: AtomicBool::new(false),
        }
    }

    pub fn routing_id(&self) -> &RoutingId {
        &self.routing_id
    }

    /// 绑定请求端点，返回实际端点。每个实例只能绑定一次。
    pub async fn bind(&self, endpoint: &str) -> Result<Endpoint, MeshError> {
        validate::endpoint(endpoint)?;
        if self.binding.swap(true, Ordering::AcqRel) {
            return Err(MeshError::conflict(
                "provider",
                self.routing_id.to_string(),
                "already bound",
            ));
        }
        match self.router.bind(endpoint).await {
            Ok(resolved) => {
                self.client.set_bind_epoch(rand::rng().random());
                *self.bound.lock() = Some(resolved.clone());
                info!(routing_id = %self.routing_id, endpoint = %resolved, "provider bound");
                Ok(resolved)
            }
            Err(err) => {
                self.binding.store(false, Ordering::Release);
                Err(err.into())
            }
        }
    }

    pub fn bound_endpoint(&self) -> Option<Endpoint> {
        self.bound.lock().clone()
    }

    /// 连接注册中心的控制端点；链路在后台建立并在断开后重连。
    pub fn connect_registry(&self, endpoint: &str) -> Result<(), MeshError> {
        self.client.connect(endpoint)?;
        self.registry_connected.store(true, Ordering::Release);
        Ok(())
    }

    /// 发出登记请求并立即返回，结果经 [`Provider::register_result`] 读取。
    pub fn register(&self, service: &str, advertise: &str, weight: u32) -> Result<(), MeshError> {
        validate::service_name(service)?;
        let endpoint = advertise_endpoint(advertise, self.bound_endpoint(), COMPONENT)?;
        if !self.registry_connected.load(Ordering::Acquire) {
            return Err(MeshError::NotReady {
                component: COMPONENT,
                reason: "connect_registry has not been called",
            });
        }
        self.client.register(service, endpoint, weight);
        Ok(())
    }

    pub fn register_result(&self, service: &str) -> Result<RegistrationState, MeshError> {
        self.client.result(service)
    }

    pub async fn wait_registered(
        &self,
        service: &str,
        timeout: Duration,
    ) -> Result<RegistrationResult, MeshError> {
        self.client.wait(service, timeout).await
    }

    /// 只修改权重，不影响登记时间。
    pub fn update_weight(&self, service: &str, weight: u32) -> Result<(), MeshError> {
        self.client.update_weight(service, weight)
    }

    /// 请求撤回登记；请求端点在本地仍可继续使用。
    pub fn unregister(&self, service: &str) -> Result<(), MeshError> {
        self.client.unregister(service)
    }

    pub fn services(&self) -> Vec<String> {
        self.client.services()
    }

    /// 是否已有一条到注册中心的活动链路。
    pub fn registry_linked(&self) -> bool {
        self.client.has_registry()
    }

    pub fn router_socket(&self) -> &RouterSocket {
        &self.router
    }

    pub fn close(&self) {
        self.client.close();
        self.router.close();
    }
}

/// 计算对外公布的端点：为空时使用绑定端点，通配主机替换为回环地址。
pub(crate) fn advertise_endpoint(
    advertise: &str,
    bound: Option<Endpoint>,
    component: &'static str,
) -> Result<String, MeshError> {
    let explicit = if advertise.is_empty() {
        None
    } else {
        Some(validate::endpoint(advertise)?)
    };
    let Some(bound) = bound else {
        return Err(MeshError::NotReady {
            component,
            reason: "bind has not been called",
        });
    };
    Ok(explicit.unwrap_or(bound).resolve_advertise().to_string())
}
