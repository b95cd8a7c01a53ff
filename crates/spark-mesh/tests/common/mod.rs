//! 集成测试共用的启动与等待工具。

#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use spark_mesh::{Discovery, Provider, Registry};
use spark_wire::{Flags, Frames, WireContext};
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

/// 测试中使用的广播间隔，缩短以加快收敛。
pub const BROADCAST_MS: u64 = 20;

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("等待条件超时");
}

pub fn frames(parts: &[&'static [u8]]) -> Frames {
    parts.iter().map(|part| Bytes::from_static(part)).collect()
}

/// 以 `inproc://{name}-pub` 与 `inproc://{name}-router` 启动一个注册中心。
pub async fn start_registry(wire: &WireContext, name: &str) -> Registry {
    let registry = Registry::new(wire);
    registry
        .set_endpoints(
            &format!("inproc://{name}-pub"),
            &format!("inproc://{name}-router"),
        )
        .expect("设置注册中心端点");
    registry
        .set_broadcast_interval(BROADCAST_MS)
        .expect("设置广播间隔");
    registry.start().await.expect("启动注册中心");
    registry
}

pub fn discovery_for(wire: &WireContext, registry_name: &str, service: &str) -> Discovery {
    let discovery = Discovery::new(wire);
    discovery.subscribe(service).expect("订阅服务");
    discovery
        .connect_registry(&format!("inproc://{registry_name}-pub"))
        .expect("连接注册中心广播端点");
    discovery
}

/// 绑定、连接注册中心并等待登记成功。
pub async fn registered_provider(
    wire: &WireContext,
    registry_name: &str,
    endpoint: &str,
    service: &str,
    weight: u32,
) -> Provider {
    let provider = Provider::new(wire);
    provider.bind(endpoint).await.expect("绑定请求端点");
    provider
        .connect_registry(&format!("inproc://{registry_name}-router"))
        .expect("连接注册中心控制端点");
    provider.register(service, "", weight).expect("发出登记");
    provider
        .wait_registered(service, WAIT)
        .await
        .expect("登记成功");
    provider
}

/// 收取实例上已到达的请求，直到静默 `quiet` 为止。
pub async fn drain(provider: &Provider, quiet: Duration) -> usize {
    let mut received = 0;
    while let Ok(Ok(_)) = timeout(quiet, provider.router_socket().recv(Flags::NONE)).await {
        received += 1;
    }
    received
}
