//! 登记、发现与网关转发的端到端测试。
//!
//! # 测试目标（Why）
//! - 走通“实例登记 → 注册中心广播 → 发现副本 → 网关转发 → 实例应答”的完整链路；
//! - 验证撤回、心跳超时、端点接管与权重调整在发现副本上的可见效果；
//! - 验证轮询与加权随机两种策略在真实链路上的分布。

mod common;

use std::time::{Duration, Instant};

use bytes::Bytes;
use common::{
    BROADCAST_MS, WAIT, discovery_for, drain, frames, registered_provider, start_registry,
    wait_until,
};
use spark_mesh::{
    Gateway, MeshError, Provider, ProviderConfig, RegistrationState, Strategy, Unavailable,
    status,
};
use spark_wire::{Flags, RoutingId, WireContext};

#[tokio::test(flavor = "multi_thread")]
async fn request_reply_through_gateway() {
    let wire = WireContext::new();
    let registry = start_registry(&wire, "scenario-reg").await;
    let discovery = discovery_for(&wire, "scenario-reg", "svc");

    let provider = Provider::new(&wire);
    provider.bind("inproc://scenario-ep1").await.expect("绑定 ep1");
    provider
        .connect_registry("inproc://scenario-reg-router")
        .expect("连接注册中心");
    provider.register("svc", "", 1).expect("发出登记");
    let result = provider
        .wait_registered("svc", WAIT)
        .await
        .expect("登记成功");
    assert_eq!(result.status, status::OK);
    assert_eq!(result.resolved_endpoint, "inproc://scenario-ep1");

    let registered = Instant::now();
    wait_until(|| discovery.provider_count("svc") == 1).await;
    assert!(registered.elapsed() < Duration::from_millis(200));
    assert!(discovery.service_available("svc"));

    let gateway = Gateway::new(&wire, discovery.clone());
    assert_eq!(gateway.load_balancing_strategy("svc"), Strategy::RoundRobin);
    wait_until(|| gateway.connection_count("svc") == 1).await;
    gateway.send("svc", frames(&[b"hello"])).expect("网关发送");

    let (caller, request) = tokio::time::timeout(WAIT, provider.router_socket().recv(Flags::NONE))
        .await
        .expect("等待请求超时")
        .expect("实例收到请求");
    assert_eq!(request, frames(&[b"hello"]));
    provider
        .router_socket()
        .send_to(&caller, frames(&[b"world"]))
        .expect("实例应答");

    let (service, reply) = tokio::time::timeout(WAIT, gateway.recv(Flags::NONE))
        .await
        .expect("等待应答超时")
        .expect("网关收到应答");
    assert_eq!(service, "svc");
    assert_eq!(reply, frames(&[b"world"]));

    gateway.close();
    provider.close();
    discovery.close();
    registry.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn unregister_retracts_exactly_one_provider() {
    let wire = WireContext::new();
    let registry = start_registry(&wire, "retract-reg").await;
    let discovery = discovery_for(&wire, "retract-reg", "svc");
    let first = registered_provider(&wire, "retract-reg", "inproc://retract-a", "svc", 1).await;
    let second = registered_provider(&wire, "retract-reg", "inproc://retract-b", "svc", 1).await;
    wait_until(|| discovery.provider_count("svc") == 2).await;

    first.unregister("svc").expect("撤回登记");
    assert!(matches!(first.register_result("svc"), Err(MeshError::NotFound { .. })));
    wait_until(|| discovery.provider_count("svc") == 1).await;

    tokio::time::sleep(Duration::from_millis(BROADCAST_MS * 5)).await;
    let remaining = discovery.get_providers("svc");
    assert_eq!(remaining.len(), 1);
    assert_eq!(&remaining[0].routing_id, second.routing_id());
    assert_eq!(registry.provider_count("svc"), 1);

    first.close();
    second.close();
    registry.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn round_robin_is_fair_over_live_links() {
    let wire = WireContext::new();
    let registry = start_registry(&wire, "rr-reg").await;
    let discovery = discovery_for(&wire, "rr-reg", "svc");
    let mut providers = Vec::new();
    for name in ["rr-a", "rr-b", "rr-c"] {
        providers.push(
            registered_provider(&wire, "rr-reg", &format!("inproc://{name}"), "svc", 1).await,
        );
    }
    let gateway = Gateway::new(&wire, discovery.clone());
    wait_until(|| gateway.connection_count("svc") == 3).await;

    let sends = 300;
    for _ in 0..sends {
        gateway.send("svc", frames(&[b"job"])).expect("网关发送");
    }
    let mut total = 0;
    for provider in &providers {
        let received = drain(provider, Duration::from_millis(300)).await;
        assert!(
            received.abs_diff(sends / providers.len()) <= 1,
            "轮询分布失衡：{received}"
        );
        total += received;
    }
    assert_eq!(total, sends);

    gateway.close();
    registry.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn weighted_strategy_follows_weights() {
    let wire = WireContext::new();
    let registry = start_registry(&wire, "weighted-reg").await;
    let discovery = discovery_for(&wire, "weighted-reg", "svc");
    let light =
        registered_provider(&wire, "weighted-reg", "inproc://weighted-light", "svc", 1).await;
    let heavy =
        registered_provider(&wire, "weighted-reg", "inproc://weighted-heavy", "svc", 3).await;
    let gateway = Gateway::new(&wire, discovery.clone());
    gateway.set_load_balancing_strategy("svc", Strategy::Weighted);
    wait_until(|| gateway.connection_count("svc") == 2).await;

    let sends = 4000;
    for _ in 0..sends {
        gateway.send("svc", frames(&[b"job"])).expect("网关发送");
    }
    let light_count = drain(&light, Duration::from_millis(300)).await;
    let heavy_count = drain(&heavy, Duration::from_millis(300)).await;
    assert_eq!(light_count + heavy_count, sends);
    let share = light_count as f64 / sends as f64;
    assert!((0.20..=0.30).contains(&share), "轻实例占比 {share}");

    gateway.close();
    registry.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn gateway_reports_why_nothing_is_available() {
    let wire = WireContext::new();
    let registry = start_registry(&wire, "empty-reg").await;
    let discovery = discovery_for(&wire, "empty-reg", "svc");
    let gateway = Gateway::new(&wire, discovery.clone());

    match gateway.send("svc", frames(&[b"x"])) {
        Err(MeshError::Unavailable { reason, .. }) => assert_eq!(reason, Unavailable::NoProviders),
        other => panic!("期望无实例错误，实际 {other:?}"),
    }
    assert!(matches!(
        gateway.send("svc", Vec::new()),
        Err(MeshError::Validation { .. })
    ));
    assert!(matches!(
        gateway.send_to("svc", &RoutingId::random(), frames(&[b"x"])),
        Err(MeshError::NotFound { .. })
    ));

    let provider = registered_provider(&wire, "empty-reg", "inproc://empty-zero", "svc", 0).await;
    wait_until(|| discovery.provider_count("svc") == 1).await;
    gateway.set_load_balancing_strategy("svc", Strategy::Weighted);
    match gateway.send("svc", frames(&[b"x"])) {
        Err(MeshError::Unavailable { reason, .. }) => assert_eq!(reason, Unavailable::NoProviders),
        other => panic!("权重全为零时期望无实例错误，实际 {other:?}"),
    }

    wait_until(|| gateway.connection_count("svc") == 1).await;
    gateway
        .send_to("svc", provider.routing_id(), frames(&[b"direct"]))
        .expect("定向发送");
    let (_, request) = tokio::time::timeout(WAIT, provider.router_socket().recv(Flags::NONE))
        .await
        .expect("等待请求超时")
        .expect("实例收到定向请求");
    assert_eq!(request, vec![Bytes::from_static(b"direct")]);

    gateway.close();
    provider.close();
    registry.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn result_reads_are_idempotent() {
    let wire = WireContext::new();
    let registry = start_registry(&wire, "idem-reg").await;
    let provider = registered_provider(&wire, "idem-reg", "inproc://idem-ep", "svc", 1).await;

    let first = provider.register_result("svc").expect("第一次读取");
    let second = provider.register_result("svc").expect("第二次读取");
    assert_eq!(first, second);
    match first {
        RegistrationState::Ok(result) => {
            assert_eq!(result.status, status::OK);
            assert_eq!(result.resolved_endpoint, "inproc://idem-ep");
        }
        other => panic!("期望登记成功，实际 {other:?}"),
    }

    provider.close();
    registry.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn newer_identity_takes_over_the_endpoint() {
    let wire = WireContext::new();
    let registry = start_registry(&wire, "takeover-reg").await;
    let observer = discovery_for(&wire, "takeover-reg", "svc");
    let crashed =
        registered_provider(&wire, "takeover-reg", "inproc://takeover-ep", "svc", 1).await;
    let crashed_id = crashed.routing_id().clone();
    wait_until(|| observer.provider_count("svc") == 1).await;
    // 进程崩溃：不注销，旧记录仍在心跳超时窗口内。
    crashed.close();

    let successor = Provider::new(&wire);
    successor
        .bind("inproc://takeover-successor")
        .await
        .expect("绑定请求端点");
    successor
        .connect_registry("inproc://takeover-reg-router")
        .expect("连接注册中心");
    successor
        .register("svc", "inproc://takeover-ep", 2)
        .expect("发出登记");
    let result = successor
        .wait_registered("svc", WAIT)
        .await
        .expect("后到的登记接管端点");
    assert_eq!(result.status, status::OK);
    assert_eq!(result.resolved_endpoint, "inproc://takeover-ep");

    let providers = registry.providers("svc");
    assert_eq!(providers.len(), 1);
    assert_eq!(&providers[0].routing_id, successor.routing_id());
    assert_eq!(providers[0].weight, 2);
    wait_until(|| {
        let cached = observer.get_providers("svc");
        cached.len() == 1 && cached[0].routing_id != crashed_id
    })
    .await;

    successor.close();
    registry.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn weight_updates_keep_registration_time() {
    let wire = WireContext::new();
    let registry = start_registry(&wire, "weight-reg").await;
    let discovery = discovery_for(&wire, "weight-reg", "svc");
    let provider = registered_provider(&wire, "weight-reg", "inproc://weight-ep", "svc", 1).await;
    wait_until(|| discovery.provider_count("svc") == 1).await;
    let before = discovery.get_providers("svc")[0].clone();

    provider.update_weight("svc", 7).expect("调整权重");
    wait_until(|| {
        discovery
            .get_providers("svc")
            .first()
            .is_some_and(|record| record.weight == 7)
    })
    .await;
    let after = discovery.get_providers("svc")[0].clone();
    assert_eq!(after.registered_at, before.registered_at);
    assert!(after.revision > before.revision);

    provider.close();
    registry.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_provider_is_evicted() {
    let wire = WireContext::new();
    let registry = spark_mesh::Registry::new(&wire);
    registry
        .set_endpoints("inproc://evict-reg-pub", "inproc://evict-reg-router")
        .expect("设置端点");
    registry.set_heartbeat(50, 200).expect("设置心跳");
    registry
        .set_broadcast_interval(BROADCAST_MS)
        .expect("设置广播间隔");
    registry.start().await.expect("启动注册中心");
    let discovery = discovery_for(&wire, "evict-reg", "svc");

    let provider = Provider::with_config(
        &wire,
        RoutingId::random(),
        &ProviderConfig {
            heartbeat_interval_ms: 50,
        },
    );
    provider.bind("inproc://evict-ep").await.expect("绑定");
    provider
        .connect_registry("inproc://evict-reg-router")
        .expect("连接注册中心");
    provider.register("svc", "", 1).expect("发出登记");
    provider.wait_registered("svc", WAIT).await.expect("登记成功");
    wait_until(|| discovery.provider_count("svc") == 1).await;

    // 心跳持续期间记录保持存在。
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(discovery.provider_count("svc"), 1);

    provider.close();
    wait_until(|| discovery.provider_count("svc") == 0).await;
    assert_eq!(registry.provider_count("svc"), 0);

    registry.close();
}
