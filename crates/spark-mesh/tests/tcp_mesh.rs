//! TCP 传输上的服务网格端到端测试：注册中心、实例与网关分属不同的上下文。

mod common;

use std::time::Duration;

use common::{BROADCAST_MS, frames, wait_until};
use spark_mesh::{Discovery, Gateway, Provider, Registry};
use spark_wire::{Flags, WireContext};
use spark_wire_tcp::{TcpSocketConfig, TcpTransport};

const WAIT: Duration = Duration::from_secs(10);

fn tcp_context() -> WireContext {
    let context = WireContext::new();
    TcpTransport::install(&context, TcpSocketConfig::default());
    context
}

#[tokio::test(flavor = "multi_thread")]
async fn request_reply_over_tcp() {
    let registry_wire = tcp_context();
    let registry = Registry::new(&registry_wire);
    registry
        .set_endpoints("tcp://127.0.0.1:0", "tcp://127.0.0.1:0")
        .expect("设置端点");
    registry
        .set_broadcast_interval(BROADCAST_MS)
        .expect("设置广播间隔");
    registry.start().await.expect("启动注册中心");
    let pub_endpoint = registry.pub_endpoint().expect("广播端点").to_string();
    let router_endpoint = registry.router_endpoint().expect("控制端点").to_string();

    let provider_wire = tcp_context();
    let provider = Provider::new(&provider_wire);
    let bound = provider
        .bind("tcp://127.0.0.1:0")
        .await
        .expect("绑定请求端点");
    provider.connect_registry(&router_endpoint).expect("连接注册中心");
    provider.register("echo", "", 1).expect("发出登记");
    let result = provider
        .wait_registered("echo", WAIT)
        .await
        .expect("登记成功");
    assert_eq!(result.resolved_endpoint, bound.to_string());

    let client_wire = tcp_context();
    let discovery = Discovery::new(&client_wire);
    discovery.subscribe("echo").expect("订阅服务");
    discovery.connect_registry(&pub_endpoint).expect("连接广播端点");
    let gateway = Gateway::new(&client_wire, discovery.clone());
    wait_until(|| gateway.connection_count("echo") == 1).await;

    gateway.send("echo", frames(&[b"ping", b"1"])).expect("网关发送");
    let (caller, request) = tokio::time::timeout(WAIT, provider.router_socket().recv(Flags::NONE))
        .await
        .expect("等待请求超时")
        .expect("实例收到请求");
    assert_eq!(request, frames(&[b"ping", b"1"]));
    provider
        .router_socket()
        .send_to(&caller, frames(&[b"pong", b"1"]))
        .expect("实例应答");
    let (service, reply) = tokio::time::timeout(WAIT, gateway.recv(Flags::NONE))
        .await
        .expect("等待应答超时")
        .expect("网关收到应答");
    assert_eq!(service, "echo");
    assert_eq!(reply, frames(&[b"pong", b"1"]));

    provider.unregister("echo").expect("撤回登记");
    wait_until(|| discovery.provider_count("echo") == 0).await;
    wait_until(|| gateway.connection_count("echo") == 0).await;

    gateway.close();
    provider.close();
    registry.close();
}
