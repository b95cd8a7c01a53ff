//! TCP 传输集成测试：验证握手、帧边界、订阅同步与断线重连。

use std::time::Duration;

use bytes::Bytes;
use spark_wire::{Flags, RoutingId, SocketEvent, WireContext, WireError};
use spark_wire_tcp::{TcpSocketConfig, TcpTransport};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn tcp_context() -> WireContext {
    let context = WireContext::new();
    TcpTransport::install(&context, TcpSocketConfig::default());
    context
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("等待条件超时");
}

#[tokio::test(flavor = "multi_thread")]
async fn router_dealer_roundtrip_over_tcp() {
    let server = tcp_context();
    let client = tcp_context();

    let router = server.router_socket(RoutingId::try_from("registry").expect("构造标识"));
    let endpoint = router.bind("tcp://127.0.0.1:0").await.expect("绑定 ROUTER");
    assert_ne!(endpoint.to_string(), "tcp://127.0.0.1:0");

    let dealer = client.dealer_socket(RoutingId::try_from("svc-a").expect("构造标识"));
    dealer.connect(&endpoint.to_string()).expect("连接 ROUTER");
    wait_until(|| dealer.peer_count() == 1).await;

    let request = vec![
        Bytes::from_static(b"head"),
        Bytes::new(),
        Bytes::from(vec![42u8; 70_000]),
    ];
    dealer.send(request.clone()).expect("发送多帧请求");
    let (identity, received) = timeout(WAIT, router.recv(Flags::NONE))
        .await
        .expect("接收超时")
        .expect("接收请求");
    assert_eq!(identity, RoutingId::try_from("svc-a").expect("构造标识"));
    assert_eq!(received, request);

    router
        .send_to(&identity, vec![Bytes::from_static(b"ok")])
        .expect("回送应答");
    let reply = timeout(WAIT, dealer.recv(Flags::NONE))
        .await
        .expect("接收超时")
        .expect("接收应答");
    assert_eq!(reply, vec![Bytes::from_static(b"ok")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn subscriptions_cross_the_wire() {
    let context = tcp_context();
    let publisher = context.pub_socket();
    let mut events = publisher.monitor();
    let endpoint = publisher
        .bind("tcp://127.0.0.1:0")
        .await
        .expect("绑定 PUB");

    let subscriber = context.sub_socket();
    subscriber.subscribe("svc.").expect("订阅");
    subscriber.connect(&endpoint.to_string()).expect("连接 PUB");

    timeout(WAIT, async {
        loop {
            if let Some(SocketEvent::Subscribed { prefix, .. }) = events.recv().await {
                assert_eq!(prefix, Bytes::from_static(b"svc."));
                break;
            }
        }
    })
    .await
    .expect("等待订阅事件超时");

    publisher
        .publish(vec![Bytes::from_static(b"other")])
        .expect("发布");
    publisher
        .publish(vec![Bytes::from_static(b"svc.echo"), Bytes::from_static(b"1")])
        .expect("发布");
    let received = timeout(WAIT, subscriber.recv(Flags::NONE))
        .await
        .expect("接收超时")
        .expect("接收消息");
    assert_eq!(received[0], Bytes::from_static(b"svc.echo"));
}

#[tokio::test(flavor = "multi_thread")]
async fn incompatible_kinds_never_link() {
    let context = tcp_context();
    let publisher = context.pub_socket();
    let endpoint = publisher
        .bind("tcp://127.0.0.1:0")
        .await
        .expect("绑定 PUB");
    let dealer = context.dealer_socket(RoutingId::random());
    dealer.connect(&endpoint.to_string()).expect("连接不应同步失败");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(dealer.peer_count(), 0);
    assert_eq!(publisher.subscriber_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn port_conflicts_are_reported() {
    let context = tcp_context();
    let first = context.router_socket(RoutingId::random());
    let endpoint = first.bind("tcp://127.0.0.1:0").await.expect("首次绑定");
    let second = context.router_socket(RoutingId::random());
    assert!(matches!(
        second.bind(&endpoint.to_string()).await,
        Err(WireError::AddressInUse { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn dealer_reconnects_after_router_restart() {
    let context = tcp_context();
    let router = context.router_socket(RoutingId::try_from("r1").expect("构造标识"));
    let endpoint = router.bind("tcp://127.0.0.1:0").await.expect("绑定 ROUTER");
    let dealer = context.dealer_socket(RoutingId::try_from("d1").expect("构造标识"));
    dealer.connect(&endpoint.to_string()).expect("连接");
    wait_until(|| dealer.peer_count() == 1).await;

    router.close();
    wait_until(|| dealer.peer_count() == 0).await;

    let restarted = context.router_socket(RoutingId::try_from("r2").expect("构造标识"));
    // 旧监听任务的撤销是异步的，端口释放前重试绑定。
    timeout(WAIT, async {
        loop {
            match restarted.bind(&endpoint.to_string()).await {
                Ok(_) => break,
                Err(WireError::AddressInUse { .. }) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(err) => panic!("重新绑定失败: {err}"),
            }
        }
    })
    .await
    .expect("在同一端口重新绑定");
    wait_until(|| dealer.peer_count() == 1).await;
    dealer
        .send(vec![Bytes::from_static(b"again")])
        .expect("重连后发送");
    let (identity, _) = timeout(WAIT, restarted.recv(Flags::NONE))
        .await
        .expect("接收超时")
        .expect("接收请求");
    assert_eq!(identity, RoutingId::try_from("d1").expect("构造标识"));
}
