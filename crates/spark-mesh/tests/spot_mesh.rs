//! 主题网格端到端测试。
//!
//! # 测试目标（Why）
//! - 节点经注册中心互相发现后，订阅方能收到发布方的主题消息；
//! - 晚加入的订阅者在 `QUEUE` 模式下收不到旧消息，在 `RING_BUFFER` 模式下收到重放；
//! - 不同主题与不匹配的模式之间互不串扰。

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{WAIT, frames, start_registry, wait_until};
use spark_mesh::{Discovery, MeshError, ServiceKind, Spot, SpotNode, TopicMode};
use spark_wire::{Flags, WireContext};

async fn recv_within(spot: &Spot, limit: Duration) -> Option<(String, Vec<Bytes>)> {
    tokio::time::timeout(limit, spot.recv(Flags::NONE))
        .await
        .ok()
        .and_then(Result::ok)
}

#[tokio::test(flavor = "multi_thread")]
async fn late_subscribers_see_only_retained_topics() {
    let wire = WireContext::new();
    let registry = start_registry(&wire, "spot-reg").await;

    let node_a = SpotNode::new(&wire);
    node_a.bind("inproc://spot-a").await.expect("节点 A 绑定");
    node_a
        .connect_registry("inproc://spot-reg-router")
        .expect("节点 A 连接注册中心");
    node_a.register("spot", "", 1).expect("节点 A 登记");
    node_a
        .wait_registered("spot", WAIT)
        .await
        .expect("节点 A 登记成功");
    let spot_a = Spot::new(&node_a);
    spot_a.topic_create("t", TopicMode::Queue).expect("创建 QUEUE 主题");
    spot_a
        .topic_create("r", TopicMode::RingBuffer)
        .expect("创建 RING_BUFFER 主题");

    let discovery = Discovery::with_kind(&wire, ServiceKind::SpotNode);
    discovery
        .connect_registry("inproc://spot-reg-pub")
        .expect("连接注册中心广播端点");
    let node_b = SpotNode::new(&wire);
    node_b.set_discovery(discovery.clone(), "spot").expect("节点 B 启用自动发现");
    wait_until(|| node_b.peers().len() == 1).await;
    let spot_b = Spot::new(&node_b);
    spot_b.subscribe("t").expect("节点 B 订阅 t");

    // 订阅声明异步到达发布端，QUEUE 主题在此之前发布的消息会丢失。
    let received = tokio::time::timeout(WAIT, async {
        loop {
            spot_a.publish("t", frames(&[b"m"])).expect("发布到 t");
            if let Some(message) = recv_within(&spot_b, Duration::from_millis(50)).await {
                return message;
            }
        }
    })
    .await
    .expect("节点 B 应在 5 秒内收到消息");
    assert_eq!(received, ("t".to_owned(), frames(&[b"m"])));

    spot_a.publish("r", frames(&[b"m"])).expect("发布到 r");

    let node_c = SpotNode::new(&wire);
    let spot_c = Spot::new(&node_c);
    spot_c.subscribe("t").expect("节点 C 订阅 t");
    spot_c.subscribe("r").expect("节点 C 订阅 r");
    node_c.connect_peer_pub("inproc://spot-a").expect("节点 C 连接 A");

    let replayed = recv_within(&spot_c, WAIT).await.expect("节点 C 收到重放");
    assert_eq!(replayed, ("r".to_owned(), frames(&[b"m"])));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(
        spot_c.recv(Flags::DONTWAIT).await,
        Err(MeshError::WouldBlock)
    ));

    node_c.close();
    node_b.close();
    node_a.close();
    discovery.close();
    registry.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn topics_are_isolated_across_nodes() {
    let wire = WireContext::new();
    let publisher_node = SpotNode::new(&wire);
    publisher_node
        .bind("inproc://isolation-pub")
        .await
        .expect("发布节点绑定");
    let publisher = Spot::new(&publisher_node);
    publisher.topic_create("a", TopicMode::RingBuffer).expect("创建主题 a");
    publisher.topic_create("z", TopicMode::RingBuffer).expect("创建主题 z");
    publisher.publish("a", frames(&[b"for-a"])).expect("发布到 a");

    let subscriber_node = SpotNode::new(&wire);
    let exact_b = Spot::new(&subscriber_node);
    let pattern_x = Spot::new(&subscriber_node);
    let witness = Spot::new(&subscriber_node);
    exact_b.subscribe("b").expect("订阅 b");
    pattern_x.subscribe_pattern("x*").expect("订阅 x*");
    witness.subscribe("z").expect("订阅 z");
    subscriber_node
        .connect_peer_pub("inproc://isolation-pub")
        .expect("连接发布节点");

    publisher.publish("z", frames(&[b"marker"])).expect("发布标记");
    let (topic, _) = recv_within(&witness, WAIT).await.expect("标记送达");
    assert_eq!(topic, "z");
    publisher.publish("a", frames(&[b"again"])).expect("再次发布到 a");
    tokio::time::sleep(Duration::from_millis(100)).await;

    for spot in [&exact_b, &pattern_x] {
        assert!(matches!(
            spot.recv(Flags::DONTWAIT).await,
            Err(MeshError::WouldBlock)
        ));
    }

    subscriber_node.close();
    publisher_node.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn peers_are_tracked_and_released() {
    let wire = WireContext::new();
    let node = SpotNode::new(&wire);
    node.connect_peer_pub("inproc://peer-one").expect("连接对端");
    node.connect_peer_pub("inproc://peer-one").expect("重复连接保持幂等");
    assert_eq!(node.peers().len(), 1);
    node.disconnect_peer_pub("inproc://peer-one").expect("断开对端");
    assert!(node.peers().is_empty());
    assert!(matches!(
        node.disconnect_peer_pub("inproc://peer-one"),
        Err(MeshError::NotFound { .. })
    ));

    let spot = Spot::new(&node);
    spot.close();
    assert!(matches!(
        spot.publish("t", frames(&[b"x"])),
        Err(MeshError::Closed)
    ));
    assert!(matches!(spot.subscribe("t"), Err(MeshError::Closed)));
    node.close();
}
