//! spark-meshd：按配置文件启动注册中心，并可在同一进程内运行一个主题节点。
//!
//! # 使用方法
//! ```bash
//! RUST_LOG=spark_mesh=debug spark-meshd mesh.toml
//! ```
//! - 注册中心的端点、对端与各项周期取自配置根节点的 `[registry]` 等段；
//! - `[spot_node]` 存在时启动主题节点，登记到本进程的注册中心并创建列出的主题；
//! - 收到 `Ctrl-C` 后依次关闭主题节点与注册中心。

mod config;
mod telemetry;

use std::env;

use anyhow::{Context, anyhow};
use spark_mesh::{Discovery, Registry, ServiceKind, Spot, SpotNode};
use spark_wire::WireContext;
use spark_wire_tcp::TcpTransport;
use tracing::{info, warn};

use crate::config::{DaemonConfig, SpotNodeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::install()?;
    let path = env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("用法: spark-meshd <配置文件路径>"))?;
    let config = DaemonConfig::load(&path)?;
    run(config).await
}

/// 与主题节点同生命周期的句柄。
struct SpotRuntime {
    node: SpotNode,
    discovery: Option<Discovery>,
    // 持有主题表的 Spot 句柄，节点关闭前保持存活。
    _topics: Spot,
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let wire = WireContext::with_options(config.mesh.wire.clone());
    TcpTransport::install(&wire, config.tcp.clone());

    let registry = Registry::from_config(&wire, &config.mesh.registry)?;
    registry.start().await.context("注册中心启动失败")?;
    let pub_endpoint = registry
        .pub_endpoint()
        .ok_or_else(|| anyhow!("注册中心未进入运行状态"))?;
    let router_endpoint = registry
        .router_endpoint()
        .ok_or_else(|| anyhow!("注册中心未进入运行状态"))?;
    info!(
        registry = registry.id(),
        pub_endpoint = %pub_endpoint,
        router_endpoint = %router_endpoint,
        "spark-meshd running"
    );

    let spot = match &config.spot_node {
        Some(node_config) => Some(
            start_spot_node(
                &wire,
                &config,
                node_config,
                &pub_endpoint.resolve_advertise().to_string(),
                &router_endpoint.resolve_advertise().to_string(),
            )
            .await?,
        ),
        None => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("等待退出信号失败")?;
    info!("shutdown requested");

    if let Some(runtime) = spot {
        runtime.node.close();
        if let Some(discovery) = runtime.discovery {
            discovery.close();
        }
    }
    registry.close();
    Ok(())
}

async fn start_spot_node(
    wire: &WireContext,
    config: &DaemonConfig,
    node_config: &SpotNodeConfig,
    registry_pub: &str,
    registry_router: &str,
) -> anyhow::Result<SpotRuntime> {
    let node = SpotNode::with_config(wire, &config.mesh.spot, &config.mesh.provider);
    let bound = node.bind(&node_config.bind).await.context("主题节点绑定失败")?;
    node.connect_registry(registry_router)?;
    node.register(&node_config.service, &node_config.advertise, node_config.weight)?;

    for peer in &node_config.peers {
        node.connect_peer_pub(peer)
            .with_context(|| format!("连接对端 {peer} 失败"))?;
    }
    let discovery = if node_config.discover {
        let discovery =
            Discovery::from_config(wire, Some(ServiceKind::SpotNode), &config.mesh.discovery)?;
        discovery.connect_registry(registry_pub)?;
        node.set_discovery(discovery.clone(), &node_config.service)?;
        Some(discovery)
    } else {
        None
    };

    let topics = Spot::new(&node);
    for topic in &node_config.topics {
        topics.topic_create(&topic.name, topic.mode)?;
    }
    info!(
        endpoint = %bound,
        service = %node_config.service,
        topics = node_config.topics.len(),
        "spot node running"
    );

    let waited = node
        .wait_registered(&node_config.service, config.mesh.provider.heartbeat_interval() * 3)
        .await;
    if let Err(err) = waited {
        warn!(error = %err, code = err.code(), "spot node registration not confirmed yet");
    }

    Ok(SpotRuntime {
        node,
        discovery,
        _topics: topics,
    })
}
