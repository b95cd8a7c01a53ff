use std::sync::Arc;

use async_trait::async_trait;
use spark_wire::{Binding, Endpoint, SocketHandle, Transport, WeakSocket, WireContext, WireError};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::channel::establish;
use crate::config::TcpSocketConfig;
use crate::error::{self, map_io_error, timeout_error};
use crate::listener::TcpListener;

/// `tcp://` 协议的 [`Transport`] 实现。
#[derive(Clone, Debug, Default)]
pub struct TcpTransport {
    config: TcpSocketConfig,
}

impl TcpTransport {
    pub fn new(config: TcpSocketConfig) -> Self {
        Self { config }
    }

    /// 构造并注册到上下文。
    pub fn install(context: &WireContext, config: TcpSocketConfig) {
        context.register_transport(Arc::new(Self::new(config)));
    }

    pub fn config(&self) -> &TcpSocketConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    async fn bind(&self, socket: SocketHandle, endpoint: &Endpoint) -> Result<Binding, WireError> {
        let listener = TcpListener::bind(endpoint).await?;
        let local = listener.local_endpoint().clone();
        let task = listener.spawn_accept_loop(socket.downgrade(), self.config.clone());
        Ok(Binding::new(local, move || task.abort()))
    }

    fn connect(
        &self,
        socket: WeakSocket,
        endpoint: &Endpoint,
    ) -> Result<JoinHandle<()>, WireError> {
        let addr = endpoint.socket_addr_text().ok_or_else(|| WireError::UnsupportedScheme {
            scheme: endpoint.scheme().to_owned(),
        })?;
        let endpoint = endpoint.clone();
        let config = self.config.clone();
        Ok(tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                let options = match socket.upgrade() {
                    Some(handle) if !handle.is_closed() => handle.options().clone(),
                    _ => return,
                };
                let connected =
                    tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr.as_str()))
                        .await
                        .map_err(|_| timeout_error(error::CONNECT, config.connect_timeout()))
                        .and_then(|result| result.map_err(|err| map_io_error(error::CONNECT, err)));
                let linked = match connected {
                    Ok(stream) => establish(&socket, stream, Some(endpoint.clone()), &config).await,
                    Err(err) => Err(err),
                };
                match linked {
                    Ok(state) => {
                        attempt = 0;
                        state.closed().await;
                        debug!(endpoint = %endpoint, "tcp link closed, reconnecting");
                        tokio::time::sleep(options.reconnect_interval()).await;
                    }
                    Err(WireError::Closed) => return,
                    Err(err) => {
                        debug!(
                            endpoint = %endpoint,
                            attempt,
                            error = %err,
                            "tcp connect attempt failed"
                        );
                        tokio::time::sleep(options.backoff(attempt)).await;
                        attempt = attempt.saturating_add(1);
                    }
                }
            }
        }))
    }
}
