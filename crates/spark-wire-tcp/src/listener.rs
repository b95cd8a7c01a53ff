use spark_wire::{Endpoint, SocketHandle, WeakSocket, WireError};
use tokio::net::TcpListener as TokioTcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::accept_link;
use crate::config::TcpSocketConfig;
use crate::error::{self, map_bind_error, map_io_error};

/// 对 Tokio `TcpListener` 的封装，负责把入站连接交给所属套接字。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 绑定阶段同步返回实际端口，`tcp://host:0` 因而可以得到可公布的端点；
/// - 接受循环只持有套接字的弱引用，套接字释放后循环自行退出。
///
/// ## 契约 (What)
/// - `bind`：失败时区分端口占用（[`WireError::AddressInUse`]）与其他 IO 错误；
/// - `spawn_accept_loop`：每条入站连接在独立任务中完成握手，慢握手不阻塞后续接受。
///
/// ## 注意事项 (Trade-offs)
/// - 未设置 `SO_REUSEPORT`；同一端口的重复绑定直接失败。
#[derive(Debug)]
pub struct TcpListener {
    inner: TokioTcpListener,
    local: Endpoint,
}

impl TcpListener {
    /// 绑定到 TCP 端点，端口 `0` 会被替换为系统分配的端口。
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, WireError> {
        let Endpoint::Tcp { host, .. } = endpoint else {
            return Err(WireError::UnsupportedScheme {
                scheme: endpoint.scheme().to_owned(),
            });
        };
        let addr = endpoint
            .socket_addr_text()
            .ok_or_else(|| WireError::invalid_endpoint(&endpoint.to_string(), "not a tcp endpoint"))?;
        let listener = TokioTcpListener::bind(addr.as_str())
            .await
            .map_err(|err| map_bind_error(&endpoint.to_string(), err))?;
        let local = listener
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        Ok(Self {
            inner: listener,
            local: Endpoint::Tcp {
                host: host.clone(),
                port: local.port(),
            },
        })
    }

    /// 实际生效的端点。
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    pub(crate) fn spawn_accept_loop(
        self,
        socket: WeakSocket,
        config: TcpSocketConfig,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let accepted = self.inner.accept().await;
                let Some(handle): Option<SocketHandle> = socket.upgrade() else {
                    return;
                };
                if handle.is_closed() {
                    return;
                }
                match accepted {
                    Ok((stream, remote)) => {
                        debug!(endpoint = %self.local, %remote, "tcp connection accepted");
                        tokio::spawn(accept_link(handle, stream, config.clone()));
                    }
                    Err(err) => {
                        let err = map_io_error(error::ACCEPT, err);
                        warn!(endpoint = %self.local, error = %err, "tcp accept failed");
                        drop(handle);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }
        })
    }
}
