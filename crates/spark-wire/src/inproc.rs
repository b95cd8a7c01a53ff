//! # inproc 传输
//!
//! 同一进程内的套接字通过名称表直接互联，链路两端互相持有对方的弱引用，
//! 消息投递是一次同步的函数调用，不经过任何缓冲或序列化。
//!
//! 连接任务在目标名称尚未绑定时挂起等待，绑定出现后立即建链；链路断开后
//! 回到等待状态，直到同名端点重新绑定。

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::error::WireError;
use crate::frame::{Command, PipeId};
use crate::socket::{LinkSpec, LinkState, SocketHandle, WeakSocket};
use crate::transport::{Binding, PeerSink, Transport};

pub(crate) struct InprocTransport {
    bound: Arc<DashMap<String, WeakSocket>>,
    changed: Arc<Notify>,
}

impl InprocTransport {
    pub(crate) fn new() -> Self {
        Self {
            bound: Arc::new(DashMap::new()),
            changed: Arc::new(Notify::new()),
        }
    }
}

fn inproc_name(endpoint: &Endpoint) -> Result<&str, WireError> {
    match endpoint {
        Endpoint::Inproc(name) => Ok(name),
        other => Err(WireError::UnsupportedScheme {
            scheme: other.scheme().to_owned(),
        }),
    }
}

#[async_trait]
impl Transport for InprocTransport {
    fn scheme(&self) -> &'static str {
        "inproc"
    }

    async fn bind(&self, socket: SocketHandle, endpoint: &Endpoint) -> Result<Binding, WireError> {
        let name = inproc_name(endpoint)?.to_owned();
        let weak = socket.downgrade();
        match self.bound.entry(name.clone()) {
            Entry::Occupied(mut occupied) => {
                let live = occupied
                    .get()
                    .upgrade()
                    .is_some_and(|current| !current.is_closed());
                if live {
                    return Err(WireError::AddressInUse {
                        endpoint: endpoint.to_string(),
                    });
                }
                occupied.insert(weak.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(weak.clone());
            }
        }
        self.changed.notify_waiters();

        let bound = Arc::clone(&self.bound);
        Ok(Binding::new(endpoint.clone(), move || {
            bound.remove_if(&name, |_, current| current.ptr_eq(&weak));
        }))
    }

    fn connect(
        &self,
        socket: WeakSocket,
        endpoint: &Endpoint,
    ) -> Result<JoinHandle<()>, WireError> {
        let name = inproc_name(endpoint)?.to_owned();
        let endpoint = endpoint.clone();
        let bound = Arc::clone(&self.bound);
        let changed = Arc::clone(&self.changed);
        Ok(tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                let notified = changed.notified();
                let Some(local) = socket.upgrade() else {
                    return;
                };
                if local.is_closed() {
                    return;
                }
                let remote = bound
                    .get(&name)
                    .and_then(|entry| entry.value().upgrade())
                    .filter(|remote| !remote.is_closed());
                let Some(remote) = remote else {
                    drop(local);
                    notified.await;
                    continue;
                };
                if remote.ptr_eq(&local) {
                    warn!(endpoint = %endpoint, "socket connected to its own inproc binding, giving up");
                    return;
                }
                let backoff = local.options().backoff(attempt);
                match link_pair(&local, &remote, &endpoint) {
                    Ok(state) => {
                        attempt = 0;
                        drop(local);
                        drop(remote);
                        state.closed().await;
                        debug!(endpoint = %endpoint, "inproc link closed, waiting to relink");
                    }
                    Err(err) => {
                        drop(local);
                        drop(remote);
                        debug!(endpoint = %endpoint, error = %err, "inproc link failed");
                        attempt = attempt.saturating_add(1);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }))
    }
}

/// 两端先各自登记链路，再依次激活，保证 SUB 端补发订阅时 PUB 端已能识别该链路。
fn link_pair(
    local: &SocketHandle,
    remote: &SocketHandle,
    endpoint: &Endpoint,
) -> Result<Arc<LinkState>, WireError> {
    let state = LinkState::new();
    let local_pipe = local.reserve_pipe();
    let remote_pipe = remote.reserve_pipe();
    remote.insert_link(
        remote_pipe,
        LinkSpec {
            identity: local.identity().clone(),
            kind: local.kind(),
            endpoint: None,
            sink: Arc::new(InprocSink {
                target: local.downgrade(),
                pipe: local_pipe,
            }),
            state: Arc::clone(&state),
        },
    )?;
    let inserted = local.insert_link(
        local_pipe,
        LinkSpec {
            identity: remote.identity().clone(),
            kind: remote.kind(),
            endpoint: Some(endpoint.clone()),
            sink: Arc::new(InprocSink {
                target: remote.downgrade(),
                pipe: remote_pipe,
            }),
            state: Arc::clone(&state),
        },
    );
    if let Err(err) = inserted {
        remote.detach(remote_pipe);
        return Err(err);
    }
    remote.activate_link(remote_pipe);
    local.activate_link(local_pipe);
    Ok(state)
}

struct InprocSink {
    target: WeakSocket,
    pipe: PipeId,
}

impl PeerSink for InprocSink {
    fn deliver(&self, command: Command) -> bool {
        match self.target.upgrade() {
            Some(target) if !target.is_closed() => {
                target.deliver(self.pipe, command);
                true
            }
            _ => false,
        }
    }

    fn close(&self) {
        if let Some(target) = self.target.upgrade() {
            target.detach(self.pipe);
        }
    }
}
