use std::sync::Arc;

use spark_wire::{
    Command, Endpoint, LinkSpec, LinkState, PeerSink, PipeId, SocketHandle, WeakSocket, WireError,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::codec::{self, Greeting};
use crate::config::TcpSocketConfig;
use crate::error::{self, protocol_error, timeout_error};

/// 将一条已连通的 TCP 流升级为套接字链路。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 主动连接与被动接受两条路径共用同一套握手与收发逻辑；
/// - 链路的出站方向是无界队列加独立写任务，保证 [`PeerSink::deliver`] 不阻塞调用方。
///
/// ## 逻辑 (How)
/// 1. 应用套接字参数，双方同时发送问候报文并在超时内读取对端问候；
/// 2. 校验套接字类型是否兼容，拆分读写半部；
/// 3. 登记链路后启动读任务与写任务，任一方向出错即拆除链路；
/// 4. 返回链路关闭信号，主动连接方据此决定何时重连。
///
/// ## 契约 (What)
/// - `endpoint` 为 `Some` 表示本端主动连接；
/// - 套接字已释放时返回 [`WireError::Closed`]。
pub(crate) async fn establish(
    socket: &WeakSocket,
    mut stream: TcpStream,
    endpoint: Option<Endpoint>,
    config: &TcpSocketConfig,
) -> Result<Arc<LinkState>, WireError> {
    config.apply(&stream)?;
    let (kind, identity) = {
        let handle = socket.upgrade().ok_or(WireError::Closed)?;
        (handle.kind(), handle.identity().clone())
    };
    let greeting = codec::encode_greeting(&Greeting { kind, identity });
    stream
        .write_all(&greeting)
        .await
        .map_err(|err| error::map_io_error(error::HANDSHAKE, err))?;
    let peer = tokio::time::timeout(config.handshake_timeout(), codec::read_greeting(&mut stream))
        .await
        .map_err(|_| timeout_error(error::HANDSHAKE, config.handshake_timeout()))??;
    if !kind.compatible_with(peer.kind) {
        return Err(protocol_error(format!(
            "{kind:?} socket cannot link with {:?} peer",
            peer.kind
        )));
    }

    let handle = socket.upgrade().ok_or(WireError::Closed)?;
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let state = LinkState::new();
    let pipe = handle.reserve_pipe();
    trace!(
        pipe,
        peer = %peer.identity,
        peer_kind = ?peer.kind,
        "tcp handshake completed"
    );
    handle.attach(
        pipe,
        LinkSpec {
            identity: peer.identity,
            kind: peer.kind,
            endpoint,
            sink: Arc::new(TcpSink {
                tx,
                state: Arc::clone(&state),
            }),
            state: Arc::clone(&state),
        },
    )?;
    drop(handle);

    tokio::spawn(write_loop(
        socket.clone(),
        pipe,
        writer,
        rx,
        Arc::clone(&state),
    ));
    tokio::spawn(read_loop(socket.clone(), pipe, reader, Arc::clone(&state)));
    Ok(state)
}

async fn write_loop(
    socket: WeakSocket,
    pipe: PipeId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Command>,
    state: Arc<LinkState>,
) {
    loop {
        tokio::select! {
            biased;
            _ = state.closed() => break,
            command = rx.recv() => {
                let Some(command) = command else { break };
                if let Err(err) = codec::write_command(&mut writer, &command).await {
                    debug!(pipe, error = %err, "tcp write failed");
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
    detach(&socket, pipe, &state);
}

async fn read_loop(
    socket: WeakSocket,
    pipe: PipeId,
    mut reader: OwnedReadHalf,
    state: Arc<LinkState>,
) {
    loop {
        let command = tokio::select! {
            biased;
            _ = state.closed() => break,
            command = codec::read_command(&mut reader) => command,
        };
        match command {
            Ok(Some(command)) => match socket.upgrade() {
                Some(handle) => handle.deliver(pipe, command),
                None => break,
            },
            Ok(None) => {
                trace!(pipe, "tcp peer closed the stream");
                break;
            }
            Err(err) => {
                debug!(pipe, error = %err, "tcp read failed");
                break;
            }
        }
    }
    detach(&socket, pipe, &state);
}

fn detach(socket: &WeakSocket, pipe: PipeId, state: &LinkState) {
    state.close();
    if let Some(handle) = socket.upgrade() {
        handle.detach(pipe);
    }
}

struct TcpSink {
    tx: mpsc::UnboundedSender<Command>,
    state: Arc<LinkState>,
}

impl PeerSink for TcpSink {
    fn deliver(&self, command: Command) -> bool {
        !self.state.is_closed() && self.tx.send(command).is_ok()
    }

    fn close(&self) {
        self.state.close();
    }
}

/// 供监听端使用的便捷封装：握手失败只记录日志。
pub(crate) async fn accept_link(socket: SocketHandle, stream: TcpStream, config: TcpSocketConfig) {
    let weak = socket.downgrade();
    drop(socket);
    if let Err(err) = establish(&weak, stream, None, &config).await {
        debug!(error = %err, code = err.code(), "inbound tcp link rejected");
    }
}
