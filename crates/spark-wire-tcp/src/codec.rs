//! TCP 链路上的握手与帧编码。
//!
//! 握手：`"SPKW"`、版本（1 字节）、套接字类型（1 字节）、标识长度（1 字节）、标识。
//!
//! 指令：类型（1 字节：0 消息、1 订阅、2 退订），随后
//! - 消息：帧数（`u32`），每帧长度（`u32`）加内容；
//! - 订阅/退订：前缀长度（`u32`）加内容。
//!
//! 所有整数均为大端序。

use bytes::{BufMut, Bytes, BytesMut};
use spark_wire::{Command, Frames, RoutingId, SocketKind, WireError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{self, map_io_error, protocol_error};

pub(crate) const MAGIC: &[u8; 4] = b"SPKW";
pub(crate) const VERSION: u8 = 1;

const TAG_MESSAGE: u8 = 0;
const TAG_SUBSCRIBE: u8 = 1;
const TAG_UNSUBSCRIBE: u8 = 2;

/// 单帧与单条消息帧数的上限，防止对端声明超大长度耗尽内存。
pub(crate) const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
pub(crate) const MAX_PARTS: usize = 4096;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Greeting {
    pub(crate) kind: SocketKind,
    pub(crate) identity: RoutingId,
}

pub(crate) fn encode_greeting(greeting: &Greeting) -> Bytes {
    let identity = greeting.identity.as_bytes();
    let mut buf = BytesMut::with_capacity(7 + identity.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(greeting.kind.to_wire());
    buf.put_u8(identity.len() as u8);
    buf.put_slice(identity);
    buf.freeze()
}

pub(crate) async fn read_greeting<R>(reader: &mut R) -> Result<Greeting, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 7];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|err| map_io_error(error::HANDSHAKE, err))?;
    if &header[..4] != MAGIC {
        return Err(protocol_error("peer greeting has wrong magic"));
    }
    if header[4] != VERSION {
        return Err(protocol_error(format!(
            "unsupported wire version {}",
            header[4]
        )));
    }
    let kind = SocketKind::from_wire(header[5])
        .ok_or_else(|| protocol_error(format!("unknown socket kind {}", header[5])))?;
    let mut identity = vec![0u8; header[6] as usize];
    reader
        .read_exact(&mut identity)
        .await
        .map_err(|err| map_io_error(error::HANDSHAKE, err))?;
    let identity = RoutingId::new(identity)?;
    Ok(Greeting { kind, identity })
}

pub(crate) fn encode_command(command: &Command) -> Bytes {
    match command {
        Command::Message(frames) => {
            let size = 5 + frames.iter().map(|frame| 4 + frame.len()).sum::<usize>();
            let mut buf = BytesMut::with_capacity(size);
            buf.put_u8(TAG_MESSAGE);
            buf.put_u32(frames.len() as u32);
            for frame in frames {
                buf.put_u32(frame.len() as u32);
                buf.put_slice(frame);
            }
            buf.freeze()
        }
        Command::Subscribe(prefix) | Command::Unsubscribe(prefix) => {
            let tag = if matches!(command, Command::Subscribe(_)) {
                TAG_SUBSCRIBE
            } else {
                TAG_UNSUBSCRIBE
            };
            let mut buf = BytesMut::with_capacity(5 + prefix.len());
            buf.put_u8(tag);
            buf.put_u32(prefix.len() as u32);
            buf.put_slice(prefix);
            buf.freeze()
        }
    }
}

pub(crate) async fn write_command<W>(writer: &mut W, command: &Command) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&encode_command(command))
        .await
        .map_err(|err| map_io_error(error::WRITE, err))
}

/// 读取下一条指令；对端正常关闭时返回 `Ok(None)`。
pub(crate) async fn read_command<R>(reader: &mut R) -> Result<Option<Command>, WireError>
where
    R: AsyncRead + Unpin,
{
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(map_io_error(error::READ, err)),
    };
    match tag {
        TAG_MESSAGE => {
            let parts = read_len(reader).await?;
            if parts > MAX_PARTS {
                return Err(protocol_error(format!("message declares {parts} frames")));
            }
            let mut frames: Frames = Vec::with_capacity(parts);
            for _ in 0..parts {
                frames.push(read_blob(reader).await?);
            }
            Ok(Some(Command::Message(frames)))
        }
        TAG_SUBSCRIBE => Ok(Some(Command::Subscribe(read_blob(reader).await?))),
        TAG_UNSUBSCRIBE => Ok(Some(Command::Unsubscribe(read_blob(reader).await?))),
        other => Err(protocol_error(format!("unknown command tag {other}"))),
    }
}

async fn read_len<R>(reader: &mut R) -> Result<usize, WireError>
where
    R: AsyncRead + Unpin,
{
    reader
        .read_u32()
        .await
        .map(|len| len as usize)
        .map_err(|err| map_io_error(error::READ, err))
}

async fn read_blob<R>(reader: &mut R) -> Result<Bytes, WireError>
where
    R: AsyncRead + Unpin,
{
    let len = read_len(reader).await?;
    if len > MAX_FRAME_LEN {
        return Err(protocol_error(format!("frame of {len} bytes exceeds limit")));
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|err| map_io_error(error::READ, err))?;
    Ok(Bytes::from(buf))
}
