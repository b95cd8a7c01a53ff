//! # protocol 模块说明
//!
//! ## 角色定位（Why）
//! - 定义控制面在套接字上交换的全部消息：注册、应答、注销、心跳、权重更新，以及注册中心对外广播的
//!   全量快照与增量；
//! - 每条消息恰好占一帧，首两个字节为消息编号，其余字段按固定顺序以大端序排列。
//!
//! ## 编码约定（What）
//! - 服务名、端点、错误文本：UTF-8，一字节长度前缀，不超过 255 字节；
//! - 路由标识：原始字节，一字节长度前缀；
//! - 权重 `u32`，时间戳与序号 `u64`，注册中心标识 `u32`，状态码 `i32`。
//!
//! ## 健壮性（How）
//! - 解码器逐字段检查剩余长度，任何截断、未知编号、非法 UTF-8 或多余尾部字节都返回 [`DecodeError`]，
//!   从不 panic；调用方丢弃该消息并记录日志。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use spark_wire::{Frames, RoutingId};
use thiserror::Error;

use crate::table::{ProviderRecord, RegistryId, ServiceKind, Stamp};

/// 消息编号。
pub mod message_id {
    pub const REGISTER: u16 = 0x0001;
    pub const REGISTER_ACK: u16 = 0x0002;
    pub const UNREGISTER: u16 = 0x0003;
    pub const HEARTBEAT: u16 = 0x0004;
    pub const SERVICE_LIST: u16 = 0x0005;
    pub const REGISTRY_SYNC: u16 = 0x0006;
    pub const UPDATE_WEIGHT: u16 = 0x0007;
}

/// 注册应答中的状态码。
pub mod status {
    pub const OK: i32 = 0;
    pub const MALFORMED: i32 = -1;
    pub const NOT_READY: i32 = -2;
    pub const NOT_FOUND: i32 = -3;
    pub const CONFLICT: i32 = -4;
}

const CHANGE_UPSERT: u8 = 1;
const CHANGE_RETRACT: u8 = 2;

/// 服务实例发出的登记请求。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterRequest {
    pub service: String,
    pub endpoint: String,
    pub weight: u32,
    pub kind: ServiceKind,
    /// 实例绑定时生成；相同则保留原登记时间。
    pub bind_epoch: u64,
}

/// 注册中心对登记、注销、权重更新与心跳的应答。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterAck {
    /// 被应答请求的消息编号。
    pub op: u16,
    pub service: String,
    pub status: i32,
    pub endpoint: String,
    pub error: String,
    /// 建议的心跳周期。
    pub heartbeat_interval_ms: u32,
}

/// 增量中的单条变更。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    Upsert(ProviderRecord),
    Retract {
        service: String,
        routing_id: RoutingId,
        stamp: Stamp,
    },
}

impl Change {
    pub fn service(&self) -> &str {
        match self {
            Change::Upsert(record) => &record.service,
            Change::Retract { service, .. } => service,
        }
    }
}

/// 注册中心的全量快照，同时充当存活信标。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub registry_id: RegistryId,
    pub incarnation: u64,
    pub seq: u64,
    pub snapshot_interval_ms: u32,
    pub records: Vec<ProviderRecord>,
}

/// 注册中心的增量广播。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delta {
    pub registry_id: RegistryId,
    pub incarnation: u64,
    pub seq: u64,
    pub changes: Vec<Change>,
}

/// 控制面消息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Register(RegisterRequest),
    Ack(RegisterAck),
    Unregister { service: String },
    Heartbeat,
    Snapshot(Snapshot),
    Delta(Delta),
    UpdateWeight { service: String, weight: u32 },
}

/// 解码失败原因。
#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum DecodeError {
    #[error("message truncated while reading {field}")]
    Truncated { field: &'static str },

    #[error("unknown message id 0x{id:04x}")]
    UnknownMessage { id: u16 },

    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("field {field} is invalid: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },

    #[error("{remaining} trailing bytes after message")]
    TrailingBytes { remaining: usize },
}

impl Message {
    pub fn id(&self) -> u16 {
        match self {
            Message::Register(_) => message_id::REGISTER,
            Message::Ack(_) => message_id::REGISTER_ACK,
            Message::Unregister { .. } => message_id::UNREGISTER,
            Message::Heartbeat => message_id::HEARTBEAT,
            Message::Snapshot(_) => message_id::SERVICE_LIST,
            Message::Delta(_) => message_id::REGISTRY_SYNC,
            Message::UpdateWeight { .. } => message_id::UPDATE_WEIGHT,
        }
    }

    /// 编码为单帧。字符串字段在进入协议层之前已校验长度，超长部分会被截断。
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(self.id());
        match self {
            Message::Register(request) => {
                put_str8(&mut buf, &request.service);
                put_str8(&mut buf, &request.endpoint);
                buf.put_u32(request.weight);
                buf.put_u8(request.kind.to_wire());
                buf.put_u64(request.bind_epoch);
            }
            Message::Ack(ack) => {
                buf.put_u16(ack.op);
                put_str8(&mut buf, &ack.service);
                buf.put_i32(ack.status);
                put_str8(&mut buf, &ack.endpoint);
                put_str8(&mut buf, &ack.error);
                buf.put_u32(ack.heartbeat_interval_ms);
            }
            Message::Unregister { service } => put_str8(&mut buf, service),
            Message::Heartbeat => {}
            Message::Snapshot(snapshot) => {
                buf.put_u32(snapshot.registry_id);
                buf.put_u64(snapshot.incarnation);
                buf.put_u64(snapshot.seq);
                buf.put_u32(snapshot.snapshot_interval_ms);
                buf.put_u32(snapshot.records.len() as u32);
                for record in &snapshot.records {
                    put_record(&mut buf, record);
                }
            }
            Message::Delta(delta) => {
                buf.put_u32(delta.registry_id);
                buf.put_u64(delta.incarnation);
                buf.put_u64(delta.seq);
                buf.put_u32(delta.changes.len() as u32);
                for change in &delta.changes {
                    match change {
                        Change::Upsert(record) => {
                            buf.put_u8(CHANGE_UPSERT);
                            put_record(&mut buf, record);
                        }
                        Change::Retract {
                            service,
                            routing_id,
                            stamp,
                        } => {
                            buf.put_u8(CHANGE_RETRACT);
                            put_str8(&mut buf, service);
                            put_bytes8(&mut buf, routing_id.as_bytes());
                            put_stamp(&mut buf, stamp);
                        }
                    }
                }
            }
            Message::UpdateWeight { service, weight } => {
                put_str8(&mut buf, service);
                buf.put_u32(*weight);
            }
        }
        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader { buf: frame };
        let id = reader.u16("message id")?;
        let message = match id {
            message_id::REGISTER => Message::Register(RegisterRequest {
                service: reader.str8("service")?,
                endpoint: reader.str8("endpoint")?,
                weight: reader.u32("weight")?,
                kind: reader.kind()?,
                bind_epoch: reader.u64("bind_epoch")?,
            }),
            message_id::REGISTER_ACK => Message::Ack(RegisterAck {
                op: reader.u16("op")?,
                service: reader.str8("service")?,
                status: reader.i32("status")?,
                endpoint: reader.str8("endpoint")?,
                error: reader.str8("error")?,
                heartbeat_interval_ms: reader.u32("heartbeat_interval_ms")?,
            }),
            message_id::UNREGISTER => Message::Unregister {
                service: reader.str8("service")?,
            },
            message_id::HEARTBEAT => Message::Heartbeat,
            message_id::SERVICE_LIST => {
                let registry_id = reader.u32("registry_id")?;
                let incarnation = reader.u64("incarnation")?;
                let seq = reader.u64("seq")?;
                let snapshot_interval_ms = reader.u32("snapshot_interval_ms")?;
                let count = reader.u32("record count")? as usize;
                let mut records = Vec::with_capacity(count.min(reader.buf.len() / 8 + 1));
                for _ in 0..count {
                    records.push(reader.record()?);
                }
                Message::Snapshot(Snapshot {
                    registry_id,
                    incarnation,
                    seq,
                    snapshot_interval_ms,
                    records,
                })
            }
            message_id::REGISTRY_SYNC => {
                let registry_id = reader.u32("registry_id")?;
                let incarnation = reader.u64("incarnation")?;
                let seq = reader.u64("seq")?;
                let count = reader.u32("change count")? as usize;
                let mut changes = Vec::with_capacity(count.min(reader.buf.len() / 8 + 1));
                for _ in 0..count {
                    let change = match reader.u8("change tag")? {
                        CHANGE_UPSERT => Change::Upsert(reader.record()?),
                        CHANGE_RETRACT => Change::Retract {
                            service: reader.str8("service")?,
                            routing_id: reader.routing_id()?,
                            stamp: reader.stamp()?,
                        },
                        _ => {
                            return Err(DecodeError::InvalidField {
                                field: "change tag",
                                reason: "unknown change kind",
                            });
                        }
                    };
                    changes.push(change);
                }
                Message::Delta(Delta {
                    registry_id,
                    incarnation,
                    seq,
                    changes,
                })
            }
            message_id::UPDATE_WEIGHT => Message::UpdateWeight {
                service: reader.str8("service")?,
                weight: reader.u32("weight")?,
            },
            other => return Err(DecodeError::UnknownMessage { id: other }),
        };
        if !reader.buf.is_empty() {
            return Err(DecodeError::TrailingBytes {
                remaining: reader.buf.len(),
            });
        }
        Ok(message)
    }

    /// 控制消息恰好占一帧。
    pub fn to_frames(&self) -> Frames {
        vec![self.encode()]
    }

    pub fn from_frames(frames: &[Bytes]) -> Result<Self, DecodeError> {
        match frames {
            [frame] => Self::decode(frame),
            _ => Err(DecodeError::InvalidField {
                field: "frames",
                reason: "control messages occupy exactly one frame",
            }),
        }
    }
}

/// 超长字符串在不超过 255 字节的最近字符边界处截断。
fn put_str8(buf: &mut BytesMut, value: &str) {
    let mut len = value.len().min(u8::MAX as usize);
    while !value.is_char_boundary(len) {
        len -= 1;
    }
    put_bytes8(buf, &value.as_bytes()[..len]);
}

fn put_bytes8(buf: &mut BytesMut, value: &[u8]) {
    let len = value.len().min(u8::MAX as usize);
    buf.put_u8(len as u8);
    buf.put_slice(&value[..len]);
}

fn put_stamp(buf: &mut BytesMut, stamp: &Stamp) {
    buf.put_u64(stamp.registered_at);
    buf.put_u64(stamp.revision);
    buf.put_u32(stamp.origin);
}

fn put_record(buf: &mut BytesMut, record: &ProviderRecord) {
    put_str8(buf, &record.service);
    put_str8(buf, &record.endpoint);
    put_bytes8(buf, record.routing_id.as_bytes());
    buf.put_u32(record.weight);
    buf.put_u8(record.kind.to_wire());
    put_stamp(buf, &record.stamp());
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl Reader<'_> {
    fn ensure(&self, len: usize, field: &'static str) -> Result<(), DecodeError> {
        if self.buf.remaining() < len {
            Err(DecodeError::Truncated { field })
        } else {
            Ok(())
        }
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        self.ensure(1, field)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        self.ensure(2, field)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        self.ensure(4, field)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self, field: &'static str) -> Result<i32, DecodeError> {
        self.ensure(4, field)?;
        Ok(self.buf.get_i32())
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, DecodeError> {
        self.ensure(8, field)?;
        Ok(self.buf.get_u64())
    }

    fn bytes8(&mut self, field: &'static str) -> Result<&[u8], DecodeError> {
        let len = self.u8(field)? as usize;
        self.ensure(len, field)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn str8(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let raw = self.bytes8(field)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8 { field })
    }

    fn routing_id(&mut self) -> Result<RoutingId, DecodeError> {
        let raw = self.bytes8("routing_id")?;
        RoutingId::try_from(raw).map_err(|_| DecodeError::InvalidField {
            field: "routing_id",
            reason: "routing identity must not be empty",
        })
    }

    fn kind(&mut self) -> Result<ServiceKind, DecodeError> {
        let raw = self.u8("kind")?;
        ServiceKind::from_wire(raw).ok_or(DecodeError::InvalidField {
            field: "kind",
            reason: "unknown service kind",
        })
    }

    fn stamp(&mut self) -> Result<Stamp, DecodeError> {
        Ok(Stamp {
            registered_at: self.u64("registered_at")?,
            revision: self.u64("revision")?,
            origin: self.u32("origin")?,
        })
    }

    fn record(&mut self) -> Result<ProviderRecord, DecodeError> {
        let service = self.str8("service")?;
        let endpoint = self.str8("endpoint")?;
        let routing_id = self.routing_id()?;
        let weight = self.u32("weight")?;
        let kind = self.kind()?;
        let stamp = self.stamp()?;
        Ok(ProviderRecord {
            service,
            endpoint,
            routing_id,
            weight,
            registered_at: stamp.registered_at,
            kind,
            origin: stamp.origin,
            revision: stamp.revision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> ProviderRecord {
        ProviderRecord {
            service: "svc".to_owned(),
            endpoint: "tcp://127.0.0.1:7000".to_owned(),
            routing_id: RoutingId::try_from("ep1").expect("构造标识"),
            weight: 3,
            registered_at: 1_700_000_000_000,
            kind: ServiceKind::Receiver,
            origin: 42,
            revision: 7,
        }
    }

    #[test]
    fn delta_layout_is_big_endian() {
        let delta = Message::Delta(Delta {
            registry_id: 0x0102_0304,
            incarnation: 1,
            seq: 2,
            changes: vec![
                Change::Upsert(sample_record()),
                Change::Retract {
                    service: "svc".to_owned(),
                    routing_id: RoutingId::try_from("old").expect("构造标识"),
                    stamp: Stamp {
                        registered_at: 5,
                        revision: 6,
                        origin: 42,
                    },
                },
            ],
        });
        let encoded = delta.encode();
        assert_eq!(&encoded[..6], &[0x00, 0x06, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(Message::decode(&encoded), Ok(delta));
    }

    #[test]
    fn register_and_ack_decode() {
        let register = Message::Register(RegisterRequest {
            service: "svc".to_owned(),
            endpoint: "inproc://ep1".to_owned(),
            weight: 1,
            kind: ServiceKind::Receiver,
            bind_epoch: 99,
        });
        assert_eq!(Message::decode(&register.encode()), Ok(register));

        let ack = Message::Ack(RegisterAck {
            op: message_id::REGISTER,
            service: "svc".to_owned(),
            status: status::CONFLICT,
            endpoint: String::new(),
            error: "endpoint held by another instance".to_owned(),
            heartbeat_interval_ms: 5000,
        });
        assert_eq!(Message::decode(&ack.encode()), Ok(ack));
        assert_eq!(
            Message::decode(&Message::Heartbeat.encode()),
            Ok(Message::Heartbeat)
        );
    }

    #[test]
    fn long_text_is_cut_on_a_char_boundary() {
        let prefix = format!("endpoint inproc://{}", "x".repeat(236));
        assert_eq!(prefix.len(), 254);
        let ack = Message::Ack(RegisterAck {
            op: message_id::REGISTER,
            service: "svc".to_owned(),
            status: status::CONFLICT,
            endpoint: String::new(),
            error: format!("{prefix}é is held elsewhere"),
            heartbeat_interval_ms: 5000,
        });
        let decoded = Message::from_frames(&ack.to_frames()).expect("截断后仍可解码");
        let Message::Ack(decoded) = decoded else {
            panic!("应解码为应答");
        };
        assert_eq!(decoded.error, prefix);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(
            Message::decode(&[]),
            Err(DecodeError::Truncated { .. })
        ));
        assert_eq!(
            Message::decode(&[0x00, 0x63]),
            Err(DecodeError::UnknownMessage { id: 0x63 })
        );
        let mut register = Message::Unregister {
            service: "svc".to_owned(),
        }
        .encode()
        .to_vec();
        register.push(0);
        assert_eq!(
            Message::decode(&register),
            Err(DecodeError::TrailingBytes { remaining: 1 })
        );
        let bad_utf8 = [0x00, 0x03, 0x02, 0xff, 0xfe];
        assert_eq!(
            Message::decode(&bad_utf8),
            Err(DecodeError::InvalidUtf8 { field: "service" })
        );
        let huge_count = [0x00, 0x05, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 5, 0xff, 0xff, 0xff, 0xff];
        assert!(Message::decode(&huge_count).is_err());
    }
}
