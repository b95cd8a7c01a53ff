use std::fmt;
use std::ops::BitOr;

use bytes::Bytes;
use rand::Rng;

use crate::error::WireError;

/// 多帧消息：每一帧是一段独立的字节序列。
pub type Frames = Vec<Bytes>;

/// 路由标识的最大长度（字节），与线协议中一字节长度前缀对应。
pub const MAX_ROUTING_ID_LEN: usize = 255;

/// 套接字在网格中的不透明地址。
///
/// # 教案式说明
/// - **意图 (Why)**：ROUTER 套接字按标识回送应答，网格的 ServiceTable 也以它区分同一服务下的不同实例；
/// - **契约 (What)**：长度 1..=255 字节，内容不做任何解释；`Display` 输出十六进制，便于日志检索；
/// - **风险 (Trade-offs)**：内部使用 `Bytes`，克隆为引用计数操作，不会复制数据。
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingId(Bytes);

impl RoutingId {
    /// 校验并构造路由标识。
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self, WireError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(WireError::InvalidRoutingId {
                reason: "routing identity must not be empty".to_owned(),
            });
        }
        if bytes.len() > MAX_ROUTING_ID_LEN {
            return Err(WireError::InvalidRoutingId {
                reason: format!(
                    "routing identity is {} bytes, limit is {MAX_ROUTING_ID_LEN}",
                    bytes.len()
                ),
            });
        }
        Ok(Self(bytes))
    }

    /// 生成随机标识：首字节固定为 `0x00`，其后 4 个随机字节。
    pub fn random() -> Self {
        let value: u32 = rand::rng().random();
        let mut raw = Vec::with_capacity(5);
        raw.push(0);
        raw.extend_from_slice(&value.to_be_bytes());
        Self(Bytes::from(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RoutingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for RoutingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoutingId({})", hex::encode(&self.0))
    }
}

impl TryFrom<&str> for RoutingId {
    type Error = WireError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl TryFrom<&[u8]> for RoutingId {
    type Error = WireError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::new(Bytes::copy_from_slice(value))
    }
}

/// 收发标志位。目前仅定义 `DONTWAIT`。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Self = Self(0);
    /// 非阻塞：接收队列为空时立即返回 [`WireError::WouldBlock`]。
    pub const DONTWAIT: Self = Self(1);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_nonblocking(self) -> bool {
        self.contains(Self::DONTWAIT)
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// 套接字在单条链路上收到的编号，仅在本地套接字内唯一。
pub type PipeId = u64;

/// 链路上传递的指令。
///
/// - `Message`：业务多帧消息；
/// - `Subscribe`/`Unsubscribe`：SUB 端向上游 PUB 声明前缀过滤器，PUB 端据此过滤并产生订阅事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Message(Frames),
    Subscribe(Bytes),
    Unsubscribe(Bytes),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_id_bounds() {
        assert!(RoutingId::new(Bytes::new()).is_err());
        assert!(RoutingId::new(vec![7u8; 255]).is_ok());
        assert!(RoutingId::new(vec![7u8; 256]).is_err());
    }

    #[test]
    fn random_routing_id_has_zero_prefix() {
        let id = RoutingId::random();
        assert_eq!(id.len(), 5);
        assert_eq!(id.as_bytes()[0], 0);
        assert_eq!(id.to_string().len(), 10);
    }

    #[test]
    fn flags_compose() {
        let flags = Flags::NONE | Flags::DONTWAIT;
        assert!(flags.is_nonblocking());
        assert!(!Flags::NONE.is_nonblocking());
    }
}
