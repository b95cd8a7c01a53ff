use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::SockRef;
use spark_wire::WireError;
use tokio::net::TcpStream;

use crate::error::{self, map_io_error};

/// TCP 套接字级别的可调参数。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 控制面消息体积小、频率高，默认关闭 Nagle 以降低注册与心跳的往返延迟；
/// - `linger` 决定关闭时是否等待未发送数据刷出，对应 `SO_LINGER`。
///
/// ## 契约 (What)
/// - `linger_ms = None`：沿用操作系统默认；`Some(0)`：关闭时直接丢弃未发送数据；
/// - `handshake_timeout_ms`：建链后等待对端问候报文的上限。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSocketConfig {
    pub nodelay: bool,
    pub keepalive: bool,
    pub linger_ms: Option<u64>,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: true,
            linger_ms: None,
            connect_timeout_ms: 2_000,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl TcpSocketConfig {
    /// 以 Builder 风格设置 `SO_LINGER`。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger_ms = linger.map(|value| value.as_millis() as u64);
        self
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// 将配置应用到已建立的连接。
    pub(crate) fn apply(&self, stream: &TcpStream) -> Result<(), WireError> {
        stream
            .set_nodelay(self.nodelay)
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        let sock = SockRef::from(stream);
        sock.set_keepalive(self.keepalive)
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        if let Some(linger) = self.linger() {
            sock.set_linger(Some(linger))
                .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: TcpSocketConfig =
            toml::from_str("linger_ms = 0\nnodelay = false").expect("解析 TCP 配置");
        assert_eq!(config.linger(), Some(Duration::ZERO));
        assert!(!config.nodelay);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn builder_sets_linger() {
        let config = TcpSocketConfig::default().with_linger(Some(Duration::from_millis(250)));
        assert_eq!(config.linger_ms, Some(250));
    }
}
