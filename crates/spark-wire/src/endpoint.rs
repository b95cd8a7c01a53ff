use std::fmt;
use std::str::FromStr;

use crate::error::WireError;

/// 端点字符串的最大长度，与线协议中的一字节长度前缀一致。
pub const MAX_ENDPOINT_LEN: usize = 255;

const LOOPBACK: &str = "127.0.0.1";

/// 结构化端点：`inproc://name` 或 `tcp://host:port`。
///
/// # 教案式说明
/// - **意图 (Why)**：控制面只与端点字符串打交道，由协议前缀决定使用哪种传输；解析集中在这里，
///   使注册请求在发出前就能完成校验；
/// - **契约 (What)**：
///   - `inproc` 名称非空；
///   - `tcp` 主机可以是域名、IPv4、`[IPv6]` 或通配符 `*`，端口为 `u16`（允许 `0` 表示由系统分配）；
///   - 整体长度不超过 255 字节；
/// - **风险 (Trade-offs)**：不做 DNS 解析，主机名合法性交给具体传输在连接时判断。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Inproc(String),
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// 协议前缀，例如 `"tcp"`。
    pub fn scheme(&self) -> &'static str {
        match self {
            Endpoint::Inproc(_) => "inproc",
            Endpoint::Tcp { .. } => "tcp",
        }
    }

    /// 主机部分是否为通配地址（`*`、`0.0.0.0`、`::`）。
    pub fn is_wildcard(&self) -> bool {
        match self {
            Endpoint::Inproc(_) => false,
            Endpoint::Tcp { host, .. } => matches!(host.as_str(), "*" | "0.0.0.0" | "[::]" | "::"),
        }
    }

    /// 将通配主机替换为回环地址，得到可对外公布的端点。
    pub fn resolve_advertise(&self) -> Endpoint {
        match self {
            Endpoint::Tcp { port, .. } if self.is_wildcard() => Endpoint::Tcp {
                host: LOOPBACK.to_owned(),
                port: *port,
            },
            other => other.clone(),
        }
    }

    /// `host:port` 形式的套接字地址文本（仅 TCP）。
    pub fn socket_addr_text(&self) -> Option<String> {
        match self {
            Endpoint::Tcp { host, port } => {
                let host = if host == "*" { "0.0.0.0" } else { host.as_str() };
                Some(format!("{host}:{port}"))
            }
            Endpoint::Inproc(_) => None,
        }
    }
}

impl FromStr for Endpoint {
    type Err = WireError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.is_empty() {
            return Err(WireError::invalid_endpoint(raw, "endpoint is empty"));
        }
        if raw.len() > MAX_ENDPOINT_LEN {
            return Err(WireError::invalid_endpoint(
                raw,
                format!("endpoint exceeds {MAX_ENDPOINT_LEN} bytes"),
            ));
        }
        let Some((scheme, rest)) = raw.split_once("://") else {
            return Err(WireError::invalid_endpoint(raw, "missing `scheme://` prefix"));
        };
        match scheme {
            "inproc" => {
                if rest.is_empty() {
                    return Err(WireError::invalid_endpoint(raw, "inproc name is empty"));
                }
                Ok(Endpoint::Inproc(rest.to_owned()))
            }
            "tcp" => parse_tcp(raw, rest),
            other => Err(WireError::UnsupportedScheme {
                scheme: other.to_owned(),
            }),
        }
    }
}

fn parse_tcp(raw: &str, rest: &str) -> Result<Endpoint, WireError> {
    let Some((host, port)) = rest.rsplit_once(':') else {
        return Err(WireError::invalid_endpoint(raw, "tcp endpoint needs `host:port`"));
    };
    if host.is_empty() {
        return Err(WireError::invalid_endpoint(raw, "tcp host is empty"));
    }
    if host.contains('[') != host.contains(']') {
        return Err(WireError::invalid_endpoint(raw, "unbalanced IPv6 brackets"));
    }
    if host.chars().any(char::is_whitespace) {
        return Err(WireError::invalid_endpoint(raw, "tcp host contains whitespace"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| WireError::invalid_endpoint(raw, format!("invalid tcp port `{port}`")))?;
    Ok(Endpoint::Tcp {
        host: host.to_owned(),
        port,
    })
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inproc(name) => write!(f, "inproc://{name}"),
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}
