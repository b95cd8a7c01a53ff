use spark_wire::Endpoint;

use crate::error::MeshError;

/// 服务名、主题名与端点字符串的长度上限（一字节长度前缀）。
pub const MAX_NAME_LEN: usize = 255;

pub(crate) fn service_name(name: &str) -> Result<(), MeshError> {
    if name.is_empty() {
        return Err(MeshError::validation("service", "service name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(MeshError::validation(
            "service",
            format!("service name exceeds {MAX_NAME_LEN} bytes"),
        ));
    }
    if name.chars().any(char::is_control) {
        return Err(MeshError::validation(
            "service",
            "service name contains control characters",
        ));
    }
    Ok(())
}

/// 主题名：1..=255 字节，`*` 保留给模式订阅。
pub(crate) fn topic(name: &str) -> Result<(), MeshError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(MeshError::validation(
            "topic",
            format!("topic must be 1..={MAX_NAME_LEN} bytes"),
        ));
    }
    if name.contains('*') {
        return Err(MeshError::validation("topic", "`*` is reserved for patterns"));
    }
    Ok(())
}

pub(crate) fn endpoint(raw: &str) -> Result<Endpoint, MeshError> {
    raw.parse::<Endpoint>().map_err(MeshError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_names_are_bounded() {
        assert!(service_name("svc").is_ok());
        assert!(service_name("").is_err());
        assert!(service_name(&"s".repeat(255)).is_ok());
        assert!(service_name(&"s".repeat(256)).is_err());
        assert!(service_name("bad\nname").is_err());
    }

    #[test]
    fn topics_reserve_the_wildcard() {
        assert!(topic("orders").is_ok());
        assert!(topic("").is_err());
        assert!(topic("ord*").is_err());
        assert!(topic(&"t".repeat(256)).is_err());
    }

    #[test]
    fn endpoints_map_to_validation_errors() {
        assert!(endpoint("inproc://ep1").is_ok());
        assert!(matches!(
            endpoint("ep1"),
            Err(MeshError::Validation {
                field: "endpoint",
                ..
            })
        ));
        assert!(matches!(
            endpoint("udp://x:1"),
            Err(MeshError::Validation { .. })
        ));
    }
}
