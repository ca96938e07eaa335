//! Version information for the host runtime and its wire protocol.

use crate::bridge::protocol::PROTOCOL_VERSION;

/// Host runtime version from Cargo.toml
pub const RECORDER_RPC_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub host: &'static str,
    /// Wire protocol version stamped on every outbound message.
    pub protocol: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            host: RECORDER_RPC_VERSION,
            protocol: PROTOCOL_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_host_and_protocol() {
        let info = VersionInfo::new();
        assert_eq!(info.host, RECORDER_RPC_VERSION);
        assert_eq!(info.protocol, "v1");
    }

    #[test]
    fn version_info_serializes() {
        let info = VersionInfo {
            host: "0.1.0",
            protocol: "v1",
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "host": "0.1.0",
          "protocol": "v1"
        }
        "#);
    }
}
