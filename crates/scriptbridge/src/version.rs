//! Version information for scriptbridge.

/// scriptbridge version from Cargo.toml
pub const SCRIPTBRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information for a session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Host library version.
    pub scriptbridge: &'static str,
    /// Identity string the peer sent during the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            scriptbridge: SCRIPTBRIDGE_VERSION,
            peer: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer(mut self, identity: String) -> Self {
        self.peer = Some(identity);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.scriptbridge, SCRIPTBRIDGE_VERSION);
        assert!(info.peer.is_none());
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            scriptbridge: "0.1.0",
            peer: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "scriptbridge": "0.1.0"
        }
        "#);
    }

    #[test]
    fn version_info_serializes_full() {
        let info = VersionInfo {
            scriptbridge: "0.1.0",
            peer: None,
        }
        .with_peer("scriptbridge-peer 0.1.0 pid 42".to_string());
        insta::assert_json_snapshot!(info, @r#"
        {
          "scriptbridge": "0.1.0",
          "peer": "scriptbridge-peer 0.1.0 pid 42"
        }
        "#);
    }
}
