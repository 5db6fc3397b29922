//! Discovery scan targets.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanProtocol {
    #[default]
    Tls,
    Https,
}

/// An endpoint the discovery scanner probes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanTarget {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: ScanProtocol,
}

impl ScanTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: ScanProtocol::Tls,
        }
    }

    /// `host:port`, also used as the discovery source of a record.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
