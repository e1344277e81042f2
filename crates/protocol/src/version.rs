//! Protocol version management

use serde::{Deserialize, Serialize};

/// Protocol version carried by every message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

/// Current protocol version
pub const CURRENT_VERSION: ProtocolVersion = ProtocolVersion {
    major: 1,
    minor: 0,
    patch: 0,
};

impl ProtocolVersion {
    /// Whether a peer speaking `peer` can be understood
    ///
    /// Only the major version has to match. A newer minor version may add
    /// message kinds, which decode as unknown and go to default handling.
    pub fn accepts(&self, peer: &ProtocolVersion) -> bool {
        self.major == peer.major
    }
}
