//! Error types shared across the driver.

use thiserror::Error;

/// Errors produced while framing or deframing serial data.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The length byte did not arrive within its deadline.
    #[error("timed out waiting for the frame length byte")]
    LengthTimeout,

    /// The frame body did not arrive within its deadline.
    #[error("timed out waiting for {expected} frame bytes")]
    BodyTimeout {
        /// Bytes the length byte promised.
        expected: usize,
    },

    /// The advertised length cannot describe a valid frame.
    #[error("invalid frame length {0}")]
    InvalidLength(u8),

    /// Checksum verification failed.
    #[error("frame checksum mismatch: computed 0x{computed:02x}, received 0x{received:02x}")]
    ChecksumMismatch {
        /// Checksum computed over the received bytes.
        computed: u8,
        /// Checksum byte carried by the frame.
        received: u8,
    },

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised when starting a network-management operation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ControllerError {
    /// Another controller command is already active.
    #[error("a controller command is already in progress")]
    Busy,

    /// The operation requires a bridge controller.
    #[error("controller is not a bridge controller")]
    NotBridgeController,

    /// The target node does not exist in the node table.
    #[error("node {0} not found")]
    NodeNotFound(u8),

    /// The button id is already mapped to a virtual node.
    #[error("button {0} is already in use")]
    ButtonInUse(u8),

    /// The button id is not mapped to a virtual node.
    #[error("button {0} is not mapped")]
    ButtonNotFound(u8),

    /// The virtual-node bitmap has not been received yet.
    #[error("virtual node information not yet available")]
    VirtualNodesUnknown,
}

/// Errors loading or saving persisted driver state.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file stems from a different on-disk format version.
    #[error("config version {found} does not match supported version {supported}")]
    VersionMismatch {
        /// Version found in the file.
        found: u32,
        /// Version this build reads and writes.
        supported: u32,
    },

    /// The file belongs to a different network.
    #[error("config home id 0x{found:08x} does not match controller home id 0x{expected:08x}")]
    HomeIdMismatch {
        /// Home id found in the file.
        found: u32,
        /// Home id reported by the controller.
        expected: u32,
    },

    /// The file belongs to a different controller node.
    #[error("config node id {found} does not match controller node id {expected}")]
    NodeIdMismatch {
        /// Node id found in the file.
        found: u8,
        /// Node id reported by the controller.
        expected: u8,
    },

    /// The document is structurally not what we wrote.
    #[error("malformed config: {0}")]
    Malformed(String),

    /// XML syntax error.
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Filesystem error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = FrameError::ChecksumMismatch {
            computed: 0xab,
            received: 0xcd,
        };
        assert_eq!(
            err.to_string(),
            "frame checksum mismatch: computed 0xab, received 0xcd"
        );

        let err = ControllerError::Busy;
        assert_eq!(err.to_string(), "a controller command is already in progress");

        let err = ConfigError::HomeIdMismatch {
            found: 0x00c0ffee,
            expected: 0x01234567,
        };
        assert!(err.to_string().contains("0x00c0ffee"));
    }
}
