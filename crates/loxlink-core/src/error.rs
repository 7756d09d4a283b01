//! Error types shared across the Loxone-Link crates

use thiserror::Error;

/// Main error type for Loxone-Link protocol operations
#[derive(Error, Debug)]
pub enum LinkError {
    // ===== Wire format =====
    /// The CAN identifier does not carry the NAT prefix
    #[error("not a NAT frame: CAN id {id:#010x}")]
    NotANatFrame {
        /// The offending 29-bit identifier
        id: u32,
    },

    /// A payload had the wrong length for its command
    #[error("invalid payload length {len} for {context}")]
    InvalidLength {
        /// Actual length in bytes
        len: usize,
        /// What was being parsed
        context: &'static str,
    },

    // ===== Configuration =====
    /// Configuration record shorter than the fixed header
    #[error("configuration record too short: {len} bytes, need at least {min}")]
    ConfigTooShort {
        /// Received length
        len: usize,
        /// Minimum accepted length
        min: usize,
    },

    /// A configured hex blob could not be decoded
    #[error("invalid hex blob for {field}: {reason}")]
    InvalidHexBlob {
        /// Configuration field name
        field: &'static str,
        /// Decode failure detail
        reason: String,
    },

    // ===== Crypto =====
    /// AES-CBC input was not block aligned
    #[error("cipher data length {len} is not a multiple of 16")]
    UnalignedCipherData {
        /// Offending length
        len: usize,
    },

    // ===== Engine plumbing =====
    /// The CAN adapter rejected a send
    #[error("adapter send failed: {0}")]
    AdapterSend(String),

    /// An internal channel closed while the engine was running
    #[error("channel closed")]
    ChannelClosed,
}

impl LinkError {
    /// Whether the error came from malformed peer data rather than a local
    /// fault. Protocol errors are logged and dropped; the processing loop
    /// keeps running.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            LinkError::NotANatFrame { .. }
                | LinkError::InvalidLength { .. }
                | LinkError::ConfigTooShort { .. }
                | LinkError::UnalignedCipherData { .. }
        )
    }
}

/// Result type alias for Loxone-Link operations
pub type Result<T> = std::result::Result<T, LinkError>;
