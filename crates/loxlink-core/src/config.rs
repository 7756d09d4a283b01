//! Boot-time crypto material and the Miniserver configuration record
//!
//! [`CryptoConfig`] is read once at startup (the surrounding application
//! decides where from) and handed to every device as shared, immutable
//! state. [`ConfigRecord`] is the per-device configuration the Miniserver
//! pushes over the bus as a fragmented `SendConfig`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crc::stm32_crc32;
use crate::crypto::algo_words;
use crate::error::{LinkError, Result};

/// Length of the STM32 device ID in bytes.
pub const DEVICE_ID_LEN: usize = 12;

/// Bytes of a configuration record covered by the advertised CRC.
pub const CANONICAL_DIGEST_LEN: usize = 12;

/// Fixed header bytes preceding the extension-specific trailer.
const HEADER_LEN: usize = 8;

/// Shortest well-formed record: header plus trailing CRC.
const MIN_RECORD_LEN: usize = 12;

/// Cryptographic material consumed by the challenge and device-ID handlers
///
/// Set once at boot and never mutated afterwards; devices share it behind
/// an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Encrypted-AES-key blob as distributed by the Miniserver (hex)
    pub aes_key: String,
    /// Encrypted-AES-IV blob (hex)
    pub aes_iv: String,
    /// Legacy key words for the device-ID exchange
    pub legacy_key: [u32; 4],
    /// Legacy IV words for the device-ID exchange
    pub legacy_iv: [u32; 4],
    /// Crypto master device-ID blob (hex, 12 bytes)
    pub master_device_id: String,
}

impl CryptoConfig {
    /// Challenge-algorithm key words derived from the key blob.
    pub fn challenge_key_words(&self) -> [u32; 4] {
        algo_words(&self.aes_key)
    }

    /// Challenge-algorithm IV words derived from the IV blob.
    pub fn challenge_iv_words(&self) -> [u32; 4] {
        algo_words(&self.aes_iv)
    }

    /// Decode the master device-ID blob into its 12 raw bytes.
    pub fn master_device_id_bytes(&self) -> Result<[u8; DEVICE_ID_LEN]> {
        let decoded = hex::decode(&self.master_device_id).map_err(|e| LinkError::InvalidHexBlob {
            field: "master_device_id",
            reason: e.to_string(),
        })?;
        decoded
            .try_into()
            .map_err(|bytes: Vec<u8>| LinkError::InvalidHexBlob {
                field: "master_device_id",
                reason: format!("expected {DEVICE_ID_LEN} bytes, got {}", bytes.len()),
            })
    }
}

/// A parsed Miniserver configuration record
///
/// Wire layout: `size(u8) version(u8) led_sync_offset(u8) reserved(u8)
/// offline_timeout(u32 LE)` followed by an extension-specific trailer and a
/// trailing CRC32. The advertised configuration CRC is computed over the
/// first twelve bytes of the record regardless of the trailer's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRecord {
    /// ConfigSize header byte
    pub size: u8,
    /// Configuration version, echoed in keep-alives
    pub version: u8,
    /// LED synchronisation offset
    pub led_sync_offset: u8,
    /// Seconds without traffic before the device drops to Offline
    pub offline_timeout_secs: u32,
    /// Extension-specific trailer bytes (may be empty)
    pub trailer: Vec<u8>,
    digest: u32,
}

impl ConfigRecord {
    /// Parse a record from a reassembled `SendConfig` payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_RECORD_LEN {
            return Err(LinkError::ConfigTooShort {
                len: data.len(),
                min: MIN_RECORD_LEN,
            });
        }

        Ok(Self {
            size: data[0],
            version: data[1],
            led_sync_offset: data[2],
            offline_timeout_secs: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            trailer: data[HEADER_LEN..data.len() - 4].to_vec(),
            digest: stm32_crc32(&data[..CANONICAL_DIGEST_LEN]),
        })
    }

    /// The advertised configuration CRC (STM32 CRC over the canonical first
    /// twelve bytes).
    pub fn digest(&self) -> u32 {
        self.digest
    }

    /// Offline timeout as a duration.
    pub fn offline_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.offline_timeout_secs))
    }

    /// Keep-alive interval: the configured timeout, floored at one minute.
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.offline_timeout_secs.max(60)))
    }
}

impl Default for ConfigRecord {
    /// The canonical default configuration: size 9, version 0, 900 s
    /// offline timeout, empty trailer.
    fn default() -> Self {
        let mut canonical = [0u8; CANONICAL_DIGEST_LEN];
        canonical[0] = 9;
        canonical[4..8].copy_from_slice(&900u32.to_le_bytes());
        Self {
            size: 9,
            version: 0,
            led_sync_offset: 0,
            offline_timeout_secs: 900,
            trailer: Vec::new(),
            digest: stm32_crc32(&canonical),
        }
    }
}
