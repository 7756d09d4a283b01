//! Key-derivation hashes and AES-128-CBC schedules
//!
//! Two encrypted exchanges exist on the bus:
//!
//! 1. The **legacy device-ID exchange** (`CryptDeviceIdRequest`), keyed by a
//!    fixed key/IV word table combined with the device serial.
//! 2. The **authentication challenge** (`CryptChallengeAuthRequest`), keyed
//!    by word tables derived from the configured key/IV blobs, with a
//!    per-session key derived from the challenge random, the serial and the
//!    STM32 device ID.
//!
//! All schedules serialize four u32 words little-endian into the 16-byte
//! AES-128 key/IV. Cipher data is always a multiple of 16 bytes; there is
//! no padding scheme.
//!
//! The legacy key formula complements the XOR (`!(serial ^ k)`), the modern
//! one complements only the serial (`!serial ^ k`). The asymmetry is how
//! real devices behave and must not be normalised.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::error::{LinkError, Result};

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Magic value opening every decrypted challenge / device-ID packet.
pub const CRYPT_MAGIC: u32 = 0xDEAD_BEEF;

// ===== Derivation hashes =====

/// RS hash (Robert Sedgewick), 32-bit wrap-around.
pub fn rs_hash(data: &[u8]) -> u32 {
    let b = 378_551u32;
    let mut a = 63_689u32;
    let mut hash = 0u32;
    for &byte in data {
        hash = hash.wrapping_mul(a).wrapping_add(u32::from(byte));
        a = a.wrapping_mul(b);
    }
    hash
}

/// JS hash (Justin Sobel).
pub fn js_hash(data: &[u8]) -> u32 {
    let mut hash = 1_315_423_911u32;
    for &byte in data {
        hash ^= (hash << 5)
            .wrapping_add(u32::from(byte))
            .wrapping_add(hash >> 2);
    }
    hash
}

/// DJB hash (Daniel J. Bernstein).
pub fn djb_hash(data: &[u8]) -> u32 {
    let mut hash = 5381u32;
    for &byte in data {
        hash = (hash << 5).wrapping_add(hash).wrapping_add(u32::from(byte));
    }
    hash
}

/// DEK hash (Donald E. Knuth).
pub fn dek_hash(data: &[u8]) -> u32 {
    let mut hash = data.len() as u32;
    for &byte in data {
        hash = ((hash << 5) ^ (hash >> 27)) ^ u32::from(byte);
    }
    hash
}

// ===== Schedules =====

/// A concrete AES-128 key/IV pair ready for CBC use
#[derive(Clone, Copy)]
pub struct AesSchedule {
    /// 16-byte AES-128 key
    pub key: [u8; BLOCK_SIZE],
    /// 16-byte CBC initialisation vector
    pub iv: [u8; BLOCK_SIZE],
}

impl AesSchedule {
    /// Serialize four key words and four IV words little-endian.
    pub fn from_words(key_words: [u32; 4], iv_words: [u32; 4]) -> Self {
        let mut key = [0u8; BLOCK_SIZE];
        let mut iv = [0u8; BLOCK_SIZE];
        for i in 0..4 {
            key[i * 4..i * 4 + 4].copy_from_slice(&key_words[i].to_le_bytes());
            iv[i * 4..i * 4 + 4].copy_from_slice(&iv_words[i].to_le_bytes());
        }
        Self { key, iv }
    }
}

impl std::fmt::Debug for AesSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("AesSchedule").finish_non_exhaustive()
    }
}

/// Legacy schedule for the device-ID exchange:
/// `key[i] = !(serial ^ k[i])`, `iv[i] = serial ^ v[i]`.
pub fn legacy_schedule(serial: u32, key_words: &[u32; 4], iv_words: &[u32; 4]) -> AesSchedule {
    let mut key = [0u32; 4];
    let mut iv = [0u32; 4];
    for i in 0..4 {
        key[i] = !(serial ^ key_words[i]);
        iv[i] = serial ^ iv_words[i];
    }
    AesSchedule::from_words(key, iv)
}

/// Derive the four challenge-algorithm words from a configured blob.
///
/// Hash order is DEK, JS, DJB, RS over the blob's ASCII bytes.
pub fn algo_words(blob: &str) -> [u32; 4] {
    let bytes = blob.as_bytes();
    [
        dek_hash(bytes),
        js_hash(bytes),
        djb_hash(bytes),
        rs_hash(bytes),
    ]
}

/// Modern schedule for the challenge:
/// `key[i] = !serial ^ k[i]`, `iv[i] = serial ^ v[i]`.
///
/// Note the complement binds to the serial alone here, unlike
/// [`legacy_schedule`].
pub fn modern_schedule(serial: u32, key_words: &[u32; 4], iv_words: &[u32; 4]) -> AesSchedule {
    let mut key = [0u32; 4];
    let mut iv = [0u32; 4];
    for i in 0..4 {
        key[i] = !serial ^ key_words[i];
        iv[i] = serial ^ iv_words[i];
    }
    AesSchedule::from_words(key, iv)
}

// ===== Session derivation =====

/// Session material derived from a solved challenge
#[derive(Clone, Copy)]
pub struct SessionKeys {
    key_words: [u32; 4],
    iv: u32,
}

impl SessionKeys {
    /// Derive session material from the challenge random, the device serial
    /// and the 12-byte STM32 device ID.
    ///
    /// The derivation buffer is `deviceID ‖ random_le ‖ serial_le`; the key
    /// words are RS, JS, DJB, DEK over it, and the IV word is RS over the
    /// same buffer with every byte XORed with `0xA5`.
    pub fn derive(device_id: &[u8; 12], random: u32, serial: u32) -> Self {
        let mut buffer = [0u8; 20];
        buffer[..12].copy_from_slice(device_id);
        buffer[12..16].copy_from_slice(&random.to_le_bytes());
        buffer[16..20].copy_from_slice(&serial.to_le_bytes());

        let key_words = [
            rs_hash(&buffer),
            js_hash(&buffer),
            djb_hash(&buffer),
            dek_hash(&buffer),
        ];

        let mut masked = buffer;
        for byte in &mut masked {
            *byte ^= 0xA5;
        }
        let iv = rs_hash(&masked);

        Self { key_words, iv }
    }

    /// The schedule for data packets after the handshake:
    /// `key[i] = iv ^ sessionKey[i]`, IV = the IV word repeated four times.
    pub fn schedule(&self) -> AesSchedule {
        let mut key = [0u32; 4];
        for i in 0..4 {
            key[i] = self.iv ^ self.key_words[i];
        }
        AesSchedule::from_words(key, [self.iv; 4])
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

// ===== CBC =====

/// AES-128-CBC encrypt without padding; `data.len()` must be a multiple of 16.
pub fn cbc_encrypt(schedule: &AesSchedule, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(LinkError::UnalignedCipherData { len: data.len() });
    }

    let cipher = Aes128::new((&schedule.key).into());
    let mut output = data.to_vec();
    let mut chain = schedule.iv;

    for block in output.chunks_mut(BLOCK_SIZE) {
        for (byte, mask) in block.iter_mut().zip(chain.iter()) {
            *byte ^= mask;
        }
        cipher.encrypt_block(block.into());
        chain.copy_from_slice(block);
    }

    Ok(output)
}

/// AES-128-CBC decrypt without padding; `data.len()` must be a multiple of 16.
pub fn cbc_decrypt(schedule: &AesSchedule, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(LinkError::UnalignedCipherData { len: data.len() });
    }

    let cipher = Aes128::new((&schedule.key).into());
    let mut output = data.to_vec();
    let mut chain = schedule.iv;

    for (block, source) in output.chunks_mut(BLOCK_SIZE).zip(data.chunks(BLOCK_SIZE)) {
        cipher.decrypt_block(block.into());
        for (byte, mask) in block.iter_mut().zip(chain.iter()) {
            *byte ^= mask;
        }
        chain.copy_from_slice(source);
    }

    Ok(output)
}
