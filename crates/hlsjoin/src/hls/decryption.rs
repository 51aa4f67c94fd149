// HLS Decryption: AES-128-CBC segment decryption and IV resolution.

use crate::hls::HlsDownloaderError;
use crate::hls::playlist::KeyRef;
use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES-128 key length in bytes.
pub const KEY_LEN: usize = 16;
/// AES block and IV length in bytes.
pub const IV_LEN: usize = 16;

/// Decrypts AES-128-CBC `data` and strips PKCS#7 padding.
///
/// A key that is not exactly 16 bytes, ciphertext that is not a whole number
/// of blocks, and invalid padding are all reported as `DecryptionError`.
pub fn decrypt(data: &[u8], key: &[u8], iv: &[u8; IV_LEN]) -> Result<Bytes, HlsDownloaderError> {
    if key.len() != KEY_LEN {
        return Err(HlsDownloaderError::DecryptionError(format!(
            "decryption key has incorrect length: {} bytes (expected {KEY_LEN})",
            key.len()
        )));
    }
    if data.len() % IV_LEN != 0 {
        return Err(HlsDownloaderError::DecryptionError(format!(
            "ciphertext length {} is not a multiple of the block size",
            data.len()
        )));
    }

    let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| {
        HlsDownloaderError::DecryptionError(format!("Failed to initialize AES decryptor: {e}"))
    })?;

    let mut buffer = data.to_vec();
    let decrypted_len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| HlsDownloaderError::DecryptionError(format!("Decryption failed: {e}")))?
        .len();

    buffer.truncate(decrypted_len);
    Ok(Bytes::from(buffer))
}

/// Parses an explicit IV: hex, optionally prefixed with `0x`, exactly 16 bytes.
pub fn parse_iv(iv_hex_str: &str) -> Result<[u8; IV_LEN], HlsDownloaderError> {
    let iv_str = iv_hex_str
        .strip_prefix("0x")
        .or_else(|| iv_hex_str.strip_prefix("0X"))
        .unwrap_or(iv_hex_str);
    let mut iv_bytes = [0u8; IV_LEN];
    hex::decode_to_slice(iv_str, &mut iv_bytes).map_err(|e| {
        HlsDownloaderError::DecryptionError(format!("Failed to parse IV '{iv_hex_str}': {e}"))
    })?;
    Ok(iv_bytes)
}

/// IV used when the key reference carries none: zeros with the segment index
/// (mod 256) in the last byte.
pub fn index_iv(index: usize) -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    iv[IV_LEN - 1] = (index % 256) as u8;
    iv
}

/// The explicit IV of `key` when present, otherwise the index-derived one.
pub fn resolve_iv(key: &KeyRef, index: usize) -> Result<[u8; IV_LEN], HlsDownloaderError> {
    match key.iv.as_deref().filter(|iv| !iv.is_empty()) {
        Some(iv_hex) => parse_iv(iv_hex),
        None => Ok(index_iv(index)),
    }
}

/// Runs decryption inline or on tokio's blocking pool.
pub struct DecryptionOffloader {
    enabled: bool,
}

impl DecryptionOffloader {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub async fn decrypt(
        &self,
        data: Bytes,
        key: Bytes,
        iv: [u8; IV_LEN],
    ) -> Result<Bytes, HlsDownloaderError> {
        if self.enabled {
            tokio::task::spawn_blocking(move || decrypt(&data, &key, &iv))
                .await
                .map_err(|e| {
                    HlsDownloaderError::DecryptionError(format!(
                        "Decryption offload task failed: {e}"
                    ))
                })?
        } else {
            decrypt(&data, &key, &iv)
        }
    }
}
