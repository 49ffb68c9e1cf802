use md5::{Digest, Md5};

use crate::TunnelError;

const MD5_LEN: usize = 16;

/// Stretches `password` into `key_size` bytes of key material.
///
/// `block[1] = MD5(password)`, `block[i] = MD5(block[i-1] | password)`,
/// concatenated and truncated. Every shadowsocks implementation derives
/// stream-cipher keys this way, so the output must not change.
pub fn derive_key(password: &str, key_size: usize) -> crate::Result<Vec<u8>> {
    if key_size == 0 {
        return Err(TunnelError::InvalidKeySize(key_size));
    }

    let blocks = key_size.div_ceil(MD5_LEN);
    let mut key = Vec::with_capacity(blocks * MD5_LEN);

    let mut prev = Md5::digest(password.as_bytes());
    key.extend_from_slice(&prev);
    for _ in 1..blocks {
        let mut hasher = Md5::new();
        hasher.update(prev);
        hasher.update(password.as_bytes());
        prev = hasher.finalize();
        key.extend_from_slice(&prev);
    }

    key.truncate(key_size);
    Ok(key)
}
