use cfb_mode::{
    cipher::{
        consts::U16, BlockCipher, BlockEncryptMut, InvalidLength, KeyInit, KeyIvInit,
        StreamCipher,
    },
    BufDecryptor, BufEncryptor,
};
use md5::{Digest, Md5};
use rc4::Rc4;

/// One direction of a stream cipher.
///
/// `apply` transforms `data` in place and advances the keystream, so calls
/// must see the bytes in stream order. Splitting a stream into chunks of any
/// size yields the same output as transforming it in one call.
pub trait Keystream: Send {
    fn apply(&mut self, data: &mut [u8]);
}

/// Builds a keystream from a key and an IV whose lengths were already
/// checked against the owning spec.
pub type KeystreamFn = fn(key: &[u8], iv: &[u8]) -> Result<Box<dyn Keystream>, InvalidLength>;

struct CfbEncrypt<C>(BufEncryptor<C>)
where
    C: BlockEncryptMut + BlockCipher;

impl<C> Keystream for CfbEncrypt<C>
where
    C: BlockEncryptMut + BlockCipher + Send,
{
    fn apply(&mut self, data: &mut [u8]) {
        self.0.encrypt(data);
    }
}

struct CfbDecrypt<C>(BufDecryptor<C>)
where
    C: BlockEncryptMut + BlockCipher;

impl<C> Keystream for CfbDecrypt<C>
where
    C: BlockEncryptMut + BlockCipher + Send,
{
    fn apply(&mut self, data: &mut [u8]) {
        self.0.decrypt(data);
    }
}

/// Full-block CFB encryption around the block cipher `C`.
pub fn cfb_encryptor<C>(key: &[u8], iv: &[u8]) -> Result<Box<dyn Keystream>, InvalidLength>
where
    C: BlockEncryptMut + BlockCipher + KeyInit + Send + 'static,
{
    let cfb = BufEncryptor::<C>::new_from_slices(key, iv)?;
    Ok(Box::new(CfbEncrypt(cfb)))
}

/// Full-block CFB decryption around the block cipher `C`.
pub fn cfb_decryptor<C>(key: &[u8], iv: &[u8]) -> Result<Box<dyn Keystream>, InvalidLength>
where
    C: BlockEncryptMut + BlockCipher + KeyInit + Send + 'static,
{
    let cfb = BufDecryptor::<C>::new_from_slices(key, iv)?;
    Ok(Box::new(CfbDecrypt(cfb)))
}

struct Rc4Md5(Rc4<U16>);

impl Keystream for Rc4Md5 {
    fn apply(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

/// RC4 keyed with `MD5(key | iv)`. Used for both directions.
pub fn rc4_md5(key: &[u8], iv: &[u8]) -> Result<Box<dyn Keystream>, InvalidLength> {
    let mut hasher = Md5::new();
    hasher.update(key);
    hasher.update(iv);
    let rc4 = Rc4::<U16>::new_from_slice(&hasher.finalize())?;
    Ok(Box::new(Rc4Md5(rc4)))
}

#[cfg(test)]
mod tests {
    use aes::{Aes128, Aes256};
    use des::Des;

    use super::*;
    use crate::cipher::derive_key;

    const PLAINTEXT: &[u8] = b"hello shadowsocks";

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn encrypt(ctor: KeystreamFn, key: &[u8], iv: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        ctor(key, iv).unwrap().apply(&mut out);
        out
    }

    #[test]
    fn aes_128_cfb_known_answer() {
        let key = derive_key("foobar", 16).unwrap();
        let iv: Vec<u8> = (0..16).collect();
        let out = encrypt(cfb_encryptor::<Aes128>, &key, &iv, PLAINTEXT);
        assert_eq!(hex(&out), "66c6797a570902040a51ffbd14bb3f1df6");
    }

    #[test]
    fn aes_256_cfb_known_answer() {
        let key = derive_key("foobar", 32).unwrap();
        let iv: Vec<u8> = (0..16).collect();
        let out = encrypt(cfb_encryptor::<Aes256>, &key, &iv, PLAINTEXT);
        assert_eq!(hex(&out), "444d9af0c45195f5505bd620b08b19bd08");
    }

    #[test]
    fn des_cfb_known_answer() {
        let key = derive_key("foobar", 8).unwrap();
        let iv: Vec<u8> = (0..8).collect();
        let out = encrypt(cfb_encryptor::<Des>, &key, &iv, PLAINTEXT);
        assert_eq!(hex(&out), "d7b94888e02c20d3168d9b2c8662760fc9");
    }

    #[test]
    fn rc4_md5_known_answer_and_self_inverse() {
        let key = derive_key("foobar", 16).unwrap();
        let iv: Vec<u8> = (0..16).collect();
        let out = encrypt(rc4_md5, &key, &iv, PLAINTEXT);
        assert_eq!(hex(&out), "808cd945265a4c21c7a412d2569e6503f0");

        assert_eq!(encrypt(rc4_md5, &key, &iv, &out), PLAINTEXT);
    }

    #[test]
    fn chunked_cfb_matches_one_shot() {
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 31 % 251) as u8).collect();
        let whole = encrypt(cfb_encryptor::<Aes128>, &key, &iv, &data);

        let mut enc = cfb_encryptor::<Aes128>(&key, &iv).unwrap();
        let mut chunked = data.clone();
        let mut offset = 0;
        for size in [1, 15, 16, 17, 3, 948] {
            enc.apply(&mut chunked[offset..offset + size]);
            offset += size;
        }
        assert_eq!(chunked, whole);
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        assert!(cfb_encryptor::<Aes128>(&[0; 15], &[0; 16]).is_err());
        assert!(cfb_decryptor::<Des>(&[0; 8], &[0; 16]).is_err());
    }
}
