use std::{collections::HashMap, fmt};

use aes::{Aes128, Aes192, Aes256};
use cfb_mode::cipher::{BlockCipher, BlockEncryptMut, KeyInit};
use des::Des;

use super::keystream::{cfb_decryptor, cfb_encryptor, rc4_md5, Keystream, KeystreamFn};
use crate::TunnelError;

/// Method used when none is configured.
pub const DEFAULT_METHOD: &str = "aes-256-cfb";

/// Key size, IV size and keystream constructors of one cipher.
#[derive(Clone, Copy)]
pub struct CipherSpec {
    key_size: usize,
    iv_size: usize,
    encryptor: KeystreamFn,
    decryptor: KeystreamFn,
}

impl CipherSpec {
    /// Both sizes must be non-zero.
    pub fn new(
        key_size: usize,
        iv_size: usize,
        encryptor: KeystreamFn,
        decryptor: KeystreamFn,
    ) -> crate::Result<Self> {
        if key_size == 0 {
            return Err(TunnelError::InvalidKeySize(key_size));
        }
        if iv_size == 0 {
            return Err(TunnelError::IvSizeMismatch {
                expected: 1,
                actual: 0,
            });
        }
        Ok(Self {
            key_size,
            iv_size,
            encryptor,
            decryptor,
        })
    }

    /// CFB mode around `C`, sized from the block cipher itself.
    pub fn cfb<C>() -> Self
    where
        C: BlockEncryptMut + BlockCipher + KeyInit + Send + 'static,
    {
        Self {
            key_size: C::key_size(),
            iv_size: C::block_size(),
            encryptor: cfb_encryptor::<C>,
            decryptor: cfb_decryptor::<C>,
        }
    }

    /// A self-inverse cipher: the same construction serves both directions.
    pub fn symmetric(
        key_size: usize,
        iv_size: usize,
        keystream: KeystreamFn,
    ) -> crate::Result<Self> {
        Self::new(key_size, iv_size, keystream, keystream)
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn iv_size(&self) -> usize {
        self.iv_size
    }

    pub fn encryptor(&self, key: &[u8], iv: &[u8]) -> crate::Result<Box<dyn Keystream>> {
        self.validate(key, iv)?;
        (self.encryptor)(key, iv).map_err(|_| rejected(key, iv))
    }

    pub fn decryptor(&self, key: &[u8], iv: &[u8]) -> crate::Result<Box<dyn Keystream>> {
        self.validate(key, iv)?;
        (self.decryptor)(key, iv).map_err(|_| rejected(key, iv))
    }

    fn validate(&self, key: &[u8], iv: &[u8]) -> crate::Result<()> {
        if key.len() != self.key_size {
            return Err(TunnelError::KeySizeMismatch {
                expected: self.key_size,
                actual: key.len(),
            });
        }
        if iv.len() != self.iv_size {
            return Err(TunnelError::IvSizeMismatch {
                expected: self.iv_size,
                actual: iv.len(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for CipherSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSpec")
            .field("key_size", &self.key_size)
            .field("iv_size", &self.iv_size)
            .finish_non_exhaustive()
    }
}

fn rejected(key: &[u8], iv: &[u8]) -> TunnelError {
    TunnelError::UnsupportedCipher(format!(
        "primitive rejected a {} byte key with a {} byte iv",
        key.len(),
        iv.len()
    ))
}

/// Named cipher specs.
///
/// Built and filled at startup, then shared immutably (usually behind an
/// `Arc`) by all sessions.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    specs: HashMap<String, CipherSpec>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in methods.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("aes-128-cfb", CipherSpec::cfb::<Aes128>());
        registry.register("aes-192-cfb", CipherSpec::cfb::<Aes192>());
        registry.register("aes-256-cfb", CipherSpec::cfb::<Aes256>());
        registry.register("des-cfb", CipherSpec::cfb::<Des>());
        registry.register(
            "rc4-md5",
            CipherSpec {
                key_size: 16,
                iv_size: 16,
                encryptor: rc4_md5,
                decryptor: rc4_md5,
            },
        );
        registry
    }

    /// Adds `spec` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, spec: CipherSpec) {
        self.specs.insert(name.into(), spec);
    }

    pub fn lookup(&self, name: &str) -> crate::Result<&CipherSpec> {
        self.specs
            .get(name)
            .ok_or_else(|| TunnelError::UnsupportedCipher(name.to_string()))
    }

    /// Registered method names, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::derive_key;

    #[test]
    fn builtin_sizes() {
        let registry = Registry::with_builtin();
        let expected = [
            ("aes-128-cfb", 16, 16),
            ("aes-192-cfb", 24, 16),
            ("aes-256-cfb", 32, 16),
            ("des-cfb", 8, 8),
            ("rc4-md5", 16, 16),
        ];
        for (name, key_size, iv_size) in expected {
            let spec = registry.lookup(name).unwrap();
            assert_eq!(spec.key_size(), key_size, "{name}");
            assert_eq!(spec.iv_size(), iv_size, "{name}");
        }

        let mut names: Vec<_> = registry.names().collect();
        names.sort_unstable();
        assert_eq!(
            names,
            ["aes-128-cfb", "aes-192-cfb", "aes-256-cfb", "des-cfb", "rc4-md5"]
        );
    }

    #[test]
    fn unknown_method_is_unsupported() {
        let err = Registry::with_builtin().lookup("chacha20").unwrap_err();
        assert!(matches!(err, TunnelError::UnsupportedCipher(ref name) if name == "chacha20"));
        assert!(Registry::new().lookup(DEFAULT_METHOD).is_err());
    }

    #[test]
    fn register_replaces_existing_entry() {
        let mut registry = Registry::with_builtin();
        registry.register("aes-256-cfb", CipherSpec::cfb::<Aes128>());
        assert_eq!(registry.lookup("aes-256-cfb").unwrap().key_size(), 16);
        assert_eq!(registry.names().count(), 5);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(CipherSpec::new(0, 16, rc4_md5, rc4_md5).is_err());
        assert!(CipherSpec::symmetric(16, 0, rc4_md5).is_err());
        assert!(CipherSpec::symmetric(16, 16, rc4_md5).is_ok());
    }

    #[test]
    fn constructors_check_sizes() {
        let spec = Registry::with_builtin().lookup("aes-128-cfb").copied().unwrap();

        let err = spec.encryptor(&[0; 32], &[0; 16]).err().unwrap();
        assert!(matches!(
            err,
            TunnelError::KeySizeMismatch {
                expected: 16,
                actual: 32
            }
        ));

        let err = spec.decryptor(&[0; 16], &[0; 8]).err().unwrap();
        assert!(matches!(
            err,
            TunnelError::IvSizeMismatch {
                expected: 16,
                actual: 8
            }
        ));
    }

    #[test]
    fn primitive_rejection_is_unsupported_cipher() {
        // Claims a 20 byte key, which AES-128 cannot take.
        let spec =
            CipherSpec::new(20, 16, cfb_encryptor::<Aes128>, cfb_decryptor::<Aes128>).unwrap();
        let err = spec.encryptor(&[0; 20], &[0; 16]).err().unwrap();
        assert!(matches!(err, TunnelError::UnsupportedCipher(_)));
    }

    #[test]
    fn every_builtin_round_trips() {
        let registry = Registry::with_builtin();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();

        for name in registry.names() {
            let spec = registry.lookup(name).unwrap();
            let key = derive_key("correct horse", spec.key_size()).unwrap();
            let iv = vec![0x5A; spec.iv_size()];

            for len in [0, 1, 15, 16, 17, 1000] {
                let mut buf = data[..len].to_vec();
                spec.encryptor(&key, &iv).unwrap().apply(&mut buf);
                if len >= 16 {
                    assert_ne!(buf, data[..len], "{name} left {len} bytes untouched");
                }
                spec.decryptor(&key, &iv).unwrap().apply(&mut buf);
                assert_eq!(buf, data[..len], "{name} with {len} bytes");
            }
        }
    }
}
