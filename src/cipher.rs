//! Stream ciphers for the shadowsocks tunnel.
//!
//! A [`CipherSpec`] knows its key and IV sizes and how to build a
//! [`Keystream`] for each direction. Specs live in a [`Registry`] that is
//! built once at startup and shared read-only by every session.

mod kdf;
mod keystream;
mod registry;
mod stream;

pub use kdf::derive_key;
pub use keystream::{cfb_decryptor, cfb_encryptor, rc4_md5, Keystream, KeystreamFn};
pub use registry::{CipherSpec, Registry, DEFAULT_METHOD};
pub use stream::{random_iv, read_iv, DecryptReader, EncryptWriter};
