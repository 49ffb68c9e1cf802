//! # sstunnel
//!
//! A local forward proxy: applications talk SOCKS5 to it, and it relays each
//! connection to a remote shadowsocks peer over a stream-cipher tunnel.
//!
//! ## Wire format
//!
//! Every direction of a tunnel starts with the sender's IV in plaintext,
//! followed by a keystream-encrypted byte stream. On the outbound direction
//! the first plaintext bytes are the target address, encoded exactly like a
//! SOCKS5 `ATYP | DST.ADDR | DST.PORT` triple, then the application payload.
//!
//! ## Pieces
//!
//! - [`cipher::Registry`] holds the named [`cipher::CipherSpec`]s
//!   (`aes-{128,192,256}-cfb`, `des-cfb`, `rc4-md5`).
//! - [`cipher::derive_key`] turns a password into key material.
//! - [`cipher::EncryptWriter`] / [`cipher::DecryptReader`] wrap tokio streams
//!   with a keystream.
//! - [`Socks5Socket`] runs the client side SOCKS5 handshake.
//! - [`Relay`] ties it all together for one accepted client connection.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sstunnel::{cipher::Registry, Config, Relay};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> sstunnel::Result<()> {
//!     let config = Config {
//!         server: "203.0.113.7:8388".into(),
//!         password: "secret".into(),
//!         ..Default::default()
//!     };
//!     let listener = TcpListener::bind(&config.local).await?;
//!     let relay = Relay::new(Arc::new(Registry::with_builtin()), Arc::new(config))?;
//!
//!     loop {
//!         let (client, _) = listener.accept().await?;
//!         let relay = relay.clone();
//!         tokio::spawn(async move {
//!             if let Err(err) = relay.serve(client).await {
//!                 eprintln!("session failed: {err}");
//!             }
//!         });
//!     }
//! }
//! ```

use std::io;

use thiserror::Error;

pub mod cipher;
mod config;
pub mod protocol;
mod relay;
mod socks5_socket;

pub use config::Config;
pub use relay::{Direction, Relay};
pub use socks5_socket::{ConnectRequest, HandshakeState, Socks5Socket};

pub type Result<T> = std::result::Result<T, TunnelError>;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("unsupported socks version: {0:#04x}")]
    UnsupportedSocksVersion(u8),
    #[error("unsupported socks command: {0:#04x}")]
    UnsupportedSocksCommand(u8),
    #[error("unknown address type: {0:#04x}")]
    UnknownAddressType(u8),
    #[error("client did not offer the no-authentication method")]
    NoAuthUnavailable,
    #[error("socks5 handshake step attempted in state {0:?}")]
    HandshakeOutOfOrder(HandshakeState),

    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),
    #[error("invalid key size: {0}")]
    InvalidKeySize(usize),
    #[error("invalid key size: {actual} (expect {expected})")]
    KeySizeMismatch { expected: usize, actual: usize },
    #[error("invalid iv size: {actual} (expect {expected})")]
    IvSizeMismatch { expected: usize, actual: usize },

    #[error("network error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Whether the client broke the SOCKS5 protocol, as opposed to a cipher
    /// or transport failure.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            TunnelError::UnsupportedSocksVersion(_)
                | TunnelError::UnsupportedSocksCommand(_)
                | TunnelError::UnknownAddressType(_)
                | TunnelError::NoAuthUnavailable
                | TunnelError::HandshakeOutOfOrder(_)
        )
    }
}
