use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{instrument, trace};

use crate::protocol::{AuthMethod, Command, Reply, SocksAddr, RESERVED, VERSION};
use crate::TunnelError;

/// Where a [`Socks5Socket`] is in the client handshake.
///
/// `WaitGreeting -> WaitRequest -> Ready`. Any parse failure moves the socket
/// to `Failed`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    WaitGreeting,
    WaitRequest,
    Ready,
    Failed,
}

/// A parsed CONNECT request.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub target: SocksAddr,
    /// `ATYP | DST.ADDR | DST.PORT` exactly as the client sent it.
    pub raw_target: Vec<u8>,
}

/// The proxy's side of a SOCKS5 client connection.
///
/// Reads go straight to the underlying stream, nothing is buffered beyond
/// the bytes each step consumes, so once the handshake is done
/// [`Socks5Socket::into_inner`] hands back a stream positioned at the first
/// payload byte.
pub struct Socks5Socket<T> {
    inner: T,
    state: HandshakeState,
}

impl<T> Socks5Socket<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            state: HandshakeState::WaitGreeting,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Greeting, method selection and request in one go.
    ///
    /// Leaves the request reply to the caller, who knows the bind address.
    pub async fn handshake(&mut self) -> crate::Result<ConnectRequest> {
        self.read_greeting().await?;
        self.write_auth_method(AuthMethod::NoAuthRequired).await?;
        self.read_request().await
    }

    /// `VER | NMETHODS | METHODS`. Fails unless no-auth is on offer.
    #[instrument(skip_all)]
    pub async fn read_greeting(&mut self) -> crate::Result<Vec<AuthMethod>> {
        self.expect_state(HandshakeState::WaitGreeting)?;

        match self.parse_methods().await {
            Ok(methods) => {
                trace!("Client offered methods: {:?}", methods);
                self.state = HandshakeState::WaitRequest;
                Ok(methods)
            }
            Err(err) => {
                self.state = HandshakeState::Failed;
                Err(err)
            }
        }
    }

    /// `VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT`. Only CONNECT is accepted.
    #[instrument(skip_all)]
    pub async fn read_request(&mut self) -> crate::Result<ConnectRequest> {
        self.expect_state(HandshakeState::WaitRequest)?;

        match self.parse_request().await {
            Ok(request) => {
                trace!("Client requested: {}", request.target);
                self.state = HandshakeState::Ready;
                Ok(request)
            }
            Err(err) => {
                self.state = HandshakeState::Failed;
                Err(err)
            }
        }
    }

    pub async fn write_auth_method(&mut self, auth_method: AuthMethod) -> io::Result<()> {
        self.inner
            .write_all(&[VERSION, auth_method.to_u8()])
            .await
    }

    /// `VER | REP | RSV | BND.ATYP | BND.ADDR | BND.PORT`
    pub async fn reply(&mut self, reply: Reply, bnd_address: SocksAddr) -> io::Result<()> {
        let mut buf = Vec::with_capacity(3 + 18);
        buf.extend_from_slice(&[VERSION, reply.to_u8(), RESERVED]);
        buf.extend_from_slice(&bnd_address.to_bytes());
        self.inner.write_all(&buf).await?;
        self.inner.flush().await
    }

    fn expect_state(&self, expected: HandshakeState) -> crate::Result<()> {
        if self.state != expected {
            return Err(TunnelError::HandshakeOutOfOrder(self.state));
        }
        Ok(())
    }

    async fn parse_methods(&mut self) -> crate::Result<Vec<AuthMethod>> {
        let version = self.inner.read_u8().await?;
        if version != VERSION {
            return Err(TunnelError::UnsupportedSocksVersion(version));
        }

        let count = self.inner.read_u8().await?;
        let mut methods = vec![0; count as usize];
        self.inner.read_exact(&mut methods).await?;

        let methods = methods
            .into_iter()
            .map(AuthMethod::from_u8)
            .collect::<Vec<_>>();

        if !methods.contains(&AuthMethod::NoAuthRequired) {
            return Err(TunnelError::NoAuthUnavailable);
        }
        Ok(methods)
    }

    async fn parse_request(&mut self) -> crate::Result<ConnectRequest> {
        let mut header = [0; 3];
        self.inner.read_exact(&mut header).await?;

        if header[0] != VERSION {
            return Err(TunnelError::UnsupportedSocksVersion(header[0]));
        }
        match Command::try_from(header[1]) {
            Ok(Command::Connect) => {}
            _ => return Err(TunnelError::UnsupportedSocksCommand(header[1])),
        }

        let (target, raw_target) = SocksAddr::read_from(&mut self.inner).await?;
        Ok(ConnectRequest { target, raw_target })
    }
}
