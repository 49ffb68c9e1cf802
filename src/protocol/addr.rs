use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::TunnelError;

/// ATYP values. Only the low nibble of the wire byte is significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4 = 0x01,
    DomainName = 0x03,
    Ipv6 = 0x04,
}

impl AddressType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value & 0x0F {
            0x01 => Some(AddressType::Ipv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::Ipv6),
            _ => None,
        }
    }

    pub fn to_u8(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Addr {
    pub fn addr_type(&self) -> AddressType {
        match self {
            Addr::Ipv4(_) => AddressType::Ipv4,
            Addr::Ipv6(_) => AddressType::Ipv6,
            Addr::Domain(_) => AddressType::DomainName,
        }
    }
}

/// A decoded `ATYP | ADDR | PORT` triple, as used by both SOCKS5 and the
/// shadowsocks target header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksAddr {
    pub addr: Addr,
    pub port: u16,
}

impl SocksAddr {
    /// `0.0.0.0:0`, sent as BND.ADDR when there is nothing better to report.
    pub fn unspecified() -> Self {
        SocksAddr {
            addr: Addr::Ipv4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    /// Reads one address off `reader`.
    ///
    /// Returns the decoded address together with the exact bytes consumed,
    /// so the caller can forward the encoding verbatim.
    pub async fn read_from<R>(reader: &mut R) -> crate::Result<(SocksAddr, Vec<u8>)>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = reader.read_u8().await?;
        let mut raw = Vec::with_capacity(1 + 1 + u8::MAX as usize + 2);
        raw.push(atyp);

        let addr_type = AddressType::from_u8(atyp).ok_or(TunnelError::UnknownAddressType(atyp))?;
        let addr = match addr_type {
            AddressType::Ipv4 => {
                let mut octets = [0; 4];
                reader.read_exact(&mut octets).await?;
                raw.extend_from_slice(&octets);
                Addr::Ipv4(Ipv4Addr::from(octets))
            }
            AddressType::Ipv6 => {
                let mut octets = [0; 16];
                reader.read_exact(&mut octets).await?;
                raw.extend_from_slice(&octets);
                Addr::Ipv6(Ipv6Addr::from(octets))
            }
            AddressType::DomainName => {
                let len = reader.read_u8().await?;
                let mut domain = vec![0; len as usize];
                reader.read_exact(&mut domain).await?;
                raw.push(len);
                raw.extend_from_slice(&domain);
                Addr::Domain(String::from_utf8_lossy(&domain).into_owned())
            }
        };

        let mut port = [0; 2];
        reader.read_exact(&mut port).await?;
        raw.extend_from_slice(&port);

        Ok((
            SocksAddr {
                addr,
                port: u16::from_be_bytes(port),
            },
            raw,
        ))
    }

    /// Turns `Self` into: ATYP+ADDR+PORT
    ///
    /// Domains longer than 255 bytes cannot be encoded and are truncated.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(18);

        bytes.push(self.addr.addr_type().to_u8());

        match &self.addr {
            Addr::Ipv4(addr) => bytes.extend_from_slice(&addr.octets()),
            Addr::Ipv6(addr) => bytes.extend_from_slice(&addr.octets()),
            Addr::Domain(domain) => {
                let domain = &domain.as_bytes()[..domain.len().min(u8::MAX as usize)];
                bytes.push(domain.len() as u8);
                bytes.extend_from_slice(domain);
            }
        }
        bytes.extend_from_slice(&self.port.to_be_bytes());

        bytes
    }
}

impl From<SocketAddr> for SocksAddr {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(v4) => SocksAddr {
                addr: Addr::Ipv4(*v4.ip()),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => SocksAddr {
                addr: Addr::Ipv6(*v6.ip()),
                port: v6.port(),
            },
        }
    }
}

impl fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            Addr::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            Addr::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            Addr::Domain(domain) => write!(f, "{}:{}", domain, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_ipv6_and_keeps_raw_bytes() {
        let mut wire = vec![0x04];
        wire.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        wire.extend_from_slice(&[0x01, 0xBB]);

        let (addr, raw) = SocksAddr::read_from(&mut &wire[..]).await.unwrap();
        assert_eq!(addr.addr, Addr::Ipv6(Ipv6Addr::LOCALHOST));
        assert_eq!(addr.port, 443);
        assert_eq!(raw, wire);
        assert_eq!(addr.to_string(), "[::1]:443");
    }

    #[tokio::test]
    async fn high_nibble_of_atyp_is_ignored_but_forwarded() {
        let wire = [0x11, 10, 0, 0, 1, 0x1F, 0x90];

        let (addr, raw) = SocksAddr::read_from(&mut &wire[..]).await.unwrap();
        assert_eq!(addr.addr, Addr::Ipv4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(addr.port, 8080);
        assert_eq!(raw, wire);
    }

    #[tokio::test]
    async fn truncated_address_is_an_io_error() {
        let wire = [0x03, 9, b'l', b'o', b'c'];

        let err = SocksAddr::read_from(&mut &wire[..]).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof
        ));
    }

    #[test]
    fn bind_address_encoding_follows_family() {
        let v4: SocketAddr = "192.168.1.2:1080".parse().unwrap();
        assert_eq!(
            SocksAddr::from(v4).to_bytes(),
            vec![0x01, 192, 168, 1, 2, 0x04, 0x38]
        );

        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        let bytes = SocksAddr::from(v6).to_bytes();
        assert_eq!(bytes.len(), 1 + 16 + 2);
        assert_eq!(bytes[0], 0x04);
        assert_eq!(&bytes[17..], &[0x00, 0x50]);
    }
}
