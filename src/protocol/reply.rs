use std::{fmt, io};

/// The REP field of a SOCKS5 request reply.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Success = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowedByRuleset = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    pub fn to_u8(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            Reply::Success => "succeeded",
            Reply::GeneralFailure => "general failure",
            Reply::ConnectionNotAllowedByRuleset => "connection not allowed by ruleset",
            Reply::NetworkUnreachable => "network unreachable",
            Reply::HostUnreachable => "host unreachable",
            Reply::ConnectionRefused => "connection refused",
            Reply::TtlExpired => "TTL expired",
            Reply::CommandNotSupported => "command not supported",
            Reply::AddressTypeNotSupported => "address type not supported",
        };
        f.write_str(description)
    }
}

/// Maps a failed dial of the remote peer onto the closest SOCKS5 reply code.
impl From<io::ErrorKind> for Reply {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            io::ErrorKind::PermissionDenied => Reply::ConnectionNotAllowedByRuleset,
            io::ErrorKind::NotConnected | io::ErrorKind::AddrNotAvailable => {
                Reply::NetworkUnreachable
            }
            io::ErrorKind::NotFound | io::ErrorKind::InvalidInput => Reply::HostUnreachable,
            io::ErrorKind::TimedOut => Reply::TtlExpired,
            io::ErrorKind::Unsupported => Reply::CommandNotSupported,
            _ => Reply::GeneralFailure,
        }
    }
}
