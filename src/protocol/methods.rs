const NO_AUTH_REQUIRED: u8 = 0x00;
const GSSAPI: u8 = 0x01;
const USERNAME_PASSWORD: u8 = 0x02;
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

/// Authentication methods offered in a SOCKS5 greeting.
///
/// The tunnel only ever selects `NoAuthRequired`; the other variants exist so
/// that a greeting can be logged faithfully before it is rejected.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AuthMethod {
    NoAuthRequired,
    Gssapi,
    UsernamePassword,
    /// Anything else, IANA assigned or private.
    Other(u8),
    NoAcceptableMethods,
}

impl AuthMethod {
    pub fn from_u8(value: u8) -> Self {
        match value {
            NO_AUTH_REQUIRED => AuthMethod::NoAuthRequired,
            GSSAPI => AuthMethod::Gssapi,
            USERNAME_PASSWORD => AuthMethod::UsernamePassword,
            NO_ACCEPTABLE_METHODS => AuthMethod::NoAcceptableMethods,
            other => AuthMethod::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            AuthMethod::NoAuthRequired => NO_AUTH_REQUIRED,
            AuthMethod::Gssapi => GSSAPI,
            AuthMethod::UsernamePassword => USERNAME_PASSWORD,
            AuthMethod::Other(value) => value,
            AuthMethod::NoAcceptableMethods => NO_ACCEPTABLE_METHODS,
        }
    }
}
