use std::time::Duration;

use crate::cipher::DEFAULT_METHOD;

/// Settings shared by every session of one proxy process.
///
/// Values are taken as given; addresses are only interpreted when the
/// listener binds or a session dials out.
#[derive(Clone)]
pub struct Config {
    /// Local SOCKS5 listen address.
    pub local: String,
    /// Remote shadowsocks peer.
    pub server: String,
    /// Cipher method name, looked up in the registry.
    pub method: String,
    pub password: String,
    /// Bound on dialing `server`. `None` waits as long as the OS does.
    pub connect_timeout: Option<Duration>,
    /// How long a session may go with neither direction moving data.
    pub idle_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local: "0.0.0.0:1080".to_string(),
            server: String::new(),
            method: DEFAULT_METHOD.to_string(),
            password: String::new(),
            connect_timeout: None,
            idle_timeout: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("local", &self.local)
            .field("server", &self.server)
            .field("method", &self.method)
            .field("password", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}
