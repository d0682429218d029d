//! Engine and proxy configuration.

use serde::{Deserialize, Serialize};

/// Default expiry for reliable UDP requests before retransmission.
pub const DEFAULT_UDP_EXPIRE_SECS: u64 = 15;

/// Default keepalive cadence to the central server.
pub const DEFAULT_KEEPALIVE_SECS: u64 = 120;

/// Connection parameters for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// User identification number — the account id.
    pub uin: u32,

    /// Password for the server login.
    pub password: String,

    /// Nickname advertised to peers.
    pub nick: String,

    /// Accept and initiate direct peer connections. When off, all
    /// traffic goes through the server.
    pub use_tcp: bool,

    /// Seconds a reliable UDP request waits for an ack before being
    /// retransmitted.
    pub udp_expire_secs: u64,

    /// Seconds between keepalive packets.
    pub keepalive_secs: u64,

    /// Route every connection through this SOCKS5 proxy when set.
    pub proxy: Option<ProxyConfig>,

    /// Directory where accepted file transfers are written.
    pub download_dir: Option<std::path::PathBuf>,
}

impl EngineConfig {
    pub fn new(uin: u32, password: impl Into<String>, nick: impl Into<String>) -> Self {
        Self {
            uin,
            password: password.into(),
            nick: nick.into(),
            use_tcp: true,
            udp_expire_secs: DEFAULT_UDP_EXPIRE_SECS,
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            proxy: None,
            download_dir: None,
        }
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }
}

/// SOCKS5 proxy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub auth: ProxyAuth,
}

/// How to authenticate against the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyAuth {
    /// No authentication offered.
    None,
    /// RFC 1929 username/password sub-negotiation.
    Password { username: String, password: String },
    /// Vendor HMAC-MD5 CHAP sub-negotiation.
    Chap { username: String, password: String },
}
