//! Typed configuration document, loaded from TOML with built-in defaults for every key.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::handler::InvalidAction;
use crate::packets::MissingPacketAction;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub net: Net,
    pub ping: Ping,
    pub log: Log,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            net: Net::default(),
            ping: Ping::default(),
            log: Log::default(),
        }
    }
}

impl Config {
    /// Reads and parses `path`, falling back to built-in defaults for any key the file omits.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let mut file = File::open(path)?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        Ok(toml::from_str(&buf)?)
    }

    pub fn missingpacketaction(&self) -> Result<MissingPacketAction, Error> {
        match self.net.registry.missingpacketaction.as_str() {
            "closeconnection" => Ok(MissingPacketAction::CloseConnection),
            "ignore" => Ok(MissingPacketAction::Ignore),
            other => Err(Error::InvalidValue {
                key: "net.registry.missingpacketaction",
                value: other.to_owned(),
            }),
        }
    }

    pub fn default_invalid_action(&self) -> Result<InvalidAction, Error> {
        self.net
            .invalid_action
            .parse()
            .map_err(|_| Error::InvalidValue {
                key: "net.invalid_action",
                value: self.net.invalid_action.clone(),
            })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Net {
    pub server: ServerAddr,
    pub client: ClientAddr,
    pub compress: Compress,
    pub encrypt: Encrypt,
    pub ssl: Ssl,
    pub events: Events,
    pub debug: Debug,
    pub registry: RegistryConfig,
    /// Default `invalid_action` for packet gates that don't specify one explicitly.
    pub invalid_action: String,
}

impl Default for Net {
    fn default() -> Self {
        Self {
            server: ServerAddr::default(),
            client: ClientAddr::default(),
            compress: Compress::default(),
            encrypt: Encrypt::default(),
            ssl: Ssl::default(),
            events: Events::default(),
            debug: Debug::default(),
            registry: RegistryConfig::default(),
            invalid_action: "ignore".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerAddr {
    pub addr: Option<String>,
    pub host: String,
    pub port: u16,
}

impl Default for ServerAddr {
    fn default() -> Self {
        Self {
            addr: None,
            host: "0.0.0.0".to_owned(),
            port: 8080,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientAddr {
    pub addr: Option<String>,
    pub host: String,
    pub port: u16,
}

impl Default for ClientAddr {
    fn default() -> Self {
        Self {
            addr: None,
            host: "localhost".to_owned(),
            port: 8080,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Compress {
    pub enabled: bool,
    pub threshold: usize,
    pub level: u32,
}

impl Default for Compress {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: crate::wire::DEFAULT_COMPRESS_THRESHOLD,
            level: 6,
        }
    }
}

impl From<Compress> for crate::wire::CompressionConfig {
    fn from(c: Compress) -> Self {
        Self {
            enabled: c.enabled,
            threshold: c.threshold,
            level: c.level,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Encrypt {
    pub enabled: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Ssl {
    pub enabled: bool,
    pub force: bool,
    pub cafile: Option<String>,
    pub server: SslServer,
    pub client: SslClient,
}

impl Default for Ssl {
    fn default() -> Self {
        Self {
            enabled: false,
            force: true,
            cafile: None,
            server: SslServer::default(),
            client: SslClient::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SslServer {
    pub force_verify: bool,
    pub certfile: Option<String>,
    pub keyfile: Option<String>,
}

impl Default for SslServer {
    fn default() -> Self {
        Self {
            force_verify: true,
            certfile: None,
            keyfile: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SslClient {
    pub check_hostname: bool,
    pub force_verify: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Events {
    /// `"auto"`, `"true"` or `"false"` — whether host-application event callbacks fire.
    pub enable: String,
}

impl Default for Events {
    fn default() -> Self {
        Self {
            enable: "auto".to_owned(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Debug {
    pub print: DebugPrint,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugPrint {
    pub recv: bool,
    pub send: bool,
    pub connect: bool,
    pub close: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub autosync: bool,
    pub missingpacketaction: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            autosync: true,
            missingpacketaction: "closeconnection".to_owned(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Ping {
    /// Whether a ping reply merges back the requester's own `oldmsg` payload.
    ///
    /// Off by default: the original implementation defaulted this on, but doing so echoes
    /// caller-supplied data back verbatim, which is surprising behavior for a server default.
    pub writeback: bool,
}

impl Default for Ping {
    fn default() -> Self {
        Self { writeback: false }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Log {
    pub level: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_enumerated_keys() {
        let cfg = Config::default();
        assert_eq!(cfg.net.server.port, 8080);
        assert_eq!(cfg.net.client.host, "localhost");
        assert!(cfg.net.compress.enabled);
        assert_eq!(cfg.net.compress.threshold, 8 * 1024);
        assert!(!cfg.net.ssl.enabled);
        assert!(cfg.net.registry.autosync);
        assert_eq!(cfg.net.registry.missingpacketaction, "closeconnection");
        assert!(!cfg.ping.writeback);
    }

    #[test]
    fn test_parses_partial_toml_with_defaults() {
        let toml = r#"
            [net.server]
            port = 9999
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.net.server.port, 9999);
        assert_eq!(cfg.net.server.host, "0.0.0.0");
        assert!(cfg.net.compress.enabled);
    }

    #[test]
    fn test_missingpacketaction_parses() {
        let cfg = Config::default();
        assert_eq!(
            cfg.missingpacketaction().unwrap(),
            MissingPacketAction::CloseConnection
        );
    }
}
