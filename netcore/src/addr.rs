//! Address parsing: `host[:port]` normalization.
//!
//! IPv6 is intentionally unsupported: a bracketed `[::1]:port` form, or any address containing
//! more than one `:`-separated suffix, is rejected outright rather than partially parsed.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("port {0} is not in range [0, 65535]")]
    InvalidPort(i64),
    #[error("port is not an integer: {0}")]
    NotAnInteger(String),
    #[error("address appears to be IPv6, which is not supported")]
    UnsupportedAddress,
}

/// A parsed `(host, port)` pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses `addr` of the form `host` or `host:port`, using `default_port` when no port is given.
pub fn parse(addr: &str, default_port: u16) -> Result<Address, Error> {
    let parts: Vec<&str> = addr.split(':').collect();

    match parts.as_slice() {
        [host] => Ok(Address::new(*host, default_port)),
        [host, port] => {
            let port: i64 = port
                .parse()
                .map_err(|_| Error::NotAnInteger((*port).to_owned()))?;

            if !(0..=65535).contains(&port) {
                return Err(Error::InvalidPort(port));
            }

            Ok(Address::new(*host, port as u16))
        }
        _ => Err(Error::UnsupportedAddress),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_host_uses_default_port() {
        assert_eq!(parse("example.com", 8080).unwrap(), Address::new("example.com", 8080));
    }

    #[test]
    fn test_host_and_port() {
        assert_eq!(parse("example.com:9000", 8080).unwrap(), Address::new("example.com", 9000));
    }

    #[test]
    fn test_port_boundaries() {
        assert_eq!(parse("h:0", 1).unwrap().port, 0);
        assert_eq!(parse("h:65535", 1).unwrap().port, 65535);
        assert_eq!(parse("h:-1", 1), Err(Error::InvalidPort(-1)));
        assert_eq!(parse("h:65536", 1), Err(Error::InvalidPort(65536)));
    }

    #[test]
    fn test_ipv6_rejected() {
        assert_eq!(parse("::1:8080", 1), Err(Error::UnsupportedAddress));
        assert_eq!(parse("[::1]:8080", 1), Err(Error::UnsupportedAddress));
    }

    #[test]
    fn test_roundtrip_format() {
        let a = parse("example.com:9000", 8080).unwrap();
        assert_eq!(a.to_string(), "example.com:9000");
        assert_eq!(parse(&a.to_string(), 8080).unwrap(), a);
    }

    #[test]
    fn test_non_integer_port() {
        assert!(matches!(parse("h:abc", 1), Err(Error::NotAnInteger(_))));
    }
}
