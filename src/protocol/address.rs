//! Link address grammar.
//!
//! ```text
//! udp://host:port      host may be empty to listen on every interface
//! serial://path:baud
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Malformed link address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid link address '{address}': {reason}")]
pub struct AddressError {
    pub address: String,
    pub reason: String,
}

impl AddressError {
    fn new(address: &str, reason: impl Into<String>) -> Self {
        Self {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}

/// Where a link goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkAddress {
    Udp { host: String, port: u16 },
    Serial { path: String, baud: u32 },
}

impl LinkAddress {
    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self::Udp {
            host: host.into(),
            port,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Udp { port, .. } => Some(*port),
            Self::Serial { .. } => None,
        }
    }

    /// Normalized location used to detect two vehicles dialing the same
    /// endpoint. An empty UDP host and `0.0.0.0` are the same listener.
    pub fn location_key(&self) -> String {
        match self {
            Self::Udp { host, port } => {
                let host = if host.is_empty() || host == "0.0.0.0" {
                    "0.0.0.0"
                } else if host.eq_ignore_ascii_case("localhost") {
                    "127.0.0.1"
                } else {
                    host.as_str()
                };
                format!("udp:{host}:{port}")
            }
            Self::Serial { path, .. } => format!("serial:{path}"),
        }
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp { host, port } => write!(f, "udp://{host}:{port}"),
            Self::Serial { path, baud } => write!(f, "serial://{path}:{baud}"),
        }
    }
}

impl FromStr for LinkAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| AddressError::new(s, "expected scheme://location"))?;
        let (location, tail) = rest
            .rsplit_once(':')
            .ok_or_else(|| AddressError::new(s, "missing ':' before port or baud rate"))?;

        match scheme.to_ascii_lowercase().as_str() {
            "udp" => {
                let port: u16 = tail
                    .parse()
                    .map_err(|_| AddressError::new(s, format!("invalid port '{tail}'")))?;
                if port == 0 {
                    return Err(AddressError::new(s, "port must be non-zero"));
                }
                if location.contains('/') {
                    return Err(AddressError::new(s, format!("invalid host '{location}'")));
                }
                Ok(Self::Udp {
                    host: location.to_string(),
                    port,
                })
            }
            "serial" => {
                if location.is_empty() {
                    return Err(AddressError::new(s, "missing serial device path"));
                }
                let baud: u32 = tail
                    .parse()
                    .map_err(|_| AddressError::new(s, format!("invalid baud rate '{tail}'")))?;
                if baud == 0 {
                    return Err(AddressError::new(s, "baud rate must be non-zero"));
                }
                Ok(Self::Serial {
                    path: location.to_string(),
                    baud,
                })
            }
            other => Err(AddressError::new(s, format!("unsupported scheme '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_udp_listen_address() {
        let addr: LinkAddress = "udp://:14540".parse().unwrap();
        assert_eq!(addr, LinkAddress::udp("", 14540));
        assert_eq!(addr.port(), Some(14540));
        assert_eq!(addr.to_string(), "udp://:14540");
    }

    #[test]
    fn test_parse_udp_with_host() {
        let addr: LinkAddress = "UDP://192.168.1.31:14561".parse().unwrap();
        assert_eq!(addr, LinkAddress::udp("192.168.1.31", 14561));
    }

    #[test]
    fn test_parse_serial() {
        let addr: LinkAddress = "serial:///dev/ttyUSB0:57600".parse().unwrap();
        assert_eq!(
            addr,
            LinkAddress::Serial {
                path: "/dev/ttyUSB0".to_string(),
                baud: 57600
            }
        );
        assert_eq!(addr.port(), None);
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "",
            "14540",
            "udp:/:14540",
            "udp://host",
            "udp://host:notaport",
            "udp://host:0",
            "udp://host:70000",
            "tcp://host:5760",
            "serial://:57600",
            "serial:///dev/ttyS0:fast",
        ] {
            let err = bad.parse::<LinkAddress>().unwrap_err();
            assert_eq!(err.address, bad, "error should carry the input");
        }
    }

    #[test]
    fn test_location_key_treats_wildcards_alike() {
        let a: LinkAddress = "udp://:14540".parse().unwrap();
        let b: LinkAddress = "udp://0.0.0.0:14540".parse().unwrap();
        let c: LinkAddress = "udp://:14541".parse().unwrap();
        assert_eq!(a.location_key(), b.location_key());
        assert_ne!(a.location_key(), c.location_key());

        let local: LinkAddress = "udp://localhost:14550".parse().unwrap();
        let loopback: LinkAddress = "udp://127.0.0.1:14550".parse().unwrap();
        assert_eq!(local.location_key(), loopback.location_key());
    }
}
