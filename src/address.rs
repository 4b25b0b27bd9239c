use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use crate::error::{PostboxError, Result};

/// Transport kind named by the address scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
}

/// A parsed `proto://ip:port` address.
///
/// The host is either `*` (bind-to-any, parsed as `0.0.0.0`) or a dotted-quad
/// IPv4 literal. `Display` formats back to the same grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub transport: Transport,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Address {
    pub fn parse(address: &str) -> Result<Address> {
        let (transport, rest) = if let Some(rest) = address.strip_prefix("udp://") {
            (Transport::Udp, rest)
        } else if let Some(rest) = address.strip_prefix("tcp://") {
            (Transport::Tcp, rest)
        } else {
            return Err(PostboxError::Address(format!(
                "unrecognized scheme in address '{}'",
                address
            )));
        };

        let colon = match rest.find(':') {
            Some(i) => i,
            None => {
                return Err(PostboxError::Address(format!(
                    "can't parse address '{}'; missing colon after ip",
                    address
                )))
            }
        };
        let (host, port_str) = (&rest[..colon], &rest[colon + 1..]);

        if host.is_empty() || host.len() > 15 {
            return Err(PostboxError::Address(format!(
                "ip length {} out of range 1-15 in address '{}'",
                host.len(),
                address
            )));
        }

        let ip = if host == "*" {
            Ipv4Addr::UNSPECIFIED
        } else {
            match host.parse::<Ipv4Addr>() {
                Ok(ip) => ip,
                Err(_) => {
                    return Err(PostboxError::Address(format!(
                        "couldn't parse ip string '{}'",
                        host
                    )))
                }
            }
        };

        if port_str.is_empty() {
            return Err(PostboxError::Address(format!(
                "empty port string in address '{}'",
                address
            )));
        }
        if !port_str.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PostboxError::Address(format!(
                "invalid port string in address '{}'",
                address
            )));
        }
        let port = match port_str.parse::<u16>() {
            Ok(p) => p,
            Err(_) => {
                return Err(PostboxError::Address(format!(
                    "port out of range in address '{}'",
                    address
                )))
            }
        };

        Ok(Address {
            transport,
            ip,
            port,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.transport {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        };
        if self.ip == Ipv4Addr::UNSPECIFIED {
            write!(f, "{}://*:{}", scheme, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.ip, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_udp_address() {
        let addr = Address::parse("udp://10.0.0.1:4040").unwrap();
        assert_eq!(addr.transport, Transport::Udp);
        assert_eq!(addr.ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(addr.port, 4040);
    }

    #[test]
    fn test_parse_tcp_address() {
        let addr = Address::parse("tcp://127.0.0.1:80").unwrap();
        assert_eq!(addr.transport, Transport::Tcp);
    }

    #[test]
    fn test_wildcard_host_is_bind_to_any() {
        let addr = Address::parse("udp://*:9999").unwrap();
        assert_eq!(addr.ip, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_port_boundaries() {
        assert!(Address::parse("udp://1.2.3.4:0").is_ok());
        assert!(Address::parse("udp://1.2.3.4:65535").is_ok());
        assert!(Address::parse("udp://1.2.3.4:65536").is_err());
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        assert!(Address::parse("http://x:1").is_err());
    }

    #[test]
    fn test_missing_colon_is_rejected() {
        assert!(Address::parse("udp://1.2.3.4").is_err());
    }

    #[test]
    fn test_bad_host_is_rejected() {
        assert!(Address::parse("udp://1.2.3.4.5:1").is_err());
        assert!(Address::parse("udp://:1").is_err());
        assert!(Address::parse("udp://255.255.255.255.255:1").is_err());
    }

    #[test]
    fn test_bad_port_is_rejected() {
        assert!(Address::parse("udp://1.2.3.4:").is_err());
        assert!(Address::parse("udp://1.2.3.4:12x").is_err());
        assert!(Address::parse("udp://1.2.3.4:-1").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["udp://10.0.0.1:4040", "udp://*:9999", "tcp://127.0.0.1:80"] {
            assert_eq!(Address::parse(s).unwrap().to_string(), s);
        }
    }
}
