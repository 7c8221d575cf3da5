use std::net::SocketAddr;
use std::str::FromStr;

use crate::transport::TransportError;

const SCHEME: &str = "tcp://";

/// A `tcp://host:port` address.
///
/// `*` as host means all interfaces, `*` or `0` as port means an ephemeral
/// port picked at bind time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form accepted by `TcpListener::bind` / `TcpStream::connect`
    pub fn socket_addr_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidEndpoint(s.to_string());
        let rest = s.strip_prefix(SCHEME).unwrap_or(s);
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = match host {
            "" => return Err(invalid()),
            "*" => "0.0.0.0",
            other => other,
        };
        let port = match port {
            "*" => 0,
            other => other.parse::<u16>().map_err(|_| invalid())?,
        };
        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", SCHEME, self.socket_addr_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_scheme() {
        let ep: Endpoint = "tcp://broker.example.com:5555".parse().unwrap();
        assert_eq!(ep.host(), "broker.example.com");
        assert_eq!(ep.port(), 5555);
        assert_eq!(ep.to_string(), "tcp://broker.example.com:5555");
    }

    #[test]
    fn wildcard_host_and_port() {
        let ep: Endpoint = "tcp://*:*".parse().unwrap();
        assert_eq!(ep.host(), "0.0.0.0");
        assert_eq!(ep.port(), 0);
    }

    #[test]
    fn bare_host_port_and_ipv6() {
        let ep: Endpoint = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(ep.socket_addr_string(), "127.0.0.1:9000");

        let v6: Endpoint = "tcp://[::1]:9000".parse().unwrap();
        assert_eq!(v6.host(), "::1");
        assert_eq!(v6.socket_addr_string(), "[::1]:9000");
    }

    #[test]
    fn rejects_garbage() {
        assert!("tcp://nohost".parse::<Endpoint>().is_err());
        assert!("tcp://:80".parse::<Endpoint>().is_err());
        assert!("tcp://host:99999".parse::<Endpoint>().is_err());
    }

    #[test]
    fn from_socket_addr_uses_actual_port() {
        let addr: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let ep = Endpoint::from(addr);
        assert_eq!(ep, Endpoint::new("127.0.0.1", 4242));
    }
}
