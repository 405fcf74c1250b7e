//! Replica addresses.

use crate::error::ClientError;
use std::fmt;
use std::str::FromStr;
use url::{Host, Url};

pub const RNTBD_SCHEME: &str = "rntbd";

/// A physical replica address, `rntbd://host:port/replica/path`.
///
/// Channels are pooled per authority (scheme, host and port); the path is
/// sent with each request as the replica path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    url: Url,
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn parse(input: &str) -> Result<Self, ClientError> {
        let url = Url::parse(input).map_err(|e| ClientError::InvalidAddress(format!("{}: {}", input, e)))?;
        if url.scheme() != RNTBD_SCHEME {
            return Err(ClientError::InvalidAddress(format!(
                "{}: scheme must be '{}'",
                input, RNTBD_SCHEME
            )));
        }
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => {
                return Err(ClientError::InvalidAddress(format!(
                    "{}: missing host",
                    input
                )))
            }
        };
        let port = url
            .port()
            .ok_or_else(|| ClientError::InvalidAddress(format!("{}: missing port", input)))?;

        Ok(Self { url, host, port })
    }

    /// Host without brackets, suitable for DNS resolution.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Pooling key: `rntbd://host:port`.
    pub fn authority(&self) -> String {
        format!("{}://{}", RNTBD_SCHEME, self.host_and_port())
    }

    pub fn host_and_port(&self) -> String {
        match self.url.host() {
            Some(Host::Ipv6(ip)) => format!("[{}]:{}", ip, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// Path component sent as the replica path token.
    pub fn replica_path(&self) -> &str {
        self.url.path()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl FromStr for ServerAddress {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_replica_address() {
        let address: ServerAddress = "rntbd://replica-3.example.net:14003/apps/a1/services/s1/partitions/p1/replicas/131p/"
            .parse()
            .unwrap();
        assert_eq!(address.host(), "replica-3.example.net");
        assert_eq!(address.port(), 14003);
        assert_eq!(address.authority(), "rntbd://replica-3.example.net:14003");
        assert_eq!(
            address.replica_path(),
            "/apps/a1/services/s1/partitions/p1/replicas/131p/"
        );
    }

    #[test]
    fn test_authority_shared_across_paths() {
        let a = ServerAddress::parse("rntbd://10.0.0.1:10250/replicas/1p/").unwrap();
        let b = ServerAddress::parse("rntbd://10.0.0.1:10250/replicas/2s/").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.authority(), b.authority());
    }

    #[test]
    fn test_ipv6_host() {
        let address = ServerAddress::parse("rntbd://[::1]:9000/").unwrap();
        assert_eq!(address.host(), "::1");
        assert_eq!(address.host_and_port(), "[::1]:9000");
        assert_eq!(address.authority(), "rntbd://[::1]:9000");
    }

    #[test]
    fn test_invalid_addresses() {
        for input in [
            "https://host:443/",
            "rntbd://host/",
            "rntbd:///path",
            "not a url",
        ] {
            let err = ServerAddress::parse(input).unwrap_err();
            assert!(err.is_local_validation(), "{input}");
        }
    }
}
