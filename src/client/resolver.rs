//! Name resolution collaborator.

use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, Result};
use crate::BoxFuture;

/// Resolves a host name to the ordered list of addresses a client should
/// try. An empty answer is reported as [`Error::NoAddressFound`].
pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> BoxFuture<'static, Result<Vec<SocketAddr>>>;
}

/// Resolver backed by the system's `getaddrinfo` through tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> BoxFuture<'static, Result<Vec<SocketAddr>>> {
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        Box::pin(async move {
            if let Ok(ip) = host.parse::<IpAddr>() {
                return Ok(vec![SocketAddr::new(ip, port)]);
            }

            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
                .await
                .map_err(|e| Error::NoAddressFound(format!("{host}: {e}")))?
                .collect();

            if addrs.is_empty() {
                return Err(Error::NoAddressFound(host));
            }
            tracing::trace!(host = %host, candidates = addrs.len(), "Resolved host");
            Ok(addrs)
        })
    }
}

/// Fixed answers, for tests and for pinning a host to known addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    addrs: Vec<SocketAddr>,
}

impl StaticResolver {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs }
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, host: &str, _port: u16) -> BoxFuture<'static, Result<Vec<SocketAddr>>> {
        let addrs = self.addrs.clone();
        let host = host.to_string();
        Box::pin(async move {
            if addrs.is_empty() {
                Err(Error::NoAddressFound(host))
            } else {
                Ok(addrs)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_literals_skip_lookup() {
        let addrs = SystemResolver.resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse().unwrap()]);

        let addrs = SystemResolver.resolve("[::1]", 443).await.unwrap();
        assert_eq!(addrs, vec!["[::1]:443".parse().unwrap()]);
    }

    #[tokio::test]
    async fn empty_static_answer_is_no_address() {
        let err = StaticResolver::default().resolve("example.test", 80).await.unwrap_err();
        assert!(matches!(err, Error::NoAddressFound(h) if h == "example.test"));
    }
}
