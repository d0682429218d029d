//! Hostname resolution seam.
//!
//! The surrounding client framework owns the real resolver (historically
//! a forked-process lookup); the engine only needs "hostname + port in,
//! candidate addresses out". Callers plug any implementation in;
//! [`SystemResolver`] is the default.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::TernError;

#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve a hostname to candidate socket addresses. The engine
    /// tries them in order until one connects.
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, TernError>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, TernError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| TernError::Resolve(e.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(TernError::Resolve(format!("no addresses for {host}")));
        }
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_literal_addresses() {
        let addrs = SystemResolver.resolve("127.0.0.1", 4000).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:4000".parse().unwrap()]);
    }
}
