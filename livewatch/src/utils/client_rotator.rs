//! Round-robin over HTTP clients bound to different source addresses.

use std::net::IpAddr;

use parking_lot::Mutex;

use super::http_client::{HttpClientSettings, build_client};
use crate::{Error, Result};

/// Spreads upstream requests over a fixed list of clients.
///
/// The list never changes after construction; only the cursor is shared.
#[derive(Debug)]
pub struct ClientRotator {
    clients: Vec<reqwest::Client>,
    cursor: Mutex<usize>,
}

impl ClientRotator {
    pub fn new(clients: Vec<reqwest::Client>) -> Result<Self> {
        if clients.is_empty() {
            return Err(Error::config("client rotator needs at least one client"));
        }
        Ok(Self {
            clients,
            cursor: Mutex::new(0),
        })
    }

    /// One client per source address, or a single unbound client when no
    /// address is configured.
    pub fn from_addresses(settings: &HttpClientSettings, addresses: &[IpAddr]) -> Result<Self> {
        let clients = if addresses.is_empty() {
            vec![build_client(settings, None)?]
        } else {
            addresses
                .iter()
                .map(|addr| build_client(settings, Some(*addr)))
                .collect::<Result<Vec<_>>>()?
        };
        tracing::debug!(clients = clients.len(), "Client rotator ready");
        Self::new(clients)
    }

    /// The next client in round-robin order.
    pub fn next(&self) -> reqwest::Client {
        self.clients[self.next_index()].clone()
    }

    fn next_index(&self) -> usize {
        let mut cursor = self.cursor.lock();
        let index = *cursor;
        *cursor = (index + 1) % self.clients.len();
        index
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_is_rejected() {
        assert!(matches!(
            ClientRotator::new(Vec::new()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_round_robin_wraps() {
        crate::utils::http_client::install_rustls_provider();
        let rotator = ClientRotator::new(vec![
            reqwest::Client::new(),
            reqwest::Client::new(),
            reqwest::Client::new(),
        ])
        .unwrap();

        let order: Vec<usize> = (0..7).map(|_| rotator.next_index()).collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_from_addresses_builds_one_client_per_address() {
        let settings = HttpClientSettings::default();
        let unbound = ClientRotator::from_addresses(&settings, &[]).unwrap();
        assert_eq!(unbound.len(), 1);

        let addrs: Vec<IpAddr> = vec!["127.0.0.1".parse().unwrap(), "::1".parse().unwrap()];
        let bound = ClientRotator::from_addresses(&settings, &addrs).unwrap();
        assert_eq!(bound.len(), 2);
    }
}
