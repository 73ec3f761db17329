use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use virt::{connect::Connect, network::Network as LibvirtNetwork};

use crate::errors::{ComputeError, Result};
use crate::pool::LibvirtPool;
use crate::repository::NetworkRepository;
use crate::types::{Network, NetworkType};

/// Libvirt networks plus host bridges named in configuration.
pub struct LibvirtNetworkRepository {
    pool: Arc<LibvirtPool>,
    bridges: Arc<Vec<String>>,
}

impl LibvirtNetworkRepository {
    pub fn new(pool: Arc<LibvirtPool>, bridges: Vec<String>) -> Self {
        Self {
            pool,
            bridges: Arc::new(bridges),
        }
    }
}

/// Resolves an interface network name; configured bridges win over libvirt
/// networks of the same name.
pub(crate) fn resolve_network(conn: &Connect, bridges: &[String], name: &str) -> Option<NetworkType> {
    if bridges.iter().any(|b| b == name) {
        return Some(NetworkType::Bridge);
    }
    match LibvirtNetwork::lookup_by_name(conn, name) {
        Ok(_) => Some(NetworkType::Libvirt),
        Err(e) => {
            debug!("Network {} not found: {}", name, e);
            None
        }
    }
}

#[async_trait]
impl NetworkRepository for LibvirtNetworkRepository {
    async fn list(&self) -> Result<Vec<Network>> {
        let bridges = self.bridges.clone();
        self.pool
            .with_connection(move |conn| {
                let networks = conn
                    .list_all_networks(0)
                    .map_err(|e| ComputeError::from_libvirt("list networks", e))?;

                let mut result = Vec::with_capacity(networks.len() + bridges.len());
                for network in networks {
                    match network.get_name() {
                        Ok(name) => result.push(Network {
                            name,
                            network_type: NetworkType::Libvirt,
                        }),
                        Err(e) => warn!("Failed to read network name: {}", e),
                    }
                }
                result.extend(bridges.iter().map(|name| Network {
                    name: name.clone(),
                    network_type: NetworkType::Bridge,
                }));
                Ok(result)
            })
            .await
    }

    async fn get(&self, name: &str) -> Result<Network> {
        let bridges = self.bridges.clone();
        let name = name.to_string();
        self.pool
            .with_connection(move |conn| match resolve_network(conn, &bridges, &name) {
                Some(network_type) => Ok(Network { name, network_type }),
                None => Err(ComputeError::NotFound(format!("network {}", name))),
            })
            .await
    }
}
