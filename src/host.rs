use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::{ComputeError, Result};
use crate::pool::LibvirtPool;
use crate::repository::HostInfoRepository;
use crate::types::HostInfo;

pub struct LibvirtHostInfoRepository {
    pool: Arc<LibvirtPool>,
}

impl LibvirtHostInfoRepository {
    pub fn new(pool: Arc<LibvirtPool>) -> Self {
        Self { pool }
    }
}

/// Libvirt packs versions as `major * 1_000_000 + minor * 1_000 + release`.
pub fn format_version(version: u32) -> String {
    format!("{}.{}.{}", version / 1_000_000, (version / 1_000) % 1_000, version % 1_000)
}

#[async_trait]
impl HostInfoRepository for LibvirtHostInfoRepository {
    async fn get(&self) -> Result<HostInfo> {
        debug!("Getting host information");

        self.pool
            .with_connection(|conn| {
                let node_info = conn
                    .get_node_info()
                    .map_err(|e| ComputeError::from_libvirt("node info", e))?;
                let hostname = conn
                    .get_hostname()
                    .map_err(|e| ComputeError::from_libvirt("hostname", e))?;
                let hypervisor = conn
                    .get_type()
                    .map_err(|e| ComputeError::from_libvirt("hypervisor type", e))?;
                let hypervisor_version = conn
                    .get_lib_version()
                    .map_err(|e| ComputeError::from_libvirt("hypervisor version", e))?;
                let active_vms = conn
                    .num_of_domains()
                    .map_err(|e| ComputeError::from_libvirt("active domains", e))?;
                let inactive_vms = conn
                    .num_of_defined_domains()
                    .map_err(|e| ComputeError::from_libvirt("inactive domains", e))?;
                let memory_free_mib = match conn.get_free_memory() {
                    Ok(bytes) => bytes / (1024 * 1024),
                    Err(e) => {
                        warn!("Failed to read free host memory: {}", e);
                        0
                    }
                };

                Ok(HostInfo {
                    hostname,
                    hypervisor,
                    hypervisor_version: format_version(hypervisor_version),
                    cpu_model: node_info.model,
                    cpus: node_info.cpus,
                    memory_total_mib: node_info.memory / 1024,
                    memory_free_mib,
                    active_vms,
                    inactive_vms,
                })
            })
            .await
    }
}
