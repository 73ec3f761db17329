use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use virt::{connect::Connect, storage_pool::StoragePool, storage_vol::StorageVol, sys};

use crate::errors::{ComputeError, Result};
use crate::pool::LibvirtPool;
use crate::repository::{VolumePoolRepository, VolumeRepository};
use crate::types::*;
use crate::xml_parser::{escape, XmlParser};

#[derive(Clone)]
pub struct LibvirtVolumeRepository {
    pool: Arc<LibvirtPool>,
    metadata: Arc<HashMap<String, VolumeMetadata>>,
}

impl LibvirtVolumeRepository {
    /// `metadata` is keyed by volume path and merged into every read.
    pub fn new(pool: Arc<LibvirtPool>, metadata: HashMap<String, VolumeMetadata>) -> Self {
        Self {
            pool,
            metadata: Arc::new(metadata),
        }
    }

    fn metadata_for(&self, path: &str) -> VolumeMetadata {
        self.metadata.get(path).cloned().unwrap_or_default()
    }

    fn volume_snapshot(&self, vol: &StorageVol, attachments: &HashMap<String, String>) -> Result<Volume> {
        let path = vol
            .get_path()
            .map_err(|e| ComputeError::from_libvirt("volume path", e))?;
        let info = vol
            .get_info()
            .map_err(|e| ComputeError::from_libvirt(&path, e))?;
        let pool_name = StoragePool::lookup_by_volume(vol)
            .and_then(|p| p.get_name())
            .map_err(|e| ComputeError::from_libvirt(&path, e))?;
        let format = match vol.get_xml_desc(0) {
            Ok(xml) => XmlParser::parse_volume(&xml).0,
            Err(e) => {
                warn!("Failed to read description of volume {}: {}", path, e);
                VolumeFormat::Unknown
            }
        };

        Ok(Volume {
            size: Size::from_bytes(info.capacity).mib(),
            volume_type: volume_type_of(info.kind),
            pool: pool_name,
            format,
            attached_to: attachments.get(&path).cloned(),
            metadata: self.metadata_for(&path),
            path,
        })
    }
}

/// Maps every disk source path to the domain using it.
pub fn attachment_map(conn: &Connect) -> Result<HashMap<String, String>> {
    let flags = sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
    let domains = conn
        .list_all_domains(flags)
        .map_err(|e| ComputeError::from_libvirt("list domains", e))?;

    let mut attachments = HashMap::new();
    for domain in domains {
        let xml = match domain.get_xml_desc(0) {
            Ok(xml) => xml,
            Err(e) => {
                warn!("Skipping domain while mapping attachments: {}", e);
                continue;
            }
        };
        let info = XmlParser::parse_domain(&xml);
        for volume in info.volumes {
            attachments.insert(volume.path, info.name.clone());
        }
    }
    Ok(attachments)
}

pub(crate) fn pool_snapshot(pool: &StoragePool) -> Result<VolumePool> {
    let name = pool
        .get_name()
        .map_err(|e| ComputeError::from_libvirt("storage pool name", e))?;
    let info = pool
        .get_info()
        .map_err(|e| ComputeError::from_libvirt(&name, e))?;
    Ok(VolumePool {
        name,
        size: Size::from_bytes(info.capacity).mib(),
        used: Size::from_bytes(info.allocation).mib(),
        free: Size::from_bytes(info.available).mib(),
    })
}

fn list_pools(conn: &Connect) -> Result<Vec<VolumePool>> {
    let pools = conn
        .list_all_storage_pools(0)
        .map_err(|e| ComputeError::from_libvirt("list storage pools", e))?;
    let mut result = Vec::with_capacity(pools.len());
    for pool in pools {
        match pool_snapshot(&pool) {
            Ok(snapshot) => result.push(snapshot),
            Err(e) => warn!("Failed to read storage pool: {}", e),
        }
    }
    Ok(result)
}

/// Maps `virStorageVolType`; only block devices are told apart from files.
pub(crate) fn volume_type_of(kind: u32) -> VolumeType {
    if kind == sys::VIR_STORAGE_VOL_BLOCK {
        VolumeType::Block
    } else {
        VolumeType::File
    }
}

/// A pool named by the caller that does not exist is bad input; any other
/// lookup failure keeps its libvirt classification.
fn missing_pool_as_validation(pool: &str, err: ComputeError) -> ComputeError {
    match err {
        ComputeError::NotFound(_) => ComputeError::Validation(format!("storage pool {} does not exist", pool)),
        other => other,
    }
}

pub(crate) fn volume_xml(name: &str, format: VolumeFormat, size: Size) -> String {
    format!(
        "<volume>\n  <name>{}</name>\n  <capacity unit='bytes'>{}</capacity>\n  <target>\n    <format type='{}'/>\n  </target>\n</volume>",
        escape(name),
        size.bytes(),
        format.as_str()
    )
}

#[async_trait]
impl VolumeRepository for LibvirtVolumeRepository {
    #[instrument(skip(self))]
    async fn get(&self, path: &str) -> Result<Volume> {
        let this = self.clone();
        let path = path.to_string();
        self.pool
            .with_connection(move |conn| {
                let vol = StorageVol::lookup_by_path(conn, &path)
                    .map_err(|e| ComputeError::from_libvirt(&path, e))?;
                let attachments = attachment_map(conn)?;
                this.volume_snapshot(&vol, &attachments)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn create(&self, pool: &str, name: &str, format: VolumeFormat, size: u64) -> Result<Volume> {
        if name.is_empty() {
            return Err(ComputeError::Validation("volume name is empty".to_string()));
        }
        if size == 0 {
            return Err(ComputeError::Validation(format!("volume {} has zero size", name)));
        }
        if format == VolumeFormat::Unknown {
            return Err(ComputeError::Validation(format!("volume {} has unknown format", name)));
        }
        let capacity = Size::try_from_mib(size)?;

        info!("Creating volume {} ({} MiB, {}) in pool {}", name, size, format, pool);
        let this = self.clone();
        let (pool, name) = (pool.to_string(), name.to_string());
        self.pool
            .with_connection(move |conn| {
                let storage_pool = StoragePool::lookup_by_name(conn, &pool)
                    .map_err(|e| missing_pool_as_validation(&pool, ComputeError::from_libvirt(&pool, e)))?;
                let xml = volume_xml(&name, format, capacity);
                let vol = StorageVol::create_xml(&storage_pool, &xml, 0)
                    .map_err(|e| ComputeError::from_libvirt(format!("{}/{}", pool, name), e))?;
                this.volume_snapshot(&vol, &HashMap::new())
            })
            .await
    }

    #[instrument(skip(self))]
    async fn delete(&self, path: &str) -> Result<()> {
        if self.metadata_for(path).protected {
            warn!("Refusing to delete protected volume {}", path);
            return Err(ComputeError::Protected(path.to_string()));
        }
        let target = path.to_string();
        self.pool
            .with_connection(move |conn| {
                let vol = StorageVol::lookup_by_path(conn, &target)
                    .map_err(|e| ComputeError::from_libvirt(&target, e))?;
                vol.delete(0).map_err(|e| ComputeError::from_libvirt(&target, e))
            })
            .await?;
        info!("Deleted volume {}", path);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<Volume>> {
        let this = self.clone();
        self.pool
            .with_connection(move |conn| {
                let attachments = attachment_map(conn)?;
                let pools = conn
                    .list_all_storage_pools(0)
                    .map_err(|e| ComputeError::from_libvirt("list storage pools", e))?;

                let mut volumes = Vec::new();
                for pool in pools {
                    let vols = match pool.list_all_volumes(0) {
                        Ok(vols) => vols,
                        Err(e) => {
                            warn!("Failed to list volumes of a storage pool: {}", e);
                            continue;
                        }
                    };
                    for vol in vols {
                        match this.volume_snapshot(&vol, &attachments) {
                            Ok(volume) => volumes.push(volume),
                            Err(e) => warn!("Skipping volume: {}", e),
                        }
                    }
                }
                debug!("Listed {} volumes", volumes.len());
                Ok(volumes)
            })
            .await
    }

    async fn pools(&self) -> Result<Vec<VolumePool>> {
        self.pool.with_connection(list_pools).await
    }
}

pub struct LibvirtVolumePoolRepository {
    pool: Arc<LibvirtPool>,
}

impl LibvirtVolumePoolRepository {
    pub fn new(pool: Arc<LibvirtPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VolumePoolRepository for LibvirtVolumePoolRepository {
    async fn list(&self) -> Result<Vec<VolumePool>> {
        self.pool.with_connection(list_pools).await
    }

    #[instrument(skip(self))]
    async fn get(&self, name: &str) -> Result<VolumePool> {
        let name = name.to_string();
        self.pool
            .with_connection(move |conn| {
                let pool = StoragePool::lookup_by_name(conn, &name)
                    .map_err(|e| ComputeError::from_libvirt(&name, e))?;
                pool_snapshot(&pool)
            })
            .await
    }
}
