//! Process-local hypervisor implementing every repository contract.
//!
//! Mirrors the libvirt adapters' validation and state rules so callers can
//! exercise the core without a daemon.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::configdrive::{ConfigDriveBuilder, ConfigDriveFormat};
use crate::errors::{ComputeError, Result};
use crate::repository::*;
use crate::types::*;

const FIRST_VNC_PORT: i32 = 5900;

#[derive(Default)]
struct State {
    machines: BTreeMap<String, VirtualMachine>,
    volumes: BTreeMap<String, Volume>,
    pools: BTreeMap<String, VolumePool>,
    networks: Vec<Network>,
}

impl State {
    fn machine_mut(&mut self, id: &str) -> Result<&mut VirtualMachine> {
        self.machines
            .get_mut(id)
            .ok_or_else(|| ComputeError::NotFound(format!("machine {}", id)))
    }

    fn network_type(&self, name: &str) -> Option<NetworkType> {
        self.networks.iter().find(|n| n.name == name).map(|n| n.network_type)
    }

    fn attachment_of(&self, path: &str) -> Option<String> {
        self.machines
            .values()
            .find(|vm| vm.attachment_info(path).is_some())
            .map(|vm| vm.id.clone())
    }

    fn add_volume(&mut self, pool: &str, name: &str, format: VolumeFormat, size_mib: u64) -> Result<Volume> {
        let storage_pool = self
            .pools
            .get_mut(pool)
            .ok_or_else(|| ComputeError::Validation(format!("storage pool {} does not exist", pool)))?;
        if storage_pool.free < size_mib {
            return Err(ComputeError::Resource(format!(
                "storage pool {} has {} MiB free, {} requested",
                pool, storage_pool.free, size_mib
            )));
        }
        let path = format!("/{}/{}", pool, name);
        if self.volumes.contains_key(&path) {
            return Err(ComputeError::Validation(format!("volume {} already exists", path)));
        }

        storage_pool.used += size_mib;
        storage_pool.free -= size_mib;
        let volume = Volume {
            path: path.clone(),
            size: size_mib,
            pool: pool.to_string(),
            format,
            volume_type: VolumeType::File,
            attached_to: None,
            metadata: VolumeMetadata::default(),
        };
        self.volumes.insert(path, volume.clone());
        Ok(volume)
    }

    fn remove_volume(&mut self, path: &str) -> Result<Volume> {
        let volume = self
            .volumes
            .remove(path)
            .ok_or_else(|| ComputeError::NotFound(format!("volume {}", path)))?;
        if let Some(pool) = self.pools.get_mut(&volume.pool) {
            pool.used = pool.used.saturating_sub(volume.size);
            pool.free += volume.size;
        }
        Ok(volume)
    }
}

struct ConfigDriveTarget {
    builder: ConfigDriveBuilder,
    pool: String,
    suffix: String,
}

pub struct InMemoryHypervisor {
    node_id: String,
    hostname: String,
    hotplug: bool,
    metadata: HashMap<String, VolumeMetadata>,
    config_drive: ConfigDriveTarget,
    state: Mutex<State>,
}

impl InMemoryHypervisor {
    pub fn new(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            hostname: node_id.clone(),
            node_id,
            hotplug: true,
            metadata: HashMap::new(),
            config_drive: ConfigDriveTarget {
                builder: ConfigDriveBuilder::new(ConfigDriveFormat::NoCloud),
                pool: "default".to_string(),
                suffix: "_config.iso".to_string(),
            },
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_pool(self, name: &str, size_mib: u64) -> Self {
        self.lock().pools.insert(
            name.to_string(),
            VolumePool {
                name: name.to_string(),
                size: size_mib,
                used: 0,
                free: size_mib,
            },
        );
        self
    }

    pub fn with_network(self, name: &str, network_type: NetworkType) -> Self {
        self.lock().networks.push(Network {
            name: name.to_string(),
            network_type,
        });
        self
    }

    /// Pre-existing volume, e.g. a base image.
    pub fn with_volume(self, pool: &str, name: &str, format: VolumeFormat, size_mib: u64) -> Result<Self> {
        self.lock().add_volume(pool, name, format, size_mib)?;
        Ok(self)
    }

    pub fn with_volume_metadata(mut self, path: &str, metadata: VolumeMetadata) -> Self {
        self.metadata.insert(path.to_string(), metadata);
        self
    }

    /// Config drives default to nocloud images named `<id>_config.iso` in
    /// pool `default`.
    pub fn with_config_drive(mut self, format: ConfigDriveFormat, pool: &str, suffix: &str) -> Self {
        self.config_drive = ConfigDriveTarget {
            builder: ConfigDriveBuilder::new(format),
            pool: pool.to_string(),
            suffix: suffix.to_string(),
        };
        self
    }

    /// Refuse live attach/detach on running machines.
    pub fn without_hotplug(mut self) -> Self {
        self.hotplug = false;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_node(&self, node: &str) -> Result<()> {
        if node == self.node_id {
            Ok(())
        } else {
            Err(ComputeError::NotFound(format!("node {}", node)))
        }
    }

    fn check_hotplug(&self, vm: &VirtualMachine) -> Result<()> {
        if vm.is_running() && !self.hotplug {
            return Err(ComputeError::Unsupported(format!(
                "live device changes are not supported on {}",
                vm.id
            )));
        }
        Ok(())
    }

    fn snapshot_volume(&self, state: &State, volume: &Volume) -> Volume {
        let mut volume = volume.clone();
        volume.attached_to = state.attachment_of(&volume.path);
        volume.metadata = self.metadata.get(&volume.path).cloned().unwrap_or_default();
        volume
    }
}

#[async_trait]
impl VirtualMachineRepository for InMemoryHypervisor {
    async fn list(&self) -> Result<Vec<VirtualMachine>> {
        Ok(self.lock().machines.values().cloned().collect())
    }

    async fn get(&self, id: &str, node: &str) -> Result<VirtualMachine> {
        self.check_node(node)?;
        self.lock().machine_mut(id).map(|vm| vm.clone())
    }

    async fn create(&self, mut params: VirtualMachineCreateParams) -> Result<VirtualMachine> {
        self.check_node(&params.node)?;
        if params.id.is_empty() {
            return Err(ComputeError::Validation("machine id is empty".to_string()));
        }
        if params.vcpus == 0 || params.memory.bytes() == 0 {
            return Err(ComputeError::Validation("vcpus and memory must be positive".to_string()));
        }
        validate_attachments(&params.volumes, &params.interfaces)?;

        let mut state = self.lock();
        if state.machines.contains_key(&params.id) {
            return Err(ComputeError::Validation(format!("machine {} already exists", params.id)));
        }
        for iface in params.interfaces.iter_mut() {
            iface.network_type = state.network_type(&iface.network_name).ok_or_else(|| {
                ComputeError::Resource(format!("network {} does not exist", iface.network_name))
            })?;
            if iface.mac.is_empty() {
                iface.mac = generate_mac();
            }
        }
        for volume in params.volumes.iter_mut() {
            let existing = state
                .volumes
                .get(&volume.path)
                .ok_or_else(|| ComputeError::Resource(format!("volume {} does not exist", volume.path)))?;
            if volume.format == VolumeFormat::Unknown {
                volume.format = existing.format;
            }
            volume.volume_type = existing.volume_type;
        }

        if let Some(config) = &params.config {
            let target = &self.config_drive;
            if !state.pools.contains_key(&target.pool) {
                return Err(ComputeError::Resource(format!(
                    "config drive pool {} does not exist",
                    target.pool
                )));
            }
            let drive = target.builder.build(&params.id, config)?;
            let name = format!("{}{}", params.id, target.suffix);
            let size_mib = drive.size_bytes().div_ceil(Size::MIB);
            let stale = format!("/{}/{}", target.pool, name);
            if state.volumes.contains_key(&stale) {
                state.remove_volume(&stale)?;
            }
            let volume = state.add_volume(&target.pool, &name, VolumeFormat::Raw, size_mib)?;
            let used = params.volumes.iter().map(|v| v.device_name.as_str());
            let device = next_device_name(DeviceBus::Sata.device_prefix(), used)?;
            params.volumes.push(drive.attachment(&volume.path, &device));
        }

        let vm = VirtualMachine {
            id: params.id.clone(),
            node_id: self.node_id.clone(),
            vcpus: params.vcpus,
            arch: if params.arch == Arch::Unknown { Arch::X86_64 } else { params.arch },
            state: VmState::Stopped,
            memory: params.memory,
            interfaces: params.interfaces,
            volumes: params.volumes,
            config: params.config,
            cpupin: None,
            guest_agent: true,
            autostart: false,
            graphic: VirtualMachineGraphic {
                graphic_type: GraphicType::Vnc,
                listen: "127.0.0.1".to_string(),
                port: -1,
            },
        };
        state.machines.insert(vm.id.clone(), vm.clone());
        info!("Defined in-memory machine {}", vm.id);
        Ok(vm)
    }

    async fn delete(&self, id: &str, node: &str) -> Result<()> {
        self.check_node(node)?;
        self.lock()
            .machines
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ComputeError::NotFound(format!("machine {}", id)))
    }

    async fn update(&self, id: &str, node: &str, params: VirtualMachineUpdateParams) -> Result<()> {
        self.check_node(node)?;
        if params.vcpus == Some(0) || params.memory.map(|m| m.bytes()) == Some(0) {
            return Err(ComputeError::Validation("vcpus and memory must be positive".to_string()));
        }
        let mut state = self.lock();
        let vm = state.machine_mut(id)?;
        if let Some(vcpus) = params.vcpus {
            vm.vcpus = vcpus;
        }
        if let Some(memory) = params.memory {
            vm.memory = memory;
        }
        if let Some(autostart) = params.autostart {
            vm.autostart = autostart;
        }
        if let Some(guest_agent) = params.guest_agent {
            vm.guest_agent = guest_agent;
        }
        Ok(())
    }

    async fn attach_volume(
        &self,
        id: &str,
        node: &str,
        mut volume: VirtualMachineAttachedVolume,
    ) -> Result<VirtualMachineAttachedVolume> {
        self.check_node(node)?;
        let mut state = self.lock();
        let (format, volume_type) = state
            .volumes
            .get(&volume.path)
            .map(|v| (v.format, v.volume_type))
            .ok_or_else(|| ComputeError::Resource(format!("volume {} does not exist", volume.path)))?;

        let vm = state.machine_mut(id)?;
        if volume.device_name.is_empty() {
            let used = vm.volumes.iter().map(|v| v.device_name.as_str());
            volume.device_name = next_device_name(volume.device_bus.device_prefix(), used)?;
        }
        if vm.volumes.iter().any(|v| v.device_name == volume.device_name) {
            return Err(ComputeError::Validation(format!(
                "device {} is already in use on {}",
                volume.device_name, id
            )));
        }
        if vm.attachment_info(&volume.path).is_some() {
            return Err(ComputeError::Validation(format!(
                "volume {} is already attached to {}",
                volume.path, id
            )));
        }
        self.check_hotplug(vm)?;
        if volume.format == VolumeFormat::Unknown {
            volume.format = format;
        }
        volume.volume_type = volume_type;
        vm.volumes.push(volume.clone());
        debug!("Attached {} to {} as {}", volume.path, id, volume.device_name);
        Ok(volume)
    }

    async fn detach_volume(&self, id: &str, node: &str, device_name: &str) -> Result<()> {
        self.check_node(node)?;
        let mut state = self.lock();
        let vm = state.machine_mut(id)?;
        let index = vm
            .volumes
            .iter()
            .position(|v| v.device_name == device_name)
            .ok_or_else(|| ComputeError::NotFound(format!("device {} on {}", device_name, id)))?;
        self.check_hotplug(vm)?;
        vm.volumes.remove(index);
        Ok(())
    }

    async fn attach_interface(
        &self,
        id: &str,
        node: &str,
        mut iface: VirtualMachineAttachedInterface,
    ) -> Result<VirtualMachineAttachedInterface> {
        self.check_node(node)?;
        let mut state = self.lock();
        iface.network_type = state
            .network_type(&iface.network_name)
            .ok_or_else(|| ComputeError::Resource(format!("network {} does not exist", iface.network_name)))?;
        if iface.mac.is_empty() {
            iface.mac = generate_mac();
        }

        let vm = state.machine_mut(id)?;
        if vm.interfaces.iter().any(|i| i.mac.eq_ignore_ascii_case(&iface.mac)) {
            return Err(ComputeError::Validation(format!(
                "interface {} already exists on {}",
                iface.mac, id
            )));
        }
        self.check_hotplug(vm)?;
        vm.interfaces.push(iface.clone());
        Ok(iface)
    }

    async fn detach_interface(&self, id: &str, node: &str, mac: &str) -> Result<()> {
        self.check_node(node)?;
        let mut state = self.lock();
        let vm = state.machine_mut(id)?;
        let index = vm
            .interfaces
            .iter()
            .position(|i| i.mac.eq_ignore_ascii_case(mac))
            .ok_or_else(|| ComputeError::NotFound(format!("interface {} on {}", mac, id)))?;
        self.check_hotplug(vm)?;
        vm.interfaces.remove(index);
        Ok(())
    }

    async fn get_console_stream(&self, id: &str, node: &str) -> Result<Box<dyn VirtualMachineStream>> {
        let vm = VirtualMachineRepository::get(self, id, node).await?;
        if !vm.is_running() {
            return Err(ComputeError::Unsupported(format!("machine {} is not running", id)));
        }
        Ok(Box::new(LoopbackStream::default()))
    }

    async fn get_graphic_stream(&self, id: &str, node: &str) -> Result<Box<dyn VirtualMachineStream>> {
        let vm = VirtualMachineRepository::get(self, id, node).await?;
        if !vm.is_running() {
            return Err(ComputeError::Unsupported(format!("machine {} is not running", id)));
        }
        if !vm.graphic.vnc() {
            return Err(ComputeError::Unsupported(format!("machine {} has no VNC graphic", id)));
        }
        Ok(Box::new(LoopbackStream::default()))
    }

    async fn poweroff(&self, id: &str, node: &str) -> Result<()> {
        self.check_node(node)?;
        let mut state = self.lock();
        let vm = state.machine_mut(id)?;
        vm.state = VmState::Stopped;
        vm.graphic.port = -1;
        Ok(())
    }

    async fn reboot(&self, id: &str, node: &str) -> Result<()> {
        self.check_node(node)?;
        let mut state = self.lock();
        let vm = state.machine_mut(id)?;
        if !vm.is_running() {
            return Err(ComputeError::Unsupported(format!("machine {} is not running", id)));
        }
        Ok(())
    }

    async fn start(&self, id: &str, node: &str) -> Result<()> {
        self.check_node(node)?;
        let mut state = self.lock();
        let running = state.machines.values().filter(|vm| vm.is_running()).count() as i32;
        let vm = state.machine_mut(id)?;
        if !vm.is_running() {
            vm.state = VmState::Running;
            vm.graphic.port = FIRST_VNC_PORT + running;
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeRepository for InMemoryHypervisor {
    async fn get(&self, path: &str) -> Result<Volume> {
        let state = self.lock();
        let volume = state
            .volumes
            .get(path)
            .ok_or_else(|| ComputeError::NotFound(format!("volume {}", path)))?;
        Ok(self.snapshot_volume(&state, volume))
    }

    async fn create(&self, pool: &str, name: &str, format: VolumeFormat, size: u64) -> Result<Volume> {
        if name.is_empty() || size == 0 || format == VolumeFormat::Unknown {
            return Err(ComputeError::Validation(format!(
                "invalid volume request name='{}' size={} format={}",
                name, size, format
            )));
        }
        Size::try_from_mib(size)?;
        let mut state = self.lock();
        let volume = state.add_volume(pool, name, format, size)?;
        Ok(self.snapshot_volume(&state, &volume))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if self.metadata.get(path).map(|m| m.protected).unwrap_or(false) {
            return Err(ComputeError::Protected(path.to_string()));
        }
        self.lock().remove_volume(path).map(|_| ())
    }

    async fn list(&self) -> Result<Vec<Volume>> {
        let state = self.lock();
        Ok(state
            .volumes
            .values()
            .map(|v| self.snapshot_volume(&state, v))
            .collect())
    }

    async fn pools(&self) -> Result<Vec<VolumePool>> {
        Ok(self.lock().pools.values().cloned().collect())
    }
}

#[async_trait]
impl VolumePoolRepository for InMemoryHypervisor {
    async fn list(&self) -> Result<Vec<VolumePool>> {
        Ok(self.lock().pools.values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<VolumePool> {
        self.lock()
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| ComputeError::NotFound(format!("storage pool {}", name)))
    }
}

#[async_trait]
impl NetworkRepository for InMemoryHypervisor {
    async fn list(&self) -> Result<Vec<Network>> {
        Ok(self.lock().networks.clone())
    }

    async fn get(&self, name: &str) -> Result<Network> {
        let state = self.lock();
        state
            .network_type(name)
            .map(|network_type| Network {
                name: name.to_string(),
                network_type,
            })
            .ok_or_else(|| ComputeError::NotFound(format!("network {}", name)))
    }
}

#[async_trait]
impl HostInfoRepository for InMemoryHypervisor {
    async fn get(&self) -> Result<HostInfo> {
        let state = self.lock();
        let active = state.machines.values().filter(|vm| vm.is_running()).count() as u32;
        let used_mib: u64 = state
            .machines
            .values()
            .filter(|vm| vm.is_running())
            .map(|vm| vm.memory_mib())
            .sum();
        let total_mib = 64 * 1024;
        Ok(HostInfo {
            hostname: self.hostname.clone(),
            hypervisor: "memory".to_string(),
            hypervisor_version: env!("CARGO_PKG_VERSION").to_string(),
            cpu_model: "virtual".to_string(),
            cpus: 16,
            memory_total_mib: total_mib,
            memory_free_mib: total_mib.saturating_sub(used_mib),
            active_vms: active,
            inactive_vms: state.machines.len() as u32 - active,
        })
    }
}

/// Echoes written bytes back to the reader.
#[derive(Default)]
pub struct LoopbackStream {
    buffer: VecDeque<u8>,
    closed: bool,
}

#[async_trait]
impl VirtualMachineStream for LoopbackStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(ComputeError::Resource("stream is closed".to_string()));
        }
        let n = buf.len().min(self.buffer.len());
        for (slot, byte) in buf.iter_mut().zip(self.buffer.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(ComputeError::Resource("stream is closed".to_string()));
        }
        self.buffer.extend(data);
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_echoes_until_closed() {
        let mut stream = LoopbackStream::default();
        assert_eq!(stream.write(b"hello").await.unwrap(), 5);
        let mut buf = [0u8; 3];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");

        stream.close().await.unwrap();
        assert!(stream.write(b"x").await.is_err());
    }

    #[tokio::test]
    async fn volume_accounting_follows_create_and_delete() {
        let hv = InMemoryHypervisor::new("node1").with_pool("default", 1000);
        let volume = VolumeRepository::create(&hv, "default", "data.qcow2", VolumeFormat::Qcow2, 400)
            .await
            .unwrap();
        assert_eq!(volume.path, "/default/data.qcow2");

        let pool = VolumePoolRepository::get(&hv, "default").await.unwrap();
        assert_eq!((pool.used, pool.free), (400, 600));
        assert_eq!(pool.usage_percent(), 40);

        VolumeRepository::delete(&hv, &volume.path).await.unwrap();
        let pool = VolumePoolRepository::get(&hv, "default").await.unwrap();
        assert_eq!(pool.free, 1000);
    }

    #[tokio::test]
    async fn oversized_volume_is_a_resource_error() {
        let hv = InMemoryHypervisor::new("node1").with_pool("small", 10);
        let err = VolumeRepository::create(&hv, "small", "big.img", VolumeFormat::Raw, 11)
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::Resource(_)));
    }

    #[tokio::test]
    async fn unaddressable_volume_size_is_rejected() {
        let hv = InMemoryHypervisor::new("node1").with_pool("default", u64::MAX);
        let err = VolumeRepository::create(&hv, "default", "huge.img", VolumeFormat::Raw, u64::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::Validation(_)));
        assert!(VolumeRepository::list(&hv).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn host_info_counts_machines() {
        let hv = InMemoryHypervisor::new("node1").with_network("default", NetworkType::Libvirt);
        let params = VirtualMachineCreateParams {
            id: "a".into(),
            node: "node1".into(),
            arch: Arch::X86_64,
            vcpus: 1,
            memory: Size::from_mib(512),
            volumes: Vec::new(),
            interfaces: Vec::new(),
            config: None,
        };
        VirtualMachineRepository::create(&hv, params.clone()).await.unwrap();
        VirtualMachineRepository::create(&hv, VirtualMachineCreateParams { id: "b".into(), ..params })
            .await
            .unwrap();
        VirtualMachineRepository::start(&hv, "a", "node1").await.unwrap();

        let host = HostInfoRepository::get(&hv).await.unwrap();
        assert_eq!((host.active_vms, host.inactive_vms), (1, 1));
        assert_eq!(host.memory_free_mib, 64 * 1024 - 512);
    }
}
