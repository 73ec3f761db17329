use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};
use virt::{connect::Connect, domain::Domain, storage_pool::StoragePool, storage_vol::StorageVol, stream::Stream, sys};

use crate::configdrive::{ConfigDrive, ConfigDriveBuilder, ConfigDriveFormat};
use crate::console::{ConsoleStream, GraphicStream};
use crate::domain_xml::{disk_xml, interface_xml, DomainDefinition, GUEST_AGENT_CHANNEL};
use crate::errors::{ComputeError, Result};
use crate::network::resolve_network;
use crate::pool::LibvirtPool;
use crate::repository::{VirtualMachineRepository, VirtualMachineStream};
use crate::storage::{volume_type_of, volume_xml};
use crate::types::*;
use crate::xml_parser::{DomainXmlInfo, XmlParser};

#[derive(Debug, Clone)]
pub struct VirtualMachineSettings {
    pub node_id: String,
    pub config_drive_pool: String,
    pub config_drive_suffix: String,
    pub config_drive_format: ConfigDriveFormat,
    pub bridges: Vec<String>,
}

#[derive(Clone)]
pub struct LibvirtVirtualMachineRepository {
    pool: Arc<LibvirtPool>,
    settings: Arc<VirtualMachineSettings>,
    config_drive: ConfigDriveBuilder,
}

impl LibvirtVirtualMachineRepository {
    pub fn new(pool: Arc<LibvirtPool>, settings: VirtualMachineSettings) -> Self {
        info!(
            node = %settings.node_id,
            config_drive_pool = %settings.config_drive_pool,
            config_drive_format = settings.config_drive_format.as_str(),
            "Initializing libvirt virtual machine repository"
        );
        let config_drive = ConfigDriveBuilder::new(settings.config_drive_format);
        Self {
            pool,
            settings: Arc::new(settings),
            config_drive,
        }
    }

    fn check_node(&self, node: &str) -> Result<()> {
        if node == self.settings.node_id {
            Ok(())
        } else {
            Err(ComputeError::NotFound(format!("node {}", node)))
        }
    }

    fn lookup(conn: &Connect, id: &str) -> Result<Domain> {
        Domain::lookup_by_name(conn, id).map_err(|e| ComputeError::from_libvirt(id, e))
    }

    fn domain_info(domain: &Domain, id: &str) -> Result<DomainXmlInfo> {
        let xml = domain
            .get_xml_desc(0)
            .map_err(|e| ComputeError::from_libvirt(id, e))?;
        Ok(XmlParser::parse_domain(&xml))
    }

    fn is_active(domain: &Domain, id: &str) -> Result<bool> {
        domain.is_active().map_err(|e| ComputeError::from_libvirt(id, e))
    }

    fn domain_state(domain: &Domain) -> VmState {
        match domain.get_state() {
            Ok((state, _reason)) => match state {
                sys::VIR_DOMAIN_RUNNING
                | sys::VIR_DOMAIN_BLOCKED
                | sys::VIR_DOMAIN_PAUSED
                | sys::VIR_DOMAIN_SHUTDOWN
                | sys::VIR_DOMAIN_PMSUSPENDED => VmState::Running,
                sys::VIR_DOMAIN_SHUTOFF | sys::VIR_DOMAIN_CRASHED => VmState::Stopped,
                _ => VmState::Unknown,
            },
            Err(e) => {
                warn!("Failed to read domain state: {}", e);
                VmState::Unknown
            }
        }
    }

    fn machine_snapshot(&self, domain: &Domain) -> Result<VirtualMachine> {
        let name = domain
            .get_name()
            .map_err(|e| ComputeError::from_libvirt("domain name", e))?;
        let info = Self::domain_info(domain, &name)?;
        let state = Self::domain_state(domain);
        let autostart = domain.get_autostart().unwrap_or_else(|e| {
            debug!("Failed to read autostart for {}: {}", name, e);
            false
        });

        let mut vm = info.into_machine(&self.settings.node_id, state, autostart);
        if vm.is_running() {
            Self::fill_addresses(domain, &mut vm);
        }
        Ok(vm)
    }

    /// Best effort: guest agent when configured, DHCP leases otherwise.
    fn fill_addresses(domain: &Domain, vm: &mut VirtualMachine) {
        let source = if vm.guest_agent {
            sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_AGENT
        } else {
            sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE
        };
        let addresses = match domain.interface_addresses(source, 0) {
            Ok(addresses) => addresses,
            Err(e) => {
                debug!("No interface addresses for {}: {}", vm.id, e);
                return;
            }
        };
        for iface in vm.interfaces.iter_mut() {
            iface.ip_address_list = addresses
                .iter()
                .filter(|a| a.hwaddr.eq_ignore_ascii_case(&iface.mac))
                .flat_map(|a| a.addrs.iter().map(|ip| ip.addr.clone()))
                .collect();
        }
    }

    fn affect_flags(domain: &Domain, id: &str) -> Result<u32> {
        let mut flags = sys::VIR_DOMAIN_AFFECT_CONFIG;
        if Self::is_active(domain, id)? {
            flags |= sys::VIR_DOMAIN_AFFECT_LIVE;
        }
        Ok(flags)
    }

    fn resolve_interfaces(
        &self,
        conn: &Connect,
        interfaces: &mut [VirtualMachineAttachedInterface],
    ) -> Result<()> {
        for iface in interfaces.iter_mut() {
            match resolve_network(conn, &self.settings.bridges, &iface.network_name) {
                Some(network_type) => iface.network_type = network_type,
                None => {
                    return Err(ComputeError::Resource(format!(
                        "network {} does not exist",
                        iface.network_name
                    )))
                }
            }
            if iface.mac.is_empty() {
                iface.mac = generate_mac();
            }
        }
        Ok(())
    }

    fn resolve_volumes(conn: &Connect, volumes: &mut [VirtualMachineAttachedVolume]) -> Result<()> {
        for volume in volumes.iter_mut() {
            let vol = StorageVol::lookup_by_path(conn, &volume.path)
                .map_err(|e| ComputeError::Resource(format!("volume {} does not exist: {}", volume.path, e)))?;
            if volume.format == VolumeFormat::Unknown {
                if let Ok(xml) = vol.get_xml_desc(0) {
                    volume.format = XmlParser::parse_volume(&xml).0;
                }
            }
            match vol.get_info() {
                Ok(info) => volume.volume_type = volume_type_of(info.kind),
                Err(e) => debug!("Keeping {} as {}: {}", volume.path, volume.volume_type, e),
            }
        }
        Ok(())
    }

    /// Creates `<id><suffix>` in the config drive pool and uploads the image.
    fn upload_config_drive(&self, conn: &Connect, id: &str, drive: &ConfigDrive) -> Result<StorageVol> {
        let pool_name = &self.settings.config_drive_pool;
        let name = format!("{}{}", id, self.settings.config_drive_suffix);
        let pool = StoragePool::lookup_by_name(conn, pool_name)
            .map_err(|e| ComputeError::Resource(format!("config drive pool {}: {}", pool_name, e)))?;

        if let Ok(stale) = StorageVol::lookup_by_name(&pool, &name) {
            warn!("Removing stale config drive {} from pool {}", name, pool_name);
            stale
                .delete(0)
                .map_err(|e| ComputeError::from_libvirt(&name, e))?;
        }

        let xml = volume_xml(&name, VolumeFormat::Raw, Size::from_bytes(drive.size_bytes()));
        let vol = StorageVol::create_xml(&pool, &xml, 0).map_err(|e| ComputeError::from_libvirt(&name, e))?;

        if let Err(e) = Self::upload(conn, &vol, drive.image()) {
            if let Err(cleanup) = vol.delete(0) {
                warn!("Failed to remove config drive {} after upload error: {}", name, cleanup);
            }
            return Err(e);
        }
        debug!("Uploaded config drive {} ({} bytes)", name, drive.size_bytes());
        Ok(vol)
    }

    fn upload(conn: &Connect, vol: &StorageVol, data: &[u8]) -> Result<()> {
        let stream = Stream::new(conn, 0).map_err(|e| ComputeError::from_libvirt("upload stream", e))?;
        vol.upload(&stream, 0, data.len() as u64, 0)
            .map_err(|e| ComputeError::from_libvirt("volume upload", e))?;

        let mut sent = 0;
        while sent < data.len() {
            let n = stream
                .send(&data[sent..])
                .map_err(|e| ComputeError::from_libvirt("volume upload", e))?;
            if n == 0 {
                return Err(ComputeError::Resource("upload stream closed early".to_string()));
            }
            sent += n;
        }
        stream
            .finish()
            .map_err(|e| ComputeError::from_libvirt("volume upload", e))
    }

    fn create_on(&self, conn: &Connect, mut params: VirtualMachineCreateParams) -> Result<VirtualMachine> {
        let id = params.id.clone();
        if Domain::lookup_by_name(conn, &id).is_ok() {
            return Err(ComputeError::Validation(format!("machine {} already exists", id)));
        }

        self.resolve_interfaces(conn, &mut params.interfaces)?;
        Self::resolve_volumes(conn, &mut params.volumes)?;

        let mut config_drive = None;
        if let Some(config) = &params.config {
            let drive = self.config_drive.build(&id, config)?;
            let vol = self.upload_config_drive(conn, &id, &drive)?;
            let path = match vol.get_path() {
                Ok(path) => path,
                Err(e) => {
                    if let Err(cleanup) = vol.delete(0) {
                        warn!("Failed to remove config drive for {}: {}", id, cleanup);
                    }
                    return Err(ComputeError::from_libvirt(&id, e));
                }
            };
            let used = params
                .volumes
                .iter()
                .map(|v| v.device_name.as_str())
                .collect::<Vec<_>>();
            let device = next_device_name(DeviceBus::Sata.device_prefix(), used)?;
            params.volumes.push(drive.attachment(&path, &device));
            config_drive = Some(vol);
        }

        let xml = DomainDefinition {
            id: &id,
            arch: params.arch,
            vcpus: params.vcpus,
            memory: params.memory,
            volumes: &params.volumes,
            interfaces: &params.interfaces,
            config: params.config.as_ref(),
            guest_agent: true,
        }
        .render();

        let domain = match Domain::define_xml(conn, &xml) {
            Ok(domain) => domain,
            Err(e) => {
                error!("Failed to define machine {}: {}", id, e);
                if let Some(vol) = config_drive {
                    if let Err(cleanup) = vol.delete(0) {
                        warn!("Failed to remove config drive for {}: {}", id, cleanup);
                    }
                }
                return Err(ComputeError::from_libvirt(&id, e));
            }
        };

        info!(
            volumes = params.volumes.len(),
            interfaces = params.interfaces.len(),
            "Defined machine {}",
            id
        );
        self.machine_snapshot(&domain)
    }

    /// Runs `op` on a pooled connection with the domain `id` looked up.
    async fn with_domain<T, F>(&self, id: &str, op: F) -> Result<T>
    where
        F: FnOnce(&Connect, &Domain, &str) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let id = id.to_string();
        self.pool
            .with_connection(move |conn| {
                let domain = Self::lookup(conn, &id)?;
                op(conn, &domain, &id)
            })
            .await
    }

    fn set_vcpus(domain: &Domain, id: &str, current: u32, vcpus: u32) -> Result<()> {
        let config = sys::VIR_DOMAIN_AFFECT_CONFIG;
        let maximum = config | sys::VIR_DOMAIN_VCPU_MAXIMUM;
        let order = if vcpus >= current {
            [maximum, config]
        } else {
            [config, maximum]
        };
        for flags in order {
            domain
                .set_vcpus_flags(vcpus, flags)
                .map_err(|e| ComputeError::from_libvirt(id, e))?;
        }
        Ok(())
    }

    fn set_memory(domain: &Domain, id: &str, current: Size, memory: Size) -> Result<()> {
        let config = sys::VIR_DOMAIN_MEM_CONFIG;
        let maximum = config | sys::VIR_DOMAIN_MEM_MAXIMUM;
        let order = if memory >= current {
            [maximum, config]
        } else {
            [config, maximum]
        };
        for flags in order {
            domain
                .set_memory_flags(memory.kib(), flags)
                .map_err(|e| ComputeError::from_libvirt(id, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl VirtualMachineRepository for LibvirtVirtualMachineRepository {
    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<VirtualMachine>> {
        debug!("Listing all virtual machines");
        let this = self.clone();
        self.pool
            .with_connection(move |conn| {
                let flags = sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
                let domains = conn
                    .list_all_domains(flags)
                    .map_err(|e| ComputeError::from_libvirt("list domains", e))?;

                let domain_count = domains.len();
                let mut machines = Vec::with_capacity(domain_count);
                for domain in domains {
                    match this.machine_snapshot(&domain) {
                        Ok(vm) => machines.push(vm),
                        Err(e) => error!("Failed to read domain: {}", e),
                    }
                }
                info!("Listed {} machines out of {} domains", machines.len(), domain_count);
                Ok(machines)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &str, node: &str) -> Result<VirtualMachine> {
        self.check_node(node)?;
        let this = self.clone();
        self.with_domain(id, move |_, domain, _| this.machine_snapshot(domain))
            .await
    }

    #[instrument(skip(self, params), fields(id = %params.id, node = %params.node))]
    async fn create(&self, params: VirtualMachineCreateParams) -> Result<VirtualMachine> {
        self.check_node(&params.node)?;
        if params.id.is_empty() {
            return Err(ComputeError::Validation("machine id is empty".to_string()));
        }
        if params.vcpus == 0 {
            return Err(ComputeError::Validation("vcpus must be positive".to_string()));
        }
        if params.memory.bytes() == 0 {
            return Err(ComputeError::Validation("memory must be positive".to_string()));
        }
        validate_attachments(&params.volumes, &params.interfaces)?;

        info!("Creating machine {}", params.id);
        let this = self.clone();
        self.pool
            .with_connection(move |conn| this.create_on(conn, params))
            .await
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str, node: &str) -> Result<()> {
        self.check_node(node)?;
        self.with_domain(id, |_, domain, id| {
            if Self::is_active(domain, id)? {
                warn!("Destroying running machine {} before undefine", id);
                domain.destroy().map_err(|e| ComputeError::from_libvirt(id, e))?;
            }
            domain.undefine().map_err(|e| ComputeError::from_libvirt(id, e))
        })
        .await?;
        info!("Deleted machine {}", id);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update(&self, id: &str, node: &str, params: VirtualMachineUpdateParams) -> Result<()> {
        self.check_node(node)?;
        if params.is_empty() {
            return Ok(());
        }
        if params.vcpus == Some(0) || params.memory.map(|m| m.bytes()) == Some(0) {
            return Err(ComputeError::Validation("vcpus and memory must be positive".to_string()));
        }

        self.with_domain(id, move |_, domain, id| {
            let info = Self::domain_info(domain, id)?;

            if let Some(vcpus) = params.vcpus {
                Self::set_vcpus(domain, id, info.vcpus, vcpus)?;
            }
            if let Some(memory) = params.memory {
                Self::set_memory(domain, id, info.memory, memory)?;
            }
            if let Some(autostart) = params.autostart {
                domain
                    .set_autostart(autostart)
                    .map_err(|e| ComputeError::from_libvirt(id, e))?;
            }
            match params.guest_agent {
                Some(true) if !info.guest_agent => {
                    domain
                        .attach_device_flags(GUEST_AGENT_CHANNEL, sys::VIR_DOMAIN_AFFECT_CONFIG)
                        .map_err(|e| ComputeError::from_libvirt(id, e))?;
                }
                Some(false) if info.guest_agent => {
                    domain
                        .detach_device_flags(GUEST_AGENT_CHANNEL, sys::VIR_DOMAIN_AFFECT_CONFIG)
                        .map_err(|e| ComputeError::from_libvirt(id, e))?;
                }
                _ => {}
            }
            Ok(())
        })
        .await?;
        info!("Updated machine {}", id);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn attach_volume(
        &self,
        id: &str,
        node: &str,
        mut volume: VirtualMachineAttachedVolume,
    ) -> Result<VirtualMachineAttachedVolume> {
        self.check_node(node)?;
        self.with_domain(id, move |conn, domain, id| {
            let info = Self::domain_info(domain, id)?;

            if volume.device_name.is_empty() {
                let used = info.volumes.iter().map(|v| v.device_name.as_str());
                volume.device_name = next_device_name(volume.device_bus.device_prefix(), used)?;
            }
            if info.volumes.iter().any(|v| v.device_name == volume.device_name) {
                return Err(ComputeError::Validation(format!(
                    "device {} is already in use on {}",
                    volume.device_name, id
                )));
            }
            if info.volumes.iter().any(|v| v.path == volume.path) {
                return Err(ComputeError::Validation(format!(
                    "volume {} is already attached to {}",
                    volume.path, id
                )));
            }
            Self::resolve_volumes(conn, std::slice::from_mut(&mut volume))?;

            let flags = Self::affect_flags(domain, id)?;
            domain
                .attach_device_flags(&disk_xml(&volume), flags)
                .map_err(|e| ComputeError::from_libvirt(format!("attach {} to {}", volume.path, id), e))?;
            info!("Attached volume {} to {} as {}", volume.path, id, volume.device_name);
            Ok(volume)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn detach_volume(&self, id: &str, node: &str, device_name: &str) -> Result<()> {
        self.check_node(node)?;
        let device_name = device_name.to_string();
        self.with_domain(id, move |_, domain, id| {
            let info = Self::domain_info(domain, id)?;
            let attached = info
                .volumes
                .iter()
                .find(|v| v.device_name == device_name)
                .ok_or_else(|| ComputeError::NotFound(format!("device {} on {}", device_name, id)))?;

            let flags = Self::affect_flags(domain, id)?;
            domain
                .detach_device_flags(&disk_xml(attached), flags)
                .map_err(|e| ComputeError::from_libvirt(format!("detach {} from {}", device_name, id), e))?;
            info!("Detached volume {} ({}) from {}", attached.path, device_name, id);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn attach_interface(
        &self,
        id: &str,
        node: &str,
        iface: VirtualMachineAttachedInterface,
    ) -> Result<VirtualMachineAttachedInterface> {
        self.check_node(node)?;
        let this = self.clone();
        self.with_domain(id, move |conn, domain, id| {
            let info = Self::domain_info(domain, id)?;

            let mut ifaces = [iface];
            this.resolve_interfaces(conn, &mut ifaces)?;
            let [iface] = ifaces;
            if info.interfaces.iter().any(|i| i.mac.eq_ignore_ascii_case(&iface.mac)) {
                return Err(ComputeError::Validation(format!(
                    "interface {} already exists on {}",
                    iface.mac, id
                )));
            }

            let flags = Self::affect_flags(domain, id)?;
            domain
                .attach_device_flags(&interface_xml(&iface), flags)
                .map_err(|e| ComputeError::from_libvirt(format!("attach {} to {}", iface.mac, id), e))?;
            info!("Attached interface {} ({}) to {}", iface.mac, iface.network_name, id);
            Ok(iface)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn detach_interface(&self, id: &str, node: &str, mac: &str) -> Result<()> {
        self.check_node(node)?;
        let mac = mac.to_string();
        self.with_domain(id, move |_, domain, id| {
            let info = Self::domain_info(domain, id)?;
            let attached = info
                .interfaces
                .iter()
                .find(|i| i.mac.eq_ignore_ascii_case(&mac))
                .ok_or_else(|| ComputeError::NotFound(format!("interface {} on {}", mac, id)))?;

            let flags = Self::affect_flags(domain, id)?;
            domain
                .detach_device_flags(&interface_xml(attached), flags)
                .map_err(|e| ComputeError::from_libvirt(format!("detach {} from {}", mac, id), e))?;
            info!("Detached interface {} from {}", mac, id);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_console_stream(&self, id: &str, node: &str) -> Result<Box<dyn VirtualMachineStream>> {
        let vm = self.get(id, node).await?;
        if !vm.is_running() {
            return Err(ComputeError::Unsupported(format!("machine {} is not running", id)));
        }
        let pool = self.pool.clone();
        let vm_id = id.to_string();
        let stream = tokio::task::spawn_blocking(move || ConsoleStream::open(pool, &vm_id))
            .await
            .map_err(|e| ComputeError::Resource(format!("console for {} did not open: {}", id, e)))??;
        Ok(Box::new(stream))
    }

    #[instrument(skip(self))]
    async fn get_graphic_stream(&self, id: &str, node: &str) -> Result<Box<dyn VirtualMachineStream>> {
        let vm = self.get(id, node).await?;
        if !vm.is_running() {
            return Err(ComputeError::Unsupported(format!("machine {} is not running", id)));
        }
        if !vm.graphic.vnc() {
            return Err(ComputeError::Unsupported(format!("machine {} has no VNC graphic", id)));
        }
        let stream = GraphicStream::connect(id, &vm.graphic).await?;
        Ok(Box::new(stream))
    }

    #[instrument(skip(self))]
    async fn poweroff(&self, id: &str, node: &str) -> Result<()> {
        self.check_node(node)?;
        self.with_domain(id, |_, domain, id| {
            if !Self::is_active(domain, id)? {
                debug!("Machine {} is already stopped", id);
                return Ok(());
            }
            domain.destroy().map_err(|e| ComputeError::from_libvirt(id, e))?;
            info!("Powered off machine {}", id);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn reboot(&self, id: &str, node: &str) -> Result<()> {
        self.check_node(node)?;
        self.with_domain(id, |_, domain, id| {
            if !Self::is_active(domain, id)? {
                return Err(ComputeError::Unsupported(format!("machine {} is not running", id)));
            }
            domain
                .reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT)
                .map_err(|e| ComputeError::from_libvirt(id, e))?;
            info!("Rebooted machine {}", id);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn start(&self, id: &str, node: &str) -> Result<()> {
        self.check_node(node)?;
        self.with_domain(id, |_, domain, id| {
            if Self::is_active(domain, id)? {
                debug!("Machine {} is already running", id);
                return Ok(());
            }
            domain.create().map_err(|e| ComputeError::from_libvirt(id, e))?;
            info!("Started machine {}", id);
            Ok(())
        })
        .await
    }
}
