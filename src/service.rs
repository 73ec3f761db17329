use std::sync::Arc;

use tracing::{error, info, instrument};

use crate::config::{Config, ConfigError};
use crate::errors::Result;
use crate::events::{EventPublisher, ScriptedEventBroker, TokioProcessRunner, VirtualMachineCreated};
use crate::host::LibvirtHostInfoRepository;
use crate::memory::InMemoryHypervisor;
use crate::network::LibvirtNetworkRepository;
use crate::pool::{LibvirtConnector, LibvirtPool};
use crate::repository::*;
use crate::storage::{LibvirtVolumePoolRepository, LibvirtVolumeRepository};
use crate::types::*;
use crate::vm_manager::{LibvirtVirtualMachineRepository, VirtualMachineSettings};

/// Entry point for the presentation layer: one instance of every repository
/// plus the event publisher.
#[derive(Clone)]
pub struct Compute {
    machines: Arc<dyn VirtualMachineRepository>,
    volumes: Arc<dyn VolumeRepository>,
    volume_pools: Arc<dyn VolumePoolRepository>,
    networks: Arc<dyn NetworkRepository>,
    host: Arc<dyn HostInfoRepository>,
    events: Arc<dyn EventPublisher>,
}

impl Compute {
    pub fn new(
        machines: Arc<dyn VirtualMachineRepository>,
        volumes: Arc<dyn VolumeRepository>,
        volume_pools: Arc<dyn VolumePoolRepository>,
        networks: Arc<dyn NetworkRepository>,
        host: Arc<dyn HostInfoRepository>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            machines,
            volumes,
            volume_pools,
            networks,
            host,
            events,
        }
    }

    /// Wires the libvirt adapters around one shared connection pool.
    pub fn libvirt(config: &Config) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let connector = LibvirtConnector::new(&config.libvirt.uri);
        let pool = Arc::new(LibvirtPool::new(connector, config.pool_settings()));

        let settings = VirtualMachineSettings {
            node_id: config.libvirt.node.clone(),
            config_drive_pool: config.libvirt.config_drive_pool.clone(),
            config_drive_suffix: config.libvirt.config_drive_suffix.clone(),
            config_drive_format: config.config_drive_format()?,
            bridges: config.bridges.clone(),
        };

        Ok(Self::new(
            Arc::new(LibvirtVirtualMachineRepository::new(pool.clone(), settings)),
            Arc::new(LibvirtVolumeRepository::new(pool.clone(), config.volume_metadata())),
            Arc::new(LibvirtVolumePoolRepository::new(pool.clone())),
            Arc::new(LibvirtNetworkRepository::new(pool.clone(), config.bridges.clone())),
            Arc::new(LibvirtHostInfoRepository::new(pool)),
            Arc::new(broker_from_config(config)),
        ))
    }

    /// Every repository backed by the same in-memory hypervisor.
    pub fn in_memory(hypervisor: Arc<InMemoryHypervisor>, events: Arc<dyn EventPublisher>) -> Self {
        Self::new(
            hypervisor.clone(),
            hypervisor.clone(),
            hypervisor.clone(),
            hypervisor.clone(),
            hypervisor,
            events,
        )
    }

    pub fn machines(&self) -> &dyn VirtualMachineRepository {
        self.machines.as_ref()
    }

    pub fn volumes(&self) -> &dyn VolumeRepository {
        self.volumes.as_ref()
    }

    pub fn volume_pools(&self) -> &dyn VolumePoolRepository {
        self.volume_pools.as_ref()
    }

    pub fn networks(&self) -> &dyn NetworkRepository {
        self.networks.as_ref()
    }

    pub fn host(&self) -> &dyn HostInfoRepository {
        self.host.as_ref()
    }

    /// Defines the machine, then publishes `vm_created`. A failing mandatory
    /// handler is returned as the error; the machine stays defined.
    #[instrument(skip(self, params), fields(id = %params.id, node = %params.node))]
    pub async fn create_machine(&self, params: VirtualMachineCreateParams) -> Result<VirtualMachine> {
        let machine = self.machines.create(params).await?;
        let event = VirtualMachineCreated::new(machine.clone());
        if let Err(e) = self.events.publish(&event).await {
            error!("Machine {} created but event handling failed: {}", machine.id, e);
            return Err(e);
        }
        info!("Created machine {} on {}", machine.id, machine.node_id);
        Ok(machine)
    }
}

pub fn broker_from_config(config: &Config) -> ScriptedEventBroker {
    let broker = ScriptedEventBroker::new(Arc::new(TokioProcessRunner), config.handler_timeout());
    for subscription in &config.subscribes {
        broker.subscribe(&subscription.event, &subscription.script, subscription.mandatory);
    }
    broker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ComputeError;
    use crate::events::testing::RecordingRunner;
    use std::time::Duration;

    fn params(id: &str) -> VirtualMachineCreateParams {
        VirtualMachineCreateParams {
            id: id.into(),
            node: "node1".into(),
            arch: Arch::X86_64,
            vcpus: 2,
            memory: Size::from_mib(2048),
            volumes: vec![VirtualMachineAttachedVolume {
                path: "/default/root.qcow2".into(),
                device_name: "vda".into(),
                device_type: DeviceType::Disk,
                format: VolumeFormat::Unknown,
                device_bus: DeviceBus::Virtio,
                volume_type: VolumeType::File,
            }],
            interfaces: vec![VirtualMachineAttachedInterface {
                network_name: "default".into(),
                ..Default::default()
            }],
            config: None,
        }
    }

    fn hypervisor() -> Arc<InMemoryHypervisor> {
        Arc::new(
            InMemoryHypervisor::new("node1")
                .with_pool("default", 100 * 1024)
                .with_network("default", NetworkType::Libvirt)
                .with_volume("default", "root.qcow2", VolumeFormat::Qcow2, 10 * 1024)
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn create_machine_publishes_vm_created() {
        let runner = Arc::new(RecordingRunner::default());
        let broker = ScriptedEventBroker::new(runner.clone(), Duration::from_secs(1));
        broker.subscribe("vm_created", "/hooks/dns", true);
        let compute = Compute::in_memory(hypervisor(), Arc::new(broker));

        let vm = compute.create_machine(params("web")).await.unwrap();
        assert_eq!(vm.volumes[0].format, VolumeFormat::Qcow2);

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        let env = &calls[0].1;
        assert_eq!(env["vm_id"], "web");
        assert_eq!(env["vm_volume_0_format"], "qcow2");
        assert_eq!(env["vm_interface_0_mac"], vm.interfaces[0].mac);
        assert_eq!(env["vm_interface_0_type"], "libvirt");
    }

    #[tokio::test]
    async fn mandatory_handler_failure_surfaces_but_machine_exists() {
        let runner = Arc::new(RecordingRunner::failing(&["/hooks/dns"]));
        let broker = ScriptedEventBroker::new(runner, Duration::from_secs(1));
        broker.subscribe("vm_created", "/hooks/dns", true);
        let compute = Compute::in_memory(hypervisor(), Arc::new(broker));

        let err = compute.create_machine(params("web")).await.unwrap_err();
        assert!(matches!(err, ComputeError::HandlerFailed { .. }));
        assert!(compute.machines().get("web", "node1").await.is_ok());
    }

    #[tokio::test]
    async fn failed_create_publishes_nothing() {
        let runner = Arc::new(RecordingRunner::default());
        let broker = ScriptedEventBroker::new(runner.clone(), Duration::from_secs(1));
        broker.subscribe("vm_created", "/hooks/dns", true);
        let compute = Compute::in_memory(hypervisor(), Arc::new(broker));

        let mut bad = params("web");
        bad.interfaces[0].network_name = "missing".into();
        let err = compute.create_machine(bad).await.unwrap_err();
        assert!(matches!(err, ComputeError::Resource(_)));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn broker_from_config_registers_subscriptions() {
        let config = Config::from_json(
            r#"{"subscribes": [{"event": "vm_created", "script": "/bin/true", "mandatory": true}]}"#,
        )
        .unwrap();
        let broker = broker_from_config(&config);
        assert_eq!(broker.subscriptions("vm_created").len(), 1);
    }
}
