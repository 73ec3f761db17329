//! Repository contracts consumed by the web layer.
//!
//! Every method borrows whatever daemon resources it needs for the duration
//! of the call; returned values are snapshots.

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::*;

/// Bidirectional byte stream to a VM console or framebuffer.
#[async_trait]
pub trait VirtualMachineStream: Send {
    /// Reads into `buf`, returning 0 at end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    async fn write(&mut self, data: &[u8]) -> Result<usize>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait VirtualMachineRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<VirtualMachine>>;

    async fn get(&self, id: &str, node: &str) -> Result<VirtualMachine>;

    async fn create(&self, params: VirtualMachineCreateParams) -> Result<VirtualMachine>;

    async fn delete(&self, id: &str, node: &str) -> Result<()>;

    async fn update(&self, id: &str, node: &str, params: VirtualMachineUpdateParams) -> Result<()>;

    async fn attach_volume(
        &self,
        id: &str,
        node: &str,
        volume: VirtualMachineAttachedVolume,
    ) -> Result<VirtualMachineAttachedVolume>;

    /// Detaches the disk attached as `device_name` (e.g. `vdb`).
    async fn detach_volume(&self, id: &str, node: &str, device_name: &str) -> Result<()>;

    /// An empty MAC is replaced with a generated one.
    async fn attach_interface(
        &self,
        id: &str,
        node: &str,
        iface: VirtualMachineAttachedInterface,
    ) -> Result<VirtualMachineAttachedInterface>;

    async fn detach_interface(&self, id: &str, node: &str, mac: &str) -> Result<()>;

    async fn get_console_stream(&self, id: &str, node: &str) -> Result<Box<dyn VirtualMachineStream>>;

    async fn get_graphic_stream(&self, id: &str, node: &str) -> Result<Box<dyn VirtualMachineStream>>;

    async fn poweroff(&self, id: &str, node: &str) -> Result<()>;

    async fn reboot(&self, id: &str, node: &str) -> Result<()>;

    async fn start(&self, id: &str, node: &str) -> Result<()>;
}

#[async_trait]
pub trait VolumeRepository: Send + Sync {
    async fn get(&self, path: &str) -> Result<Volume>;

    /// `size` is in MiB.
    async fn create(&self, pool: &str, name: &str, format: VolumeFormat, size: u64) -> Result<Volume>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<Volume>>;

    async fn pools(&self) -> Result<Vec<VolumePool>>;
}

#[async_trait]
pub trait VolumePoolRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<VolumePool>>;

    async fn get(&self, name: &str) -> Result<VolumePool>;
}

#[async_trait]
pub trait NetworkRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<Network>>;

    async fn get(&self, name: &str) -> Result<Network>;
}

#[async_trait]
pub trait HostInfoRepository: Send + Sync {
    async fn get(&self) -> Result<HostInfo>;
}
