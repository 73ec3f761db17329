//! Compute orchestration over libvirt: a pooled daemon connection, VM,
//! volume, network and host repositories, config drive images and
//! script-driven lifecycle events.

pub mod config;
pub mod configdrive;
pub mod console;
pub mod domain_xml;
pub mod errors;
pub mod events;
pub mod host;
pub mod memory;
pub mod network;
pub mod pool;
pub mod repository;
pub mod service;
pub mod storage;
pub mod types;
pub mod vm_manager;
pub mod xml_parser;

pub use config::{Config, ConfigError};
pub use configdrive::{ConfigDrive, ConfigDriveBuilder, ConfigDriveFormat};
pub use errors::{ComputeError, Result};
pub use events::{Event, EventPublisher, HandlerFailure, ScriptedEventBroker, VirtualMachineCreated};
pub use memory::InMemoryHypervisor;
pub use pool::{ConnectionPool, LibvirtConnector, LibvirtPool, PoolSettings};
pub use repository::*;
pub use service::Compute;
pub use types::*;
