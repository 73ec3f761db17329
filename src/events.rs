use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::{ComputeError, Result};
use crate::types::VirtualMachine;

const MAX_STDERR_BYTES: usize = 4096;

/// A named occurrence whose flattened form becomes the environment of
/// external handlers.
pub trait Event: Send + Sync {
    fn name(&self) -> &'static str;

    fn plain(&self) -> BTreeMap<String, String>;
}

#[derive(Debug, Clone)]
pub struct VirtualMachineCreated {
    pub machine: VirtualMachine,
}

impl VirtualMachineCreated {
    pub const NAME: &'static str = "vm_created";

    pub fn new(machine: VirtualMachine) -> Self {
        Self { machine }
    }
}

impl Event for VirtualMachineCreated {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn plain(&self) -> BTreeMap<String, String> {
        let vm = &self.machine;
        let mut env = BTreeMap::new();
        env.insert("event".to_string(), self.name().to_string());
        env.insert("vm_id".to_string(), vm.id.clone());
        env.insert("vm_cpus".to_string(), vm.vcpus.to_string());
        env.insert("vm_memory_mib".to_string(), vm.memory_mib().to_string());
        env.insert("vm_volume_count".to_string(), vm.volumes.len().to_string());
        env.insert("vm_interface_count".to_string(), vm.interfaces.len().to_string());

        for (i, volume) in vm.volumes.iter().enumerate() {
            env.insert(format!("vm_volume_{}_path", i), volume.path.clone());
            env.insert(format!("vm_volume_{}_format", i), volume.format.to_string());
            env.insert(format!("vm_volume_{}_device", i), volume.device_name.clone());
            env.insert(format!("vm_volume_{}_type", i), volume.device_type.to_string());
        }
        for (i, iface) in vm.interfaces.iter().enumerate() {
            env.insert(format!("vm_interface_{}_mac", i), iface.mac.clone());
            env.insert(format!("vm_interface_{}_network", i), iface.network_name.clone());
            env.insert(format!("vm_interface_{}_type", i), iface.network_type.to_string());
        }
        env
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerFailure {
    #[error("failed to start: {0}")]
    Spawn(String),

    #[error("exited with status {code}: {stderr}")]
    Exit { code: i32, stderr: String },

    #[error("terminated by signal")]
    Signal,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs one handler script to completion.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        script: &Path,
        env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> std::result::Result<(), HandlerFailure>;
}

/// Spawns scripts with `tokio::process`; the child is killed when it
/// outlives the timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        script: &Path,
        env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> std::result::Result<(), HandlerFailure> {
        let child = Command::new(script)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HandlerFailure::Spawn(e.to_string()))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(HandlerFailure::Spawn(e.to_string())),
            Err(_) => return Err(HandlerFailure::Timeout(timeout)),
        };

        if output.status.success() {
            return Ok(());
        }
        match output.status.code() {
            Some(code) => {
                let mut stderr = output.stderr;
                stderr.truncate(MAX_STDERR_BYTES);
                Err(HandlerFailure::Exit {
                    code,
                    stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
                })
            }
            None => Err(HandlerFailure::Signal),
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &dyn Event) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub event: String,
    pub script: PathBuf,
    pub mandatory: bool,
}

pub struct ScriptedEventBroker {
    runner: Arc<dyn ProcessRunner>,
    timeout: Duration,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl ScriptedEventBroker {
    pub fn new(runner: Arc<dyn ProcessRunner>, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, event: impl Into<String>, script: impl Into<PathBuf>, mandatory: bool) {
        let subscription = Subscription {
            event: event.into(),
            script: script.into(),
            mandatory,
        };
        info!(
            event = %subscription.event,
            script = %subscription.script.display(),
            mandatory,
            "Subscribed event handler"
        );
        self.subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(subscription);
    }

    pub fn subscriptions(&self, event: &str) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|s| s.event == event)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for ScriptedEventBroker {
    async fn publish(&self, event: &dyn Event) -> Result<()> {
        let handlers = self.subscriptions(event.name());
        if handlers.is_empty() {
            debug!("No handlers subscribed to {}", event.name());
            return Ok(());
        }

        let env = event.plain();
        info!(event = event.name(), handlers = handlers.len(), "Publishing event");

        let runs = handlers
            .iter()
            .map(|handler| self.runner.run(&handler.script, &env, self.timeout));
        let outcomes = join_all(runs).await;

        let mut first_failure = None;
        for (handler, outcome) in handlers.iter().zip(outcomes) {
            let Err(failure) = outcome else {
                debug!(script = %handler.script.display(), "Handler for {} succeeded", event.name());
                continue;
            };
            warn!(
                event = event.name(),
                script = %handler.script.display(),
                mandatory = handler.mandatory,
                "Event handler failed: {}",
                failure
            );
            if handler.mandatory && first_failure.is_none() {
                first_failure = Some(ComputeError::HandlerFailed {
                    event: event.name().to_string(),
                    script: handler.script.display().to_string(),
                    reason: failure.to_string(),
                });
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingRunner;
    use super::*;
    use crate::types::*;

    fn machine() -> VirtualMachine {
        VirtualMachine {
            id: "web".into(),
            node_id: "node1".into(),
            vcpus: 2,
            arch: Arch::X86_64,
            state: VmState::Stopped,
            memory: Size::from_mib(1024),
            interfaces: vec![VirtualMachineAttachedInterface {
                mac: "52:54:00:00:00:0a".into(),
                network_name: "br0".into(),
                network_type: NetworkType::Bridge,
                ..Default::default()
            }],
            volumes: vec![
                VirtualMachineAttachedVolume {
                    path: "/images/web.qcow2".into(),
                    device_name: "vda".into(),
                    device_type: DeviceType::Disk,
                    format: VolumeFormat::Qcow2,
                    device_bus: DeviceBus::Virtio,
                    volume_type: VolumeType::File,
                },
                VirtualMachineAttachedVolume {
                    path: "/images/web_config.iso".into(),
                    device_name: "sda".into(),
                    device_type: DeviceType::Cdrom,
                    format: VolumeFormat::Raw,
                    device_bus: DeviceBus::Sata,
                    volume_type: VolumeType::File,
                },
            ],
            config: None,
            cpupin: None,
            guest_agent: true,
            autostart: false,
            graphic: Default::default(),
        }
    }

    #[test]
    fn plain_indexes_volumes_and_interfaces_from_zero() {
        let env = VirtualMachineCreated::new(machine()).plain();
        assert_eq!(env["event"], "vm_created");
        assert_eq!(env["vm_id"], "web");
        assert_eq!(env["vm_cpus"], "2");
        assert_eq!(env["vm_memory_mib"], "1024");
        assert_eq!(env["vm_volume_count"], "2");
        assert_eq!(env["vm_interface_count"], "1");

        assert_eq!(env["vm_volume_0_path"], "/images/web.qcow2");
        assert_eq!(env["vm_volume_0_format"], "qcow2");
        assert_eq!(env["vm_volume_1_device"], "sda");
        assert_eq!(env["vm_volume_1_type"], "cdrom");
        assert!(!env.contains_key("vm_volume_2_path"));

        assert_eq!(env["vm_interface_0_mac"], "52:54:00:00:00:0a");
        assert_eq!(env["vm_interface_0_network"], "br0");
        assert_eq!(env["vm_interface_0_type"], "bridge");
        assert!(!env.contains_key("vm_interface_1_mac"));

        // 6 scalars + 4 per volume + 3 per interface
        assert_eq!(env.len(), 6 + 2 * 4 + 3);
    }

    #[tokio::test]
    async fn mandatory_failure_fails_publish() {
        let runner = Arc::new(RecordingRunner::failing(&["/hooks/notify"]));
        let broker = ScriptedEventBroker::new(runner.clone(), Duration::from_secs(1));
        broker.subscribe("vm_created", "/hooks/notify", true);
        broker.subscribe("vm_created", "/hooks/audit", false);

        let err = broker.publish(&VirtualMachineCreated::new(machine())).await.unwrap_err();
        match err {
            ComputeError::HandlerFailed { event, script, .. } => {
                assert_eq!(event, "vm_created");
                assert_eq!(script, "/hooks/notify");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn optional_failure_is_tolerated() {
        let runner = Arc::new(RecordingRunner::failing(&["/hooks/audit"]));
        let broker = ScriptedEventBroker::new(runner.clone(), Duration::from_secs(1));
        broker.subscribe("vm_created", "/hooks/audit", false);

        broker.publish(&VirtualMachineCreated::new(machine())).await.unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1["vm_id"], "web");
    }

    #[tokio::test]
    async fn only_matching_handlers_run() {
        let runner = Arc::new(RecordingRunner::default());
        let broker = ScriptedEventBroker::new(runner.clone(), Duration::from_secs(1));
        broker.subscribe("vm_deleted", "/hooks/cleanup", true);

        broker.publish(&VirtualMachineCreated::new(machine())).await.unwrap();
        assert!(runner.calls().is_empty());
        assert_eq!(broker.subscriptions("vm_deleted").len(), 1);
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_passes_environment_and_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "check.sh",
            "#!/bin/sh\n[ \"$vm_id\" = \"web\" ] || { echo \"wrong id: $vm_id\" >&2; exit 3; }\n",
        );

        let mut env = BTreeMap::new();
        env.insert("vm_id".to_string(), "web".to_string());
        TokioProcessRunner.run(&script, &env, Duration::from_secs(10)).await.unwrap();

        env.insert("vm_id".to_string(), "db".to_string());
        let failure = TokioProcessRunner
            .run(&script, &env, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(
            failure,
            HandlerFailure::Exit {
                code: 3,
                stderr: "wrong id: db".into()
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "slow.sh", "#!/bin/sh\nexec sleep 5\n");
        let failure = TokioProcessRunner
            .run(&script, &BTreeMap::new(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(failure, HandlerFailure::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn missing_script_is_a_spawn_failure() {
        let failure = TokioProcessRunner
            .run(Path::new("/nonexistent/hook"), &BTreeMap::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(failure, HandlerFailure::Spawn(_)));
    }
}
