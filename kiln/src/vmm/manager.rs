//! Manager for the single-host microVM fleet.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::api::{
    ApiClient, BootSource, Drive, MachineConfiguration, NetworkInterface,
};
use super::{GUEST_AGENT_PORT, Vm, VmConfig, VmState, VmmError, network};
use crate::configuration::VmmSettings;
use crate::protocol::{GuestHealth, InvocationRequest, InvocationResponse};

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SOCKET_POLL_DEADLINE: Duration = Duration::from_secs(5);
const PROCESS_REAP_DEADLINE: Duration = Duration::from_secs(5);
const GUEST_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct VmManager {
    settings: VmmSettings,
    vms: RwLock<HashMap<Uuid, Arc<Vm>>>,
    http: reqwest::Client,
}

impl VmManager {
    pub fn new(settings: VmmSettings) -> Self {
        info!(
            "VmManager initialized: data_dir={}, hypervisor={}",
            settings.data_dir.display(),
            settings.hypervisor_binary.display()
        );

        Self {
            settings,
            vms: RwLock::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    fn socket_path(&self, id: Uuid) -> PathBuf {
        self.settings.data_dir.join("sockets").join(format!("{id}.sock"))
    }

    fn log_path(&self, id: Uuid) -> PathBuf {
        self.settings.data_dir.join("logs").join(format!("{id}.log"))
    }

    fn vm_dir(&self, id: Uuid) -> PathBuf {
        self.settings.data_dir.join("vms").join(id.to_string())
    }

    /// Creates, configures and boots a microVM. Every failure past the
    /// process spawn runs the same teardown the stop path uses, so a
    /// failed create leaves no socket, TAP, overlay or directory behind.
    pub async fn create_vm(&self, mut config: VmConfig) -> Result<Arc<Vm>, VmmError> {
        let id = config.id.take().unwrap_or_else(Uuid::new_v4);
        if config.memory_mb <= 0 {
            config.memory_mb = 128;
        }
        if config.vcpus <= 0 {
            config.vcpus = 1;
        }
        info!("creating VM {} ({})", id, config.runtime);

        let socket_path = self.socket_path(id);
        let log_path = self.log_path(id);
        let vm_dir = self.vm_dir(id);
        tokio::fs::create_dir_all(self.settings.data_dir.join("sockets")).await?;
        tokio::fs::create_dir_all(self.settings.data_dir.join("logs")).await?;
        tokio::fs::create_dir_all(&vm_dir).await?;

        // A stale socket from a reused id would make the poll below
        // connect to nothing.
        if tokio::fs::try_exists(&socket_path).await? {
            let _ = tokio::fs::remove_file(&socket_path).await;
        }

        let log_file = std::fs::File::create(&log_path).map_err(VmmError::Spawn)?;
        let stderr = log_file.try_clone().map_err(VmmError::Spawn)?;

        let mut command = Command::new(&self.settings.hypervisor_binary);
        command
            .arg("--api-sock")
            .arg(&socket_path)
            .stdout(log_file)
            .stderr(stderr);
        // New session: the hypervisor must survive the parent's
        // controlling terminal going away.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            });
        }
        let process = command.spawn().map_err(VmmError::Spawn)?;
        debug!("hypervisor for VM {} spawned, pid {:?}", id, process.id());

        let network = network::derive(&id);
        let vm = Arc::new(Vm::new(
            id,
            config,
            socket_path,
            log_path,
            vm_dir,
            network,
            process,
        ));

        match self.configure_and_boot(&vm).await {
            Ok(()) => {
                vm.set_state(VmState::Running).await;
                self.vms.write().await.insert(id, vm.clone());
                info!("VM {} running at {}", id, vm.network.guest_ip);
                Ok(vm)
            }
            Err(e) => {
                warn!("VM {} create failed: {}, tearing down", id, e);
                if let Err(td) = self.halt(&vm, VmState::Error).await {
                    warn!("VM {} teardown after failed create: {}", id, td);
                }
                Err(e)
            }
        }
    }

    async fn configure_and_boot(&self, vm: &Vm) -> Result<(), VmmError> {
        self.wait_for_socket(vm).await?;

        let overlay = vm.vm_dir.join("rootfs.ext4");
        self.create_overlay(&overlay).await?;

        network::create_tap(&vm.network).await?;

        let api = |step, source| VmmError::Api {
            vm_id: vm.id,
            step,
            source,
        };

        let client = ApiClient::new(&vm.socket_path);
        client
            .put_boot_source(&BootSource {
                kernel_image_path: self.settings.kernel_image.display().to_string(),
                boot_args: Some(self.settings.boot_args.clone()),
            })
            .await
            .map_err(|e| api("boot-source", e))?;
        client
            .put_drive(&Drive {
                drive_id: "rootfs".to_string(),
                path_on_host: overlay.display().to_string(),
                is_root_device: true,
                is_read_only: false,
            })
            .await
            .map_err(|e| api("drives/rootfs", e))?;
        client
            .put_machine_config(&MachineConfiguration {
                vcpu_count: vm.config.vcpus,
                mem_size_mib: vm.config.memory_mb,
            })
            .await
            .map_err(|e| api("machine-config", e))?;
        client
            .put_network_interface(&NetworkInterface {
                iface_id: "eth0".to_string(),
                guest_mac: Some(vm.network.guest_mac),
                host_dev_name: vm.network.tap_name.clone(),
            })
            .await
            .map_err(|e| api("network-interfaces/eth0", e))?;
        client
            .start_instance()
            .await
            .map_err(|e| api("actions", e))?;

        // A VM only counts as running once its agent answers; the pool
        // must never hand out a VM that is still booting.
        self.wait_for_guest(vm).await?;

        Ok(())
    }

    async fn wait_for_guest(&self, vm: &Vm) -> Result<(), VmmError> {
        let url = format!(
            "http://{}:{}/health",
            vm.network.guest_ip, GUEST_AGENT_PORT
        );
        let deadline = Duration::from_secs(self.settings.guest_boot_timeout_secs);

        timeout(deadline, async {
            loop {
                let probe = self
                    .http
                    .get(&url)
                    .timeout(GUEST_POLL_INTERVAL * 4)
                    .send()
                    .await;
                match probe {
                    Ok(response) if response.status().is_success() => {
                        if let Ok(health) = response.json::<GuestHealth>().await {
                            debug!(
                                "guest agent for VM {} ready (runtime {})",
                                vm.id, health.runtime
                            );
                        }
                        break;
                    }
                    _ => tokio::time::sleep(GUEST_POLL_INTERVAL).await,
                }
            }
        })
        .await
        .map_err(|_| VmmError::GuestBootTimeout(vm.id, deadline))
    }

    async fn wait_for_socket(&self, vm: &Vm) -> Result<(), VmmError> {
        timeout(SOCKET_POLL_DEADLINE, async {
            loop {
                match UnixStream::connect(&vm.socket_path).await {
                    Ok(_) => break,
                    Err(_) => tokio::time::sleep(SOCKET_POLL_INTERVAL).await,
                }
            }
        })
        .await
        .map_err(|_| VmmError::StartTimeout(vm.id, SOCKET_POLL_DEADLINE))
    }

    /// Copy-on-write overlay of the shared base rootfs: reflink when the
    /// filesystem supports it, full copy otherwise.
    async fn create_overlay(&self, overlay: &Path) -> Result<(), VmmError> {
        let base = &self.settings.base_rootfs;
        match Command::new("cp")
            .arg("--reflink=always")
            .arg("--sparse=always")
            .arg(base)
            .arg(overlay)
            .status()
            .await
        {
            Ok(status) if status.success() => return Ok(()),
            Ok(status) => debug!("reflink copy exited {status}, falling back to full copy"),
            Err(e) => debug!("reflink copy unavailable ({e}), falling back to full copy"),
        }

        tokio::fs::copy(base, overlay).await.map_err(|e| {
            VmmError::Overlay(format!(
                "copying {} to {}: {e}",
                base.display(),
                overlay.display()
            ))
        })?;
        Ok(())
    }

    /// Stops a VM and releases everything it owned on the host. The log
    /// file is kept for operator diagnosis. Idempotent.
    pub async fn stop_vm(&self, vm: &Arc<Vm>) -> Result<(), VmmError> {
        self.vms.write().await.remove(&vm.id);
        self.halt(vm, VmState::Stopped).await
    }

    /// Removes a VM whose process died underneath us.
    pub(crate) async fn mark_failed(&self, vm: &Arc<Vm>) {
        self.vms.write().await.remove(&vm.id);
        if let Err(e) = self.halt(vm, VmState::Error).await {
            warn!("VM {} teardown after process death: {}", vm.id, e);
        }
    }

    async fn halt(&self, vm: &Vm, final_state: VmState) -> Result<(), VmmError> {
        let mut process = vm.process().lock().await;
        if vm.state().await.is_terminal() {
            return Ok(());
        }

        if let Some(mut child) = process.take() {
            if let Err(e) = child.kill().await {
                warn!("VM {} kill: {}", vm.id, e);
            }
            // Reap so the child never lingers as a zombie
            let _ = timeout(PROCESS_REAP_DEADLINE, child.wait()).await;
        }

        if tokio::fs::try_exists(&vm.socket_path).await.unwrap_or(false) {
            let _ = tokio::fs::remove_file(&vm.socket_path).await;
        }

        network::delete_tap(&vm.network.tap_name).await;

        if tokio::fs::try_exists(&vm.vm_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&vm.vm_dir).await?;
        }

        vm.set_state(final_state).await;
        info!("VM {} stopped", vm.id);
        Ok(())
    }

    /// POSTs an invocation to the guest agent. The deadline is the
    /// lesser of the caller's and the driver cap.
    pub async fn execute(
        &self,
        vm: &Vm,
        request: &InvocationRequest,
        deadline: Duration,
    ) -> Result<InvocationResponse, VmmError> {
        let deadline = deadline.min(Duration::from_secs(self.settings.max_invoke_secs));
        let response = self
            .http
            .post(vm.invoke_url())
            .timeout(deadline)
            .json(request)
            .send()
            .await
            .map_err(VmmError::Guest)?;

        response.json().await.map_err(VmmError::Guest)
    }

    pub async fn get_vm(&self, id: Uuid) -> Option<Arc<Vm>> {
        self.vms.read().await.get(&id).cloned()
    }

    pub async fn list_vms(&self) -> Vec<Arc<Vm>> {
        self.vms.read().await.values().cloned().collect()
    }

    /// Removes residue a previous run left behind: VM directories,
    /// control sockets and TAP devices whose hypervisor died with the
    /// process. Called once on startup, before any VM is created.
    pub async fn sweep_stale_vms(&self) {
        let vms_dir = self.settings.data_dir.join("vms");
        let mut entries = match tokio::fs::read_dir(&vms_dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|s| Uuid::parse_str(s).ok()) else {
                continue;
            };
            if self.vms.read().await.contains_key(&id) {
                continue;
            }
            warn!("sweeping stale VM {} from a previous run", id);

            let socket_path = self.socket_path(id);
            if tokio::fs::try_exists(&socket_path).await.unwrap_or(false) {
                let _ = tokio::fs::remove_file(&socket_path).await;
            }
            network::delete_tap(&network::derive(&id).tap_name).await;
            let _ = tokio::fs::remove_dir_all(entry.path()).await;
        }
    }

    /// Stops every live VM. Errors are logged and collected; the last
    /// one is returned. Called on process shutdown.
    pub async fn cleanup(&self) -> Result<(), VmmError> {
        let vms: Vec<Arc<Vm>> = {
            let mut map = self.vms.write().await;
            map.drain().map(|(_, vm)| vm).collect()
        };

        let mut last_error = None;
        for vm in vms {
            if let Err(e) = self.halt(&vm, VmState::Stopped).await {
                warn!("cleanup of VM {} failed: {}", vm.id, e);
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &Path) -> VmmSettings {
        VmmSettings {
            data_dir: dir.to_path_buf(),
            hypervisor_binary: "/nonexistent/firecracker".into(),
            kernel_image: "/nonexistent/vmlinux".into(),
            base_rootfs: "/nonexistent/rootfs.ext4".into(),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".to_string(),
            max_invoke_secs: 900,
            guest_boot_timeout_secs: 10,
        }
    }

    #[tokio::test]
    async fn sweep_removes_previous_run_residue() {
        let dir = tempfile::tempdir().unwrap();
        let manager = VmManager::new(settings(dir.path()));

        let id = Uuid::new_v4();
        let vm_dir = dir.path().join("vms").join(id.to_string());
        tokio::fs::create_dir_all(&vm_dir).await.unwrap();
        tokio::fs::write(vm_dir.join("rootfs.ext4"), b"overlay")
            .await
            .unwrap();
        let socket = dir.path().join("sockets").join(format!("{id}.sock"));
        tokio::fs::create_dir_all(socket.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&socket, b"").await.unwrap();

        manager.sweep_stale_vms().await;

        assert!(!vm_dir.exists());
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn sweep_leaves_foreign_directories_alone() {
        let dir = tempfile::tempdir().unwrap();
        let manager = VmManager::new(settings(dir.path()));

        let keep = dir.path().join("vms").join("not-a-vm");
        tokio::fs::create_dir_all(&keep).await.unwrap();

        manager.sweep_stale_vms().await;
        assert!(keep.exists());
    }
}
