//! MicroVM lifecycle: process spawn, control-socket configuration,
//! per-VM networking and rootfs overlays, guest invocation transport.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tokio::process::Child;
use tokio::sync::{Mutex, RwLock};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::model::functions::Runtime;

pub mod api;
pub mod manager;
pub mod monitor;
pub mod network;

pub use manager::VmManager;

pub const GUEST_AGENT_PORT: u16 = 8080;

#[derive(Debug, thiserror::Error)]
pub enum VmmError {
    #[error("failed to spawn hypervisor process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("vm {0} control socket did not come up within {1:?}")]
    StartTimeout(Uuid, Duration),

    #[error("vm {0} guest agent did not become ready within {1:?}")]
    GuestBootTimeout(Uuid, Duration),

    #[error("hypervisor api error for vm {vm_id} during {step}: {source}")]
    Api {
        vm_id: Uuid,
        step: &'static str,
        #[source]
        source: api::ApiError,
    },

    #[error("tap device error: {0}")]
    Tap(String),

    #[error("rootfs overlay error: {0}")]
    Overlay(String),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("guest request failed: {0}")]
    Guest(#[source] reqwest::Error),
}

/// Configuration for a VM about to be created. `id` is assigned when
/// absent. `handler`, `code_path` and `env` ride along for diagnostics;
/// the code itself reaches the guest per invocation.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub id: Option<Uuid>,
    pub runtime: Runtime,
    pub memory_mb: i32,
    pub vcpus: i32,
    pub handler: Option<String>,
    pub code_path: Option<String>,
    pub env: HashMap<String, String>,
}

impl VmConfig {
    /// Minimal config the warm pool boots runtimes with.
    pub fn for_runtime(runtime: Runtime) -> Self {
        Self {
            id: None,
            runtime,
            memory_mb: 128,
            vcpus: 1,
            handler: None,
            code_path: None,
            env: HashMap::new(),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VmState {
    Creating,
    Running,
    Stopped,
    Error,
}

impl VmState {
    pub fn is_terminal(self) -> bool {
        matches!(self, VmState::Stopped | VmState::Error)
    }
}

/// A live microVM. Owned by the `VmManager`; the pool and invoker hold
/// `Arc` references that lose meaning once the state turns terminal.
pub struct Vm {
    pub id: Uuid,
    pub config: VmConfig,
    pub socket_path: PathBuf,
    pub log_path: PathBuf,
    pub vm_dir: PathBuf,
    pub network: network::VmNetwork,
    pub created_at: DateTime<Utc>,

    state: RwLock<VmState>,
    process: Mutex<Option<Child>>,
}

impl Vm {
    pub(crate) fn new(
        id: Uuid,
        config: VmConfig,
        socket_path: PathBuf,
        log_path: PathBuf,
        vm_dir: PathBuf,
        network: network::VmNetwork,
        process: Child,
    ) -> Self {
        Self {
            id,
            config,
            socket_path,
            log_path,
            vm_dir,
            network,
            created_at: Utc::now(),
            state: RwLock::new(VmState::Creating),
            process: Mutex::new(Some(process)),
        }
    }

    pub async fn state(&self) -> VmState {
        *self.state.read().await
    }

    pub(crate) async fn set_state(&self, state: VmState) {
        *self.state.write().await = state;
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == VmState::Running
    }

    pub fn invoke_url(&self) -> String {
        format!(
            "http://{}:{}/invoke",
            self.network.guest_ip, GUEST_AGENT_PORT
        )
    }

    /// The per-instance mutex guarding the process handle during stop.
    pub(crate) fn process(&self) -> &Mutex<Option<Child>> {
        &self.process
    }

    /// True if the hypervisor process has already exited on its own.
    pub(crate) async fn process_exited(&self) -> bool {
        let mut process = self.process.lock().await;
        match process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => false,
        }
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("runtime", &self.config.runtime)
            .field("guest_ip", &self.network.guest_ip)
            .finish()
    }
}
