//! Warm pool: per-runtime bounded queues of idle, booted VMs.
//!
//! The queue bound is the "at most pool_size idle" invariant; refill
//! backpressures against it. Acquirers never block on an empty queue,
//! they fall through to an on-demand create.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::configuration::PoolSettings;
use crate::model::functions::Runtime;
use crate::vmm::{Vm, VmConfig, VmManager, VmmError};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("runtime '{0}' has no pool")]
    UnsupportedRuntime(Runtime),

    #[error(transparent)]
    Vmm(#[from] VmmError),
}

struct PoolQueue {
    tx: mpsc::Sender<Arc<Vm>>,
    rx: Mutex<mpsc::Receiver<Arc<Vm>>>,
}

pub struct WarmPool {
    manager: Arc<VmManager>,
    queues: HashMap<Runtime, PoolQueue>,
    refill_interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl WarmPool {
    pub fn new(manager: Arc<VmManager>, settings: &PoolSettings) -> Self {
        let runtimes = settings
            .runtimes
            .clone()
            .unwrap_or_else(|| Runtime::ALL.to_vec());
        let size = settings.size.max(1);

        let queues = runtimes
            .into_iter()
            .map(|runtime| {
                let (tx, rx) = mpsc::channel(size);
                (
                    runtime,
                    PoolQueue {
                        tx,
                        rx: Mutex::new(rx),
                    },
                )
            })
            .collect();

        let (shutdown, _) = watch::channel(false);

        Self {
            manager,
            queues,
            refill_interval: Duration::from_secs(settings.refill_interval_secs),
            shutdown,
        }
    }

    /// Spawns the background refill loop. One task per pool; it exits on
    /// `stop()`.
    pub fn start(self: &Arc<Self>) {
        let pool = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(pool.refill_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.refill_once().await,
                    _ = shutdown.changed() => {
                        info!("warm pool refill loop exiting");
                        break;
                    }
                }
            }
        });
    }

    /// Takes a warm VM for `runtime`, falling back to a cold start when
    /// the queue is empty. Never blocks on the queue.
    pub async fn acquire(&self, runtime: Runtime) -> Result<Arc<Vm>, PoolError> {
        let queue = self
            .queues
            .get(&runtime)
            .ok_or(PoolError::UnsupportedRuntime(runtime))?;

        {
            let mut rx = queue.rx.lock().await;
            while let Ok(vm) = rx.try_recv() {
                // Entries can go stale when the reaper tears a VM down
                // while it sits in the queue.
                if vm.is_running().await {
                    debug!("warm VM {} acquired for {}", vm.id, runtime);
                    return Ok(vm);
                }
                debug!("discarding stale pool entry {}", vm.id);
            }
        }

        debug!("pool empty for {}, cold-starting a VM", runtime);
        Ok(self
            .manager
            .create_vm(VmConfig::for_runtime(runtime))
            .await?)
    }

    /// Returns a VM to its pool. Non-reusable, stale or excess VMs are
    /// stopped instead.
    pub async fn release(&self, vm: Arc<Vm>, reusable: bool) {
        if !reusable || !vm.is_running().await {
            self.stop_vm(vm).await;
            return;
        }

        let Some(queue) = self.queues.get(&vm.config.runtime) else {
            self.stop_vm(vm).await;
            return;
        };

        if let Err(e) = queue.tx.try_send(vm) {
            let vm = match e {
                TrySendError::Full(vm) | TrySendError::Closed(vm) => vm,
            };
            debug!("pool for {} is full, stopping VM {}", vm.config.runtime, vm.id);
            self.stop_vm(vm).await;
        }
    }

    /// Signals the refill loop to exit, then drains and stops every
    /// queued VM.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);

        for (runtime, queue) in &self.queues {
            let mut rx = queue.rx.lock().await;
            let mut drained = 0;
            while let Ok(vm) = rx.try_recv() {
                drained += 1;
                self.stop_vm(vm).await;
            }
            if drained > 0 {
                info!("drained {} idle VMs for {}", drained, runtime);
            }
        }
    }

    async fn refill_once(&self) {
        for (runtime, queue) in &self.queues {
            // Free queue slots == deficit; bounded by the channel
            // capacity, so two overlapping refills cannot overfill.
            let deficit = queue.tx.capacity();
            if deficit == 0 {
                continue;
            }
            debug!("refilling {} VMs for {}", deficit, runtime);

            let tasks = (0..deficit).map(|_| {
                let manager = self.manager.clone();
                let tx = queue.tx.clone();
                let runtime = *runtime;
                async move {
                    match manager.create_vm(VmConfig::for_runtime(runtime)).await {
                        Ok(vm) => {
                            if let Err(e) = tx.try_send(vm) {
                                let vm = match e {
                                    TrySendError::Full(vm) | TrySendError::Closed(vm) => vm,
                                };
                                debug!(
                                    "pool for {} filled concurrently, stopping VM {}",
                                    runtime, vm.id
                                );
                                if let Err(e) = manager.stop_vm(&vm).await {
                                    warn!("failed to stop excess VM: {}", e);
                                }
                            }
                        }
                        Err(e) => warn!("warm pool refill for {} failed: {}", runtime, e),
                    }
                }
            });
            join_all(tasks).await;
        }
    }

    async fn stop_vm(&self, vm: Arc<Vm>) {
        if let Err(e) = self.manager.stop_vm(&vm).await {
            warn!("failed to stop VM {}: {}", vm.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::VmmSettings;

    fn manager() -> Arc<VmManager> {
        Arc::new(VmManager::new(VmmSettings {
            data_dir: "/nonexistent".into(),
            hypervisor_binary: "/nonexistent/firecracker".into(),
            kernel_image: "/nonexistent/vmlinux".into(),
            base_rootfs: "/nonexistent/rootfs.ext4".into(),
            boot_args: "console=ttyS0".to_string(),
            max_invoke_secs: 900,
            guest_boot_timeout_secs: 10,
        }))
    }

    #[tokio::test]
    async fn acquire_unknown_runtime_is_unsupported() {
        let settings = PoolSettings {
            size: 2,
            refill_interval_secs: 10,
            runtimes: Some(vec![Runtime::Nodejs20]),
        };
        let pool = WarmPool::new(manager(), &settings);

        match pool.acquire(Runtime::Python311).await {
            Err(PoolError::UnsupportedRuntime(runtime)) => {
                assert_eq!(runtime, Runtime::Python311);
            }
            other => panic!("expected UnsupportedRuntime, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn queues_default_to_all_runtimes() {
        let settings = PoolSettings {
            size: 2,
            refill_interval_secs: 10,
            runtimes: None,
        };
        let pool = WarmPool::new(manager(), &settings);
        assert_eq!(pool.queues.len(), Runtime::ALL.len());
        for queue in pool.queues.values() {
            assert_eq!(queue.tx.capacity(), 2);
        }
    }
}
