//! Background task that sweeps the live-VM registry for hypervisor
//! processes that exited on their own (crash, guest panic) and tears
//! their VMs down so the pool cannot hand out a corpse.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::warn;

use super::VmManager;

const REAP_INTERVAL: Duration = Duration::from_secs(30);

pub async fn start_vm_reaper(manager: Arc<VmManager>) {
    let mut ticker = interval(REAP_INTERVAL);

    loop {
        ticker.tick().await;

        for vm in manager.list_vms().await {
            if vm.process_exited().await {
                warn!(
                    "VM {} hypervisor process exited unexpectedly, reaping",
                    vm.id
                );
                manager.mark_failed(&vm).await;
            }
        }
    }
}
