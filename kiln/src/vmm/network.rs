//! Per-VM host networking: one TAP device and a deterministic /30.
//!
//! The subnet and MAC are hashed from the VM id. The scheme collides on
//! larger fleets; the derivation is kept in one place so it can be
//! swapped for an allocation table recycled on teardown.

use std::net::Ipv4Addr;

use macaddr::MacAddr6;
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

use super::VmmError;

#[derive(Debug, Clone)]
pub struct VmNetwork {
    pub tap_name: String,
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub guest_mac: MacAddr6,
}

/// Derives the TAP name, /30 pair and guest MAC for a VM id.
pub fn derive(id: &Uuid) -> VmNetwork {
    let sum: u32 = id.as_bytes().iter().map(|&b| u32::from(b)).sum();
    let host_octet = (sum % 250 + 1) as u8;
    let mac_octet = (sum % 256) as u8;
    let hex = id.simple().to_string();

    VmNetwork {
        tap_name: format!("tap-{}", &hex[..8]),
        host_ip: Ipv4Addr::new(172, 16, host_octet, 1),
        guest_ip: Ipv4Addr::new(172, 16, host_octet, 2),
        guest_mac: MacAddr6::new(0xAA, 0xFC, 0x00, 0x00, 0x00, mac_octet),
    }
}

async fn run_ip(args: &[&str]) -> Result<(), VmmError> {
    let status = Command::new("ip")
        .args(args)
        .status()
        .await
        .map_err(|e| VmmError::Tap(format!("failed to run ip {}: {e}", args.join(" "))))?;
    if !status.success() {
        return Err(VmmError::Tap(format!(
            "ip {} failed with status {status}",
            args.join(" ")
        )));
    }
    Ok(())
}

/// Creates the TAP device, assigns the host side of the /30 and brings
/// the link up. The host must permit tuntap operations; failure here is
/// a hard create-time error.
pub async fn create_tap(network: &VmNetwork) -> Result<(), VmmError> {
    run_ip(&["tuntap", "add", &network.tap_name, "mode", "tap"]).await?;
    run_ip(&[
        "addr",
        "add",
        &format!("{}/30", network.host_ip),
        "dev",
        &network.tap_name,
    ])
    .await?;
    run_ip(&["link", "set", &network.tap_name, "up"]).await?;

    info!("TAP device {} created and up", network.tap_name);
    Ok(())
}

/// Deletes a TAP device. Logs a warning on failure but does not
/// propagate; teardown keeps going.
pub async fn delete_tap(name: &str) {
    match Command::new("ip")
        .args(["link", "delete", name])
        .status()
        .await
    {
        Ok(s) if s.success() => info!("TAP device {} deleted", name),
        Ok(s) => warn!("ip link delete {} failed with status {}", name, s),
        Err(e) => warn!("failed to run ip link delete {}: {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let id = Uuid::new_v4();
        let a = derive(&id);
        let b = derive(&id);
        assert_eq!(a.tap_name, b.tap_name);
        assert_eq!(a.host_ip, b.host_ip);
        assert_eq!(a.guest_ip, b.guest_ip);
        assert_eq!(a.guest_mac, b.guest_mac);
    }

    #[test]
    fn tap_name_fits_linux_ifname_limit() {
        let network = derive(&Uuid::new_v4());
        assert!(network.tap_name.len() <= 15);
        assert!(network.tap_name.starts_with("tap-"));
    }

    #[test]
    fn host_and_guest_share_a_slash_30() {
        let network = derive(&Uuid::new_v4());
        let host = network.host_ip.octets();
        let guest = network.guest_ip.octets();
        assert_eq!(&host[..3], &guest[..3]);
        assert_eq!(host[3], 1);
        assert_eq!(guest[3], 2);
        // Third octet stays inside 1..=250
        assert!((1..=250).contains(&host[2]));
    }

    #[test]
    fn known_id_hashes_to_expected_values() {
        let id = Uuid::nil();
        let network = derive(&id);
        assert_eq!(network.tap_name, "tap-00000000");
        assert_eq!(network.host_ip, Ipv4Addr::new(172, 16, 1, 1));
        assert_eq!(network.guest_ip, Ipv4Addr::new(172, 16, 1, 2));
        assert_eq!(network.guest_mac, MacAddr6::new(0xAA, 0xFC, 0, 0, 0, 0));
    }
}
