//! HTTP-over-Unix-socket client for the hypervisor control API.
//!
//! One short-lived connection per call; bodies are JSON. Responses with
//! status >= 400 carry the hypervisor's body in the error.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_util::rt::TokioIo;
use macaddr::MacAddr6;
use serde::Serialize;
use serde_with::skip_serializing_none;
use tokio::net::UnixStream;

/// Cap on a single control-socket call, independent of any invocation
/// deadline.
const API_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("socket connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("transport error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("hypervisor returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("control socket call timed out")]
    Timeout,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineConfiguration {
    pub vcpu_count: i32,
    pub mem_size_mib: i32,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: Option<MacAddr6>,
    pub host_dev_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub enum ActionType {
    InstanceStart,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceActionInfo {
    pub action_type: ActionType,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    socket_path: PathBuf,
}

impl ApiClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub async fn put_boot_source(&self, boot_source: &BootSource) -> Result<(), ApiError> {
        self.put("/boot-source", boot_source).await
    }

    pub async fn put_drive(&self, drive: &Drive) -> Result<(), ApiError> {
        self.put(&format!("/drives/{}", drive.drive_id), drive).await
    }

    pub async fn put_machine_config(
        &self,
        machine_config: &MachineConfiguration,
    ) -> Result<(), ApiError> {
        self.put("/machine-config", machine_config).await
    }

    pub async fn put_network_interface(
        &self,
        interface: &NetworkInterface,
    ) -> Result<(), ApiError> {
        self.put(
            &format!("/network-interfaces/{}", interface.iface_id),
            interface,
        )
        .await
    }

    pub async fn start_instance(&self) -> Result<(), ApiError> {
        self.put(
            "/actions",
            &InstanceActionInfo {
                action_type: ActionType::InstanceStart,
            },
        )
        .await
    }

    async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        let body = serde_json::to_vec(body)?;
        tokio::time::timeout(API_CALL_TIMEOUT, self.send("PUT", path, body))
            .await
            .map_err(|_| ApiError::Timeout)?
    }

    async fn send(&self, method: &str, path: &str, body: Vec<u8>) -> Result<(), ApiError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(ApiError::Connect)?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(conn);

        let request = Request::builder()
            .method(method)
            .uri(format!("http://localhost{path}"))
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.into_body().collect().await?.to_bytes();
            return Err(ApiError::Api {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_source_omits_unset_args() {
        let json = serde_json::to_value(BootSource {
            kernel_image_path: "/images/vmlinux".to_string(),
            boot_args: None,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kernel_image_path": "/images/vmlinux"})
        );
    }

    #[test]
    fn instance_start_uses_wire_name() {
        let json = serde_json::to_value(InstanceActionInfo {
            action_type: ActionType::InstanceStart,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"action_type": "InstanceStart"}));
    }

    #[test]
    fn network_interface_serializes_mac_as_string() {
        let json = serde_json::to_value(NetworkInterface {
            iface_id: "eth0".to_string(),
            guest_mac: Some(MacAddr6::new(0xAA, 0xFC, 0, 0, 0, 0x2A)),
            host_dev_name: "tap-0000abcd".to_string(),
        })
        .unwrap();
        assert_eq!(json["guest_mac"], "AA:FC:00:00:00:2A");
        assert_eq!(json["host_dev_name"], "tap-0000abcd");
    }
}
