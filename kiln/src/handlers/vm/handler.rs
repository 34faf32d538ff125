use axum::Extension;
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::Serialize;
use tracing::instrument;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{App, model::functions::Runtime, vmm::VmState};

use crate::handlers::{ApiResponse, Result};

#[derive(Serialize, ToSchema)]
pub struct VmSummary {
    pub id: Uuid,
    pub runtime: Runtime,
    pub state: VmState,
    #[schema(value_type = String)]
    pub guest_ip: std::net::Ipv4Addr,
    pub created_at: DateTime<Utc>,
}

#[utoipa::path(
    get,
    path = "/api/v1/vms",
    responses(
        (status = 200, description = "List live microVMs", body = Vec<VmSummary>)
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn list(Extension(env): Extension<App>) -> Result<ApiResponse<Vec<VmSummary>>> {
    let mut summaries = Vec::new();
    for vm in env.manager().list_vms().await {
        summaries.push(VmSummary {
            id: vm.id,
            runtime: vm.config.runtime,
            state: vm.state().await,
            guest_ip: vm.network.guest_ip,
            created_at: vm.created_at,
        });
    }
    Ok(ApiResponse {
        data: summaries,
        code: StatusCode::OK,
    })
}
