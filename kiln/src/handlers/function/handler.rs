use axum::{Extension, extract::Path};
use http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tracing::instrument;
use utoipa::ToSchema;

use crate::{
    App,
    errors::Error,
    invoker::Outcome,
    model::functions::{CreateFunctionRequest, Function, UpdateFunctionRequest},
};

use crate::handlers::{ApiJson, ApiResponse, Result};

#[derive(Serialize, ToSchema)]
pub struct ListFunctionsResponse {
    pub items: Vec<Function>,
    pub count: usize,
}

#[derive(Serialize, ToSchema)]
pub struct DeleteFunctionResponse {
    pub deleted: String,
}

#[utoipa::path(
    get,
    path = "/api/v1/functions",
    responses(
        (status = 200, description = "List all functions", body = ListFunctionsResponse),
        (status = 500, description = "Internal server error")
    ),
    tag = "functions"
)]
#[instrument(skip(env))]
pub async fn list(Extension(env): Extension<App>) -> Result<ApiResponse<ListFunctionsResponse>> {
    let items = env.registry().list_functions().await?;
    let count = items.len();
    Ok(ApiResponse {
        data: ListFunctionsResponse { items, count },
        code: StatusCode::OK,
    })
}

#[utoipa::path(
    get,
    path = "/api/v1/functions/{name}",
    params(
        ("name" = String, Path, description = "Function name")
    ),
    responses(
        (status = 200, description = "Function details", body = Function),
        (status = 404, description = "Function not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "functions"
)]
#[instrument(skip(env))]
pub async fn get(
    Extension(env): Extension<App>,
    Path(name): Path<String>,
) -> Result<ApiResponse<Function>> {
    let function = env.registry().get_function(&name).await?;
    Ok(ApiResponse {
        data: function,
        code: StatusCode::OK,
    })
}

#[utoipa::path(
    post,
    path = "/api/v1/functions",
    request_body = CreateFunctionRequest,
    responses(
        (status = 201, description = "Function created", body = Function),
        (status = 400, description = "Invalid request"),
        (status = 409, description = "Name already exists"),
        (status = 500, description = "Internal server error")
    ),
    tag = "functions"
)]
#[instrument(skip(env, request), fields(name = %request.name))]
pub async fn create(
    Extension(env): Extension<App>,
    ApiJson(request): ApiJson<CreateFunctionRequest>,
) -> Result<ApiResponse<Function>> {
    let function = env.registry().create_function(request).await?;
    Ok(ApiResponse {
        data: function,
        code: StatusCode::CREATED,
    })
}

#[utoipa::path(
    put,
    path = "/api/v1/functions/{name}",
    params(
        ("name" = String, Path, description = "Function name")
    ),
    request_body = UpdateFunctionRequest,
    responses(
        (status = 200, description = "Function updated", body = Function),
        (status = 400, description = "Invalid request"),
        (status = 404, description = "Function not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "functions"
)]
#[instrument(skip(env, patch))]
pub async fn update(
    Extension(env): Extension<App>,
    Path(name): Path<String>,
    ApiJson(patch): ApiJson<UpdateFunctionRequest>,
) -> Result<ApiResponse<Function>> {
    let function = env.registry().update_function(&name, patch).await?;
    Ok(ApiResponse {
        data: function,
        code: StatusCode::OK,
    })
}

#[utoipa::path(
    delete,
    path = "/api/v1/functions/{name}",
    params(
        ("name" = String, Path, description = "Function name")
    ),
    responses(
        (status = 200, description = "Function deleted", body = DeleteFunctionResponse),
        (status = 404, description = "Function not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "functions"
)]
#[instrument(skip(env))]
pub async fn delete(
    Extension(env): Extension<App>,
    Path(name): Path<String>,
) -> Result<ApiResponse<DeleteFunctionResponse>> {
    env.registry().delete_function(&name).await?;
    Ok(ApiResponse {
        data: DeleteFunctionResponse { deleted: name },
        code: StatusCode::OK,
    })
}

#[utoipa::path(
    post,
    path = "/api/v1/functions/{name}/invoke",
    params(
        ("name" = String, Path, description = "Function name")
    ),
    request_body = Value,
    responses(
        (status = 200, description = "Handler result body"),
        (status = 404, description = "Function not found"),
        (status = 408, description = "Invocation timed out"),
        (status = 502, description = "Handler raised an error"),
        (status = 503, description = "No VM available")
    ),
    tag = "functions"
)]
#[instrument(skip(env, event))]
pub async fn invoke(
    Extension(env): Extension<App>,
    Path(name): Path<String>,
    ApiJson(event): ApiJson<Value>,
) -> Result<ApiResponse<Value>> {
    let function = env.registry().get_function(&name).await?;

    match env.invoker().invoke(&function, event).await? {
        Outcome::Completed { body, .. } => Ok(ApiResponse {
            data: body,
            code: StatusCode::OK,
        }),
        Outcome::HandlerFailed { error, stack, logs } => {
            Err(Error::HandlerFailed { error, stack, logs })
        }
        Outcome::Timeout => Err(Error::Timeout(function.timeout_sec)),
        Outcome::Unavailable(message) => Err(Error::Unavailable(message)),
    }
}
