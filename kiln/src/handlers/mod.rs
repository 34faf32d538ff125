use crate::{App, errors::Error};
use axum::{
    Extension, Json, Router,
    body::Body,
    extract::FromRequest,
    response::{self, IntoResponse, Response},
    routing::get,
};
use http::{Request, StatusCode, header::HeaderName};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_with::DisplayFromStr;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use validator::ValidationErrors;

mod function;
mod vm;

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        function::handler::list,
        function::handler::get,
        function::handler::create,
        function::handler::update,
        function::handler::delete,
        function::handler::invoke,
        vm::handler::list,
    ),
    components(
        schemas(
            crate::model::functions::Function,
            crate::model::functions::Runtime,
            crate::model::functions::CreateFunctionRequest,
            crate::model::functions::UpdateFunctionRequest,
            crate::handlers::function::handler::ListFunctionsResponse,
            crate::handlers::function::handler::DeleteFunctionResponse,
            crate::handlers::vm::handler::VmSummary,
            crate::vmm::VmState,
            crate::handlers::HealthResponse,
        )
    ),
    tags(
        (name = "functions", description = "Function registry and invocation endpoints"),
        (name = "vms", description = "Live microVM observability endpoints")
    ),
    info(
        title = "Kiln API",
        version = "0.1.0",
        description = "REST API for managing and invoking functions on microVMs"
    )
)]
pub struct ApiDoc;

pub fn app(env: App) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");
    Router::new()
        .route("/health", get(health))
        .merge(functions())
        .merge(vms())
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
                .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                        let request_id = request
                            .extensions()
                            .get::<RequestId>()
                            .map(|value| value.header_value().to_str().unwrap_or_default())
                            .unwrap_or_default();

                        tracing::info_span!(
                            "HTTP",
                            http.method = %request.method(),
                            http.url = %request.uri(),
                            request_id = %request_id,
                        )
                    }),
                ),
        )
        .layer(Extension(env))
}

fn functions() -> Router {
    Router::new()
        .route(
            "/api/v1/functions",
            get(function::handler::list).post(function::handler::create),
        )
        .route(
            "/api/v1/functions/{name}",
            get(function::handler::get)
                .put(function::handler::update)
                .delete(function::handler::delete),
        )
        .route(
            "/api/v1/functions/{name}/invoke",
            axum::routing::post(function::handler::invoke),
        )
}

fn vms() -> Router {
    Router::new().route("/api/v1/vms", get(vm::handler::list))
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "kiln",
    })
}

/// `Json` with the rejection mapped into the API error shape: any body
/// that fails to parse is a 400, not axum's 422.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request(
        req: axum::extract::Request,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(Error::Invalid(rejection.body_text())),
        }
    }
}

pub struct ApiResponse<T> {
    data: T,
    code: StatusCode,
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Send + Sync + Serialize,
{
    fn into_response(self) -> Response {
        let mut response = response::Json(self.data).into_response();

        *response.status_mut() = self.code;
        response
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        #[serde_with::serde_as]
        #[serde_with::skip_serializing_none]
        #[derive(serde::Serialize)]
        struct ErrorResponse<'a> {
            // Serialize the `Display` output as the error message
            #[serde_as(as = "DisplayFromStr")]
            error: &'a Error,

            kind: &'static str,
            stack: Option<&'a str>,
            logs: Option<&'a str>,
            errors: Option<&'a ValidationErrors>,
        }

        let (stack, logs) = match &self {
            Error::HandlerFailed { stack, logs, .. } => (stack.as_deref(), logs.as_deref()),
            _ => (None, None),
        };
        let errors = match &self {
            Error::InvalidEntity(errors) => Some(errors),
            _ => None,
        };

        tracing::error!("API error: {:?}", self);
        (
            self.status_code(),
            Json(ErrorResponse {
                error: &self,
                kind: self.kind(),
                stack,
                logs,
                errors,
            }),
        )
            .into_response()
    }
}
