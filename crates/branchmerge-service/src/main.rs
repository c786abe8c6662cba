use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use branchmerge_api::{BranchMergeApi, MigrateResult, API_CONTRACT_VERSION};
use branchmerge_core::{Branch, BranchId, BranchOrder, BranchTransaction, MergeError, MergeRequest};
use clap::Parser;
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: BranchMergeApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error_kind: &'static str,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing_ids: Option<Vec<BranchId>>,
    retryable: bool,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "branchmerge-service")]
#[command(about = "Local HTTP service for merchant branch consolidation")]
struct Args {
    #[arg(long, default_value = "./branchmerge.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:2022")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error_kind: "internal",
            error: message.into(),
            missing_ids: None,
            retryable: false,
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn from_merge(err: &MergeError) -> Self {
        let status = match err {
            MergeError::InvalidRequest(_) | MergeError::SelfMergeNotAllowed => {
                StatusCode::BAD_REQUEST
            }
            MergeError::CanonicalNotFound(_) | MergeError::DuplicatesNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            MergeError::ConsolidationFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        Self {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error_kind: err.kind(),
            error: err.to_string(),
            missing_ids: err.missing_ids().map(<[BranchId]>::to_vec),
            retryable: err.is_retryable(),
            status,
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/seed-demo", post(db_seed_demo))
        .route("/v1/branches", get(branches_list))
        .route("/v1/branches/merge", post(branches_merge))
        .route("/v1/branches/:id", get(branch_show))
        .route("/v1/branches/:id/transactions", get(branch_transactions))
        .route("/v1/branches/:id/orders", get(branch_orders))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let state = ServiceState { api: BranchMergeApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "branchmerge service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<branchmerge_store_sqlite::SchemaStatus>>, ServiceError> {
    let status =
        state.api.schema_status().map_err(|err| ServiceError::internal(err.to_string()))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state
        .api
        .migrate(request.dry_run)
        .map_err(|err| ServiceError::internal(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn db_seed_demo(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<branchmerge_store_sqlite::SeedSummary>>, ServiceError> {
    let summary = state.api.seed_demo().map_err(|err| ServiceError::internal(err.to_string()))?;
    Ok(Json(envelope(summary)))
}

async fn branches_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<Branch>>>, ServiceError> {
    let branches =
        state.api.list_branches().map_err(|err| ServiceError::internal(err.to_string()))?;
    Ok(Json(envelope(branches)))
}

async fn branch_show(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<Option<Branch>>>, ServiceError> {
    let branch = state
        .api
        .get_branch(&BranchId::new(id))
        .map_err(|err| ServiceError::internal(err.to_string()))?;
    Ok(Json(envelope(branch)))
}

async fn branch_transactions(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<BranchTransaction>>>, ServiceError> {
    let records = state
        .api
        .list_transactions(&BranchId::new(id))
        .map_err(|err| ServiceError::internal(err.to_string()))?;
    Ok(Json(envelope(records)))
}

async fn branch_orders(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<BranchOrder>>>, ServiceError> {
    let records = state
        .api
        .list_orders(&BranchId::new(id))
        .map_err(|err| ServiceError::internal(err.to_string()))?;
    Ok(Json(envelope(records)))
}

async fn branches_merge(
    State(state): State<ServiceState>,
    Json(request): Json<MergeRequest>,
) -> Result<Json<ServiceEnvelope<Branch>>, ServiceError> {
    let branch = state
        .api
        .merge_branches(&request)
        .map_err(|err| ServiceError::from_merge(&err))?;
    Ok(Json(envelope(branch)))
}
