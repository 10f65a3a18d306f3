use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use proforma_backup_api::{
    BackupApi, Connector, HealthStatus, RetryPolicy, SqliteConnector, StorageSession,
    API_CONTRACT_VERSION,
};
use proforma_backup_core::{BackupError, Batch, MergeSummary, ProformaView};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const SECRET_HEADER: &str = "x-secret-key";
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

struct ServiceState<C: Connector> {
    api: BackupApi<C>,
    secret_key: Option<Arc<str>>,
}

impl<C: Connector> Clone for ServiceState<C> {
    fn clone(&self) -> Self {
        Self { api: self.api.clone(), secret_key: self.secret_key.clone() }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Debug, Clone)]
struct ServiceError {
    status: StatusCode,
    message: String,
}

#[derive(Debug, Deserialize)]
struct BackupRequest {
    #[serde(default)]
    data: Option<Batch>,
}

#[derive(Debug, Parser)]
#[command(name = "proforma-backup-service")]
#[command(about = "HTTP backup service for proformas and their line items")]
struct Args {
    #[arg(long, env = "BACKUP_DB_PATH", default_value = "./proforma_backup.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    /// Shared secret required in the `x-secret-key` header of `POST /backup`.
    #[arg(long, env = "SECRET_KEY")]
    secret_key: Option<String>,
    #[arg(long, env = "BACKUP_CONNECT_ATTEMPTS", default_value_t = 5)]
    connect_attempts: u32,
    #[arg(long, env = "BACKUP_CONNECT_DELAY_SECS", default_value_t = 5)]
    connect_delay_secs: u64,
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    fn from_backup(err: BackupError, storage_context: &str) -> Self {
        match err {
            BackupError::Validation(message) => Self::new(StatusCode::BAD_REQUEST, message),
            BackupError::NotReady => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "Database connection not ready")
            }
            BackupError::Storage(store_err) => {
                error!(error = %store_err, "{storage_context}");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{storage_context}: {store_err}"))
            }
            BackupError::StartupFatal { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let body = ServiceEnvelope::<()> {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            api_contract_version: API_CONTRACT_VERSION,
            success: false,
            message: Some(self.message),
            data: None,
        };
        (self.status, Json(body)).into_response()
    }
}

fn envelope<T>(message: Option<&str>, data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        success: true,
        message: message.map(str::to_string),
        data: Some(data),
    }
}

fn app<C: Connector>(state: ServiceState<C>) -> Router {
    Router::new()
        .route("/health", get(health::<C>))
        .route("/backup", get(backup_list::<C>).post(backup_store::<C>))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.secret_key.is_none() {
        warn!("no secret key configured; POST /backup accepts unauthenticated requests");
    }

    let policy = RetryPolicy::new(args.connect_attempts, Duration::from_secs(args.connect_delay_secs));
    let session = StorageSession::new(SqliteConnector::new(args.db.clone()), policy);
    session
        .connect_at_startup()
        .await
        .with_context(|| format!("failed to open backup store at {}", args.db.display()))?;

    let state = ServiceState { api: BackupApi::new(session), secret_key: args.secret_key.map(Arc::from) };
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(bind = %args.bind, "backup service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health<C: Connector>(
    State(state): State<ServiceState<C>>,
) -> Result<Json<ServiceEnvelope<HealthStatus>>, ServiceError> {
    let status =
        state.api.health().map_err(|err| ServiceError::from_backup(err, "Health check failed"))?;
    Ok(Json(envelope(Some("Server is healthy"), status)))
}

async fn backup_store<C: Connector>(
    State(state): State<ServiceState<C>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ServiceEnvelope<MergeSummary>>, ServiceError> {
    state.api.check_ready().map_err(|err| ServiceError::from_backup(err, "Failed to save backup"))?;
    verify_secret(state.secret_key.as_deref(), &headers)?;

    let Some(batch) = parse_backup_request(&body)?.data else {
        info!("backup request rejected: missing data");
        return Err(ServiceError::new(StatusCode::BAD_REQUEST, "Backup data is required"));
    };

    let summary = state
        .api
        .merge_batch(batch)
        .await
        .map_err(|err| ServiceError::from_backup(err, "Failed to save backup"))?;
    Ok(Json(envelope(Some("Backup saved successfully"), summary)))
}

async fn backup_list<C: Connector>(
    State(state): State<ServiceState<C>>,
) -> Result<Json<ServiceEnvelope<Vec<ProformaView>>>, ServiceError> {
    let views = state
        .api
        .list_all()
        .await
        .map_err(|err| ServiceError::from_backup(err, "Failed to fetch backup"))?;
    Ok(Json(envelope(None, views)))
}

fn verify_secret(expected: Option<&str>, headers: &HeaderMap) -> Result<(), ServiceError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let provided = headers.get(SECRET_HEADER).map(http::HeaderValue::as_bytes);
    match provided {
        Some(provided) if Sha256::digest(provided) == Sha256::digest(expected.as_bytes()) => Ok(()),
        _ => {
            info!("unauthorized backup request: invalid secret key");
            Err(ServiceError::unauthorized())
        }
    }
}

// An empty body carries no data, same as `{}`.
fn parse_backup_request(body: &[u8]) -> Result<BackupRequest, ServiceError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(BackupRequest { data: None });
    }
    serde_json::from_slice(body).map_err(|err| {
        ServiceError::new(StatusCode::BAD_REQUEST, format!("Invalid backup payload: {err}"))
    })
}
