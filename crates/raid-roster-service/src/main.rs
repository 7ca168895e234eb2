use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use raid_roster_api::{
    spawn_background_tasks, CloseReceipt, CreateRecruitmentRequest, DeleteOutcome, JoinReceipt,
    JoinRequest, JoinSession, LeaveReceipt, PersistenceManager, Presenter, RosterApi,
    RosterConfig, API_CONTRACT_VERSION,
};
use raid_roster_core::{
    Actor, ActorId, AssignmentOutcome, ClosingSchedule, Preference, Recruitment, RecruitmentId,
    RecruitmentState, RenderHandle, RetentionPolicy, RosterError, Slot, TimeSlot,
};
use raid_roster_store_json::SnapshotFile;
use serde::{Deserialize, Serialize};
use time::{Duration, UtcOffset};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod presenters;

use presenters::{LogPresenter, WebhookPresenter};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: Arc<RosterApi>,
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
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
    kind: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct ListQuery {
    state: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LeaveRequest {
    actor_id: ActorId,
}

#[derive(Debug, Clone, Deserialize)]
struct BeginSessionRequest {
    recruitment_id: RecruitmentId,
}

#[derive(Debug, Clone, Deserialize)]
struct PreferenceRequest {
    preference: Preference,
}

#[derive(Debug, Clone, Deserialize)]
struct SlotsRequest {
    slots: BTreeSet<Slot>,
}

#[derive(Debug, Clone, Deserialize)]
struct AvailabilityRequest {
    earliest_available: TimeSlot,
}

#[derive(Debug, Clone, Deserialize)]
struct RemarksRequest {
    remarks: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConfirmRequest {
    display_name: String,
}

#[derive(Debug, Clone, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

#[derive(Debug, Parser)]
#[command(name = "raid-roster-service")]
#[command(about = "Raid recruitment roster service")]
struct Args {
    /// Directory holding `recruitment_data.json` and its backup.
    #[arg(long, env = "ROSTER_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,
    #[arg(long, env = "ROSTER_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Post presentation events here instead of only logging them.
    #[arg(long, env = "ROSTER_WEBHOOK_URL")]
    webhook_url: Option<String>,
    #[arg(long, env = "ROSTER_CAPACITY", default_value_t = 6)]
    capacity: usize,
    #[arg(long, env = "ROSTER_PREVIEW_THRESHOLD", default_value_t = 6)]
    preview_threshold: usize,
    #[arg(long, env = "ROSTER_CLOSING_HOUR", default_value_t = 8)]
    closing_hour: u8,
    #[arg(long, env = "ROSTER_UTC_OFFSET_HOURS", default_value_t = 9, allow_negative_numbers = true)]
    utc_offset_hours: i8,
    /// Any recruitment older than this many days is swept.
    #[arg(long, env = "ROSTER_RETENTION_MAX_AGE_DAYS", default_value_t = 7)]
    retention_max_age_days: u32,
    /// Closed, assigned, or errored recruitments older than this many days are swept.
    #[arg(long, env = "ROSTER_RETENTION_TERMINAL_DAYS", default_value_t = 3)]
    retention_terminal_days: u32,
}

impl Args {
    fn roster_config(&self) -> Result<RosterConfig> {
        let utc_offset = UtcOffset::from_hms(self.utc_offset_hours, 0, 0)
            .with_context(|| format!("invalid UTC offset {}h", self.utc_offset_hours))?;
        let config = RosterConfig {
            capacity: self.capacity,
            preview_threshold: self.preview_threshold,
            closing: ClosingSchedule { hour: self.closing_hour, utc_offset },
            retention: RetentionPolicy {
                max_age: Duration::days(i64::from(self.retention_max_age_days)),
                terminal_max_age: Duration::days(i64::from(self.retention_terminal_days)),
            },
            ..RosterConfig::default()
        };
        config.validate().context("invalid roster configuration")?;
        Ok(config)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<RosterError> for ServiceError {
    fn from(err: RosterError) -> Self {
        let status = match &err {
            RosterError::RecruitmentNotFound(_)
            | RosterError::RecruitmentOrphaned(_)
            | RosterError::NotAParticipant { .. } => StatusCode::NOT_FOUND,
            RosterError::InvalidState { .. }
            | RosterError::RecruitmentNotOpen(_)
            | RosterError::RecruitmentClosed(_)
            | RosterError::AlreadyClosed(_)
            | RosterError::RecruitmentFull { .. } => StatusCode::CONFLICT,
            RosterError::Forbidden { .. } => StatusCode::FORBIDDEN,
            RosterError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RosterError::AssignmentFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RosterError::PresentationFailure { .. } => StatusCode::BAD_GATEWAY,
        };
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: err.to_string(),
            kind: err.kind(),
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

fn parse_id(raw: &str) -> Result<RecruitmentId, ServiceError> {
    raw.parse::<RecruitmentId>().map_err(ServiceError::from)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/recruitments", post(recruitment_create).get(recruitment_list))
        .route("/v1/recruitments/:id", get(recruitment_show))
        .route("/v1/recruitments/:id/preview", get(recruitment_preview))
        .route("/v1/recruitments/:id/open", post(recruitment_open))
        .route("/v1/recruitments/:id/join", post(recruitment_join))
        .route("/v1/recruitments/:id/leave", post(recruitment_leave))
        .route("/v1/recruitments/:id/close", post(recruitment_close))
        .route("/v1/recruitments/:id/delete", post(recruitment_delete))
        .route("/v1/sessions/:actor", get(session_show).delete(session_cancel))
        .route("/v1/sessions/:actor/begin", post(session_begin))
        .route("/v1/sessions/:actor/preference", post(session_preference))
        .route("/v1/sessions/:actor/slots", post(session_slots))
        .route("/v1/sessions/:actor/availability", post(session_availability))
        .route("/v1/sessions/:actor/remarks", post(session_remarks))
        .route("/v1/sessions/:actor/confirm", post(session_confirm))
        .with_state(state)
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
}

/// Write one last snapshot if anything panics, release the data-dir lock, then exit.
fn install_panic_snapshot(api: &Arc<RosterApi>, lock_path: PathBuf) {
    let api = Arc::clone(api);
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        match api.emergency_snapshot() {
            Ok(report) => {
                error!(path = %report.path, records = report.records, "emergency snapshot written");
            }
            Err(err) => error!(error = %format!("{err:#}"), "emergency snapshot failed"),
        }
        let _ = std::fs::remove_file(&lock_path);
        std::process::exit(1);
    }));
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received terminate signal, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = args.roster_config()?;

    let presenter: Arc<dyn Presenter> = match &args.webhook_url {
        Some(url) => Arc::new(WebhookPresenter::new(url.clone())),
        None => Arc::new(LogPresenter),
    };
    let persistence = Arc::new(PersistenceManager::new(SnapshotFile::in_dir(&args.data_dir)));
    let (data_lock, stale_holder) =
        persistence.file().claim().context("failed to claim the data directory")?;
    if let Some(holder) = stale_holder {
        warn!(
            lock = %data_lock.path().display(),
            holder = %holder,
            "replaced a lock file left by an earlier run"
        );
    }
    let api = Arc::new(RosterApi::load(config, presenter, persistence)?);
    install_panic_snapshot(&api, data_lock.path().to_path_buf());

    let token = CancellationToken::new();
    let tasks = spawn_background_tasks(&api, &token);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(bind = %args.bind, data_dir = %args.data_dir.display(), "raid roster service listening");

    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let serve_token = token.clone();
    axum::serve(listener, app(ServiceState { api: Arc::clone(&api) }))
        .with_graceful_shutdown(async move { serve_token.cancelled().await })
        .await
        .context("http server failed")?;

    token.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            warn!(error = %err, "background task ended abnormally");
        }
    }
    if api.autosave().await.is_none() {
        warn!("final snapshot failed");
    }
    drop(data_lock);
    info!("raid roster service stopped");
    Ok(())
}

async fn recruitment_create(
    State(state): State<ServiceState>,
    Json(request): Json<CreateRecruitmentRequest>,
) -> Result<Json<ServiceEnvelope<Recruitment>>, ServiceError> {
    let record = state.api.create_pending(request).await?;
    Ok(Json(envelope(record)))
}

async fn recruitment_list(
    State(state): State<ServiceState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ServiceEnvelope<Vec<Recruitment>>>, ServiceError> {
    let filter = match query.state.as_deref() {
        Some(raw) => Some(RecruitmentState::parse(raw).ok_or_else(|| {
            RosterError::Validation(format!("unknown recruitment state `{raw}`"))
        })?),
        None => None,
    };
    Ok(Json(envelope(state.api.list(filter).await)))
}

async fn recruitment_show(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<Recruitment>>, ServiceError> {
    let record = state.api.get(parse_id(&id)?).await?;
    Ok(Json(envelope(record)))
}

async fn recruitment_preview(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<AssignmentOutcome>>, ServiceError> {
    let outcome = state.api.preview(parse_id(&id)?).await?;
    Ok(Json(envelope(outcome)))
}

async fn recruitment_open(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<RenderHandle>>, ServiceError> {
    let handle = state.api.open(parse_id(&id)?).await?;
    Ok(Json(envelope(handle)))
}

async fn recruitment_join(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    Json(request): Json<JoinRequest>,
) -> Result<Json<ServiceEnvelope<JoinReceipt>>, ServiceError> {
    let receipt = state.api.join(parse_id(&id)?, request).await?;
    Ok(Json(envelope(receipt)))
}

async fn recruitment_leave(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    Json(request): Json<LeaveRequest>,
) -> Result<Json<ServiceEnvelope<LeaveReceipt>>, ServiceError> {
    let receipt = state.api.leave(parse_id(&id)?, &request.actor_id).await?;
    Ok(Json(envelope(receipt)))
}

async fn recruitment_close(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    Json(actor): Json<Actor>,
) -> Result<Json<ServiceEnvelope<CloseReceipt>>, ServiceError> {
    let receipt = state.api.close(parse_id(&id)?, &actor).await?;
    Ok(Json(envelope(receipt)))
}

async fn recruitment_delete(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    Json(actor): Json<Actor>,
) -> Result<Json<ServiceEnvelope<DeleteOutcome>>, ServiceError> {
    let outcome = state.api.delete(parse_id(&id)?, &actor).await?;
    Ok(Json(envelope(outcome)))
}

async fn session_begin(
    State(state): State<ServiceState>,
    Path(actor): Path<String>,
    Json(request): Json<BeginSessionRequest>,
) -> Result<Json<ServiceEnvelope<JoinSession>>, ServiceError> {
    let session = state.api.begin_session(ActorId::new(actor), request.recruitment_id).await?;
    Ok(Json(envelope(session)))
}

async fn session_preference(
    State(state): State<ServiceState>,
    Path(actor): Path<String>,
    Json(request): Json<PreferenceRequest>,
) -> Result<Json<ServiceEnvelope<JoinSession>>, ServiceError> {
    let session = state.api.session_preference(&ActorId::new(actor), request.preference).await?;
    Ok(Json(envelope(session)))
}

async fn session_slots(
    State(state): State<ServiceState>,
    Path(actor): Path<String>,
    Json(request): Json<SlotsRequest>,
) -> Result<Json<ServiceEnvelope<JoinSession>>, ServiceError> {
    let session = state.api.session_slots(&ActorId::new(actor), request.slots).await?;
    Ok(Json(envelope(session)))
}

async fn session_availability(
    State(state): State<ServiceState>,
    Path(actor): Path<String>,
    Json(request): Json<AvailabilityRequest>,
) -> Result<Json<ServiceEnvelope<JoinSession>>, ServiceError> {
    let session =
        state.api.session_availability(&ActorId::new(actor), request.earliest_available).await?;
    Ok(Json(envelope(session)))
}

async fn session_remarks(
    State(state): State<ServiceState>,
    Path(actor): Path<String>,
    Json(request): Json<RemarksRequest>,
) -> Result<Json<ServiceEnvelope<JoinSession>>, ServiceError> {
    let session = state.api.session_remarks(&ActorId::new(actor), request.remarks).await?;
    Ok(Json(envelope(session)))
}

async fn session_confirm(
    State(state): State<ServiceState>,
    Path(actor): Path<String>,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<ServiceEnvelope<JoinReceipt>>, ServiceError> {
    let receipt = state.api.confirm_session(ActorId::new(actor), request.display_name).await?;
    Ok(Json(envelope(receipt)))
}

async fn session_show(
    State(state): State<ServiceState>,
    Path(actor): Path<String>,
) -> Json<ServiceEnvelope<Option<JoinSession>>> {
    Json(envelope(state.api.session(&ActorId::new(actor)).await))
}

async fn session_cancel(
    State(state): State<ServiceState>,
    Path(actor): Path<String>,
) -> Json<ServiceEnvelope<CancelResponse>> {
    let cancelled = state.api.cancel_session(&ActorId::new(actor)).await;
    Json(envelope(CancelResponse { cancelled }))
}
