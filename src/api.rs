use crate::circuit_breaker::CircuitBreaker;
use crate::context::ControlContext;
use crate::dispatcher::CommandDispatcher;
use crate::error::ControlError;
use crate::heartbeat::{HealthStatus, HeartbeatMonitor};
use crate::metrics;
use crate::model::{CommandPayload, CommandPriority, CommandType, TradeCommand};
use crate::optimization::OptimizationSupervisor;
use crate::persistence::store::PersistenceStore;
use crate::risk_policy::{CircuitBreakerThresholds, PolicyHandle, SafetyLimits};
use crate::rollback::RollbackManager;
use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

const OPERATOR: &str = "operator";

/// Shared handles behind the operator API.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<CommandDispatcher>,
    pub breaker: Arc<CircuitBreaker>,
    pub rollback: Arc<RollbackManager>,
    pub supervisor: Arc<OptimizationSupervisor>,
    pub heartbeat: Arc<HeartbeatMonitor>,
    pub limits: PolicyHandle<SafetyLimits>,
    pub thresholds: PolicyHandle<CircuitBreakerThresholds>,
    pub store: Arc<PersistenceStore>,
    pub ctx: ControlContext,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ResponseError for ControlError {
    fn status_code(&self) -> StatusCode {
        match self {
            ControlError::Validation(_) | ControlError::Config(_) => StatusCode::BAD_REQUEST,
            ControlError::SafetyViolation(_) | ControlError::RiskRejection(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ControlError::NotFound { .. } => StatusCode::NOT_FOUND,
            ControlError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ControlError::Halted { .. }
            | ControlError::InvalidState(_)
            | ControlError::CircuitBreakerTrip(_) => StatusCode::CONFLICT,
            ControlError::Transport(_)
            | ControlError::TransientDispatch(_)
            | ControlError::PermanentDispatch { .. }
            | ControlError::Advisory(_) => StatusCode::BAD_GATEWAY,
            ControlError::Store(_) | ControlError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.code(),
            message: self.to_string(),
        })
    }
}

type ApiResult = Result<HttpResponse, ControlError>;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let report = state.heartbeat.get_health_status();
    let code = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    HttpResponse::build(code).json(report)
}

pub async fn metrics_handler() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::render())
}

// --- Commands ---

#[derive(Debug, Deserialize)]
pub struct SubmitCommandRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub strategy_id: String,
    #[serde(default)]
    pub target_executor: Option<String>,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub priority: CommandPriority,
    pub payload: CommandPayload,
    #[serde(default)]
    pub expiry_ms: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub sender: Option<String>,
}

impl SubmitCommandRequest {
    fn into_command(self, ctx: &ControlContext) -> TradeCommand {
        let mut command = TradeCommand::new(
            self.id.unwrap_or_else(|| ctx.id.new_id()),
            self.strategy_id,
            self.command_type,
            self.priority,
            self.payload,
            ctx.time.now(),
        )
        .with_sender(self.sender.unwrap_or_else(|| OPERATOR.to_string()));
        if let Some(target) = self.target_executor {
            command = command.with_target(target);
        }
        if let Some(ms) = self.expiry_ms {
            command = command.with_expiry_ms(ms);
        }
        if let Some(max) = self.max_retries {
            command = command.with_max_retries(max);
        }
        command
    }
}

pub async fn submit_command(
    state: web::Data<AppState>,
    body: web::Json<SubmitCommandRequest>,
) -> ApiResult {
    let command = body.into_inner().into_command(&state.ctx);
    let queued = state.dispatcher.submit(command)?;
    Ok(HttpResponse::Accepted().json(queued))
}

pub async fn get_command(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult {
    Ok(HttpResponse::Ok().json(state.dispatcher.status(&path)?))
}

pub async fn cancel_command(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult {
    Ok(HttpResponse::Ok().json(state.dispatcher.cancel(&path)?))
}

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    pub executor: Option<String>,
}

pub async fn pending_commands(
    state: web::Data<AppState>,
    query: web::Query<PendingQuery>,
) -> ApiResult {
    let pending = state.dispatcher.pending(query.executor.as_deref())?;
    Ok(HttpResponse::Ok().json(pending))
}

#[derive(Debug, Deserialize)]
pub struct EmergencyStopRequest {
    pub reason: String,
    #[serde(default)]
    pub initiated_by: Option<String>,
}

pub async fn emergency_stop(
    state: web::Data<AppState>,
    body: web::Json<EmergencyStopRequest>,
) -> ApiResult {
    if body.reason.trim().is_empty() {
        return Err(ControlError::Validation("Emergency stop requires a reason".into()));
    }
    let initiated_by = body.initiated_by.as_deref().unwrap_or(OPERATOR);
    let report = state.dispatcher.emergency_stop(&body.reason, initiated_by).await?;
    Ok(HttpResponse::Ok().json(report))
}

// --- Optimizations ---

#[derive(Debug, Deserialize)]
pub struct OptimizationQuery {
    pub strategy_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RunOptimizationRequest {
    pub strategy_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    #[serde(default)]
    pub approver: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReasonRequest {
    pub reason: String,
}

pub async fn list_optimizations(
    state: web::Data<AppState>,
    query: web::Query<OptimizationQuery>,
) -> ApiResult {
    let items = state.supervisor.optimizations(query.strategy_id.as_deref())?;
    Ok(HttpResponse::Ok().json(items))
}

pub async fn get_optimization(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult {
    Ok(HttpResponse::Ok().json(state.supervisor.optimization(&path)?))
}

pub async fn run_optimization(
    state: web::Data<AppState>,
    body: web::Json<RunOptimizationRequest>,
) -> ApiResult {
    let outcome = state
        .supervisor
        .run_optimization(&body.strategy_id, body.force)
        .await?;
    Ok(HttpResponse::Ok().json(outcome))
}

pub async fn approve_optimization(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ApproveRequest>,
) -> ApiResult {
    let approver = body.approver.as_deref().unwrap_or(OPERATOR);
    Ok(HttpResponse::Ok().json(state.supervisor.approve(&path, approver)?))
}

pub async fn reject_optimization(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ReasonRequest>,
) -> ApiResult {
    Ok(HttpResponse::Ok().json(state.supervisor.reject(&path, &body.reason)?))
}

pub async fn rollback_optimization(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ReasonRequest>,
) -> ApiResult {
    Ok(HttpResponse::Ok().json(state.rollback.rollback(&path, &body.reason)?))
}

// --- Policies ---

pub async fn get_limits(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.limits.current())
}

pub async fn update_limits(
    state: web::Data<AppState>,
    body: web::Json<SafetyLimits>,
) -> ApiResult {
    let updated = state.limits.update(body.into_inner())?;
    info!("🛡️ Safety limits updated by operator");
    Ok(HttpResponse::Ok().json(updated))
}

pub async fn get_thresholds(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.thresholds.current())
}

pub async fn update_thresholds(
    state: web::Data<AppState>,
    body: web::Json<CircuitBreakerThresholds>,
) -> ApiResult {
    let updated = state.thresholds.update(body.into_inner())?;
    info!("🛡️ Circuit breaker thresholds updated by operator");
    Ok(HttpResponse::Ok().json(updated))
}

// --- Anomalies and strategies ---

#[derive(Debug, Deserialize)]
pub struct AnomalyQuery {
    #[serde(default)]
    pub unresolved: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub resolution: String,
}

pub async fn list_anomalies(
    state: web::Data<AppState>,
    query: web::Query<AnomalyQuery>,
) -> ApiResult {
    Ok(HttpResponse::Ok().json(state.store.load_anomalies(query.unresolved)?))
}

pub async fn reset_anomaly(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ResetRequest>,
) -> ApiResult {
    Ok(HttpResponse::Ok().json(state.breaker.reset(&path, &body.resolution)?))
}

pub async fn snapshot_history(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult {
    Ok(HttpResponse::Ok().json(state.rollback.history(&path)?))
}

pub async fn rollback_history(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult {
    Ok(HttpResponse::Ok().json(state.rollback.rollback_history(&path)?))
}

#[derive(Debug, Serialize)]
struct ResumeResponse {
    strategy_id: String,
    resumed: bool,
}

pub async fn resume_strategy(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ReasonRequest>,
) -> ApiResult {
    let strategy_id = path.into_inner();
    let resumed = state
        .dispatcher
        .halt()
        .resume_strategy(&strategy_id, &body.reason)?;
    Ok(HttpResponse::Ok().json(ResumeResponse {
        strategy_id,
        resumed,
    }))
}

pub async fn resume_all(state: web::Data<AppState>, body: web::Json<ReasonRequest>) -> ApiResult {
    state.dispatcher.halt().resume_all(&body.reason)?;
    Ok(HttpResponse::Ok().json(state.dispatcher.halt().snapshot()))
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health_check)))
        .service(web::resource("/metrics").route(web::get().to(metrics_handler)))
        .service(web::resource("/commands").route(web::post().to(submit_command)))
        // registered before /commands/{id} so it is not captured as an id
        .service(web::resource("/commands/pending").route(web::get().to(pending_commands)))
        .service(
            web::resource("/commands/{id}")
                .route(web::get().to(get_command))
                .route(web::delete().to(cancel_command)),
        )
        .service(web::resource("/emergency-stop").route(web::post().to(emergency_stop)))
        .service(
            web::resource("/optimizations")
                .route(web::get().to(list_optimizations))
                .route(web::post().to(run_optimization)),
        )
        .service(web::resource("/optimizations/{id}").route(web::get().to(get_optimization)))
        .service(
            web::resource("/optimizations/{id}/approve")
                .route(web::post().to(approve_optimization)),
        )
        .service(
            web::resource("/optimizations/{id}/reject").route(web::post().to(reject_optimization)),
        )
        .service(
            web::resource("/optimizations/{id}/rollback")
                .route(web::post().to(rollback_optimization)),
        )
        .service(
            web::resource("/limits")
                .route(web::get().to(get_limits))
                .route(web::put().to(update_limits)),
        )
        .service(
            web::resource("/thresholds")
                .route(web::get().to(get_thresholds))
                .route(web::put().to(update_thresholds)),
        )
        .service(web::resource("/anomalies").route(web::get().to(list_anomalies)))
        .service(web::resource("/anomalies/{id}/reset").route(web::post().to(reset_anomaly)))
        .service(
            web::resource("/strategies/{id}/snapshots").route(web::get().to(snapshot_history)),
        )
        .service(
            web::resource("/strategies/{id}/rollbacks").route(web::get().to(rollback_history)),
        )
        .service(web::resource("/strategies/{id}/resume").route(web::post().to(resume_strategy)))
        .service(web::resource("/resume-all").route(web::post().to(resume_all)));
}
