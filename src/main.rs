use actix_web::{web, App, HttpServer};
use brain_control_rs::advisory::{HttpAdvisor, ParameterAdvisor};
use brain_control_rs::api::{self, AppState};
use brain_control_rs::auth_middleware::AuthMiddleware;
use brain_control_rs::circuit_breaker::{CircuitBreaker, TradingHalt};
use brain_control_rs::config::Settings;
use brain_control_rs::context::ControlContext;
use brain_control_rs::dispatcher::CommandDispatcher;
use brain_control_rs::error::ControlError;
use brain_control_rs::event_ingestor::EventIngestor;
use brain_control_rs::heartbeat::HeartbeatMonitor;
use brain_control_rs::metrics::OutcomeWindow;
use brain_control_rs::optimization::OptimizationSupervisor;
use brain_control_rs::parameter_validator::ParameterValidator;
use brain_control_rs::persistence::store::PersistenceStore;
use brain_control_rs::risk_policy::PolicyHandle;
use brain_control_rs::rollback::RollbackManager;
use brain_control_rs::safety_gate::SafetyGate;
use brain_control_rs::security::CommandSigner;
use brain_control_rs::transport::{NatsTransport, Transport};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║               BRAIN CONTROL RS                                ║");
    info!("║               Command Dispatch & Safety Control Plane         ║");
    info!("╚═══════════════════════════════════════════════════════════════╝");

    let settings = Settings::new()?;
    let ctx = ControlContext::new_system();

    // --- Persistence ---
    if let Some(parent) = std::path::Path::new(&settings.storage.path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = Arc::new(PersistenceStore::open(&settings.storage.path)?);
    info!(path = %settings.storage.path, "✅ Store opened");

    let limits = PolicyHandle::load(settings.limits.clone(), store.clone())?;
    let thresholds = PolicyHandle::load(settings.breaker.clone(), store.clone())?;
    let halt = TradingHalt::load(store.clone())?;

    // --- Transport ---
    let transport: Arc<dyn Transport> = Arc::new(
        NatsTransport::connect(&settings.transport.broadcast_url, &settings.transport.rpc_url)
            .await?,
    );

    let signer = match settings.security.hmac_secret.as_deref() {
        Some(secret) => Some(
            CommandSigner::new(secret, settings.security.timestamp_tolerance_secs)
                .map_err(ControlError::Config)?,
        ),
        None => {
            warn!("⚠️ HMAC secret not set, command envelopes go out unsigned");
            None
        }
    };

    // --- Core components ---
    let gate = Arc::new(SafetyGate::new(limits.clone(), ParameterValidator::default()));
    let outcomes = Arc::new(OutcomeWindow::new(Duration::from_secs(
        settings.heartbeat.error_window_secs,
    )));
    let dispatcher = Arc::new(CommandDispatcher::new(
        store.clone(),
        gate.clone(),
        transport.clone(),
        halt,
        signer,
        settings.dispatcher.clone(),
        outcomes,
        ctx.clone(),
    ));

    let recovered = dispatcher.recover_interrupted()?;
    if !recovered.is_empty() {
        warn!(count = recovered.len(), "♻️ Failed commands interrupted by the last shutdown");
    }

    let breaker = Arc::new(CircuitBreaker::new(
        store.clone(),
        thresholds.clone(),
        dispatcher.clone(),
        ctx.clone(),
    ));
    let rollback = Arc::new(RollbackManager::new(
        store.clone(),
        dispatcher.clone(),
        settings.rollback.clone(),
        ctx.clone(),
    ));

    let http_advisor = HttpAdvisor::new(settings.advisory.clone())?;
    if !http_advisor.is_configured() {
        warn!("⚠️ Advisory API key not set, optimization runs will fail");
    }
    let advisor: Arc<dyn ParameterAdvisor> = Arc::new(http_advisor);
    let supervisor = Arc::new(OptimizationSupervisor::new(
        store.clone(),
        gate,
        breaker.clone(),
        rollback.clone(),
        dispatcher.clone(),
        advisor,
        settings.optimization.clone(),
        Duration::from_secs(settings.advisory.timeout_secs),
        ctx.clone(),
    ));

    let heartbeat = Arc::new(HeartbeatMonitor::new(
        transport.clone(),
        dispatcher.clone(),
        settings.heartbeat.clone(),
        ctx.clone(),
    ));
    let ingestor = Arc::new(EventIngestor::new(
        transport.clone(),
        store.clone(),
        dispatcher.clone(),
        breaker.clone(),
    ));

    info!("✅ Core components initialized");

    // --- Background tasks ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if settings.transport.executor_ids.is_empty() {
        warn!("⚠️ No executors configured, commands will queue without dispatch");
    }
    for executor_id in &settings.transport.executor_ids {
        tasks.push(tokio::spawn(
            dispatcher
                .clone()
                .run_worker(executor_id.clone(), shutdown_rx.clone()),
        ));
    }
    tasks.push(tokio::spawn(ingestor.run(shutdown_rx.clone())));
    tasks.push(tokio::spawn(heartbeat.clone().start(shutdown_rx.clone())));
    tasks.push(tokio::spawn(supervisor.clone().run_monitor(
        Duration::from_secs(settings.optimization.monitor_interval_secs.max(1)),
        shutdown_rx.clone(),
    )));

    // --- Operator API ---
    let state = AppState {
        dispatcher,
        breaker,
        rollback,
        supervisor,
        heartbeat,
        limits,
        thresholds,
        store,
        ctx,
    };
    let api_key = settings.api.api_key.clone();
    if api_key.is_none() {
        warn!("⚠️ Operator API key not set, every protected route will return 401");
    }

    let addr = settings.api.bind.clone();
    info!("🚀 Starting operator API on {}", addr);

    HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        App::new()
            .wrap(AuthMiddleware::new(api_key.clone()))
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .configure(api::config)
    })
    .bind(&addr)?
    .run()
    .await?;

    info!("🛑 Operator API stopped, shutting down background tasks");
    if shutdown_tx.send(true).is_err() {
        error!("❌ Background tasks already gone");
    }
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task panicked: {}", e);
        }
    }

    info!("👋 Shutdown complete");
    Ok(())
}
