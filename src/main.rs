use std::sync::Arc;

use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod business_time;
mod config;
mod db;
mod error;
mod routes;
mod services;

use business_time::{Clock, SystemClock};
use config::Config;
use services::analytics::{AnalyticsApi, AnalyticsClient};
use services::data::DataStrategy;
use services::notifications::NotificationManager;
use services::orchestrator::Orchestrator;
use services::scheduler::Scheduler;
use services::settings::ConfigStore;
use services::tracker::ExecutionTracker;
use services::webhook::ChatWebhookClient;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub settings: ConfigStore,
    pub clock: Arc<dyn Clock>,
    pub analytics: Arc<dyn AnalyticsApi>,
    pub data: Arc<DataStrategy>,
    pub manager: Arc<NotificationManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Scheduler,
}

#[derive(Parser)]
#[command(
    name = "fsoa-agent",
    version,
    about = "Field service operations assistant"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one pipeline pass and exit.
    RunOnce {
        /// Evaluate and create tasks but suppress outbound webhook calls.
        #[arg(long)]
        dry_run: bool,
    },
    /// Start the periodic scheduler together with the operator API.
    #[command(alias = "serve")]
    StartScheduler,
    /// Ask a running instance to stop its scheduler.
    StopScheduler {
        /// Base URL of the running instance's API.
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        api_url: String,
    },
    /// Print system health and exit nonzero when unhealthy.
    ShowHealth,
}

#[tokio::main]
async fn main() {
    let exit_code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run() -> anyhow::Result<i32> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fsoa_agent=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // stop-scheduler only talks to a running instance; no local state needed.
    if let Command::StopScheduler { api_url } = &cli.command {
        return stop_remote_scheduler(api_url).await;
    }

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Field Service Operations Assistant");

    let state = build_state(config).await?;

    match cli.command {
        Command::RunOnce { dry_run } => {
            let summary = state.orchestrator.execute(dry_run, "manual").await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(if summary.status == "completed" { 0 } else { 1 })
        }
        Command::ShowHealth => show_health(&state).await,
        Command::StartScheduler => serve(state).await,
        Command::StopScheduler { .. } => unreachable!("handled above"),
    }
}

async fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let pool = services::init::init_db(&config).await?;

    let clock: Arc<dyn Clock> =
        Arc::new(SystemClock::new(config.business.timezone_offset_hours)?);
    let settings = ConfigStore::new(pool.clone(), clock.clone());
    services::init::bootstrap_defaults(&pool, &config, &settings, &clock).await?;

    let analytics: Arc<dyn AnalyticsApi> = Arc::new(AnalyticsClient::new(&config.analytics)?);
    let webhook = Arc::new(ChatWebhookClient::new(&config.webhook)?);

    let data = Arc::new(DataStrategy::new(
        pool.clone(),
        analytics.clone(),
        settings.clone(),
        clock.clone(),
        config.analytics.report_id,
        config.business.timezone_offset_hours,
    ));
    let manager = Arc::new(NotificationManager::new(
        pool.clone(),
        settings.clone(),
        clock.clone(),
        config.webhook.internal_ops_url.clone(),
    ));
    let tracker = ExecutionTracker::new(pool.clone(), clock.clone());
    let orchestrator = Arc::new(Orchestrator::new(
        data.clone(),
        manager.clone(),
        tracker,
        webhook,
    ));
    let scheduler = Scheduler::new(orchestrator.clone(), settings.clone(), clock.clone());

    Ok(Arc::new(AppState {
        db: pool,
        config,
        settings,
        clock,
        analytics,
        data,
        manager,
        orchestrator,
        scheduler,
    }))
}

async fn serve(state: Arc<AppState>) -> anyhow::Result<i32> {
    state.scheduler.start().await?;

    // Build router
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/api/runs", routes::runs::router())
        .nest("/api/opportunities", routes::opportunities::router())
        .nest("/api/cache", routes::cache::router())
        .nest("/api/tasks", routes::tasks::router())
        .nest("/api/groups", routes::groups::router())
        .nest("/api/scheduler", routes::scheduler::router())
        .nest("/api/settings", routes::settings::router())
        .with_state(state.clone())
        // Add middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(0)
}

async fn show_health(state: &Arc<AppState>) -> anyhow::Result<i32> {
    let database = sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .is_ok();
    let analytics = state.analytics.test_connection().await;
    let webhook_configured = state.config.webhook.internal_ops_url.is_some()
        || matches!(
            db::GroupConfigRepository::list_all(&state.db).await,
            Ok(groups) if groups.iter().any(|g| g.enabled)
        );

    let status = if database && analytics && webhook_configured {
        "healthy"
    } else if database {
        "degraded"
    } else {
        "unhealthy"
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "status": status,
            "database": database,
            "analytics": analytics,
            "webhook_configured": webhook_configured,
        }))?
    );

    Ok(if status == "unhealthy" { 1 } else { 0 })
}

async fn stop_remote_scheduler(api_url: &str) -> anyhow::Result<i32> {
    let url = format!("{}/api/scheduler/stop", api_url.trim_end_matches('/'));
    let response = reqwest::Client::new().post(&url).send().await?;

    if response.status().is_success() {
        println!("Scheduler stopped");
        Ok(0)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        eprintln!("Failed to stop scheduler ({}): {}", status, body);
        Ok(1)
    }
}
