//! Basalt daemon entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::RwLock;

use basalt::adapters::http::{
    CognitionOutbox, HttpBotClient, HttpCognitionStream, HttpDashboardSink, HttpSolverClient,
};
use basalt::adapters::postgres::{create_seed_pool, PostgresEventRepository};
use basalt::cli::{Cli, Commands};
use basalt::domain::models::action::ExecutorMode;
use basalt::domain::models::Config;
use basalt::domain::ports::{CognitionEvent, DashboardSink};
use basalt::infrastructure::config::ConfigLoader;
use basalt::infrastructure::logging;
use basalt::services::event_bus::EventPayload;
use basalt::services::{
    CircuitBreaker, EmergencyStop, EventBus, EventStoreHandle, Executor, ExecutorDeps,
    GoalBindingHooks, GoalResolver, PrereqInjector, ProtocolEffectsDrain, SterlingPlanner,
    TaskService, TaskServiceDeps, TaskStore, ThreatBridge, VerificationEngine,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };

    match cli.command {
        Commands::ConfigCheck => {
            println!("configuration ok");
            Ok(())
        }
        Commands::Start { mode, poll_ms } => {
            if let Some(mode) = mode {
                config.executor.mode = ExecutorMode::from_str(&mode)
                    .with_context(|| format!("invalid --mode {mode}"))?;
            }
            if let Some(poll_ms) = poll_ms {
                config.executor.poll_ms = poll_ms;
            }
            ConfigLoader::validate(&config).context("configuration invalid after overrides")?;
            run(config).await
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let _log_guard = logging::init(&config.logging);
    tracing::info!(
        mode = config.executor.mode.as_str(),
        world_seed = %config.world_seed,
        "Basalt starting"
    );

    // Event store: init failure disables persistence for the process.
    let (event_store, _writer) = if config.planning.event_store {
        match create_seed_pool(&config.endpoints.database_url, &config.world_seed, None).await {
            Ok(pool) => {
                let repository =
                    Arc::new(PostgresEventRepository::new(pool, config.world_seed.clone()));
                let (handle, writer) = EventStoreHandle::spawn(repository);
                (handle, Some(writer))
            }
            Err(err) => {
                tracing::warn!(error = %err, "Event store init failed; persistence disabled");
                (EventStoreHandle::disabled(), None)
            }
        }
    } else {
        (EventStoreHandle::disabled(), None)
    };

    // Adapters.
    let bot = Arc::new(
        HttpBotClient::new(config.endpoints.bot_url.clone()).context("bot client init failed")?,
    );
    let solver = Arc::new(
        HttpSolverClient::new(config.endpoints.solver_url.clone())
            .context("solver client init failed")?,
    );
    let dashboard: Arc<dyn DashboardSink> = Arc::new(
        HttpDashboardSink::new(config.endpoints.dashboard_url.clone())
            .context("dashboard sink init failed")?,
    );
    let cognition = Arc::new(
        HttpCognitionStream::new(config.endpoints.cognition_url.clone())
            .context("cognition stream init failed")?,
    );

    // Core wiring.
    let bus = EventBus::default();
    let store = Arc::new(RwLock::new(TaskStore::new()));
    let resolver = Arc::new(GoalResolver::new(store.clone(), bus.clone()));
    let planner = Arc::new(SterlingPlanner::new(solver.clone()).with_flags(
        config.planning.join_keys_deprecated_compat,
        config.planning.sterling_episode_debug,
    ));
    let hooks = GoalBindingHooks::new(config.goal_binding.enabled);

    let (drain_tx, drain_rx) = ProtocolEffectsDrain::channel();
    let service = TaskService::new(TaskServiceDeps {
        store,
        bus: bus.clone(),
        planner: planner.clone(),
        resolver,
        hooks,
        drain_tx,
        event_store,
        dashboard: Some(dashboard),
        bot: Some(bot.clone()),
        goal_resolver_enabled: config.goal_binding.enabled,
        strict_finalize: config.planning.strict_finalize,
    });
    let _drain = ProtocolEffectsDrain::spawn(service.clone(), drain_rx);

    // Emergency stop wired to SIGINT/SIGTERM.
    let (stop, stop_rx) = EmergencyStop::new();

    // Cognition outbox: forwards completion/failure events for review.
    let outbox = CognitionOutbox::new(cognition);
    let _outbox_flush = outbox.spawn_flush_loop(stop_rx.clone());
    {
        let outbox = outbox.clone();
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let (event_type, detail) = match &event.payload {
                    EventPayload::TaskCompleted { .. } => ("completed".to_string(), None),
                    EventPayload::TaskFailed { reason, .. } => {
                        ("failed".to_string(), reason.clone())
                    }
                    _ => continue,
                };
                if let Some(task_id) = event.payload.task_id() {
                    outbox
                        .push_event(CognitionEvent {
                            task_id,
                            event_type,
                            detail,
                            ts: event.timestamp,
                        })
                        .await;
                }
            }
        });
    }

    // Executor.
    let executor_handle = if config.executor.enabled {
        let executor = Executor::new(ExecutorDeps {
            service: service.clone(),
            bot: bot.clone(),
            verification: VerificationEngine::new(bot.clone(), config.verification.clone()),
            prereq: PrereqInjector::new(solver.clone()),
            threat: ThreatBridge::new(bot),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            executor_config: config.executor.clone(),
            budget_config: config.budget.clone(),
            stop_rx,
        });
        Some(tokio::spawn(executor.run()))
    } else {
        tracing::info!("Executor disabled; serving task APIs only");
        None
    };

    // Clean shutdown on SIGINT/SIGTERM.
    shutdown_signal().await;
    tracing::info!("Shutdown signal received; engaging emergency stop");
    stop.engage();

    if let Some(handle) = executor_handle {
        let _ = handle.await;
    }
    tracing::info!("Basalt stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
