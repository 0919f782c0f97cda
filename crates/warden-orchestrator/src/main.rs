use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::{info, warn};
use warden_admin::PolicyAdminService;
use warden_archive::SqliteReplyArchive;
use warden_bus::MessageBus;
use warden_core::WardenConfig;
use warden_orchestrator::null_ports::{AlwaysLowRiskClassifier, EchoResponder, NullMemoryNotes, NullTelemetry};
use warden_orchestrator::ports::NullTypingNotifier;
use warden_orchestrator::service::{check_runtime_ready, spawn_policy_reload_task};
use warden_orchestrator::OrchestratorService;
use warden_pipeline::middleware::{
    AccessControlMiddleware, AdminCommandMiddleware, ArchiveMiddleware, DeduplicationMiddleware, IdeaCaptureMiddleware,
    InputSecurityMiddleware, NewChatNotifyMiddleware, NoReplyFilterMiddleware, NormalizationMiddleware, OutboundMiddleware,
    PolicyMiddleware, ReplyContextMiddleware, ResponderMiddleware,
};
use warden_pipeline::Pipeline;
use warden_policy::{load_policy, PolicyEngine};
use warden_scheduler::{HeartbeatEngine, JobStore, SchedulerEngine};
use warden_security::SecurityEngine;

/// Tool names the policy document is allowed to grant/deny access to. No
/// tool integrations are in scope here, but the policy schema validates
/// against a known set regardless, so we declare the empty-but-typed set a
/// real deployment would extend as adapters come online.
fn known_tools() -> HashSet<String> {
    HashSet::new()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warden=info".into()))
        .init();

    let config_path = std::env::var("WARDEN_CONFIG").ok();
    let config = WardenConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "config load failed, using defaults");
        WardenConfig::default()
    });

    let policy_path = PathBuf::from(&config.policy.path);
    let workspace = PathBuf::from(&config.policy.workspace);
    let apply_channels = config.policy.apply_channels.clone();
    let known_tools = known_tools();

    let policy_doc = load_policy(&policy_path).unwrap_or_else(|e| {
        warn!(error = %e, "policy load failed, using defaults");
        warden_policy::PolicyConfig::default()
    });
    let policy_engine = PolicyEngine::new(policy_doc, workspace.clone(), Some(apply_channels.clone()));
    if let Err(e) = policy_engine.validate(&known_tools) {
        anyhow::bail!("policy validation failed at startup, refusing to run: {e}");
    }
    let policy: Arc<ArcSwap<PolicyEngine>> = Arc::new(ArcSwap::from_pointee(policy_engine));

    let security = Arc::new(SecurityEngine::new(config.security.clone()));
    let archive: Arc<dyn warden_core::ReplyArchivePort> =
        Arc::new(SqliteReplyArchive::open(&config.archive.path, config.archive.retention_days)?);

    let admin_service = Arc::new(PolicyAdminService::new(
        policy_path.clone(),
        workspace.clone(),
        known_tools.clone(),
        apply_channels.iter().cloned().collect(),
        None,
    ));

    let pipeline = Pipeline::new(vec![
        Arc::new(NormalizationMiddleware),
        Arc::new(DeduplicationMiddleware::new(config.pipeline.dedup_ttl_seconds)),
        Arc::new(ArchiveMiddleware::new(archive.clone())),
        Arc::new(ReplyContextMiddleware::new(
            archive.clone(),
            config.pipeline.reply_context_window_limit,
            config.pipeline.reply_context_line_max_chars,
            config.pipeline.ambient_window_limit,
        )),
        Arc::new(AdminCommandMiddleware::new(admin_service.clone(), policy.clone())),
        Arc::new(PolicyMiddleware::new(policy.clone(), known_tools.clone())),
        Arc::new(IdeaCaptureMiddleware::new(security.clone())),
        Arc::new(AccessControlMiddleware::new(security.clone())),
        Arc::new(NewChatNotifyMiddleware::new(
            policy.clone(),
            None,
            PathBuf::from(&config.pipeline.seen_chats_path),
        )),
        Arc::new(NoReplyFilterMiddleware::new(security.clone())),
        Arc::new(InputSecurityMiddleware::new(
            security.clone(),
            Some(Arc::new(AlwaysLowRiskClassifier)),
            config.pipeline.input_block_emoji.clone(),
        )),
        Arc::new(ResponderMiddleware::new(Arc::new(EchoResponder))),
        Arc::new(OutboundMiddleware::new(
            Some(security.clone()),
            config.security.block_user_message.clone(),
            None,
            None,
            config.pipeline.tts_max_raw_bytes,
            None,
            Some(policy.clone()),
            config.pipeline.owner_alert_cooldown_seconds,
        )),
    ]);

    let bus = Arc::new(MessageBus::new(
        config.bus.inbound_capacity,
        config.bus.outbound_capacity,
        config.bus.reaction_capacity,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reload_task = spawn_policy_reload_task(
        policy.clone(),
        policy_path,
        workspace,
        apply_channels,
        known_tools,
        Duration::from_secs_f64(config.policy.reload_check_interval_seconds.max(1.0)),
        shutdown_rx.clone(),
    );

    let job_store = Arc::new(JobStore::load(format!("{}/jobs.json", config.data.dir))?);
    let scheduler = SchedulerEngine::new(job_store, bus.clone());
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));
    let heartbeat = HeartbeatEngine::new(bus.clone());
    let heartbeat_task = tokio::spawn(heartbeat.run(shutdown_rx.clone()));

    let dispatch_task = {
        let bus = bus.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { bus.dispatch_outbound(shutdown_rx).await })
    };
    let reaction_dispatch_task = {
        let bus = bus.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { bus.dispatch_reactions(shutdown_rx).await })
    };

    check_runtime_ready(None, false, false).await;

    let service = OrchestratorService::new(
        bus.clone(),
        pipeline,
        Arc::new(NullTypingNotifier),
        Arc::new(NullTelemetry),
        Arc::new(NullMemoryNotes),
        shutdown_rx.clone(),
    );

    info!("warden orchestrator starting");
    let run_task = tokio::spawn(service.run());

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(run_task, reload_task, scheduler_task, heartbeat_task, dispatch_task, reaction_dispatch_task);

    Ok(())
}
