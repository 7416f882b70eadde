//! Wires the engine from config and runs the worker pool plus the
//! maintenance loop until shutdown.

use crate::config::{AutopilotConfig, QueueBackend};
use crate::notify::WebhookNotifier;
use anyhow::Result;
use ap_actions::ActionRegistry;
use ap_core::{
    AiProvider, ApprovalController, AuditLog, AutopilotListener, Breaker, CreditLedger,
    CreditScope, DecisionAction, DecisionGenerator, DecisionPipeline, EventBus, ExecutionReport,
    FsTargetStore, GeminiProvider, GuardState, NewTask, OpenAiProvider, ProviderManager,
    RateLimiter, RetryPolicy, ReviewPolicy, SnapshotService, SqliteStore, TargetStore,
    TaskExecutor, TaskQueue, Thresholds,
};
use ap_llm::{GeminiClient, HttpTransport, OpenAiClient, Transport};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MAINTENANCE_TICK: Duration = Duration::from_secs(30);

pub struct Autopilot {
    pub cfg: AutopilotConfig,
    pub store: SqliteStore,
    pub events: Arc<EventBus>,
    pub targets: Arc<dyn TargetStore>,
    pub ledger: CreditLedger,
    pub providers: Arc<ProviderManager>,
    pub pipeline: Arc<DecisionPipeline>,
    pub queue: TaskQueue,
    pub breaker: Arc<Breaker>,
    pub snapshots: SnapshotService,
    pub approvals: Arc<ApprovalController>,
    pub executor: Arc<TaskExecutor>,
    pub audit: Arc<AuditLog>,
}

impl Autopilot {
    pub fn build(cfg: AutopilotConfig) -> Result<Self> {
        let data_dir = cfg.data_dir_path();
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| anyhow::anyhow!("create data dir {}: {e}", data_dir.display()))?;

        let store = match cfg.queue.backend {
            QueueBackend::Sqlite => SqliteStore::open(&data_dir.join("autopilot.db"))?,
            QueueBackend::Memory => {
                tracing::warn!("queue.backend = memory; nothing survives a restart");
                SqliteStore::open_in_memory()?
            }
        };
        let targets: Arc<dyn TargetStore> = Arc::new(FsTargetStore::new(data_dir.join("targets"))?);
        let events = Arc::new(EventBus::new());

        let ledger = CreditLedger::new(Arc::new(store.clone()));
        ledger.ensure_grant(cfg.credits.global_grant, &CreditScope::Global)?;
        let limiter = Arc::new(RateLimiter::new(
            cfg.rate_limit.limit,
            cfg.rate_limit.window_seconds,
        ));
        let providers = Arc::new(ProviderManager::new(
            build_providers(&cfg),
            ledger.clone(),
            limiter,
        ));

        let pipeline = Arc::new(DecisionPipeline::new(
            DecisionGenerator::default(),
            Arc::new(store.clone()),
            events.clone(),
        ));
        let queue = TaskQueue::new(
            Arc::new(store.clone()),
            RetryPolicy::new(
                cfg.queue.max_attempts,
                cfg.queue.backoff_base_seconds,
                cfg.queue.backoff_max_seconds,
            ),
        );
        let breaker = Arc::new(
            Breaker::new(
                Arc::new(store.clone()),
                events.clone(),
                Thresholds {
                    min_confidence: cfg.reliability.min_confidence,
                    max_fail_rate: cfg.reliability.max_fail_rate,
                    min_sample: cfg.reliability.min_sample,
                },
            )
            .with_window_days(cfg.reliability.window_days)
            .with_confidence_baseline(cfg.reliability.confidence_baseline),
        );
        let snapshots = SnapshotService::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            targets.clone(),
            events.clone(),
        );
        let approvals = Arc::new(ApprovalController::new(
            Arc::new(store.clone()),
            queue.clone(),
            breaker.clone(),
            events.clone(),
            ReviewPolicy::new(cfg.review.operators.clone()),
        ));

        let registry = ActionRegistry::standard(
            targets.clone(),
            snapshots.clone(),
            providers.clone(),
            pipeline.clone(),
            CreditScope::Global,
        );
        let executor = Arc::new(
            TaskExecutor::new(
                queue.clone(),
                Arc::new(store.clone()),
                snapshots.clone(),
                breaker.clone(),
                events.clone(),
                Arc::new(registry),
            )
            .with_timeout(Duration::from_secs(cfg.queue.task_timeout_seconds.max(1))),
        );

        let audit = Arc::new(AuditLog::new(Arc::new(store.clone())));
        events.subscribe(audit.clone());
        events.subscribe(Arc::new(AutopilotListener::new(
            approvals.clone(),
            breaker.clone(),
        )));
        if let Some(url) = cfg.notify.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
            let notifier = WebhookNotifier::new(
                url,
                cfg.notify.webhook_token.as_deref(),
                Duration::from_secs(cfg.notify.timeout_seconds.max(1)),
            )?;
            events.subscribe(Arc::new(notifier));
        }

        tracing::info!(
            data_dir = %data_dir.display(),
            queue_backend = ?cfg.queue.backend,
            providers = ?providers.provider_names(),
            listeners = events.listener_count(),
            emergency_stop = cfg.general.emergency_stop,
            safe_mode = cfg.general.safe_mode,
            "autopilot assembled"
        );

        Ok(Self {
            cfg,
            store,
            events,
            targets,
            ledger,
            providers,
            pipeline,
            queue,
            breaker,
            snapshots,
            approvals,
            executor,
            audit,
        })
    }

    /// Config switches merged with the persisted pause state.
    pub fn guard(&self) -> Result<GuardState> {
        let base = GuardState::running()
            .with_emergency_stop(self.cfg.general.emergency_stop)
            .with_safe_mode(self.cfg.general.safe_mode);
        Ok(self.breaker.guard(base)?)
    }

    /// Grant the configured per-actor credits the first time an actor is seen.
    pub fn ensure_actor_grant(&self, actor: &str) -> Result<()> {
        if self.cfg.credits.actor_grant > 0 {
            self.ledger
                .ensure_grant(self.cfg.credits.actor_grant, &CreditScope::actor(actor))?;
        }
        Ok(())
    }

    /// Runs until ctrl-c.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let recovered = self.recover_stale()?;
        tracing::info!(recovered, "startup lease recovery complete");

        let shutdown = CancellationToken::new();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for worker in 0..self.cfg.queue.concurrency {
            handles.push(self.clone().spawn_worker(worker, shutdown.child_token()));
        }
        handles.push(self.clone().spawn_maintenance(shutdown.child_token())?);
        tracing::info!(
            workers = self.cfg.queue.concurrency,
            batch_size = self.cfg.queue.batch_size,
            "autopilot serving"
        );

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("listen for ctrl-c: {e}"))?;
        tracing::info!("shutdown requested");
        shutdown.cancel();

        let joined = tokio::time::timeout(
            Duration::from_secs(10),
            futures_util::future::join_all(handles),
        )
        .await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "background task join failed");
                    }
                }
            }
            Err(_) => tracing::warn!("timed out waiting for background tasks to stop"),
        }
        Ok(())
    }

    fn recover_stale(&self) -> Result<usize> {
        let lease = chrono::Duration::seconds(self.cfg.queue.lease_timeout_seconds as i64);
        Ok(self.queue.recover_stale(lease)?)
    }

    /// One worker pass. Returns how many tasks were run.
    pub async fn work_once(&self) -> Result<usize> {
        let guard = self.guard()?;
        let reports = self
            .executor
            .run_batch(&guard, self.cfg.queue.batch_size)
            .await?;
        for report in &reports {
            match report {
                ExecutionReport::Executed { task_id, snapshot_id, .. } => {
                    tracing::info!(task_id = %task_id, snapshot_id = ?snapshot_id, "task executed");
                }
                ExecutionReport::Retrying { task_id, attempts, available_at, error } => {
                    tracing::warn!(task_id = %task_id, attempts, %available_at, error = %error, "task will retry");
                }
                ExecutionReport::Dead { task_id, attempts, error } => {
                    tracing::error!(task_id = %task_id, attempts, error = %error, "task dead-lettered");
                }
            }
        }
        Ok(reports.len())
    }

    fn spawn_worker(self: Arc<Self>, worker: usize, shutdown: CancellationToken) -> JoinHandle<()> {
        let idle = Duration::from_millis(self.cfg.queue.poll_interval_ms.max(10));
        tokio::spawn(async move {
            loop {
                let ran = match self.work_once().await {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::error!(worker, error = %e, "worker pass failed");
                        0
                    }
                };
                if ran > 0 && !shutdown.is_cancelled() {
                    continue;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!(worker, "worker received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        })
    }

    fn spawn_maintenance(self: Arc<Self>, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let schedule = self.cfg.cleanup_schedule()?;
        let mut next_cleanup = next_fire(&schedule, Utc::now());
        tracing::info!(next_cleanup = ?next_cleanup, "maintenance loop scheduled");
        Ok(tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_TICK);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("maintenance loop received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {}
                }
                let now = Utc::now();
                match self.recover_stale() {
                    Ok(0) => {}
                    Ok(n) => tracing::warn!(recovered = n, "recovered expired task leases"),
                    Err(e) => tracing::error!(error = %e, "lease recovery failed"),
                }
                if let Err(e) = self.breaker.evaluate().await {
                    tracing::error!(error = %e, "breaker evaluation failed");
                }
                let Some(due) = next_cleanup.filter(|due| *due <= now) else {
                    continue;
                };
                match self.enqueue_cleanup(due) {
                    Ok(task_id) => tracing::info!(task_id = %task_id, "snapshot cleanup enqueued"),
                    Err(e) => tracing::error!(error = %e, "snapshot cleanup enqueue failed"),
                }
                next_cleanup = next_fire(&schedule, now);
            }
        }))
    }

    /// Keyed by the scheduled fire time, so a tick replayed after a restart
    /// does not queue a second cleanup.
    pub fn enqueue_cleanup(&self, due: DateTime<Utc>) -> Result<String> {
        let payload = serde_json::to_value(DecisionAction::CleanupSnapshots {
            keep_latest: self.cfg.snapshots.keep_latest,
        })?;
        let task = NewTask::new("cleanup_snapshots", payload)
            .with_idempotency_key(format!("cleanup_snapshots:{}", due.timestamp()));
        Ok(self.queue.enqueue(task)?)
    }
}

fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

fn build_providers(cfg: &AutopilotConfig) -> Vec<Arc<dyn AiProvider>> {
    let p = &cfg.providers;
    let mode = match p.proxy_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => Transport::Proxy {
            url: url.to_string(),
            token: p
                .proxy_token
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        },
        None => Transport::Direct,
    };
    let transport = HttpTransport::new(Duration::from_secs(p.timeout_seconds), mode);

    let mut out: Vec<Arc<dyn AiProvider>> = Vec::new();
    for name in &p.order {
        match name.as_str() {
            "openai" => {
                let mut client = OpenAiClient::new(
                    transport.clone(),
                    cfg.keys.openai_api_key.as_deref(),
                    &p.openai_model,
                );
                if let Some(endpoint) = p.openai_endpoint.as_deref() {
                    client = client.with_endpoint(endpoint);
                }
                out.push(Arc::new(OpenAiProvider::new(client)));
            }
            "gemini" => {
                let mut client = GeminiClient::new(
                    transport.clone(),
                    cfg.keys.gemini_api_key.as_deref(),
                    &p.gemini_model,
                );
                if let Some(endpoint) = p.gemini_endpoint.as_deref() {
                    client = client.with_endpoint(endpoint);
                }
                out.push(Arc::new(GeminiProvider::new(client)));
            }
            other => tracing::warn!(provider = other, "unknown provider in order; skipped"),
        }
    }
    out
}
