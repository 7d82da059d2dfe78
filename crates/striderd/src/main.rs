//! striderd — the Strider orchestrator daemon.
//!
//! Wires the core: state store, instance tracker, launch queue,
//! deployment executor, scheduler adapter, and the background loops
//! (unreachable reaper, storage compaction, reconciliation). The native
//! broker client attaches by implementing [`strider_driver::BrokerDriver`];
//! started standalone, the daemon wires a logging driver that records
//! every outbound call instead of sending it.
//!
//! # Usage
//!
//! ```text
//! striderd --data-dir /var/lib/strider
//! striderd --data-dir /var/lib/strider --max-instances-per-offer 10
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use strider_core::{SchedulerConfig, UnreachableStrategy};
use strider_deploy::{DeploymentExecutor, ExecutorConfig};
use strider_driver::{
    BrokerDriver, BrokerKiller, DriverResult, LocalLeadership, OfferFilters,
    ReconciliationLoop, SchedulerAdapter,
};
use strider_events::EventBus;
use strider_launch::{LaunchOperation, LaunchQueue};
use strider_state::{
    Compactor, DeploymentRepository, FrameworkIdRepository, GroupRepository, InstanceRepository,
    KvStore,
};
use strider_tracker::{InstanceTracker, TrackerConfig, UnreachableReaper};

#[derive(Parser)]
#[command(name = "striderd", about = "Strider orchestrator daemon")]
struct Cli {
    /// Data directory for persistent state.
    #[arg(long, default_value = "/var/lib/strider")]
    data_dir: PathBuf,

    /// Upper bound on instances launched per (offer, run spec).
    #[arg(long, default_value = "5")]
    max_instances_per_offer: u32,

    /// Budget per offer decision, in milliseconds.
    #[arg(long, default_value = "5000")]
    offer_matching_timeout: u64,

    /// Capacity of the instance tracker's update mailbox.
    #[arg(long, default_value = "1024")]
    instance_tracker_update_queue_size: usize,

    /// Writer shards in the instance tracker.
    #[arg(long, default_value = "16")]
    instance_tracker_num_parallel_updates: usize,

    /// Tracker query deadline, in milliseconds.
    #[arg(long, default_value = "1000")]
    instance_tracker_query_timeout: u64,

    /// Initial launch backoff in seconds.
    #[arg(long, default_value = "1")]
    default_backoff_seconds: u64,

    /// Backoff multiplier per failure.
    #[arg(long, default_value = "1.15")]
    default_backoff_factor: f64,

    /// Ceiling on the launch delay, in seconds.
    #[arg(long, default_value = "3600")]
    max_launch_delay_seconds: u64,

    /// Default minimum health capacity for upgrades.
    #[arg(long, default_value = "1.0")]
    default_minimum_health_capacity: f64,

    /// Default maximum over capacity for upgrades.
    #[arg(long, default_value = "1.0")]
    default_maximum_over_capacity: f64,

    /// Resident relaunch escalation timeout, in seconds.
    #[arg(long, default_value = "3600")]
    residency_relaunch_escalation_timeout: u64,

    /// Demote unreachable instances after this many seconds.
    #[arg(long, default_value = "300")]
    unreachable_inactive_after_seconds: u64,

    /// Expunge unreachable instances after this many seconds.
    #[arg(long, default_value = "600")]
    unreachable_expunge_after_seconds: u64,

    /// Versions retained per storage key.
    #[arg(long, default_value = "50")]
    max_versions: usize,

    /// Keys scanned per compaction step.
    #[arg(long, default_value = "64")]
    storage_compaction_scan_batch_size: usize,

    /// Seconds between compaction runs.
    #[arg(long, default_value = "300")]
    storage_compaction_interval: u64,

    /// Seconds between reconciliation rounds.
    #[arg(long, default_value = "600")]
    reconciliation_interval: u64,

    /// Delay before the first reconciliation after election.
    #[arg(long, default_value = "15")]
    reconciliation_initial_delay: u64,
}

impl Cli {
    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_instances_per_offer: self.max_instances_per_offer,
            offer_matching_timeout_millis: self.offer_matching_timeout,
            instance_tracker_update_queue_size: self.instance_tracker_update_queue_size,
            instance_tracker_num_parallel_updates: self.instance_tracker_num_parallel_updates,
            instance_tracker_query_timeout_millis: self.instance_tracker_query_timeout,
            default_backoff_seconds: self.default_backoff_seconds,
            default_backoff_factor: self.default_backoff_factor,
            max_launch_delay_seconds: self.max_launch_delay_seconds,
            default_minimum_health_capacity: self.default_minimum_health_capacity,
            default_maximum_over_capacity: self.default_maximum_over_capacity,
            residency_relaunch_escalation_timeout_seconds: self
                .residency_relaunch_escalation_timeout,
            unreachable_inactive_after_seconds: self.unreachable_inactive_after_seconds,
            unreachable_expunge_after_seconds: self.unreachable_expunge_after_seconds,
            max_versions: self.max_versions,
            storage_compaction_scan_batch_size: self.storage_compaction_scan_batch_size,
            storage_compaction_interval_seconds: self.storage_compaction_interval,
            reconciliation_interval_seconds: self.reconciliation_interval,
            reconciliation_initial_delay_seconds: self.reconciliation_initial_delay,
            ..SchedulerConfig::default()
        }
    }
}

/// Stand-in driver for standalone operation: records outbound calls in
/// the log instead of sending them to a master.
struct LoggingBrokerDriver;

#[async_trait]
impl BrokerDriver for LoggingBrokerDriver {
    async fn accept_offers(
        &self,
        offer_ids: &[String],
        operations: Vec<LaunchOperation>,
        _filters: OfferFilters,
    ) -> DriverResult<()> {
        info!(?offer_ids, operations = operations.len(), "accept_offers");
        Ok(())
    }
    async fn decline_offer(&self, offer_id: &str, _filters: OfferFilters) -> DriverResult<()> {
        info!(offer_id, "decline_offer");
        Ok(())
    }
    async fn kill_task(&self, task_id: &str) -> DriverResult<()> {
        info!(task_id, "kill_task");
        Ok(())
    }
    async fn reconcile_tasks(&self, task_ids: Vec<String>) -> DriverResult<()> {
        info!(count = task_ids.len(), "reconcile_tasks");
        Ok(())
    }
    async fn revive_offers(&self) -> DriverResult<()> {
        info!("revive_offers");
        Ok(())
    }
    async fn suppress_offers(&self) -> DriverResult<()> {
        info!("suppress_offers");
        Ok(())
    }
    async fn stop(&self, failover: bool) -> DriverResult<()> {
        info!(failover, "driver stop");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,striderd=debug,strider=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.scheduler_config();

    info!("strider daemon starting");

    // ── State store & repositories ─────────────────────────────────

    std::fs::create_dir_all(&cli.data_dir)?;
    let db_path = cli.data_dir.join("strider.redb");
    let store = KvStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let groups = GroupRepository::new(store.clone());
    let instances = InstanceRepository::new(store.clone());
    let deployments = DeploymentRepository::new(store.clone());
    let frameworks = FrameworkIdRepository::new(store.clone());

    // ── Core subsystems ────────────────────────────────────────────

    let bus = EventBus::new();
    let tracker = InstanceTracker::spawn(
        TrackerConfig::from_scheduler(&config),
        instances,
        bus.clone(),
    )?;
    info!("instance tracker started");

    let queue = LaunchQueue::new();
    let driver: Arc<dyn BrokerDriver> = Arc::new(LoggingBrokerDriver);
    let leadership = Arc::new(LocalLeadership::new(false));
    leadership.elect();

    let crash = Arc::new(|message: &str| {
        tracing::error!(message, "fatal scheduler error, failing stop");
        std::process::exit(1);
    });
    let adapter = SchedulerAdapter::new(
        config.clone(),
        tracker.clone(),
        queue.clone(),
        bus.clone(),
        driver.clone(),
        leadership.clone(),
        frameworks,
        groups.clone(),
        crash,
    );
    info!("scheduler adapter wired");

    let executor = DeploymentExecutor::new(
        tracker.clone(),
        queue.clone(),
        bus.clone(),
        deployments.clone(),
        Arc::new(BrokerKiller::new(driver.clone())),
        ExecutorConfig::default(),
    );
    let resumed = executor.resume_pending().await?;
    if resumed > 0 {
        info!(resumed, "persisted deployments resumed");
    }

    // ── Shutdown signal ────────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background loops ───────────────────────────────────────────

    // Unreachable reaper, resolving strategies from the live root.
    let reaper_groups = groups.clone();
    let inactive_after = config.unreachable_inactive_after_seconds;
    let expunge_after = config.unreachable_expunge_after_seconds;
    let reaper = UnreachableReaper::new(
        tracker.clone(),
        Arc::new(move |run_spec_id| {
            reaper_groups
                .root()
                .ok()
                .flatten()
                .and_then(|root| root.find_run_spec(run_spec_id).map(|s| s.unreachable))
                .unwrap_or(UnreachableStrategy::Enabled {
                    inactive_after_secs: inactive_after,
                    expunge_after_secs: expunge_after,
                })
        }),
        Duration::from_secs(30),
    );
    let reaper_shutdown = shutdown_rx.clone();
    let reaper_handle = tokio::spawn(async move { reaper.run(reaper_shutdown).await });

    // Storage compaction.
    let mut compactor = Compactor::new(
        store,
        deployments,
        config.max_versions,
        config.storage_compaction_scan_batch_size,
    );
    let compaction_interval = Duration::from_secs(config.storage_compaction_interval_seconds);
    let mut compaction_shutdown = shutdown_rx.clone();
    let compaction_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(compaction_interval) => {
                    if let Err(e) = compactor.run_once() {
                        tracing::warn!(error = %e, "compaction pass failed");
                    }
                }
                _ = compaction_shutdown.changed() => break,
            }
        }
    });

    // Task reconciliation.
    let reconciler = ReconciliationLoop::new(
        tracker,
        driver,
        groups,
        Duration::from_secs(config.reconciliation_interval_seconds),
        Duration::from_secs(config.reconciliation_initial_delay_seconds),
    );
    let reconcile_shutdown = shutdown_rx.clone();
    let reconcile_handle = tokio::spawn(async move { reconciler.run(reconcile_shutdown).await });

    // Keep the adapter's suppress/revive state aligned with demand.
    let interest_adapter = adapter.clone();
    let mut interest_shutdown = shutdown_rx;
    let interest_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => {
                    let _ = interest_adapter.sync_offer_interest().await;
                }
                _ = interest_shutdown.changed() => break,
            }
        }
    });

    info!("strider daemon running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = reaper_handle.await;
    let _ = compaction_handle.await;
    let _ = reconcile_handle.await;
    let _ = interest_handle.await;

    info!("strider daemon stopped");
    Ok(())
}
