pub mod tasks;

use std::future::Future;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::config::StorageConfig;
use crate::store::SqliteStore;

/// Top of every hour.
pub const HEARTBEAT_CRON: &str = "0 0 * * * *";
/// Quarter past, away from the heartbeat.
pub const RETENTION_CRON: &str = "0 15 * * * *";

pub const HEARTBEAT_JOB: &str = "heartbeat";
pub const RETENTION_JOB: &str = "prune-mappings";

/// Background upkeep for the mirror: a liveness heartbeat and trimming of
/// the mappings table to the configured retention.
pub struct MaintenanceScheduler {
    inner: JobScheduler,
    jobs: Vec<&'static str>,
}

impl MaintenanceScheduler {
    /// Build the scheduler with every maintenance job the storage settings call for.
    pub async fn for_store(store: SqliteStore, storage: &StorageConfig) -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        let mut scheduler = Self {
            inner,
            jobs: Vec::new(),
        };

        scheduler
            .add_job(HEARTBEAT_CRON, HEARTBEAT_JOB, tasks::heartbeat)
            .await?;

        let keep = storage.mapping_retention;
        if keep == 0 {
            info!("Mapping retention disabled");
        } else {
            scheduler
                .add_job(RETENTION_CRON, RETENTION_JOB, move || {
                    let store = store.clone();
                    async move { tasks::prune_mappings(&store, keep).await }
                })
                .await?;
        }
        Ok(scheduler)
    }

    async fn add_job<F, Fut>(&mut self, cron_expr: &str, name: &'static str, task: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let fut = task();
            Box::pin(async move {
                info!("Running maintenance job: {}", name);
                fut.await;
            })
        })
        .with_context(|| format!("Failed to create maintenance job: {}", name))?;

        self.inner
            .add(job)
            .await
            .with_context(|| format!("Failed to add maintenance job: {}", name))?;

        self.jobs.push(name);
        info!("Maintenance job '{}' scheduled with cron: {}", name, cron_expr);
        Ok(())
    }

    /// Names of the registered jobs, in registration order.
    pub fn jobs(&self) -> &[&'static str] {
        &self.jobs
    }

    pub async fn start(&self) -> Result<()> {
        self.inner
            .start()
            .await
            .context("Failed to start maintenance scheduler")?;
        info!("Maintenance scheduler started ({} job(s))", self.jobs.len());
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .context("Failed to shutdown maintenance scheduler")?;
        info!("Maintenance scheduler stopped");
        Ok(())
    }
}
