use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::catalog::{CatalogClient, SessionManager, TryLockOutcome};
use crate::config::ControllerConfig;
use crate::controller::discovery::discover;
use crate::controller::job::{JobSpec, JobState};
use crate::engine::QueryEngine;
use crate::error::{ControllerError, Result};
use crate::query;

/// Drives the job lifecycle end to end: discovery, claiming, query rewrite,
/// execution and terminal state bookkeeping.
pub struct Controller<E> {
    catalog: CatalogClient,
    session: SessionManager,
    engine: E,
    retry_delay: Duration,
}

/// Why a discovery pass ended without an error.
enum CycleEnd {
    Shutdown,
    StreamClosed,
}

impl<E: QueryEngine> Controller<E> {
    pub fn new(
        catalog: CatalogClient,
        session: SessionManager,
        engine: E,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            catalog,
            session,
            engine,
            retry_delay: config.retry_delay,
        }
    }

    /// Runs until `shutdown` fires or the session cannot be restored.
    ///
    /// A transport failure anywhere in a discovery pass aborts that pass;
    /// the session is refreshed and discovery starts over. Faults of
    /// individual jobs never reach this level.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("controller started");
        loop {
            match self.run_cycle(&shutdown).await {
                Ok(CycleEnd::Shutdown) => {
                    tracing::info!("shutdown requested, controller stopping");
                    return Ok(());
                }
                Ok(CycleEnd::StreamClosed) => {
                    tracing::info!("event stream closed, restarting discovery");
                }
                Err(ControllerError::Auth(reason)) => {
                    tracing::error!(%reason, "catalog session cannot be restored");
                    return Err(ControllerError::Auth(reason));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "discovery pass aborted, refreshing session");
                    match self.session.refresh().await {
                        Ok(()) => {}
                        Err(ControllerError::Auth(reason)) => {
                            tracing::error!(%reason, "refresh token rejected");
                            return Err(ControllerError::Auth(reason));
                        }
                        Err(refresh_err) => {
                            tracing::warn!(error = %refresh_err, "session refresh failed, will retry");
                        }
                    }
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    /// One discovery pass: processes ids from the merged stream until it
    /// closes, shutdown fires or a transport failure aborts it.
    async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<CycleEnd> {
        let mut jobs = discover(&self.catalog).await?;
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return Ok(CycleEnd::Shutdown),
                next = jobs.next() => next,
            };
            match next {
                None => return Ok(CycleEnd::StreamClosed),
                Some(Err(err)) => return Err(err),
                Some(Ok(job_id)) => self.handle_discovered(&job_id).await?,
            }
        }
    }

    /// Claims and processes one discovered job. Faults of the job itself are
    /// recorded on the job; only connectivity errors propagate.
    async fn handle_discovered(&self, job_id: &str) -> Result<()> {
        let guard = match self.catalog.try_lock(job_id).await? {
            TryLockOutcome::Acquired(guard) => guard,
            TryLockOutcome::Held => {
                tracing::debug!(job_id, "lock held elsewhere, skipping");
                return Ok(());
            }
        };
        tracing::debug!(
            job_id,
            fencing_token = guard.fencing_token(),
            "job lock acquired"
        );

        let outcome = match self.process_job(job_id).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_job_failure() => {
                tracing::warn!(job_id, error = %err, "job failed");
                match self.set_state(job_id, JobState::Failed).await {
                    Ok(()) => Ok(()),
                    Err(update_err) if update_err.is_job_failure() => {
                        tracing::warn!(job_id, error = %update_err, "could not record FAILED state");
                        Ok(())
                    }
                    Err(update_err) => Err(update_err),
                }
            }
            Err(err) => Err(err),
        };
        guard.release();
        outcome
    }

    /// Runs one locked job: re-checks it is still pending, then moves it
    /// through RUNNING to FINISHED.
    async fn process_job(&self, job_id: &str) -> Result<()> {
        let resource = self.catalog.get_resource(job_id).await?;
        let spec = JobSpec::parse(&resource.data)
            .map_err(|e| ControllerError::Payload(format!("job {job_id}: {e}")))?;
        if spec.state != JobState::Pending {
            tracing::debug!(job_id, state = %spec.state, "job no longer pending, skipping");
            return Ok(());
        }

        tracing::info!(job_id, creator = %resource.creator_id, "executing job");
        self.set_state(job_id, JobState::Running).await?;
        let prepared =
            query::prepare(&self.catalog, &self.engine, &spec.sql, &resource.creator_id).await?;
        query::execute(
            &self.catalog,
            &self.engine,
            &prepared,
            &spec.target,
            &resource.creator_id,
        )
        .await?;
        self.set_state(job_id, JobState::Finished).await?;
        tracing::info!(job_id, "job finished");
        Ok(())
    }

    async fn set_state(&self, job_id: &str, state: JobState) -> Result<()> {
        let patch = serde_json::json!({ "state": state }).to_string();
        self.catalog.update_resource(job_id, patch).await?;
        tracing::debug!(job_id, state = %state, "job state recorded");
        Ok(())
    }
}
