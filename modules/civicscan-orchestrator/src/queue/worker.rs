//! Broker worker: claims jobs from the broker and runs them through the
//! lifecycle manager with bounded concurrency.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use civicscan_common::JobStatus;

use super::broker::{BrokerClient, BrokerJob};
use crate::lifecycle::{ExecutionOutcome, JobLifecycleManager};

pub struct BrokerWorker {
    client: BrokerClient,
    lifecycle: Arc<JobLifecycleManager>,
    slots: Arc<Semaphore>,
    poll_interval: Duration,
}

impl BrokerWorker {
    pub fn new(
        client: BrokerClient,
        lifecycle: Arc<JobLifecycleManager>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            lifecycle,
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
            poll_interval,
        }
    }

    /// Claim and execute jobs until `shutdown` flips to true, then wait for
    /// in-flight executions to report back.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            concurrency = self.slots.available_permits(),
            "Broker worker started"
        );
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match self.client.claim().await {
                Ok(Some(job)) => {
                    in_flight.retain(|handle| !handle.is_finished());
                    in_flight.push(tokio::spawn(process(
                        self.client.clone(),
                        self.lifecycle.clone(),
                        job,
                        permit,
                    )));
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "Broker claim failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(in_flight = in_flight.len(), "Broker worker draining");
        join_all(in_flight).await;
        info!("Broker worker stopped");
    }
}

async fn process(
    client: BrokerClient,
    lifecycle: Arc<JobLifecycleManager>,
    job: BrokerJob,
    _permit: OwnedSemaphorePermit,
) {
    let job_id = job.data.job_id;
    debug!(job_id = %job_id, broker_id = job.id.as_str(), "Claimed job");

    let ack = match lifecycle.execute(job_id).await {
        Ok(ExecutionOutcome::Succeeded {
            result_count,
            artifact_count,
        }) => {
            client
                .complete(
                    &job.id,
                    json!({ "resultCount": result_count, "artifactCount": artifact_count }),
                )
                .await
        }
        Ok(ExecutionOutcome::Failed { error }) => client.fail(&job.id, &error).await,
        Ok(ExecutionOutcome::Skipped { status }) => match status {
            JobStatus::Succeeded => {
                info!(job_id = %job_id, "Redelivered job already succeeded");
                client.complete(&job.id, json!({ "redelivered": true })).await
            }
            JobStatus::Failed => {
                info!(job_id = %job_id, "Redelivered job already failed");
                client.fail(&job.id, "job already failed").await
            }
            JobStatus::Queued | JobStatus::Running => {
                debug!(job_id = %job_id, status = %status, "Job owned by another worker");
                Ok(())
            }
        },
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Job execution could not be recorded");
            let reason = format!("{e:#}");
            if let Err(e) = lifecycle.abandon(job_id, &reason).await {
                error!(job_id = %job_id, error = %e, "Could not release aborted job");
            }
            client.fail(&job.id, &reason).await
        }
    };

    if let Err(e) = ack {
        warn!(job_id = %job_id, error = %e, "Failed to report job result to broker");
    }
}
