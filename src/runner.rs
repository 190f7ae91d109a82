use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Namespace;
use kube::Api;
use kube::api::{DeleteParams, ListParams};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::alerting::{AlertEvaluator, JobWindow};
use crate::errors::BurnerError;
use crate::executor::{JobExecutor, RunContext};
use crate::indexer::{IndexOpts, Indexer};
use crate::io_models::alert::Severity;
use crate::io_models::job::JobConfig;
use crate::object_handlers::LABEL_UUID;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_ALERT_CRITICAL: i32 = 3;

/// The one place fatal classifications funnel through. Production routes to
/// `ProcessExit`; tests inject a recorder.
pub trait FatalSink: Send + Sync {
    fn fatal(&self, exit_code: i32, reason: &str);
}

/// Terminates the process. Loud failure beats a silently corrupted
/// measurement run.
pub struct ProcessExit;

impl FatalSink for ProcessExit {
    fn fatal(&self, exit_code: i32, reason: &str) {
        error!("fatal: {reason}");
        std::process::exit(exit_code);
    }
}

/// Per-job record kept for later correlation by the alert evaluator, also
/// indexed as a `jobSummary` document.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub uuid: String,
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub churn_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub churn_end: Option<DateTime<Utc>>,
    pub error_count: usize,
    pub job_config: JobConfig,
}

impl JobSummary {
    fn window(&self) -> JobWindow {
        JobWindow {
            job_name: self.name.clone(),
            start: self.start,
            end: self.end,
            churn_start: self.churn_start,
            churn_end: self.churn_end,
        }
    }
}

/// Sequences jobs in declared order, owns global timing and namespace
/// lifecycle, and hands each job's window to the alert evaluator once the
/// last job is done.
pub struct Runner {
    ctx: RunContext,
    jobs: Vec<JobConfig>,
    indexer: Arc<dyn Indexer>,
    fatal: Arc<dyn FatalSink>,
    evaluator: Option<AlertEvaluator>,
    pre_cleanup: bool,
}

impl Runner {
    pub fn new(
        ctx: RunContext,
        jobs: Vec<JobConfig>,
        indexer: Arc<dyn Indexer>,
        fatal: Arc<dyn FatalSink>,
    ) -> Self {
        Runner {
            ctx,
            jobs,
            indexer,
            fatal,
            evaluator: None,
            pre_cleanup: false,
        }
    }

    pub fn with_alerting(mut self, evaluator: AlertEvaluator) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Delete leftovers from previous runs before dispatching anything.
    pub fn with_pre_cleanup(mut self) -> Self {
        self.pre_cleanup = true;
        self
    }

    pub async fn run(&self) -> Result<i32, BurnerError> {
        spawn_signal_handler(self.ctx.cancel.clone());

        if self.pre_cleanup {
            cleanup_namespaces(&self.ctx.client, &self.ctx.uuid).await?;
        }

        let mut summaries: Vec<JobSummary> = Vec::new();
        let mut error_count = 0_usize;
        let mut cleanup_requested = false;

        for job in &self.jobs {
            let start = Utc::now();
            let mut executor = JobExecutor::new(self.ctx.clone(), job.clone());

            let execution = match executor.run().await {
                Ok(execution) => execution,
                Err(BurnerError::Cancelled) => {
                    warn!("run cancelled during job {}", job.name);
                    return Ok(EXIT_ERROR);
                }
                Err(e) => {
                    error!("job {} aborted: {e}", job.name);
                    self.fatal.fatal(EXIT_ERROR, &e.to_string());
                    return Err(e);
                }
            };

            error_count += execution.errors.len();
            cleanup_requested |= job.cleanup;

            let summary = JobSummary {
                uuid: self.ctx.uuid.clone(),
                name: job.name.clone(),
                start,
                end: Utc::now(),
                churn_start: execution.churn.map(|c| c.start),
                churn_end: execution.churn.map(|c| c.end),
                error_count: execution.errors.len(),
                job_config: job.clone(),
            };
            self.index_summary(&summary).await;
            summaries.push(summary);

            if !job.job_pause.is_zero() {
                info!("pausing {:?} before the next job", job.job_pause);
                tokio::select! {
                    _ = self.ctx.cancel.cancelled() => return Ok(EXIT_ERROR),
                    _ = tokio::time::sleep(job.job_pause) => {}
                }
            }
        }

        if let Some(evaluator) = &self.evaluator {
            for summary in &summaries {
                match evaluator.evaluate_window(&summary.window()).await {
                    Ok(records) => {
                        error_count += records
                            .iter()
                            .filter(|r| r.severity == Severity::Error)
                            .count();
                    }
                    Err(BurnerError::AlertCritical { .. }) => {
                        // the fatal sink already fired; surface the code for
                        // callers whose sink does not exit
                        return Ok(EXIT_ALERT_CRITICAL);
                    }
                    Err(e) => {
                        error!("alert evaluation failed for job {}: {e}", summary.name);
                        error_count += 1;
                    }
                }
            }
        }

        if cleanup_requested {
            cleanup_namespaces(&self.ctx.client, &self.ctx.uuid).await?;
        }

        if error_count > 0 {
            warn!("run finished with {error_count} error(s)");
            Ok(EXIT_ERROR)
        } else {
            Ok(EXIT_SUCCESS)
        }
    }

    async fn index_summary(&self, summary: &JobSummary) {
        let doc = match serde_json::to_value(summary) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("cannot serialize summary for job {}: {e}", summary.name);
                return;
            }
        };
        let opts = IndexOpts {
            metric_name: "jobSummary".to_string(),
            job_name: Some(summary.name.clone()),
        };
        if let Err(e) = self.indexer.index(&[doc], &opts).await {
            warn!("cannot index summary for job {}: {e}", summary.name);
        }
    }
}

/// Bulk-delete every namespace this run labeled, in one collection call.
pub async fn cleanup_namespaces(client: &kube::Client, uuid: &str) -> Result<(), BurnerError> {
    let selector = format!("{LABEL_UUID}={uuid}");
    info!("deleting namespaces matching {selector}");

    let api: Api<Namespace> = Api::all(client.clone());
    let params = ListParams::default().labels(&selector);
    api.delete_collection(&DeleteParams::background(), &params)
        .await
        .map_err(BurnerError::from)?;
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!("cannot install SIGTERM handler: {e}");
                    let _ = ctrl_c.await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        warn!("termination signal received, cancelling outstanding work");
        cancel.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_serialization_shape() {
        let summary = JobSummary {
            uuid: "u1".to_string(),
            name: "storm".to_string(),
            start: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            end: DateTime::from_timestamp(1_700_000_600, 0).unwrap(),
            churn_start: None,
            churn_end: None,
            error_count: 0,
            job_config: JobConfig::default(),
        };

        let doc = serde_json::to_value(&summary).unwrap();
        assert_eq!(doc["uuid"], "u1");
        assert_eq!(doc["name"], "storm");
        assert!(doc.get("churnStart").is_none());
        assert!(doc["jobConfig"].is_object());
        assert_eq!(doc["jobConfig"]["qps"], 5);
    }

    #[test]
    fn test_exit_codes_are_stable() {
        assert_eq!(EXIT_SUCCESS, 0);
        assert_eq!(EXIT_ERROR, 1);
        assert_eq!(EXIT_ALERT_CRITICAL, 3);
    }
}
