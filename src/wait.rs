use kube::Api;
use kube::api::{DynamicObject, ListParams};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::BurnerError;
use crate::rate_limiter::DispatchLimiter;
use crate::rest_mapper::MappedResource;

/// How readiness is decided for the polled objects.
#[derive(Debug, Clone, Default)]
pub enum ReadyCheck {
    /// Kind-specific default predicate (Pod Running, readyReplicas, ...).
    #[default]
    KindDefault,
    /// `status.conditions[type=<0>].status == "True"`.
    Condition(String),
    /// `status.<path> == <value>`, dots in the path descend.
    StatusField { path: String, value: String },
}

#[derive(Debug, Clone)]
pub struct WaitTarget {
    pub mapped: MappedResource,
    /// Namespaces to poll; empty polls across the cluster.
    pub namespaces: Vec<String>,
    pub selector: String,
    pub check: ReadyCheck,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: u32,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_secs(1),
            multiplier: 2,
            cap: Duration::from_secs(15),
        }
    }
}

/// Polls listed objects until every one satisfies its readiness predicate,
/// the timeout elapses, or the run is cancelled. Polling requests go through
/// a dedicated limiter so they do not compete with mutation dispatch.
pub struct WaitEngine {
    client: kube::Client,
    limiter: DispatchLimiter,
    backoff: BackoffPolicy,
}

impl WaitEngine {
    pub fn new(client: kube::Client, limiter: DispatchLimiter) -> Self {
        WaitEngine {
            client,
            limiter,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(client: kube::Client, limiter: DispatchLimiter, backoff: BackoffPolicy) -> Self {
        WaitEngine { client, limiter, backoff }
    }

    /// On timeout the unmet resource count is reported back; the caller
    /// decides whether that is terminal.
    pub async fn wait_ready(&self, target: &WaitTarget, cancel: &CancellationToken) -> Result<(), BurnerError> {
        let deadline = Instant::now() + target.timeout;
        let mut interval = self.backoff.initial;
        let params = ListParams::default().labels(&target.selector);

        loop {
            match self.count_unmet(target, &params, cancel).await {
                Ok(0) => return Ok(()),
                Ok(unmet) => {
                    if Instant::now() >= deadline {
                        warn!(
                            "timed out waiting for {} {} object(s) matching {}",
                            unmet, target.mapped.api_resource.kind, target.selector
                        );
                        return Err(BurnerError::WaitTimeout { unmet });
                    }
                    debug!(
                        "{} {} object(s) matching {} not ready yet",
                        unmet, target.mapped.api_resource.kind, target.selector
                    );
                }
                Err(e) if e.is_transient() && Instant::now() < deadline => {
                    warn!("readiness poll failed, retrying: {e}");
                }
                Err(e) => return Err(e),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let sleep = interval.min(remaining);
            tokio::select! {
                _ = cancel.cancelled() => return Err(BurnerError::Cancelled),
                _ = tokio::time::sleep(sleep) => {}
            }
            interval = (interval * self.backoff.multiplier).min(self.backoff.cap);
        }
    }

    async fn count_unmet(
        &self,
        target: &WaitTarget,
        params: &ListParams,
        cancel: &CancellationToken,
    ) -> Result<usize, BurnerError> {
        let mut unmet = 0_usize;

        if target.namespaces.is_empty() {
            self.limiter.wait(cancel).await?;
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &target.mapped.api_resource);
            let list = api.list(params).await.map_err(BurnerError::from)?;
            unmet += list
                .items
                .iter()
                .filter(|obj| !is_ready(&target.mapped.api_resource.kind, &target.check, obj))
                .count();
        } else {
            for namespace in &target.namespaces {
                self.limiter.wait(cancel).await?;
                let api: Api<DynamicObject> =
                    Api::namespaced_with(self.client.clone(), namespace, &target.mapped.api_resource);
                let list = api.list(params).await.map_err(BurnerError::from)?;
                unmet += list
                    .items
                    .iter()
                    .filter(|obj| !is_ready(&target.mapped.api_resource.kind, &target.check, obj))
                    .count();
            }
        }

        Ok(unmet)
    }
}

/// Readiness predicate over the schema-less object tree.
pub fn is_ready(kind: &str, check: &ReadyCheck, obj: &DynamicObject) -> bool {
    match check {
        ReadyCheck::Condition(cond_type) => has_condition(&obj.data, cond_type, "True"),
        ReadyCheck::StatusField { path, value } => {
            let pointer = format!("/status/{}", path.replace('.', "/"));
            obj.data.pointer(&pointer).map(|v| json_eq(v, value)).unwrap_or(false)
        }
        ReadyCheck::KindDefault => match kind {
            "Pod" => pod_ready(&obj.data),
            "Deployment" | "ReplicaSet" | "StatefulSet" | "DaemonSet" => replicas_ready(&obj.data),
            "Job" => job_complete(&obj.data),
            "PersistentVolumeClaim" => phase_is(&obj.data, "Bound"),
            "VirtualMachineInstance" => phase_is(&obj.data, "Running"),
            // kinds without a readiness notion pass as soon as they exist
            _ => true,
        },
    }
}

fn phase_is(data: &Value, expected: &str) -> bool {
    data.pointer("/status/phase").and_then(Value::as_str) == Some(expected)
}

fn pod_ready(data: &Value) -> bool {
    if !phase_is(data, "Running") {
        return false;
    }
    match data.pointer("/status/containerStatuses").and_then(Value::as_array) {
        Some(statuses) => statuses
            .iter()
            .all(|s| s.get("ready").and_then(Value::as_bool).unwrap_or(false)),
        None => false,
    }
}

fn replicas_ready(data: &Value) -> bool {
    let ready = data
        .pointer("/status/readyReplicas")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    // DaemonSets have no spec.replicas; their desired count lives in status
    let desired = data
        .pointer("/spec/replicas")
        .or_else(|| data.pointer("/status/desiredNumberScheduled"))
        .and_then(Value::as_i64)
        .unwrap_or(1);
    ready == desired
}

fn job_complete(data: &Value) -> bool {
    let succeeded = data
        .pointer("/status/succeeded")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    succeeded >= 1 || has_condition(data, "Complete", "True")
}

fn has_condition(data: &Value, cond_type: &str, status: &str) -> bool {
    data.pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some(cond_type)
                    && c.get("status").and_then(Value::as_str) == Some(status)
            })
        })
        .unwrap_or(false)
}

fn json_eq(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(s) => s == expected,
        other => other.to_string() == expected,
    }
}
