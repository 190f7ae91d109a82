use kube::Api;
use kube::api::{DynamicObject, ListParams, ObjectList};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::BurnerError;
use crate::rest_mapper::MappedResource;

pub mod churn;
pub mod create;
pub mod delete;
pub mod kubevirt;
pub mod patch;
pub mod read;

/// Labels stamped on every created object; the selection key for churn,
/// delete and cleanup.
pub const LABEL_UUID: &str = "kube-burner-uuid";
pub const LABEL_JOB: &str = "kube-burner-job";
pub const LABEL_INDEX: &str = "kube-burner-index";
pub const LABEL_CHURN: &str = "kube-burner-churn";

/// Field manager identifier for server-side apply patches.
pub const FIELD_MANAGER: &str = "kube-burner";

/// One successfully created object, remembered for churn and teardown. The
/// stored manifest is the labeled one that was POSTed, so recreation is a
/// plain replay.
#[derive(Debug, Clone)]
pub struct CreatedObject {
    pub mapped: MappedResource,
    pub namespace: Option<String>,
    pub manifest: DynamicObject,
}

impl CreatedObject {
    pub fn name(&self) -> String {
        use kube::core::ResourceExt;
        self.manifest.name_any()
    }
}

pub fn run_labels(uuid: &str, job_name: &str, iteration: u32) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_UUID.to_string(), uuid.to_string()),
        (LABEL_JOB.to_string(), job_name.to_string()),
        (LABEL_INDEX.to_string(), iteration.to_string()),
    ])
}

pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn api_for(
    client: &kube::Client,
    mapped: &MappedResource,
    namespace: Option<&str>,
) -> Api<DynamicObject> {
    match (mapped.namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client.clone(), ns, &mapped.api_resource),
        _ => Api::all_with(client.clone(), &mapped.api_resource),
    }
}

/// Parse a rendered template into the schema-less object tree.
pub fn to_dynamic_object(rendered: &str) -> Result<DynamicObject, BurnerError> {
    let obj: DynamicObject = serde_yaml::from_str(rendered).map_err(|e| BurnerError::Template {
        raw_error_message: format!("rendered object is not a valid manifest: {e}"),
    })?;
    if obj.types.is_none() {
        return Err(BurnerError::Template {
            raw_error_message: "rendered object is missing apiVersion or kind".to_string(),
        });
    }
    Ok(obj)
}

/// Retry transient failures with exponential backoff until the deadline.
/// Everything else surfaces immediately.
pub(crate) async fn retry_transient<T, F, Fut>(
    deadline: Instant,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, BurnerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BurnerError>>,
{
    let mut delay = Duration::from_millis(500);
    loop {
        match op().await {
            Err(e) if e.is_transient() && Instant::now() + delay < deadline => {
                warn!("transient API failure, retrying in {delay:?}: {e}");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BurnerError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(Duration::from_secs(8));
            }
            other => return other,
        }
    }
}

/// List objects matching the selector, retrying transient failures.
pub async fn list_by_selector(
    client: &kube::Client,
    mapped: &MappedResource,
    namespace: Option<&str>,
    selector: &str,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<ObjectList<DynamicObject>, BurnerError> {
    let api = api_for(client, mapped, namespace);
    let params = ListParams::default().labels(selector);
    retry_transient(deadline, cancel, || {
        let api = api.clone();
        let params = params.clone();
        async move { api.list(&params).await.map_err(BurnerError::from) }
    })
    .await
}
