use kube::Api;
use kube::api::{DynamicObject, Patch, PatchParams};
use kube::core::ResourceExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::BurnerError;
use crate::io_models::job::PatchType;
use crate::object_handlers::{FIELD_MANAGER, api_for, list_by_selector, retry_transient};
use crate::rate_limiter::DispatchLimiter;
use crate::rest_mapper::MappedResource;

/// List objects matching the selector and PATCH each with the rendered
/// payload. Non-apply patch types convert the YAML payload to JSON;
/// `apply` ships the manifest through server-side apply under our field
/// manager. A 403 surfaces as `Forbidden`, which the executor treats as
/// fatal — retrying against broken credentials at storm scale only hides
/// the misconfiguration.
pub async fn patch_objects(
    client: &kube::Client,
    mapped: &MappedResource,
    namespace: Option<&str>,
    selector: &str,
    rendered: &str,
    patch_type: PatchType,
    limiter: &DispatchLimiter,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<usize, BurnerError> {
    let payload: serde_json::Value = serde_yaml::from_str(rendered).map_err(|e| BurnerError::Template {
        raw_error_message: format!("patch payload is not valid YAML: {e}"),
    })?;

    limiter.wait(cancel).await?;
    let listed = list_by_selector(client, mapped, namespace, selector, deadline, cancel).await?;
    let api = api_for(client, mapped, namespace);

    let mut patched = 0_usize;
    for item in listed {
        let name = item.name_any();
        limiter.wait(cancel).await?;
        retry_transient(deadline, cancel, || issue_patch(&api, &name, &payload, patch_type)).await?;
        patched += 1;
    }

    Ok(patched)
}

async fn issue_patch(
    api: &Api<DynamicObject>,
    name: &str,
    payload: &serde_json::Value,
    patch_type: PatchType,
) -> Result<(), BurnerError> {
    match patch_type {
        PatchType::Apply => {
            let mut params = PatchParams::apply(FIELD_MANAGER);
            params.force = true;
            api.patch(name, &params, &Patch::Apply(payload)).await?;
        }
        PatchType::Merge => {
            api.patch(name, &PatchParams::default(), &Patch::Merge(payload)).await?;
        }
        PatchType::Strategic => {
            api.patch(name, &PatchParams::default(), &Patch::Strategic(payload))
                .await?;
        }
        PatchType::Json => {
            let ops: json_patch::Patch =
                serde_json::from_value(payload.clone()).map_err(|e| BurnerError::Template {
                    raw_error_message: format!("payload is not a JSON patch op list: {e}"),
                })?;
            api.patch(name, &PatchParams::default(), &Patch::Json::<()>(ops)).await?;
        }
    }
    Ok(())
}

/// `apply` patches must be authored as YAML manifests; a payload that parses
/// as JSON is rejected before any dispatch happens.
pub fn validate_apply_source(template: &str) -> Result<(), BurnerError> {
    if serde_json::from_str::<serde_json::Value>(template.trim()).is_ok() {
        return Err(BurnerError::Template {
            raw_error_message: "apply patches require a YAML template, got JSON".to_string(),
        });
    }
    Ok(())
}
