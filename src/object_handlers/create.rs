use kube::api::{DynamicObject, PostParams};
use std::collections::BTreeMap;

use crate::errors::BurnerError;
use crate::object_handlers::api_for;
use crate::rest_mapper::MappedResource;

/// POST one rendered object to its GVR endpoint. The run's label triple is
/// merged into the manifest (template-provided labels are kept, ours win on
/// conflict). AlreadyExists is tolerated when the job is idempotent.
pub async fn create_object(
    client: &kube::Client,
    mapped: &MappedResource,
    namespace: Option<&str>,
    mut obj: DynamicObject,
    labels: &BTreeMap<String, String>,
    skip_exists: bool,
) -> Result<DynamicObject, BurnerError> {
    inject_labels(&mut obj, labels);

    let api = api_for(client, mapped, namespace);
    match api.create(&PostParams::default(), &obj).await {
        // hand back the labeled input, not the server echo: replaying the
        // echo would carry resourceVersion/uid and be rejected
        Ok(_) => Ok(obj),
        Err(e) => {
            let classified = BurnerError::from(e);
            if skip_exists && matches!(classified, BurnerError::Conflict { .. }) {
                debug!(
                    "{} {} already exists, configured as idempotent",
                    mapped.api_resource.kind,
                    obj.metadata.name.as_deref().unwrap_or("unnamed")
                );
                return Ok(obj);
            }
            Err(classified)
        }
    }
}

pub fn inject_labels(obj: &mut DynamicObject, labels: &BTreeMap<String, String>) {
    obj.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
}
