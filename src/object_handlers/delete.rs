use kube::api::DeleteParams;
use kube::core::ResourceExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::BurnerError;
use crate::object_handlers::{api_for, list_by_selector, retry_transient};
use crate::rate_limiter::DispatchLimiter;
use crate::rest_mapper::MappedResource;

/// List by selector and DELETE each match. Propagation defaults to
/// Foreground so dependents are gone before the call is considered done;
/// an object already deleted by a concurrent invocation is not an error.
pub async fn delete_objects(
    client: &kube::Client,
    mapped: &MappedResource,
    namespace: Option<&str>,
    selector: &str,
    foreground: bool,
    limiter: &DispatchLimiter,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<usize, BurnerError> {
    limiter.wait(cancel).await?;
    let listed = list_by_selector(client, mapped, namespace, selector, deadline, cancel).await?;
    let api = api_for(client, mapped, namespace);
    let params = if foreground {
        DeleteParams::foreground()
    } else {
        DeleteParams::background()
    };

    let mut deleted = 0_usize;
    for item in listed {
        let name = item.name_any();
        limiter.wait(cancel).await?;
        let result = retry_transient(deadline, cancel, || {
            let api = api.clone();
            let params = params.clone();
            let name = name.clone();
            async move {
                api.delete(&name, &params).await.map_err(BurnerError::from)?;
                Ok(())
            }
        })
        .await;

        match result {
            Ok(()) => deleted += 1,
            Err(BurnerError::NotFound { .. }) => {
                debug!("{} {} already gone", mapped.api_resource.kind, name);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(deleted)
}

/// Delete a single named object, tolerating absence.
pub async fn delete_named(
    client: &kube::Client,
    mapped: &MappedResource,
    namespace: Option<&str>,
    name: &str,
    foreground: bool,
) -> Result<bool, BurnerError> {
    let api = api_for(client, mapped, namespace);
    let params = if foreground {
        DeleteParams::foreground()
    } else {
        DeleteParams::background()
    };
    match api.delete(name, &params).await {
        Ok(_) => Ok(true),
        Err(e) => match BurnerError::from(e) {
            BurnerError::NotFound { .. } => Ok(false),
            other => Err(other),
        },
    }
}
