use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::BurnerError;
use crate::object_handlers::list_by_selector;
use crate::rate_limiter::DispatchLimiter;
use crate::rest_mapper::MappedResource;

/// Exercise the list endpoint under load: one rate-limited LIST by selector,
/// returning how many objects came back.
pub async fn read_objects(
    client: &kube::Client,
    mapped: &MappedResource,
    namespace: Option<&str>,
    selector: &str,
    limiter: &DispatchLimiter,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<usize, BurnerError> {
    limiter.wait(cancel).await?;
    let listed = list_by_selector(client, mapped, namespace, selector, deadline, cancel).await?;
    Ok(listed.items.len())
}
