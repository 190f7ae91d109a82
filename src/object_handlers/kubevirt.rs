use http::{Method, Request, header};
use kube::core::ResourceExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::BurnerError;
use crate::io_models::job::VmOp;
use crate::object_handlers::list_by_selector;
use crate::rate_limiter::DispatchLimiter;
use crate::rest_mapper::MappedResource;

/// KubeVirt lifecycle verbs live on the subresource API group, not on the
/// VirtualMachine resource itself.
const SUBRESOURCE_GROUP: &str = "subresources.kubevirt.io";
const SUBRESOURCE_VERSION: &str = "v1";

/// Dispatch a lifecycle subresource call against every targeted VM: either a
/// single VM by name or all VMs matching the selector. Volume operations
/// carry the rendered payload as their body, the rest send an empty one.
pub async fn kubevirt_ops(
    client: &kube::Client,
    mapped_vm: &MappedResource,
    namespace: &str,
    vm_name: Option<&str>,
    selector: &str,
    op: VmOp,
    payload: Option<&str>,
    limiter: &DispatchLimiter,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<usize, BurnerError> {
    let targets: Vec<String> = match vm_name {
        Some(name) => vec![name.to_string()],
        None => {
            limiter.wait(cancel).await?;
            let listed =
                list_by_selector(client, mapped_vm, Some(namespace), selector, deadline, cancel).await?;
            listed.iter().map(|vm| vm.name_any()).collect()
        }
    };

    let body = match payload {
        Some(rendered) => {
            // volume requests are authored as YAML templates, the API wants JSON
            let value: serde_json::Value = serde_yaml::from_str(rendered).map_err(|e| BurnerError::Template {
                raw_error_message: format!("subresource payload is not valid YAML: {e}"),
            })?;
            serde_json::to_vec(&value).map_err(|e| BurnerError::Template {
                raw_error_message: e.to_string(),
            })?
        }
        None => Vec::new(),
    };

    let mut dispatched = 0_usize;
    for vm in &targets {
        limiter.wait(cancel).await?;
        vm_subresource(client, namespace, vm, op, body.clone()).await?;
        dispatched += 1;
    }

    Ok(dispatched)
}

async fn vm_subresource(
    client: &kube::Client,
    namespace: &str,
    vm_name: &str,
    op: VmOp,
    body: Vec<u8>,
) -> Result<(), BurnerError> {
    let path = subresource_path(namespace, vm_name, op);
    let request = Request::builder()
        .method(Method::PUT)
        .uri(&path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .map_err(|e| BurnerError::Config {
            raw_error_message: format!("cannot build subresource request {path}: {e}"),
        })?;

    debug!("kubevirt {op} on {namespace}/{vm_name}");
    client.request_text(request).await.map_err(BurnerError::from)?;
    Ok(())
}

fn subresource_path(namespace: &str, vm_name: &str, op: VmOp) -> String {
    format!(
        "/apis/{SUBRESOURCE_GROUP}/{SUBRESOURCE_VERSION}/namespaces/{namespace}/virtualmachines/{vm_name}/{op}"
    )
}
