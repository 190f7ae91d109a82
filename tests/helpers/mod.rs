//! A fake apiserver behind a real `kube::Client`: every request the engine
//! issues is recorded (with its receive time) and answered by a test-provided
//! router.

use http::{Request, Response};
use http_body_util::BodyExt;
use kube::client::Body;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tower_test::mock;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub body: Vec<u8>,
    pub at: Instant,
}

impl RecordedRequest {
    /// Request path without the query string.
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or(&self.uri)
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

pub type Router = Box<dyn Fn(&RecordedRequest) -> Response<Body> + Send + Sync>;

/// Spawn the fake apiserver; the returned log accumulates every call in
/// arrival order.
pub fn mock_client(router: Router) -> (kube::Client, Arc<Mutex<Vec<RecordedRequest>>>) {
    let (mock_service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
    let client = kube::Client::new(mock_service, "default");

    let log: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let log_writer = log.clone();

    tokio::spawn(async move {
        while let Some((request, send)) = handle.next_request().await {
            let (parts, body) = request.into_parts();
            let bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes().to_vec(),
                Err(_) => Vec::new(),
            };
            let recorded = RecordedRequest {
                method: parts.method.to_string(),
                uri: parts.uri.to_string(),
                body: bytes,
                at: Instant::now(),
            };
            let response = router(&recorded);
            log_writer.lock().unwrap().push(recorded);
            send.send_response(response);
        }
    });

    (client, log)
}

pub fn json_response(status: u16, body: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

/// Echo the posted manifest back, the way a creation succeeds.
pub fn echo_created(request: &RecordedRequest) -> Response<Body> {
    json_response(201, &request.json())
}

/// A Kubernetes Status failure body, so the client classifies the code.
pub fn status_error(code: u16, reason: &str) -> Response<Body> {
    json_response(
        code,
        &serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("{reason} by the fake apiserver"),
            "reason": reason,
            "code": code,
        }),
    )
}

pub fn status_ok() -> Response<Body> {
    json_response(
        200,
        &serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Success",
        }),
    )
}

/// A list response wrapping the given items.
pub fn object_list(items: Vec<serde_json::Value>) -> Response<Body> {
    json_response(
        200,
        &serde_json::json!({
            "apiVersion": "v1",
            "kind": "List",
            "metadata": {"resourceVersion": ""},
            "items": items,
        }),
    )
}

/// A running pod with every container ready.
pub fn ready_pod(name: &str, namespace: &str) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": name, "namespace": namespace},
        "status": {
            "phase": "Running",
            "containerStatuses": [{"ready": true}],
        },
    })
}

pub fn ready_deployment(name: &str, namespace: &str, replicas: i64) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name, "namespace": namespace},
        "spec": {"replicas": replicas},
        "status": {"readyReplicas": replicas},
    })
}
