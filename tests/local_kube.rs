//! Smoke tests against a reachable cluster (kubeconfig). Gated behind the
//! `test-local-kube` feature so CI without a cluster skips them.
#![cfg(feature = "test-local-kube")]

use function_name::named;
use kube_burner::executor::{JobExecutor, JobState, RunContext};
use kube_burner::io_models::BurnerConfig;
use kube_burner::io_models::job::{JobConfig, JobType, ObjectConfig};
use kube_burner::rest_mapper::RestMapper;
use kube_burner::runner::cleanup_namespaces;
use kube_burner::template::TemplateStore;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const POD_TEMPLATE: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: "{{ JobName }}-{{ Iteration }}-{{ Replica }}"
spec:
  containers:
    - name: app
      image: public.ecr.aws/docker/library/nginx:stable-alpine
"#;

#[tokio::test(flavor = "multi_thread")]
#[named]
async fn test_create_job_against_local_cluster() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let client = kube::Client::try_default().await?;
    let mapper = Arc::new(RestMapper::discover(&client).await?);
    let templates = Arc::new(TemplateStore::new(None).with_embedded([("pod.yml", POD_TEMPLATE)]));

    let config: BurnerConfig = serde_yaml::from_str("jobs: []")?;
    let ctx = RunContext::new(client.clone(), mapper, templates, &config);

    let namespace = format!(
        "{}-{:?}",
        function_name!().replace('_', "-"),
        SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs()
    );

    let job = JobConfig {
        name: "smoke".to_string(),
        job_type: JobType::Create,
        job_iterations: 2,
        namespace: namespace.clone(),
        qps: 10,
        burst: 10,
        max_wait_timeout: Duration::from_secs(120),
        objects: vec![ObjectConfig {
            object_template: "pod.yml".to_string(),
            replicas: 2,
            kind: "Pod".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };

    let mut executor = JobExecutor::new(ctx.clone(), job);
    let execution = executor.run().await?;

    assert_eq!(executor.state(), JobState::Complete);
    assert_eq!(execution.inventory.len(), 4);
    assert!(execution.errors.is_empty(), "errors: {:?}", execution.errors);

    cleanup_namespaces(&ctx.client, &ctx.uuid).await?;
    Ok(())
}
