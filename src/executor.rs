use k8s_openapi::api::core::v1::Namespace;
use kube::Api;
use kube::api::{ObjectMeta, PostParams};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::BurnerError;
use crate::io_models::BurnerConfig;
use crate::io_models::job::{ExecutionMode, JobConfig, JobType, ObjectConfig, VmOp};
use crate::object_handlers::churn::{ChurnStats, run_churn};
use crate::object_handlers::create::create_object;
use crate::object_handlers::delete::delete_objects;
use crate::object_handlers::kubevirt::kubevirt_ops;
use crate::object_handlers::patch::{patch_objects, validate_apply_source};
use crate::object_handlers::read::read_objects;
use crate::object_handlers::{
    CreatedObject, LABEL_JOB, LABEL_UUID, run_labels, selector_string, to_dynamic_object,
};
use crate::rate_limiter::DispatchLimiter;
use crate::rest_mapper::{MappedResource, RestMapper};
use crate::template::{MissingKeyPolicy, TemplateStore, TemplateVars};
use crate::wait::{ReadyCheck, WaitEngine, WaitTarget};

/// Everything a job needs from the surrounding run, threaded through by the
/// runner instead of living in process-wide state.
#[derive(Clone)]
pub struct RunContext {
    pub client: kube::Client,
    pub mapper: Arc<RestMapper>,
    pub templates: Arc<TemplateStore>,
    pub uuid: String,
    pub cancel: CancellationToken,
    pub wait_limiter: DispatchLimiter,
    pub missing_key_policy: MissingKeyPolicy,
}

impl RunContext {
    /// Fresh run identity over an established client; the wait-poller
    /// limiter is sized from the API client QPS/burst, not from any job's.
    pub fn new(
        client: kube::Client,
        mapper: Arc<RestMapper>,
        templates: Arc<TemplateStore>,
        config: &BurnerConfig,
    ) -> Self {
        RunContext {
            client,
            mapper,
            templates,
            uuid: uuid::Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
            wait_limiter: DispatchLimiter::new(config.client_qps, config.client_burst),
            missing_key_policy: MissingKeyPolicy::Error,
        }
    }

    pub fn with_missing_key_policy(mut self, policy: MissingKeyPolicy) -> Self {
        self.missing_key_policy = policy;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Init,
    Resolving,
    Running,
    Waiting,
    Complete,
    Aborted,
}

/// The atomic unit of work: one API call for one replica of one object at
/// one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaInvocation {
    pub object_index: usize,
    pub iteration: u32,
    pub replica: u32,
}

/// Outcome of one executed job; non-fatal per-invocation errors are tallied
/// here rather than failing the run.
#[derive(Debug)]
pub struct JobExecution {
    pub state: JobState,
    pub errors: Vec<BurnerError>,
    pub inventory: Vec<CreatedObject>,
    pub churn: Option<ChurnStats>,
}

struct ResolvedObject {
    config: ObjectConfig,
    mapped: MappedResource,
    /// Template source, loaded once per object per job.
    template: Option<String>,
}

struct JobShared {
    ctx: RunContext,
    job: JobConfig,
    limiter: DispatchLimiter,
    objects: Vec<ResolvedObject>,
    /// Guards the created-namespace set so concurrent invocations do not
    /// race duplicate creates.
    namespaces: tokio::sync::Mutex<HashSet<String>>,
}

pub struct JobExecutor {
    ctx: RunContext,
    job: JobConfig,
    state: JobState,
}

impl JobExecutor {
    pub fn new(ctx: RunContext, job: JobConfig) -> Self {
        JobExecutor {
            ctx,
            job,
            state: JobState::Init,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub async fn run(&mut self) -> Result<JobExecution, BurnerError> {
        info!(
            "running job {} ({:?}, {:?}): {} iteration(s) over {} object(s)",
            self.job.name,
            self.job.job_type,
            self.job.execution_mode,
            self.job.job_iterations,
            self.job.objects.len()
        );

        self.state = JobState::Resolving;
        let shared = match self.resolve().await {
            Ok(shared) => shared,
            Err(e) => {
                self.state = JobState::Aborted;
                return Err(e);
            }
        };
        self.state = JobState::Running;

        let mut execution = JobExecution {
            state: self.state,
            errors: Vec::new(),
            inventory: Vec::new(),
            churn: None,
        };

        let dispatch = match self.job.job_type {
            // check jobs only verify readiness of what is already there
            JobType::Check => Ok(()),
            _ => match self.job.execution_mode {
                ExecutionMode::Parallel => self.run_parallel(&shared, &mut execution).await,
                ExecutionMode::Sequential => self.run_sequential(&shared, &mut execution).await,
            },
        };

        if let Err(e) = dispatch {
            self.state = JobState::Aborted;
            execution.state = self.state;
            return Err(e);
        }

        // closing barrier passed, wait for post-conditions
        self.state = JobState::Waiting;
        let check_everything = matches!(self.job.job_type, JobType::Check)
            || (self.job.wait_when_finished
                && self.job.execution_mode == ExecutionMode::Parallel
                && self.job.job_type == JobType::Create);
        if check_everything {
            for object in &shared.objects {
                let namespaces = self.known_namespaces(&shared, object).await;
                if let Err(e) = self.wait_on_object(&shared, object, namespaces).await {
                    if e.is_fatal() || e == BurnerError::Cancelled {
                        self.state = JobState::Aborted;
                        execution.state = self.state;
                        return Err(e);
                    }
                    execution.errors.push(e);
                }
            }
        }

        if let (JobType::Create, Some(churn)) = (self.job.job_type, &self.job.churn) {
            if !execution.inventory.is_empty() {
                match run_churn(
                    &shared.ctx.client,
                    churn,
                    &execution.inventory,
                    &shared.limiter,
                    self.job.max_wait_timeout,
                    &shared.ctx.cancel,
                )
                .await
                {
                    Ok(stats) => execution.churn = Some(stats),
                    Err(e) if e.is_fatal() || e == BurnerError::Cancelled => {
                        self.state = JobState::Aborted;
                        execution.state = self.state;
                        return Err(e);
                    }
                    Err(e) => execution.errors.push(e),
                }
            }
        }

        self.state = JobState::Complete;
        execution.state = self.state;
        info!(
            "job {} complete: {} object(s) created, {} error(s)",
            self.job.name,
            execution.inventory.len(),
            execution.errors.len()
        );
        Ok(execution)
    }

    /// Map every GVR exactly once, load template sources, and make sure the
    /// first iteration's namespaces exist before anything dispatches.
    async fn resolve(&self) -> Result<Arc<JobShared>, BurnerError> {
        self.job.validate()?;

        let mut objects = Vec::with_capacity(self.job.objects.len());
        for config in &self.job.objects {
            let mapped = match self.job.job_type {
                JobType::Kubevirt => self.ctx.mapper.resolve("kubevirt.io/v1", "VirtualMachine")?,
                _ => self.ctx.mapper.resolve(&config.api_version, &config.kind)?,
            };

            let template = if needs_template(self.job.job_type, config) {
                let source = self.ctx.templates.get(&config.object_template)?;
                if self.job.job_type == JobType::Patch
                    && config.patch_type == crate::io_models::job::PatchType::Apply
                {
                    validate_apply_source(&source)?;
                }
                // probe render: template errors fail the job before any
                // dispatch happens
                self.ctx.templates.render_source(
                    &config.object_template,
                    &source,
                    TemplateVars {
                        iteration: 0,
                        replica: 0,
                        job_name: self.job.name.clone(),
                        uuid: self.ctx.uuid.clone(),
                        input_vars: config.input_vars.clone(),
                    },
                    self.ctx.missing_key_policy,
                )?;
                Some(source)
            } else {
                None
            };

            objects.push(ResolvedObject {
                config: config.clone(),
                mapped,
                template,
            });
        }

        let shared = Arc::new(JobShared {
            ctx: self.ctx.clone(),
            job: self.job.clone(),
            limiter: DispatchLimiter::new(self.job.qps, self.job.burst),
            objects,
            namespaces: tokio::sync::Mutex::new(HashSet::new()),
        });

        if self.job.job_type == JobType::Create
            && shared.objects.iter().any(|o| o.mapped.namespaced)
        {
            ensure_namespace(&shared, &namespace_for(&self.job, 0)).await?;
        }

        Ok(shared)
    }

    async fn run_parallel(
        &self,
        shared: &Arc<JobShared>,
        execution: &mut JobExecution,
    ) -> Result<(), BurnerError> {
        let mut join = JoinSet::new();
        for invocation in expand_invocations(&shared.job, &shared.objects.iter().map(|o| &o.config).collect::<Vec<_>>()) {
            let shared = shared.clone();
            join.spawn(async move { dispatch_invocation(shared, invocation).await });
        }
        self.barrier(&mut join, execution).await
    }

    async fn run_sequential(
        &self,
        shared: &Arc<JobShared>,
        execution: &mut JobExecution,
    ) -> Result<(), BurnerError> {
        for iteration in 0..self.job.job_iterations.max(1) {
            for (object_index, object) in shared.objects.iter().enumerate() {
                if object.config.run_once && iteration > 0 {
                    continue;
                }

                let mut join = JoinSet::new();
                for replica in 0..object.config.replicas {
                    let shared = shared.clone();
                    let invocation = ReplicaInvocation {
                        object_index,
                        iteration,
                        replica,
                    };
                    join.spawn(async move { dispatch_invocation(shared, invocation).await });
                }
                self.barrier(&mut join, execution).await?;

                if self.job.job_type == JobType::Create {
                    let namespaces = if object.mapped.namespaced {
                        vec![namespace_for(&self.job, iteration)]
                    } else {
                        Vec::new()
                    };
                    match self.wait_on_object(shared, object, namespaces).await {
                        Ok(()) => {}
                        Err(e) if e.is_fatal() || e == BurnerError::Cancelled => return Err(e),
                        Err(e) => execution.errors.push(e),
                    }
                }

                self.pause(self.job.object_delay).await?;
            }
            self.pause(self.job.job_iteration_delay).await?;
        }
        Ok(())
    }

    /// Join every outstanding invocation; fatal classifications abort the
    /// whole job, the rest land in the error tally.
    async fn barrier(
        &self,
        join: &mut JoinSet<Result<Option<CreatedObject>, BurnerError>>,
        execution: &mut JobExecution,
    ) -> Result<(), BurnerError> {
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(Ok(Some(created))) => execution.inventory.push(created),
                Ok(Ok(None)) => {}
                Ok(Err(e)) if e.is_fatal() || e == BurnerError::Cancelled => {
                    join.abort_all();
                    return Err(e);
                }
                Ok(Err(e)) => {
                    warn!("invocation failed: {e}");
                    execution.errors.push(e);
                }
                Err(join_err) => execution.errors.push(BurnerError::Config {
                    raw_error_message: format!("worker task failed: {join_err}"),
                }),
            }
        }
        Ok(())
    }

    async fn wait_on_object(
        &self,
        shared: &Arc<JobShared>,
        object: &ResolvedObject,
        namespaces: Vec<String>,
    ) -> Result<(), BurnerError> {
        let mapped = self.wait_resource(object)?;
        let selector = match self.job.job_type {
            // check jobs verify pre-existing objects picked by their own selector
            JobType::Check => selector_string(&object.config.label_selector),
            _ => selector_string(&BTreeMap::from([
                (LABEL_UUID.to_string(), self.ctx.uuid.clone()),
                (LABEL_JOB.to_string(), self.job.name.clone()),
            ])),
        };

        let target = WaitTarget {
            mapped,
            namespaces,
            selector,
            check: ready_check(&object.config),
            timeout: self.job.max_wait_timeout,
        };

        let engine = WaitEngine::new(self.ctx.client.clone(), self.ctx.wait_limiter.clone());
        engine.wait_ready(&target, &self.ctx.cancel).await
    }

    /// The kind polled for readiness: the object's own, unless the wait
    /// options redirect to another one (created Deployments, wait on Pods).
    fn wait_resource(&self, object: &ResolvedObject) -> Result<MappedResource, BurnerError> {
        match &object.config.wait_options.kind {
            None => Ok(object.mapped.clone()),
            Some(kind) => self
                .ctx
                .mapper
                .resolve(&object.config.api_version, kind)
                .or_else(|_| self.ctx.mapper.resolve("v1", kind)),
        }
    }

    async fn known_namespaces(&self, shared: &Arc<JobShared>, object: &ResolvedObject) -> Vec<String> {
        if !object.mapped.namespaced {
            return Vec::new();
        }
        let created = shared.namespaces.lock().await;
        let mut namespaces: Vec<String> = created.iter().cloned().collect();
        namespaces.sort();
        namespaces
    }

    async fn pause(&self, delay: Duration) -> Result<(), BurnerError> {
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => Err(BurnerError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

fn needs_template(job_type: JobType, config: &ObjectConfig) -> bool {
    match job_type {
        JobType::Create | JobType::Patch => true,
        JobType::Kubevirt => matches!(config.vm_op, Some(VmOp::AddVolume | VmOp::RemoveVolume)),
        JobType::Delete | JobType::Read | JobType::Check => false,
    }
}

/// Deterministic namespace assignment: one shared namespace, or batches of
/// `iterations_per_namespace` iterations when namespaced iterations are on.
pub fn namespace_for(job: &JobConfig, iteration: u32) -> String {
    let prefix = job.namespace_prefix();
    if job.namespaced_iterations {
        format!("{}-{}", prefix, iteration / job.iterations_per_namespace.max(1))
    } else {
        prefix.to_string()
    }
}

/// Expand iterations × objects × replicas into the invocation list.
pub fn expand_invocations(job: &JobConfig, objects: &[&ObjectConfig]) -> Vec<ReplicaInvocation> {
    let mut invocations = Vec::new();
    for (object_index, object) in objects.iter().enumerate() {
        let iterations = if object.run_once { 1 } else { job.job_iterations };
        for iteration in 0..iterations {
            for replica in 0..object.replicas {
                invocations.push(ReplicaInvocation {
                    object_index,
                    iteration,
                    replica,
                });
            }
        }
    }
    invocations
}

fn ready_check(config: &ObjectConfig) -> ReadyCheck {
    if let Some(condition) = &config.wait_options.for_condition {
        return ReadyCheck::Condition(condition.clone());
    }
    if let (Some(path), Some(value)) = (
        &config.wait_options.custom_status_path,
        &config.wait_options.custom_status_value,
    ) {
        return ReadyCheck::StatusField {
            path: path.clone(),
            value: value.clone(),
        };
    }
    ReadyCheck::KindDefault
}

/// Create the namespace on first use; the per-job mutex over the created set
/// keeps concurrent invocations from racing duplicate creates.
async fn ensure_namespace(shared: &Arc<JobShared>, name: &str) -> Result<(), BurnerError> {
    let mut created = shared.namespaces.lock().await;
    if created.contains(name) {
        return Ok(());
    }

    let labels = BTreeMap::from([
        (LABEL_UUID.to_string(), shared.ctx.uuid.clone()),
        (LABEL_JOB.to_string(), shared.job.name.clone()),
    ]);
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    };

    let api: Api<Namespace> = Api::all(shared.ctx.client.clone());
    match api.create(&PostParams::default(), &namespace).await {
        Ok(_) => debug!("created namespace {name}"),
        // already there, fine
        Err(kube::Error::Api(api_err)) if api_err.code == 409 => {}
        Err(e) => return Err(e.into()),
    }

    created.insert(name.to_string());
    Ok(())
}

async fn dispatch_invocation(
    shared: Arc<JobShared>,
    invocation: ReplicaInvocation,
) -> Result<Option<CreatedObject>, BurnerError> {
    let object = &shared.objects[invocation.object_index];
    let namespace = if object.mapped.namespaced {
        Some(namespace_for(&shared.job, invocation.iteration))
    } else {
        None
    };

    if shared.job.job_type == JobType::Create {
        if let Some(ns) = &namespace {
            ensure_namespace(&shared, ns).await?;
        }
    }

    let rendered = match &object.template {
        Some(template) => Some(shared.ctx.templates.render_source(
            &object.config.object_template,
            template,
            TemplateVars {
                iteration: invocation.iteration,
                replica: invocation.replica,
                job_name: shared.job.name.clone(),
                uuid: shared.ctx.uuid.clone(),
                input_vars: object.config.input_vars.clone(),
            },
            shared.ctx.missing_key_policy,
        )?),
        None => None,
    };

    let deadline = Instant::now() + shared.job.max_wait_timeout;
    let selector = selector_string(&object.config.label_selector);
    let cancel = &shared.ctx.cancel;

    match shared.job.job_type {
        JobType::Create => {
            let manifest = to_dynamic_object(rendered.as_deref().unwrap_or_default())?;
            let labels = run_labels(&shared.ctx.uuid, &shared.job.name, invocation.iteration);
            shared.limiter.wait(cancel).await?;
            let manifest = crate::object_handlers::retry_transient(deadline, cancel, || {
                create_object(
                    &shared.ctx.client,
                    &object.mapped,
                    namespace.as_deref(),
                    manifest.clone(),
                    &labels,
                    shared.job.skip_exists,
                )
            })
            .await?;
            Ok(Some(CreatedObject {
                mapped: object.mapped.clone(),
                namespace,
                manifest,
            }))
        }
        JobType::Patch => {
            patch_objects(
                &shared.ctx.client,
                &object.mapped,
                namespace.as_deref(),
                &selector,
                rendered.as_deref().unwrap_or_default(),
                object.config.patch_type,
                &shared.limiter,
                deadline,
                cancel,
            )
            .await?;
            Ok(None)
        }
        JobType::Delete => {
            delete_objects(
                &shared.ctx.client,
                &object.mapped,
                namespace.as_deref(),
                &selector,
                true,
                &shared.limiter,
                deadline,
                cancel,
            )
            .await?;
            Ok(None)
        }
        JobType::Read => {
            read_objects(
                &shared.ctx.client,
                &object.mapped,
                namespace.as_deref(),
                &selector,
                &shared.limiter,
                deadline,
                cancel,
            )
            .await?;
            Ok(None)
        }
        JobType::Kubevirt => {
            let ns = namespace.unwrap_or_else(|| shared.job.namespace_prefix().to_string());
            let vm_op = object.config.vm_op.ok_or_else(|| BurnerError::Config {
                raw_error_message: format!("job {}: kubevirt object without vmOp", shared.job.name),
            })?;
            kubevirt_ops(
                &shared.ctx.client,
                &object.mapped,
                &ns,
                object.config.vm_name.as_deref(),
                &selector,
                vm_op,
                rendered.as_deref(),
                &shared.limiter,
                deadline,
                cancel,
            )
            .await?;
            Ok(None)
        }
        JobType::Check => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(namespaced_iterations: bool, per_ns: u32) -> JobConfig {
        JobConfig {
            name: "storm".to_string(),
            namespace: "burn".to_string(),
            namespaced_iterations,
            iterations_per_namespace: per_ns,
            ..Default::default()
        }
    }

    #[test]
    fn test_namespace_assignment_shared() {
        let job = job(false, 1);
        assert_eq!(namespace_for(&job, 0), "burn");
        assert_eq!(namespace_for(&job, 9), "burn");
    }

    #[test]
    fn test_namespace_assignment_per_iteration_batches() {
        let job = job(true, 2);
        assert_eq!(namespace_for(&job, 0), "burn-0");
        assert_eq!(namespace_for(&job, 1), "burn-0");
        assert_eq!(namespace_for(&job, 2), "burn-1");
        assert_eq!(namespace_for(&job, 5), "burn-2");
    }

    #[test]
    fn test_namespace_prefix_defaults_to_job_name() {
        let mut job = job(false, 1);
        job.namespace = String::new();
        assert_eq!(namespace_for(&job, 0), "storm");
    }

    #[test]
    fn test_invocation_expansion_counts() {
        let mut job = job(false, 1);
        job.job_iterations = 10;
        let object = ObjectConfig {
            replicas: 5,
            kind: "Pod".to_string(),
            ..Default::default()
        };

        let invocations = expand_invocations(&job, &[&object]);
        assert_eq!(invocations.len(), 50);
        assert_eq!(
            invocations[0],
            ReplicaInvocation {
                object_index: 0,
                iteration: 0,
                replica: 0
            }
        );
        assert_eq!(invocations[49].iteration, 9);
        assert_eq!(invocations[49].replica, 4);
    }

    #[test]
    fn test_run_once_objects_expand_a_single_iteration() {
        let mut job = job(false, 1);
        job.job_iterations = 4;
        let every = ObjectConfig {
            replicas: 2,
            kind: "Pod".to_string(),
            ..Default::default()
        };
        let once = ObjectConfig {
            replicas: 2,
            kind: "Service".to_string(),
            run_once: true,
            ..Default::default()
        };

        let invocations = expand_invocations(&job, &[&every, &once]);
        let for_once = invocations.iter().filter(|i| i.object_index == 1).count();
        assert_eq!(invocations.len(), 8 + 2);
        assert_eq!(for_once, 2);
    }

    #[test]
    fn test_ready_check_selection() {
        let mut config = ObjectConfig::default();
        assert!(matches!(ready_check(&config), ReadyCheck::KindDefault));

        config.wait_options.custom_status_path = Some("phase".to_string());
        config.wait_options.custom_status_value = Some("Ready".to_string());
        assert!(matches!(ready_check(&config), ReadyCheck::StatusField { .. }));

        config.wait_options.for_condition = Some("Available".to_string());
        assert!(matches!(ready_check(&config), ReadyCheck::Condition(_)));
    }
}
