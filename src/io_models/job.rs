use duration_str::deserialize_duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use strum_macros::EnumString;

use crate::errors::BurnerError;

#[derive(Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Hash, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    #[default]
    Create,
    Patch,
    Delete,
    Read,
    Kubevirt,
    Check,
}

#[derive(Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Hash, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Parallel,
    Sequential,
}

#[derive(Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Hash, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    Json,
    Merge,
    #[default]
    Strategic,
    Apply,
}

/// KubeVirt lifecycle verbs, dispatched as subresource calls on a VM.
#[derive(Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Hash, Debug, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum VmOp {
    Start,
    Stop,
    Restart,
    Pause,
    Unpause,
    Migrate,
    AddVolume,
    RemoveVolume,
}

impl Display for VmOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmOp::Start => "start",
            VmOp::Stop => "stop",
            VmOp::Restart => "restart",
            VmOp::Pause => "pause",
            VmOp::Unpause => "unpause",
            VmOp::Migrate => "migrate",
            VmOp::AddVolume => "addvolume",
            VmOp::RemoveVolume => "removevolume",
        };
        f.write_str(s)
    }
}

/// Per-object override of what the wait engine polls for.
#[derive(Serialize, Deserialize, Clone, Eq, PartialEq, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WaitOptions {
    /// Wait on this kind instead of the object's own (e.g. created Deployments
    /// but wait on Pods).
    pub kind: Option<String>,
    /// Readiness means `status.conditions[type=<forCondition>].status == "True"`.
    pub for_condition: Option<String>,
    /// Readiness means `status.<customStatusPath> == <customStatusValue>`.
    pub custom_status_path: Option<String>,
    pub custom_status_value: Option<String>,
}

/// Periodic delete-and-recreate of a fraction of the job's created objects.
#[derive(Serialize, Deserialize, Clone, Eq, PartialEq, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct ChurnConfig {
    /// Percentage of the created inventory recycled per cycle.
    pub percent: u32,
    /// Interval between churn cycles.
    #[serde(deserialize_with = "deserialize_duration")]
    pub delay: Duration,
    /// Number of cycles; 0 means derive from `duration / delay`.
    pub cycles: u32,
    /// Total churn window when `cycles` is 0.
    #[serde(deserialize_with = "deserialize_duration")]
    pub duration: Duration,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        ChurnConfig {
            percent: 10,
            delay: Duration::from_secs(120),
            cycles: 0,
            duration: Duration::from_secs(3600),
        }
    }
}

impl ChurnConfig {
    pub fn effective_cycles(&self) -> u32 {
        if self.cycles > 0 {
            return self.cycles;
        }
        if self.delay.is_zero() {
            return 0;
        }
        (self.duration.as_secs() / self.delay.as_secs().max(1)) as u32
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectConfig {
    /// Template path or embedded key resolved through the template store.
    pub object_template: String,
    pub replicas: u32,
    pub kind: String,
    pub api_version: String,
    /// Extra template variables; these win over the reserved ones on conflict.
    pub input_vars: BTreeMap<String, serde_json::Value>,
    /// Selection key for patch/delete/read/kubevirt/check jobs.
    pub label_selector: BTreeMap<String, String>,
    pub patch_type: PatchType,
    pub wait_options: WaitOptions,
    /// Dispatch a single replica at iteration 0 instead of one per iteration.
    pub run_once: bool,
    /// Required for kubevirt jobs.
    pub vm_op: Option<VmOp>,
    /// Target a single VM by name instead of by selector.
    pub vm_name: Option<String>,
}

impl Default for ObjectConfig {
    fn default() -> Self {
        ObjectConfig {
            object_template: String::new(),
            replicas: 1,
            kind: String::new(),
            api_version: "v1".to_string(),
            input_vars: BTreeMap::new(),
            label_selector: BTreeMap::new(),
            patch_type: PatchType::default(),
            wait_options: WaitOptions::default(),
            run_once: false,
            vm_op: None,
            vm_name: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct JobConfig {
    pub name: String,
    pub job_type: JobType,
    pub job_iterations: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    pub job_iteration_delay: Duration,
    /// Pause after the job completes, before the next one starts.
    #[serde(deserialize_with = "deserialize_duration")]
    pub job_pause: Duration,
    /// Namespace name, or prefix when `namespaced_iterations` is set.
    /// Defaults to the job name.
    pub namespace: String,
    pub namespaced_iterations: bool,
    pub iterations_per_namespace: u32,
    pub qps: u32,
    pub burst: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    pub max_wait_timeout: Duration,
    pub wait_when_finished: bool,
    pub churn: Option<ChurnConfig>,
    pub execution_mode: ExecutionMode,
    pub cleanup: bool,
    /// Treat AlreadyExists as success on create.
    pub skip_exists: bool,
    /// Pause between objects inside one sequential iteration.
    #[serde(deserialize_with = "deserialize_duration")]
    pub object_delay: Duration,
    pub objects: Vec<ObjectConfig>,
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            name: String::new(),
            job_type: JobType::default(),
            job_iterations: 1,
            job_iteration_delay: Duration::ZERO,
            job_pause: Duration::ZERO,
            namespace: String::new(),
            namespaced_iterations: false,
            iterations_per_namespace: 1,
            qps: 5,
            burst: 10,
            max_wait_timeout: Duration::from_secs(4 * 3600),
            wait_when_finished: true,
            churn: None,
            execution_mode: ExecutionMode::default(),
            cleanup: true,
            skip_exists: false,
            object_delay: Duration::ZERO,
            objects: Vec::new(),
        }
    }
}

impl JobConfig {
    /// Namespace prefix for this job's iterations.
    pub fn namespace_prefix(&self) -> &str {
        if self.namespace.is_empty() { &self.name } else { &self.namespace }
    }

    /// Structural checks that do not need a cluster. Template-level checks
    /// (e.g. apply patches fed JSON) happen at resolve time.
    pub fn validate(&self) -> Result<(), BurnerError> {
        if self.name.is_empty() {
            return Err(BurnerError::Config {
                raw_error_message: "job name cannot be empty".to_string(),
            });
        }
        if self.objects.is_empty() {
            return Err(BurnerError::Config {
                raw_error_message: format!("job {} declares no objects", self.name),
            });
        }
        if self.namespaced_iterations && self.iterations_per_namespace == 0 {
            return Err(BurnerError::Config {
                raw_error_message: format!("job {}: iterationsPerNamespace must be > 0", self.name),
            });
        }
        for object in &self.objects {
            if object.kind.is_empty() {
                return Err(BurnerError::Config {
                    raw_error_message: format!("job {}: object without kind", self.name),
                });
            }
            match self.job_type {
                JobType::Patch | JobType::Delete | JobType::Read => {
                    if object.label_selector.is_empty() {
                        return Err(BurnerError::Config {
                            raw_error_message: format!(
                                "job {}: {} objects require a labelSelector",
                                self.name,
                                object.kind
                            ),
                        });
                    }
                }
                JobType::Kubevirt => {
                    if object.vm_op.is_none() {
                        return Err(BurnerError::Config {
                            raw_error_message: format!("job {}: kubevirt objects require vmOp", self.name),
                        });
                    }
                    if object.vm_name.is_none() && object.label_selector.is_empty() {
                        return Err(BurnerError::Config {
                            raw_error_message: format!(
                                "job {}: kubevirt objects require vmName or a labelSelector",
                                self.name
                            ),
                        });
                    }
                }
                JobType::Create | JobType::Check => {}
            }
            if matches!(self.job_type, JobType::Create | JobType::Patch) && object.object_template.is_empty() {
                return Err(BurnerError::Config {
                    raw_error_message: format!("job {}: {} objects require an objectTemplate", self.name, object.kind),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_job() -> JobConfig {
        JobConfig {
            name: "storm".to_string(),
            objects: vec![ObjectConfig {
                object_template: "pod.yml".to_string(),
                kind: "Pod".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let job = create_job();
        assert_eq!(job.job_iterations, 1);
        assert_eq!(job.qps, 5);
        assert_eq!(job.burst, 10);
        assert!(job.wait_when_finished);
        assert!(job.cleanup);
        assert_eq!(job.max_wait_timeout, Duration::from_secs(14400));
        assert_eq!(job.namespace_prefix(), "storm");
    }

    #[test]
    fn test_patch_requires_selector() {
        let mut job = create_job();
        job.job_type = JobType::Patch;
        let err = job.validate().unwrap_err();
        assert!(matches!(err, BurnerError::Config { .. }));

        job.objects[0]
            .label_selector
            .insert("app".to_string(), "storm".to_string());
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_kubevirt_requires_op_and_target() {
        let mut job = create_job();
        job.job_type = JobType::Kubevirt;
        assert!(job.validate().is_err());

        job.objects[0].vm_op = Some(VmOp::Start);
        assert!(job.validate().is_err());

        job.objects[0].vm_name = Some("vm-0".to_string());
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_churn_effective_cycles() {
        let churn = ChurnConfig {
            percent: 20,
            delay: Duration::from_secs(30),
            cycles: 2,
            duration: Duration::from_secs(3600),
        };
        assert_eq!(churn.effective_cycles(), 2);

        let derived = ChurnConfig {
            cycles: 0,
            delay: Duration::from_secs(60),
            duration: Duration::from_secs(300),
            ..Default::default()
        };
        assert_eq!(derived.effective_cycles(), 5);
    }

    #[test]
    fn test_vm_op_subresource_names() {
        assert_eq!(VmOp::Start.to_string(), "start");
        assert_eq!(VmOp::AddVolume.to_string(), "addvolume");
        assert_eq!("add-volume".parse::<VmOp>().unwrap(), VmOp::AddVolume);
    }
}
