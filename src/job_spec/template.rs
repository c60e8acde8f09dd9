//! Job manifest generation.
//!
//! Every dispatched message becomes one `batch/v1` Job named
//! `{jobName}-{uuid}`. The same name is used for the message secret the job's
//! container reads its environment from.

use super::JobSpec;
use crate::constants::job_template;
use serde_json::{json, Value};
use uuid::Uuid;

/// Generated job manifest with its resource name
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub name: String,
    pub manifest: Value,
}

impl JobTemplate {
    /// Build a manifest with a freshly generated unique name
    pub fn for_spec(spec: &JobSpec) -> Self {
        Self::with_name(spec, format!("{}-{}", spec.job_name, Uuid::new_v4()))
    }

    pub fn with_name(spec: &JobSpec, name: String) -> Self {
        let metadata = json!({
            "name": name,
            "namespace": spec.namespace,
            "labels": spec.labels,
        });

        let mut pod_spec = json!({
            "restartPolicy": job_template::RESTART_POLICY,
            "containers": [{
                "name": job_template::CONTAINER_NAME,
                "image": spec.image,
                "env": spec.environment,
                "envFrom": [{ "secretRef": { "name": name } }],
                "resources": spec.resources,
            }],
        });

        if let Some(service_account) = &spec.service_account {
            pod_spec["serviceAccount"] = json!(service_account);
        }

        let manifest = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": metadata,
            "spec": {
                "parallelism": 1,
                "backoffLimit": job_template::BACKOFF_LIMIT,
                "ttlSecondsAfterFinished": job_template::TTL_SECONDS_AFTER_FINISHED,
                "activeDeadlineSeconds": spec.timeout,
                "template": {
                    "metadata": metadata,
                    "spec": pod_spec,
                },
            },
        });

        Self { name, manifest }
    }
}
