//! Kubernetes API client.
//!
//! A thin REST client over `reqwest` covering the four calls the provisioner
//! makes: create secret, create job, list active jobs and read a config map.
//!
//! In production the in-cluster service account is used (token and CA from
//! the mounted service account directory, endpoint from
//! `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT`). Otherwise the
//! explicitly configured URL/token/CA are used, falling back to a local
//! `kubectl proxy`.

use super::secret::MessageSecret;
use super::{ConfigStore, JobOrchestrator, JobReceipt};
use crate::config::KubernetesConfig;
use crate::constants::job_template;
use crate::error::{ProvisionerError, Result};
use crate::job_spec::template::JobTemplate;
use crate::job_spec::JobSpec;
use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const LOCAL_PROXY_URL: &str = "http://127.0.0.1:8001";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
struct JobList {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigMap {
    #[serde(default)]
    data: Option<HashMap<String, String>>,
}

/// Connection settings resolved from the process configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoint {
    pub base_url: String,
    pub token: Option<String>,
    pub ca_pem: Option<Vec<u8>>,
}

impl ApiEndpoint {
    /// In-cluster endpoint from the service account mount
    pub async fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            ProvisionerError::configuration("KUBERNETES_SERVICE_HOST is not set")
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let dir = Path::new(SERVICE_ACCOUNT_DIR);

        let token = read_file(&dir.join("token")).await?;
        let ca_pem = tokio::fs::read(dir.join("ca.crt")).await.map_err(|e| {
            ProvisionerError::configuration(format!("could not read service account CA: {e}"))
        })?;

        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        Ok(Self {
            base_url: format!("https://{host}:{port}"),
            token: Some(token.trim().to_string()),
            ca_pem: Some(ca_pem),
        })
    }

    /// Endpoint from explicit settings
    pub async fn from_config(config: &KubernetesConfig) -> Result<Self> {
        let ca_pem = match &config.ca_cert_path {
            Some(path) => Some(tokio::fs::read(path).await.map_err(|e| {
                ProvisionerError::configuration(format!(
                    "could not read Kubernetes CA {}: {e}",
                    path.display()
                ))
            })?),
            None => None,
        };

        Ok(Self {
            base_url: config
                .api_url
                .clone()
                .unwrap_or_else(|| LOCAL_PROXY_URL.to_string()),
            token: config.token.clone(),
            ca_pem,
        })
    }
}

async fn read_file(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        ProvisionerError::configuration(format!("could not read {}: {e}", path.display()))
    })
}

/// `k1=v1,k2=v2` over the job labels
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// REST client implementing [`JobOrchestrator`] and [`ConfigStore`]
#[derive(Clone)]
pub struct KubernetesClient {
    client: Client,
    base_url: Url,
}

impl std::fmt::Debug for KubernetesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesClient")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl KubernetesClient {
    /// Resolve the endpoint for the current environment and build the client
    pub async fn connect(config: &KubernetesConfig, production: bool) -> Result<Self> {
        let endpoint = if production {
            ApiEndpoint::in_cluster().await?
        } else {
            ApiEndpoint::from_config(config).await?
        };
        Self::new(endpoint)
    }

    pub fn new(endpoint: ApiEndpoint) -> Result<Self> {
        let base_url = Url::parse(&endpoint.base_url).map_err(|e| {
            ProvisionerError::configuration(format!(
                "invalid Kubernetes API URL '{}': {e}",
                endpoint.base_url
            ))
        })?;

        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);

        if let Some(token) = &endpoint.token {
            let mut headers = reqwest::header::HeaderMap::new();
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ProvisionerError::configuration(format!("invalid bearer token: {e}")))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        if let Some(pem) = &endpoint.ca_pem {
            let certificate = reqwest::Certificate::from_pem(pem).map_err(|e| {
                ProvisionerError::configuration(format!("invalid Kubernetes CA certificate: {e}"))
            })?;
            builder = builder.add_root_certificate(certificate);
        }

        let client = builder.build().map_err(|e| {
            ProvisionerError::configuration(format!("failed to build HTTP client: {e}"))
        })?;

        info!(base_url = %base_url, "Kubernetes API client created");
        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> std::result::Result<Url, String> {
        self.base_url
            .join(path)
            .map_err(|e| format!("failed to construct URL: {e}"))
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> std::result::Result<(), String> {
        let url = self.url(path)?;
        debug!(url = %url, "POST");
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        check_status(response).await.map(|_| ())
    }

    async fn post_secret(&self, secret: &MessageSecret) -> std::result::Result<(), String> {
        self.post(
            &format!("/api/v1/namespaces/{}/secrets", secret.namespace),
            &secret.manifest(),
        )
        .await
    }
}

async fn check_status(response: Response) -> std::result::Result<Response, String> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(format!("HTTP {status}: {error_text}"))
}

#[async_trait]
impl JobOrchestrator for KubernetesClient {
    async fn create_job(&self, spec: &JobSpec, message: &[u8]) -> Result<JobReceipt> {
        let template = JobTemplate::for_spec(spec);
        let secret = MessageSecret::new(&spec.namespace, &spec.job_name, &template.name, message);
        let dispatch_error = |e: String| ProvisionerError::orchestration_dispatch(&spec.alias, e);

        self.post_secret(&secret).await.map_err(dispatch_error)?;
        self.post(
            &format!("/apis/batch/v1/namespaces/{}/jobs", spec.namespace),
            &template.manifest,
        )
        .await
        .map_err(|e| {
            warn!(secret = %secret.name, "Job creation failed after its secret was created");
            dispatch_error(e)
        })?;

        Ok(JobReceipt {
            job: template.name,
            alias: spec.alias.clone(),
            job_name: spec.job_name.clone(),
        })
    }

    async fn count_active_jobs(&self, spec: &JobSpec) -> Result<u32> {
        let query_error = |e: String| ProvisionerError::orchestration_query(&spec.alias, e);
        let url = self
            .url(&format!("/apis/batch/v1/namespaces/{}/jobs", spec.namespace))
            .map_err(query_error)?;

        let mut query = vec![
            ("fieldSelector", job_template::ACTIVE_JOBS_FIELD_SELECTOR.to_string()),
            ("labelSelector", label_selector(&spec.labels)),
        ];
        if let Some(limit) = spec.parallelism.limit() {
            query.push(("limit", (u64::from(limit) + 1).to_string()));
        }

        let response = self
            .client
            .get(url)
            .query(&query)
            .send()
            .await
            .map_err(|e| query_error(format!("request failed: {e}")))?;
        let response = check_status(response).await.map_err(query_error)?;
        let jobs: JobList = response
            .json()
            .await
            .map_err(|e| query_error(format!("invalid job list: {e}")))?;

        Ok(u32::try_from(jobs.items.len()).unwrap_or(u32::MAX))
    }

    async fn create_secret(&self, secret: &MessageSecret) -> Result<()> {
        self.post_secret(secret)
            .await
            .map_err(|e| ProvisionerError::orchestration_dispatch(&secret.name, e))
    }
}

#[async_trait]
impl ConfigStore for KubernetesClient {
    async fn get_config(&self, name: &str, namespace: &str) -> Result<HashMap<String, String>> {
        let fetch_error = |e: String| ProvisionerError::config_fetch(name, e);
        let url = self
            .url(&format!("/api/v1/namespaces/{namespace}/configmaps/{name}"))
            .map_err(fetch_error)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_error(format!("request failed: {e}")))?;
        let response = check_status(response).await.map_err(fetch_error)?;
        let config_map: ConfigMap = response
            .json()
            .await
            .map_err(|e| fetch_error(format!("invalid config map: {e}")))?;

        Ok(config_map.data.unwrap_or_default())
    }
}
