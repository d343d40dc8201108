//! RunPod backend over its GraphQL API.

use super::cloud::{CloudApi, Endpoint, InstanceStatus};
use super::ssh::expand_home;
use crate::config::{CloudConfig, RunPodSpec, Secret};
use crate::error::{Result, SweepError};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::time::Duration;

const GRAPHQL_URL: &str = "https://api.runpod.io/graphql";

const DEPLOY_ON_DEMAND: &str = "mutation Deploy($input: PodFindAndDeployOnDemandInput) { \
    podFindAndDeployOnDemand(input: $input) { id desiredStatus } }";

const DEPLOY_SPOT: &str = "mutation Rent($input: PodRentInterruptableInput!) { \
    podRentInterruptable(input: $input) { id desiredStatus } }";

const POD_STATUS: &str = "query Pod($input: PodFilter!) { pod(input: $input) { \
    id desiredStatus runtime { uptimeInSeconds ports { ip isIpPublic privatePort publicPort type } } } }";

const MY_PODS: &str = "query Pods { myself { pods { id name desiredStatus } } }";

const TERMINATE: &str = "mutation Terminate($input: PodTerminateInput!) { podTerminate(input: $input) }";

const LOWEST_BID: &str = "query Bid($input: GpuTypeFilter, $price: GpuLowestPriceInput) { \
    gpuTypes(input: $input) { id lowestPrice(input: $price) { minimumBidPrice } } }";

pub struct RunPodApi {
    client: reqwest::Client,
    api_key: Secret,
    spec: RunPodSpec,
    public_key_file: Option<PathBuf>,
}

impl RunPodApi {
    pub fn new(api_key: Secret, spec: RunPodSpec) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_key,
            spec,
            public_key_file: None,
        })
    }

    pub fn from_config(cloud: &CloudConfig) -> Result<Self> {
        let api_key = cloud
            .api_key
            .clone()
            .ok_or_else(|| SweepError::config("RunPod API key is not configured"))?;
        let mut api = Self::new(api_key, cloud.runpod.clone())?;
        api.public_key_file = cloud.ssh_key_file.as_ref().map(|key| {
            let mut public = expand_home(key).into_os_string();
            public.push(".pub");
            PathBuf::from(public)
        });
        Ok(api)
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value> {
        let resp = self
            .client
            .post(GRAPHQL_URL)
            .bearer_auth(self.api_key.expose())
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SweepError::api(
                format!("RunPod returned HTTP {}: {}", status.as_u16(), truncate(&body, 300)),
                status.is_server_error() || status.as_u16() == 429,
            ));
        }
        let body: Value = resp.json().await?;
        graphql_data(body)
    }

    async fn minimum_bid(&self) -> Result<f64> {
        let data = self
            .graphql(
                LOWEST_BID,
                json!({
                    "input": { "id": self.spec.gpu_type },
                    "price": { "gpuCount": self.spec.gpu_count },
                }),
            )
            .await?;
        data["gpuTypes"][0]["lowestPrice"]["minimumBidPrice"]
            .as_f64()
            .ok_or_else(|| {
                SweepError::api(
                    format!("no spot price available for {}", self.spec.gpu_type),
                    false,
                )
            })
    }

    async fn public_key(&self) -> Option<String> {
        let path = self.public_key_file.as_ref()?;
        match tokio::fs::read_to_string(path).await {
            Ok(key) => Some(key.trim().to_string()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Could not read SSH public key");
                None
            }
        }
    }
}

#[async_trait]
impl CloudApi for RunPodApi {
    fn name(&self) -> &str {
        "runpod"
    }

    fn name_prefix(&self) -> &str {
        &self.spec.name
    }

    async fn create_instance(&self, name: &str) -> Result<String> {
        let public_key = self.public_key().await;
        let mut input = deploy_input(&self.spec, name, public_key.as_deref());
        let (query, field) = if self.spec.spot {
            let bid = match self.spec.bid_per_gpu {
                Some(bid) => bid,
                None => self.minimum_bid().await?,
            };
            input["bidPerGpu"] = json!(bid);
            (DEPLOY_SPOT, "podRentInterruptable")
        } else {
            (DEPLOY_ON_DEMAND, "podFindAndDeployOnDemand")
        };
        tracing::info!(
            name,
            gpu_type = %self.spec.gpu_type,
            gpu_count = self.spec.gpu_count,
            spot = self.spec.spot,
            "Deploying RunPod pod"
        );
        let data = self.graphql(query, json!({ "input": input })).await?;
        data[field]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SweepError::api(format!("{field} returned no pod id"), false))
    }

    async fn find_instance(&self, name: &str) -> Result<Option<String>> {
        let data = self.graphql(MY_PODS, json!({})).await?;
        Ok(find_pod(&data, name))
    }

    async fn instance_status(&self, instance_id: &str) -> Result<InstanceStatus> {
        let data = self
            .graphql(POD_STATUS, json!({ "input": { "podId": instance_id } }))
            .await?;
        Ok(parse_pod_status(&data["pod"]))
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.graphql(TERMINATE, json!({ "input": { "podId": instance_id } }))
            .await?;
        Ok(())
    }
}

/// Build the deployment input shared by on-demand and spot requests.
fn deploy_input(spec: &RunPodSpec, name: &str, public_key: Option<&str>) -> Value {
    let mut env: Vec<Value> = spec
        .env
        .iter()
        .map(|(key, value)| json!({ "key": key, "value": value }))
        .collect();
    if let Some(key) = public_key {
        env.push(json!({ "key": "PUBLIC_KEY", "value": key }));
    }
    let cloud_type = if spec.secure_cloud { "SECURE" } else { "ALL" };
    json!({
        "cloudType": cloud_type,
        "gpuCount": spec.gpu_count,
        "gpuTypeId": spec.gpu_type,
        "name": name,
        "imageName": spec.image,
        "containerDiskInGb": spec.container_disk_gb,
        "volumeInGb": spec.volume_gb,
        "volumeMountPath": spec.volume_mount_path,
        "ports": spec.ports,
        "startSsh": true,
        "supportPublicIp": true,
        "env": env,
    })
}

/// Id of the live pod called `name` in a `myself { pods }` response.
fn find_pod(data: &Value, name: &str) -> Option<String> {
    data["myself"]["pods"]
        .as_array()?
        .iter()
        .find(|pod| pod["name"].as_str() == Some(name) && pod["desiredStatus"].as_str() != Some("TERMINATED"))
        .and_then(|pod| pod["id"].as_str())
        .map(str::to_string)
}

/// Unwrap a GraphQL response body into its `data`, surfacing `errors`.
fn graphql_data(body: Value) -> Result<Value> {
    if let Some(errors) = body["errors"].as_array()
        && !errors.is_empty()
    {
        let message = errors
            .iter()
            .filter_map(|e| e["message"].as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let lower = message.to_lowercase();
        let transient = lower.contains("rate limit") || lower.contains("try again");
        return Err(SweepError::api(format!("RunPod: {message}"), transient));
    }
    Ok(body["data"].clone())
}

/// Map a `pod` object to an instance status. A pod counts as ready once it
/// is running and port 22 is mapped to a public address.
fn parse_pod_status(pod: &Value) -> InstanceStatus {
    if pod.is_null() {
        return InstanceStatus::Terminated;
    }
    let desired = pod["desiredStatus"].as_str().unwrap_or("UNKNOWN");
    match desired {
        "TERMINATED" | "EXITED" => return InstanceStatus::Terminated,
        "RUNNING" => {}
        other => return InstanceStatus::Pending(format!("desired status {other}")),
    }
    let ssh_port = pod["runtime"]["ports"]
        .as_array()
        .into_iter()
        .flatten()
        .find(|p| p["privatePort"].as_u64() == Some(22) && p["isIpPublic"].as_bool() != Some(false));
    match ssh_port {
        Some(port) => match (port["ip"].as_str(), port["publicPort"].as_u64()) {
            (Some(ip), Some(public)) if !ip.is_empty() => InstanceStatus::Ready(Endpoint {
                host: ip.to_string(),
                port: u16::try_from(public).ok(),
                user: Some("root".to_string()),
            }),
            _ => InstanceStatus::Pending("ssh port not yet mapped".to_string()),
        },
        None if pod["runtime"].is_null() => InstanceStatus::Pending("container starting".to_string()),
        None => InstanceStatus::Pending("waiting for public ssh port".to_string()),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
