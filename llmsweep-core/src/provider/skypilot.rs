//! SkyPilot backend driving the `sky` CLI.
//!
//! The cluster name doubles as the instance id. SkyPilot writes an entry for
//! each cluster into `~/.ssh/config`, so the name is also the SSH host alias.
//! A cluster name is known before `sky launch` runs, so a launch that fails
//! or is interrupted half way still leaves something to tear down.

use super::cloud::{CloudApi, Endpoint, InstanceStatus};
use super::CommandOutput;
use crate::config::SkyPilotSpec;
use crate::error::{Result, SweepError};
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use tokio::process::Command;

pub struct SkyPilotApi {
    spec: SkyPilotSpec,
    binary: String,
}

/// Task file handed to `sky launch`; only resources are declared.
#[derive(Debug, Serialize)]
struct TaskFile<'a> {
    name: &'a str,
    resources: Resources<'a>,
}

#[derive(Debug, Serialize)]
struct Resources<'a> {
    accelerators: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cloud: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    region: Option<&'a str>,
    use_spot: bool,
    disk_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_id: Option<&'a str>,
}

impl SkyPilotApi {
    pub fn new(spec: SkyPilotSpec) -> Self {
        Self {
            spec,
            binary: "sky".to_string(),
        }
    }

    fn task_yaml(&self, cluster: &str) -> Result<String> {
        let task = TaskFile {
            name: cluster,
            resources: Resources {
                accelerators: &self.spec.accelerators,
                cloud: self.spec.cloud.as_deref(),
                region: self.spec.region.as_deref(),
                use_spot: self.spec.use_spot,
                disk_size: self.spec.disk_size_gb,
                image_id: self.spec.image_id.as_deref(),
            },
        };
        serde_yaml::to_string(&task)
            .map_err(|e| SweepError::config(format!("cannot render SkyPilot task: {e}")))
    }

    async fn sky(&self, args: &[&str]) -> Result<CommandOutput> {
        tracing::debug!(args = ?args, "Running sky");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SweepError::api(format!("failed to run {}: {e}", self.binary), false))?;
        Ok(CommandOutput::from_output(output))
    }
}

#[async_trait]
impl CloudApi for SkyPilotApi {
    fn name(&self) -> &str {
        "skypilot"
    }

    fn name_prefix(&self) -> &str {
        &self.spec.cluster_name
    }

    async fn create_instance(&self, cluster: &str) -> Result<String> {
        let yaml = self.task_yaml(cluster)?;
        let task_path = std::env::temp_dir().join(format!(
            "llmsweep-sky-{}.yaml",
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::write(&task_path, yaml).await?;
        tracing::info!(cluster, accelerators = %self.spec.accelerators, "Launching SkyPilot cluster");
        let task_arg = task_path.to_string_lossy().into_owned();
        let result = self.sky(&["launch", "-y", "-c", cluster, &task_arg]).await;
        let _ = tokio::fs::remove_file(&task_path).await;
        let out = result?;
        if out.success() {
            Ok(cluster.to_string())
        } else {
            Err(SweepError::api(
                format!("sky launch failed (exit {}): {}", out.exit_code, out.stderr_tail(10)),
                false,
            ))
        }
    }

    async fn find_instance(&self, cluster: &str) -> Result<Option<String>> {
        match self.instance_status(cluster).await {
            Ok(InstanceStatus::Terminated) => Ok(None),
            Ok(_) => Ok(Some(cluster.to_string())),
            // Unknown state counts as present so the cluster still gets torn down.
            Err(e) => {
                tracing::warn!(cluster, error = %e, "Cannot tell whether the cluster exists");
                Ok(Some(cluster.to_string()))
            }
        }
    }

    async fn instance_status(&self, instance_id: &str) -> Result<InstanceStatus> {
        let out = self.sky(&["status", "--refresh", instance_id]).await?;
        if !out.success() {
            return Err(SweepError::api(
                format!("sky status failed: {}", out.stderr_tail(5)),
                true,
            ));
        }
        Ok(parse_status(&out.stdout, instance_id))
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        let out = self.sky(&["down", "-y", instance_id]).await?;
        if out.success() {
            Ok(())
        } else {
            Err(SweepError::api(
                format!("sky down failed: {}", out.stderr_tail(5)),
                true,
            ))
        }
    }
}

/// Find the cluster's row in `sky status` output and map its STATUS column.
fn parse_status(stdout: &str, cluster: &str) -> InstanceStatus {
    let row = stdout
        .lines()
        .find(|line| line.split_whitespace().next() == Some(cluster));
    let Some(row) = row else {
        return InstanceStatus::Terminated;
    };
    let columns: Vec<&str> = row.split_whitespace().collect();
    if columns.contains(&"UP") {
        InstanceStatus::Ready(Endpoint {
            host: cluster.to_string(),
            port: None,
            user: None,
        })
    } else if columns.contains(&"INIT") {
        InstanceStatus::Pending("cluster initializing".to_string())
    } else if columns.contains(&"STOPPED") {
        InstanceStatus::Failed("cluster is stopped".to_string())
    } else {
        InstanceStatus::Pending(format!("unrecognized status row: {row}"))
    }
}
