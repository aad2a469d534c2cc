use crate::errors::{HarnessError, HarnessResult};
use crate::infra::ssh::SshInfra;
use crate::infra::{CommandOutput, Infrastructure, Node};
use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Discovers running compute instances whose names share a prefix and then
/// drives them exactly like the ssh backend. Instances are expected to be
/// provisioned ahead of time, so teardown leaves them running.
pub struct CloudInfra {
    name_prefix: String,
    project: Option<String>,
    inner: SshInfra,
}

impl CloudInfra {
    pub fn new(name_prefix: String, user: Option<String>, project: Option<String>) -> Self {
        CloudInfra {
            name_prefix,
            project,
            inner: SshInfra::new(vec![], user),
        }
    }

    async fn discover(&self) -> anyhow::Result<Vec<String>> {
        let mut command = tokio::process::Command::new("gcloud");
        command.args(["compute", "instances", "list", "--format=json"]);
        if let Some(project) = &self.project {
            command.args(["--project", project]);
        }

        let output = command
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to run gcloud, is the sdk installed?")?;
        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "gcloud instance listing exited with status {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let instances: serde_json::Value = serde_json::from_slice(&output.stdout)
            .context("Unable to parse gcloud instance listing")?;
        Ok(running_addresses(&instances, &self.name_prefix))
    }
}

fn running_addresses(instances: &serde_json::Value, name_prefix: &str) -> Vec<String> {
    let mut matched: Vec<(String, String)> = instances
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|instance| {
            let name = instance["name"].as_str()?;
            if !name.starts_with(name_prefix) || instance["status"] != "RUNNING" {
                return None;
            }

            match instance["networkInterfaces"][0]["accessConfigs"][0]["natIP"].as_str() {
                Some(address) => Some((name.to_string(), address.to_string())),
                None => {
                    warn!("instance {} is running but has no external address", name);
                    None
                }
            }
        })
        .collect();

    matched.sort();
    matched.into_iter().map(|(_, address)| address).collect()
}

#[async_trait]
impl Infrastructure for CloudInfra {
    async fn provision(&mut self, count: usize) -> HarnessResult<()> {
        let addresses = self
            .discover()
            .await
            .map_err(|e| HarnessError::Provisioning(e.to_string()))?;

        if addresses.len() < count {
            return Err(HarnessError::Provisioning(format!(
                "instance group '{}' has {} running instances but {} workers requested",
                self.name_prefix,
                addresses.len(),
                count
            )));
        }
        debug!(
            "discovered {} running instances for prefix '{}'",
            addresses.len(),
            self.name_prefix
        );

        let user = self.inner.login_user().cloned();
        self.inner = SshInfra::new(addresses, user);
        self.inner.provision(count).await
    }

    fn nodes(&self) -> &[Node] {
        self.inner.nodes()
    }

    async fn run_command(&self, node: &Node, argv: &[String]) -> anyhow::Result<CommandOutput> {
        self.inner.run_command(node, argv).await
    }

    async fn push_files(
        &self,
        files: &[PathBuf],
        dest_dir: &str,
        remove_existing: bool,
    ) -> anyhow::Result<()> {
        self.inner.push_files(files, dest_dir, remove_existing).await
    }

    async fn pull_tree(&self, node: &Node, src_dir: &str, dest_dir: &Path) -> anyhow::Result<()> {
        self.inner.pull_tree(node, src_dir, dest_dir).await
    }

    async fn teardown(&self) {
        // instances outlive the run, the next one reuses them
        self.inner.teardown().await;
    }
}
