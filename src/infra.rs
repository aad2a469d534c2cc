/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod cloud;
pub mod local;
pub mod ssh;

use crate::config::InfrastructureConfig;
use crate::errors::HarnessResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Env var naming a comma-separated list of hosts. When set it overrides the
/// configured backend with ssh over those hosts, so a run can be pointed at a
/// static fleet without touching config.
pub const HOSTS_ENV: &str = "FLOTILLA_HOSTS";

/// Handle to one provisioned machine. Owned by the backend that created it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub index: usize,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}
impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Capability interface over a set of compute nodes. One instance per run;
/// `teardown` is guaranteed on every exit path and must be idempotent.
#[async_trait]
pub trait Infrastructure: Send + Sync {
    /// Provisions or reserves `count` nodes.
    async fn provision(&mut self, count: usize) -> HarnessResult<()>;

    fn nodes(&self) -> &[Node];

    /// Runs `argv` on the given node and waits for it to finish. A non-zero
    /// exit status is reported, not raised; the caller decides whether it is
    /// fatal.
    async fn run_command(&self, node: &Node, argv: &[String]) -> anyhow::Result<CommandOutput>;

    /// Copies the given files into `dest_dir` on every node.
    async fn push_files(
        &self,
        files: &[PathBuf],
        dest_dir: &str,
        remove_existing: bool,
    ) -> anyhow::Result<()>;

    /// Copies the directory tree at `src_dir` on the node into `dest_dir`
    /// locally.
    async fn pull_tree(&self, node: &Node, src_dir: &str, dest_dir: &Path) -> anyhow::Result<()>;

    /// Releases everything this backend still holds. Partial failures are
    /// logged, never raised, so the rest of the fleet is still released.
    async fn teardown(&self);
}

/// Builds the backend for a run. `FLOTILLA_HOSTS` wins over the config.
pub fn from_config(config: &InfrastructureConfig) -> Box<dyn Infrastructure> {
    if let Ok(env_hosts) = std::env::var(HOSTS_ENV) {
        let hosts = env_hosts
            .split(',')
            .map(|host| host.trim().to_string())
            .filter(|host| !host.is_empty())
            .collect::<Vec<_>>();
        if !hosts.is_empty() {
            info!("{} is set, using ssh infrastructure over {:?}", HOSTS_ENV, hosts);
            return Box::new(ssh::SshInfra::new(hosts, None));
        }
    }

    match config {
        InfrastructureConfig::Local => Box::new(local::LocalInfra::new()),
        InfrastructureConfig::Ssh { hosts, user } => {
            Box::new(ssh::SshInfra::new(hosts.clone(), user.clone()))
        }
        InfrastructureConfig::Cloud {
            name_prefix,
            user,
            project,
        } => Box::new(cloud::CloudInfra::new(
            name_prefix.clone(),
            user.clone(),
            project.clone(),
        )),
    }
}
