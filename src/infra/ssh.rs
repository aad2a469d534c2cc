/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::errors::{HarnessError, HarnessResult};
use crate::infra::{CommandOutput, Infrastructure, Node};
use anyhow::Context;
use async_trait::async_trait;
use futures_util::future::try_join_all;
use std::path::{Path, PathBuf};
use tracing::debug;

const SSH_OPTS: [&str; 8] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "ConnectTimeout=10",
    "-o",
    "LogLevel=ERROR",
];

/// Drives a fixed pool of pre-provisioned hosts over ssh and scp. Remote
/// paths are relative to the login user's home directory.
pub struct SshInfra {
    hosts: Vec<String>,
    user: Option<String>,
    nodes: Vec<Node>,
}

impl SshInfra {
    pub fn new(hosts: Vec<String>, user: Option<String>) -> Self {
        SshInfra {
            hosts,
            user,
            nodes: vec![],
        }
    }

    pub fn login_user(&self) -> Option<&String> {
        self.user.as_ref()
    }

    fn target(&self, node: &Node) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, node.address),
            None => node.address.clone(),
        }
    }

    async fn ssh(&self, node: &Node, remote_command: &str) -> anyhow::Result<CommandOutput> {
        let output = tokio::process::Command::new("ssh")
            .args(SSH_OPTS)
            .arg(self.target(node))
            .arg(remote_command)
            .kill_on_drop(true)
            .output()
            .await
            .context(format!("Failed to run ssh against {}", node.address))?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn scp(&self, args: Vec<String>) -> anyhow::Result<()> {
        let output = tokio::process::Command::new("scp")
            .args(SSH_OPTS)
            .arg("-r")
            .arg("-C")
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to run scp")?;

        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "scp {:?} exited with status {}: {}",
                args,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

fn remote_command(argv: &[String]) -> anyhow::Result<String> {
    shlex::try_join(argv.iter().map(String::as_str))
        .context("Unable to quote command for the remote shell")
}

#[async_trait]
impl Infrastructure for SshInfra {
    async fn provision(&mut self, count: usize) -> HarnessResult<()> {
        if self.hosts.len() < count {
            return Err(HarnessError::Provisioning(format!(
                "{} hosts available but {} workers requested",
                self.hosts.len(),
                count
            )));
        }

        self.nodes = self
            .hosts
            .iter()
            .take(count)
            .enumerate()
            .map(|(index, host)| Node {
                index,
                address: host.clone(),
            })
            .collect();
        Ok(())
    }

    fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    async fn run_command(&self, node: &Node, argv: &[String]) -> anyhow::Result<CommandOutput> {
        self.ssh(node, &remote_command(argv)?).await
    }

    async fn push_files(
        &self,
        files: &[PathBuf],
        dest_dir: &str,
        remove_existing: bool,
    ) -> anyhow::Result<()> {
        let prepare = if remove_existing {
            format!("rm -rf {dest_dir} && mkdir -p {dest_dir}")
        } else {
            format!("mkdir -p {dest_dir}")
        };

        try_join_all(self.nodes.iter().map(|node| {
            let prepare = prepare.clone();
            async move {
                let output = self.ssh(node, &prepare).await?;
                if !output.success() {
                    return Err(anyhow::anyhow!(
                        "Unable to prepare {} on {}: {}",
                        dest_dir,
                        node.address,
                        output.stderr.trim()
                    ));
                }

                let mut args: Vec<String> = files
                    .iter()
                    .map(|file| file.to_string_lossy().to_string())
                    .collect();
                args.push(format!("{}:{}/", self.target(node), dest_dir));
                self.scp(args).await
            }
        }))
        .await?;
        Ok(())
    }

    async fn pull_tree(&self, node: &Node, src_dir: &str, dest_dir: &Path) -> anyhow::Result<()> {
        let probe = self.ssh(node, &format!("test -d {src_dir}")).await?;
        if !probe.success() {
            debug!("nothing to pull from {} at {}", node.address, src_dir);
            return Ok(());
        }

        std::fs::create_dir_all(dest_dir)
            .context(format!("Unable to create {:?}", dest_dir))?;
        self.scp(vec![
            format!("{}:{}/.", self.target(node), src_dir),
            dest_dir.to_string_lossy().to_string(),
        ])
        .await
    }

    async fn teardown(&self) {
        // the hosts are not ours to destroy
        debug!("releasing {} ssh hosts", self.nodes.len());
    }
}
