/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::errors::{HarnessError, HarnessResult};
use crate::infra::{CommandOutput, Infrastructure, Node};
use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Represents every instance as a distinct pseudo-node on this machine, each
/// with its own working directory under the system temp dir. Commands run as
/// child processes rooted in that directory.
pub struct LocalInfra {
    nodes: Vec<Node>,
    workdirs: Vec<PathBuf>,
    token: CancellationToken,
}

impl LocalInfra {
    pub fn new() -> Self {
        LocalInfra {
            nodes: vec![],
            workdirs: vec![],
            token: CancellationToken::new(),
        }
    }

    fn workdir(&self, node: &Node) -> anyhow::Result<&PathBuf> {
        self.workdirs
            .get(node.index)
            .context(format!("No working directory for node {}", node.index))
    }
}

impl Default for LocalInfra {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Infrastructure for LocalInfra {
    async fn provision(&mut self, count: usize) -> HarnessResult<()> {
        for index in 0..count {
            let workdir = std::env::temp_dir().join(format!(
                "flotilla-node-{}-{}",
                std::process::id(),
                index
            ));
            std::fs::create_dir_all(&workdir).map_err(|e| {
                HarnessError::Provisioning(format!(
                    "unable to create working directory {:?}: {}",
                    workdir, e
                ))
            })?;
            debug!("provisioned local node {} at {:?}", index, workdir);

            self.workdirs.push(workdir);
            self.nodes.push(Node {
                index,
                address: "127.0.0.1".to_string(),
            });
        }
        Ok(())
    }

    fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    async fn run_command(&self, node: &Node, argv: &[String]) -> anyhow::Result<CommandOutput> {
        let workdir = self.workdir(node)?;
        let (program, args) = argv
            .split_first()
            .context("Cannot run an empty command")?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context(format!("Failed to spawn {:?} on node {}", program, node.index))?;

        tokio::select! {
            output = child.wait_with_output() => {
                let output = output.context(format!("Failed waiting for {:?}", program))?;
                Ok(CommandOutput {
                    status: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                })
            }
            _ = self.token.cancelled() => {
                // dropping the wait future kills the child via kill_on_drop
                debug!("node {} command {:?} cancelled by teardown", node.index, program);
                Ok(CommandOutput {
                    status: -1,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            }
        }
    }

    async fn push_files(
        &self,
        files: &[PathBuf],
        dest_dir: &str,
        remove_existing: bool,
    ) -> anyhow::Result<()> {
        for workdir in self.workdirs.iter() {
            let dest = workdir.join(dest_dir);
            if remove_existing && dest.exists() {
                std::fs::remove_dir_all(&dest)
                    .context(format!("Unable to clear existing {:?}", dest))?;
            }
            std::fs::create_dir_all(&dest)?;

            for file in files {
                let name = file
                    .file_name()
                    .context(format!("Pushed path {:?} has no file name", file))?;
                copy_recursively(file, &dest.join(name))?;
            }
        }
        Ok(())
    }

    async fn pull_tree(&self, node: &Node, src_dir: &str, dest_dir: &Path) -> anyhow::Result<()> {
        let src = self.workdir(node)?.join(src_dir);
        if !src.exists() {
            // a worker that wrote nothing is not an error
            debug!("nothing to pull from node {} at {:?}", node.index, src);
            return Ok(());
        }
        copy_recursively(&src, dest_dir)
    }

    async fn teardown(&self) {
        self.token.cancel();

        for workdir in self.workdirs.iter() {
            match std::fs::remove_dir_all(workdir) {
                Ok(()) => debug!("removed {:?}", workdir),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Unable to remove working directory {:?}: {}", workdir, e),
            }
        }
    }
}

fn copy_recursively(src: &Path, dest: &Path) -> anyhow::Result<()> {
    if src.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_recursively(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dest).context(format!("Unable to copy {:?} to {:?}", src, dest))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_commands_in_per_node_workdirs() -> anyhow::Result<()> {
        let mut infra = LocalInfra::new();
        infra.provision(2).await?;
        assert_eq!(infra.nodes().len(), 2);

        let node = infra.nodes()[1].clone();
        let output = infra
            .run_command(&node, &["pwd".to_string()])
            .await?;
        assert!(output.success());
        assert!(output.stdout.contains("flotilla-node"));

        infra.teardown().await;
        Ok(())
    }

    #[tokio::test]
    async fn reports_exit_status_without_raising() -> anyhow::Result<()> {
        let mut infra = LocalInfra::new();
        infra.provision(1).await?;

        let node = infra.nodes()[0].clone();
        let output = infra
            .run_command(&node, &["false".to_string()])
            .await?;
        assert!(!output.success());

        infra.teardown().await;
        Ok(())
    }

    #[tokio::test]
    async fn push_then_pull_round_trips_files() -> anyhow::Result<()> {
        let mut infra = LocalInfra::new();
        infra.provision(1).await?;
        let node = infra.nodes()[0].clone();

        let scratch = std::env::temp_dir().join(format!("flotilla-push-{}", std::process::id()));
        std::fs::create_dir_all(&scratch)?;
        let file = scratch.join("payload.txt");
        std::fs::write(&file, "fleet")?;

        infra.push_files(&[file], "payload", false).await?;
        let output = infra
            .run_command(&node, &["cat".to_string(), "payload/payload.txt".to_string()])
            .await?;
        assert_eq!(output.stdout, "fleet");

        let pulled = scratch.join("pulled");
        infra.pull_tree(&node, "payload", &pulled).await?;
        assert_eq!(std::fs::read_to_string(pulled.join("payload.txt"))?, "fleet");

        infra.teardown().await;
        std::fs::remove_dir_all(&scratch)?;
        Ok(())
    }

    #[tokio::test]
    async fn pull_of_missing_tree_is_silent() -> anyhow::Result<()> {
        let mut infra = LocalInfra::new();
        infra.provision(1).await?;
        let node = infra.nodes()[0].clone();

        let dest = std::env::temp_dir().join("flotilla-missing-pull");
        infra.pull_tree(&node, "no-such-dir", &dest).await?;
        assert!(!dest.exists());

        infra.teardown().await;
        Ok(())
    }

    #[tokio::test]
    async fn teardown_removes_workdirs_and_is_idempotent() -> anyhow::Result<()> {
        let mut infra = LocalInfra::new();
        infra.provision(2).await?;
        let workdirs = infra.workdirs.clone();
        assert!(workdirs.iter().all(|dir| dir.exists()));

        infra.teardown().await;
        assert!(workdirs.iter().all(|dir| !dir.exists()));

        // a second teardown finds nothing and stays quiet
        infra.teardown().await;
        Ok(())
    }
}
