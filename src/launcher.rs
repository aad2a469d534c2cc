/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::config::{Benchmark, ControlConfig, Placement};
use crate::control::WorkerMapping;
use crate::errors::{HarnessError, HarnessResult};
use crate::infra::{Infrastructure, Node};
use anyhow::Context;
use futures_util::future::try_join_all;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Directory on every node the payload archive is unpacked into.
pub const PAYLOAD_DIR: &str = "flotilla-payload";
const PAYLOAD_ARCHIVE: &str = "payload.tar";
pub const AGENT_BINARY: &str = "flotilla-agent";

/// Where an agent writes its results, relative to its node working
/// directory. The scheduler pulls this tree back after the run.
pub fn worker_output_dir(role: &str, id: usize) -> String {
    format!("output/{}-{}", role, id)
}

/// Assigns worker ids in role declaration order and maps each onto a node
/// according to the benchmark's placement strategy.
pub fn place_workers(benchmark: &Benchmark, nodes: &[Node]) -> HarnessResult<Vec<WorkerMapping>> {
    if nodes.is_empty() {
        return Err(HarnessError::Provisioning(
            "cannot place workers, no nodes were provisioned".to_string(),
        ));
    }

    let mut mappings = vec![];
    let mut id = 0;
    for role in benchmark.roles.iter() {
        for _ in 0..role.count {
            let node = match benchmark.placement {
                Placement::Spread => nodes[id % nodes.len()].clone(),
                Placement::Pack => nodes[0].clone(),
            };
            mappings.push(WorkerMapping {
                id,
                role: role.name.clone(),
                node,
            });
            id += 1;
        }
    }
    Ok(mappings)
}

/// Bundles the agent binary and any extra payload into one tar archive,
/// ships it to every node and unpacks it there.
async fn stage_payload(infra: &dyn Infrastructure, payload: &[PathBuf]) -> anyhow::Result<()> {
    let agent_binary = std::env::current_exe()
        .context("Unable to locate the running executable")?
        .with_file_name(AGENT_BINARY);
    if !agent_binary.exists() {
        return Err(anyhow::anyhow!(
            "Agent binary not found at {:?}, was it built?",
            agent_binary
        ));
    }

    // push_files keeps the basename, so the archive must already carry the
    // name the unpack command expects
    let scratch = std::env::temp_dir().join(format!("flotilla-stage-{}", std::process::id()));
    std::fs::create_dir_all(&scratch).context(format!("Unable to create {:?}", scratch))?;
    let archive_path = scratch.join(PAYLOAD_ARCHIVE);
    let archive =
        File::create(&archive_path).context(format!("Unable to create {:?}", archive_path))?;
    let mut builder = tar::Builder::new(archive);
    builder
        .append_path_with_name(&agent_binary, AGENT_BINARY)
        .context("Unable to archive the agent binary")?;
    for path in payload {
        let name = path
            .file_name()
            .context(format!("Payload path {:?} has no file name", path))?;
        if path.is_dir() {
            builder
                .append_dir_all(name, path)
                .context(format!("Unable to archive payload directory {:?}", path))?;
        } else {
            builder
                .append_path_with_name(path, name)
                .context(format!("Unable to archive payload file {:?}", path))?;
        }
    }
    builder.finish().context("Unable to finish the payload archive")?;

    infra
        .push_files(&[archive_path.clone()], PAYLOAD_DIR, true)
        .await
        .context("Unable to push the payload archive")?;
    try_join_all(infra.nodes().iter().map(|node| async move {
        let argv = vec![
            "tar".to_string(),
            "-xf".to_string(),
            format!("{}/{}", PAYLOAD_DIR, PAYLOAD_ARCHIVE),
            "-C".to_string(),
            PAYLOAD_DIR.to_string(),
        ];
        let output = infra.run_command(node, &argv).await?;
        if !output.success() {
            return Err(anyhow::anyhow!(
                "Unpacking the payload on node {} failed: {}",
                node.index,
                output.stderr.trim()
            ));
        }
        Ok(())
    }))
    .await?;

    std::fs::remove_dir_all(&scratch).ok();
    Ok(())
}

/// The address agents should call the coordinator back on. Explicit config
/// wins, an all-loopback fleet stays on loopback, anything else gets this
/// machine's host name.
fn advertise_host(control: &ControlConfig, nodes: &[Node]) -> String {
    if let Some(host) = &control.advertise_host {
        return host.clone();
    }
    if nodes.iter().all(|node| node.address == "127.0.0.1") {
        return "127.0.0.1".to_string();
    }
    sysinfo::System::host_name().unwrap_or_else(|| "127.0.0.1".to_string())
}

fn agent_argv(mapping: &WorkerMapping, coordinator: &str, extra_args: &[String]) -> Vec<String> {
    let mut argv = vec![
        format!("./{}/{}", PAYLOAD_DIR, AGENT_BINARY),
        "--coordinator".to_string(),
        coordinator.to_string(),
        "--id".to_string(),
        mapping.id.to_string(),
        "--role".to_string(),
        mapping.role.clone(),
        "--output-dir".to_string(),
        worker_output_dir(&mapping.role, mapping.id),
        "--advertise-host".to_string(),
        mapping.node.address.clone(),
    ];
    for arg in extra_args {
        argv.push("--worker-arg".to_string());
        argv.push(arg.clone());
    }
    argv
}

/// The launched agents plus the control server keeping them alive. Dropping
/// the server is what tells the agents to exit.
pub struct WorkerFleet {
    pub mappings: Vec<WorkerMapping>,
    server: JoinHandle<()>,
    workers: JoinSet<()>,
}

impl WorkerFleet {
    pub fn worker_ids(&self) -> Vec<usize> {
        self.mappings.iter().map(|mapping| mapping.id).collect()
    }

    /// Stops the control server, then waits for the agents to notice and
    /// exit on their own. Stragglers are aborted.
    pub async fn shutdown(mut self) {
        self.server.abort();

        let drain = async {
            while self.workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(Duration::from_secs(10), drain)
            .await
            .is_err()
        {
            warn!("workers did not exit in time, aborting their launch tasks");
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }
        debug!("worker fleet shut down");
    }
}

/// Places, stages and starts one agent per worker. Does not wait for
/// registration; callers hold the barrier themselves so a partial launch can
/// still be torn down.
pub async fn launch_fleet(
    infra: Arc<dyn Infrastructure>,
    benchmark: &Benchmark,
    control: &ControlConfig,
    server: JoinHandle<()>,
) -> HarnessResult<WorkerFleet> {
    let staged = async {
        let mappings = place_workers(benchmark, infra.nodes())?;
        stage_payload(infra.as_ref(), &benchmark.payload)
            .await
            .map_err(|e| HarnessError::Provisioning(format!("payload staging failed: {:#}", e)))?;
        Ok::<_, HarnessError>(mappings)
    }
    .await;

    // nothing launched yet, so the control server is ours to stop
    let mappings = match staged {
        Ok(mappings) => mappings,
        Err(e) => {
            server.abort();
            return Err(e);
        }
    };

    let coordinator = format!(
        "http://{}:{}",
        advertise_host(control, infra.nodes()),
        control.port
    );
    info!(
        "launching {} workers, coordinator at {}",
        mappings.len(),
        coordinator
    );

    let mut workers = JoinSet::new();
    for mapping in mappings.iter() {
        let no_args = vec![];
        let argv = agent_argv(
            mapping,
            &coordinator,
            benchmark.worker_args.get(&mapping.role).unwrap_or(&no_args),
        );
        let infra = infra.clone();
        let mapping = mapping.clone();
        workers.spawn(async move {
            match infra.run_command(&mapping.node, &argv).await {
                Ok(output) if output.success() => {
                    debug!("worker {} exited cleanly", mapping.id);
                }
                Ok(output) => {
                    warn!(
                        "worker {} exited with status {}: {}",
                        mapping.id,
                        output.status,
                        output.stderr.trim()
                    );
                }
                Err(e) => {
                    warn!("worker {} launch failed: {:#}", mapping.id, e);
                }
            }
        });
    }

    Ok(WorkerFleet {
        mappings,
        server,
        workers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::workload::WorkloadParams;
    use std::collections::HashMap;

    fn nodes(count: usize) -> Vec<Node> {
        (0..count)
            .map(|index| Node {
                index,
                address: format!("10.0.0.{}", index + 1),
            })
            .collect()
    }

    fn benchmark(placement: Placement) -> Benchmark {
        Benchmark {
            name: "put_throughput".to_string(),
            roles: vec![
                Role {
                    name: "server".to_string(),
                    count: 2,
                },
                Role {
                    name: "client".to_string(),
                    count: 3,
                },
            ],
            before: vec![],
            workload: vec![],
            after: vec![],
            params: WorkloadParams::default(),
            placement,
            worker_args: HashMap::new(),
            payload: vec![],
        }
    }

    #[test]
    fn spread_placement_wraps_round_the_nodes() -> anyhow::Result<()> {
        let mappings = place_workers(&benchmark(Placement::Spread), &nodes(2))?;

        assert_eq!(mappings.len(), 5);
        assert_eq!(
            mappings.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert_eq!(
            mappings.iter().map(|m| m.node.index).collect::<Vec<_>>(),
            vec![0, 1, 0, 1, 0]
        );
        assert_eq!(mappings[1].role, "server");
        assert_eq!(mappings[2].role, "client");
        Ok(())
    }

    #[test]
    fn pack_placement_stacks_everything_on_the_first_node() -> anyhow::Result<()> {
        let mappings = place_workers(&benchmark(Placement::Pack), &nodes(3))?;
        assert!(mappings.iter().all(|m| m.node.index == 0));
        Ok(())
    }

    #[test]
    fn placement_needs_at_least_one_node() {
        let err = place_workers(&benchmark(Placement::Spread), &[]).unwrap_err();
        assert!(matches!(err, HarnessError::Provisioning(_)));
    }

    #[test]
    fn agent_argv_carries_identity_and_extra_args() {
        let mapping = WorkerMapping {
            id: 4,
            role: "client".to_string(),
            node: Node {
                index: 1,
                address: "10.0.0.2".to_string(),
            },
        };
        let argv = agent_argv(
            &mapping,
            "http://coordinator:33333",
            &["--cache-size".to_string()],
        );

        assert_eq!(argv[0], "./flotilla-payload/flotilla-agent");
        let joined = argv.join(" ");
        assert!(joined.contains("--id 4"));
        assert!(joined.contains("--role client"));
        assert!(joined.contains("--output-dir output/client-4"));
        assert!(joined.contains("--advertise-host 10.0.0.2"));
        assert!(joined.contains("--worker-arg --cache-size"));
    }

    #[test]
    fn advertise_host_prefers_explicit_config() {
        let control = ControlConfig {
            advertise_host: Some("coordinator.internal".to_string()),
            ..Default::default()
        };
        assert_eq!(advertise_host(&control, &nodes(2)), "coordinator.internal");
    }

    #[test]
    fn loopback_fleets_advertise_loopback() {
        let loopback = vec![
            Node {
                index: 0,
                address: "127.0.0.1".to_string(),
            },
            Node {
                index: 1,
                address: "127.0.0.1".to_string(),
            },
        ];
        assert_eq!(
            advertise_host(&ControlConfig::default(), &loopback),
            "127.0.0.1"
        );
    }
}
