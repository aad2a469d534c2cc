/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::config::{Benchmark, Config, ControlConfig, Phase, Step, TaskSpec};
use crate::workload::WorkloadParams;
use crate::control::{self, Dispatcher, Registry, TaskContext, TaskRequest, WorkerMapping};
use crate::errors::{HarnessError, HarnessResult};
use crate::infra::{self, Infrastructure};
use crate::launcher;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// generous slack on top of a workload's own duration before the worker is
// declared stuck
const WORKLOAD_TIMEOUT_SLACK_SECS: u64 = 60;

/// Runs the named benchmarks in order, each on freshly provisioned
/// infrastructure. Stops at the first failure or on cancellation.
pub async fn run(
    config: &Config,
    benchmark_names: &[String],
    token: &CancellationToken,
) -> anyhow::Result<Vec<PathBuf>> {
    let benchmarks = config.find_benchmarks(benchmark_names)?;

    let mut run_dirs = vec![];
    for benchmark in benchmarks {
        if token.is_cancelled() {
            warn!("run cancelled, skipping remaining benchmarks");
            break;
        }
        let run_dir = run_benchmark(config, benchmark, token)
            .await
            .context(format!("Benchmark {} failed", benchmark.name))?;
        run_dirs.push(run_dir);
    }
    Ok(run_dirs)
}

/// Provisions, launches, drives the three phases and harvests the results of
/// one benchmark. Infrastructure teardown runs no matter how the rest went.
pub async fn run_benchmark(
    config: &Config,
    benchmark: &Benchmark,
    token: &CancellationToken,
) -> HarnessResult<PathBuf> {
    let run_dir = config.output_root.join(&benchmark.name);
    if run_dir.exists() {
        return Err(HarnessError::DuplicateRun(run_dir));
    }

    info!(
        "running benchmark {} with {} workers",
        benchmark.name,
        benchmark.total_workers()
    );
    let mut infra = infra::from_config(&config.infrastructure);
    infra.provision(benchmark.total_workers()).await?;
    let infra: Arc<dyn Infrastructure> = Arc::from(infra);

    // the control server comes up before any worker so registration can
    // never race it
    let registry = Registry::new();
    let server = control::start(registry.clone(), config.control.port).await?;

    let result = drive(infra.clone(), &registry, config, benchmark, &run_dir, server, token).await;

    infra.teardown().await;
    match &result {
        Ok(_) => info!("benchmark {} finished, results in {:?}", benchmark.name, run_dir),
        Err(e) => warn!("benchmark {} failed: {}", benchmark.name, e),
    }
    result
}

async fn drive(
    infra: Arc<dyn Infrastructure>,
    registry: &Registry,
    config: &Config,
    benchmark: &Benchmark,
    run_dir: &Path,
    server: tokio::task::JoinHandle<()>,
    token: &CancellationToken,
) -> HarnessResult<PathBuf> {
    let fleet = launcher::launch_fleet(infra.clone(), benchmark, &config.control, server).await?;

    let phases = async {
        registry
            .await_registration(
                &fleet.worker_ids(),
                Duration::from_secs(config.control.registration_timeout_secs),
            )
            .await?;
        run_phases(registry, &config.control, benchmark, &fleet.mappings, token).await
    }
    .await;

    let result = match phases {
        Ok(()) => pull_results(infra.as_ref(), &fleet.mappings, run_dir).await,
        Err(e) => Err(e),
    };

    fleet.shutdown().await;
    result.map(|_| run_dir.to_path_buf())
}

/// Drives the before, workload and after phases in strict order against an
/// already-registered fleet. Within a step, dispatch fans out to every
/// worker of the targeted roles and the step joins before the next starts.
/// The first failed step skips the rest of the run.
pub async fn run_phases(
    registry: &Registry,
    control: &ControlConfig,
    benchmark: &Benchmark,
    mappings: &[WorkerMapping],
    token: &CancellationToken,
) -> HarnessResult<()> {
    let dispatcher = Dispatcher::new(registry.clone());
    let context = TaskContext {
        mappings: mappings.to_vec(),
    };

    for phase in [Phase::Before, Phase::Workload, Phase::After] {
        for step in benchmark.steps_for(phase) {
            run_step(&dispatcher, control, benchmark, phase, step, &context, token).await?;
        }
    }
    Ok(())
}

async fn run_step(
    dispatcher: &Dispatcher,
    control: &ControlConfig,
    benchmark: &Benchmark,
    phase: Phase,
    step: &Step,
    context: &TaskContext,
    token: &CancellationToken,
) -> HarnessResult<()> {
    let task = resolve_task(&step.task, &benchmark.params);
    let timeout = step_timeout(&task, control);
    let targets: Vec<usize> = context
        .mappings
        .iter()
        .filter(|mapping| step.roles.contains(&mapping.role))
        .map(|mapping| mapping.id)
        .collect();

    info!(
        "{}: dispatching a {} step to {} workers ({:?})",
        benchmark.name,
        phase,
        targets.len(),
        step.roles
    );

    let mut calls = JoinSet::new();
    for id in targets {
        let request = TaskRequest {
            benchmark: benchmark.name.clone(),
            phase,
            task: task.clone(),
            context: context.clone(),
        };
        let dispatcher = dispatcher.clone();
        let token = token.clone();
        calls.spawn(async move { (id, dispatcher.dispatch(id, &request, timeout, &token).await) });
    }

    // join the whole fan-out before judging the step, so no call is ever
    // abandoned mid-flight
    let mut failure = None;
    while let Some(joined) = calls.join_next().await {
        match joined {
            Ok((id, Ok(outcome))) => debug!("worker {} completed: {}", id, outcome.detail),
            Ok((id, Err(e))) => {
                warn!("worker {} failed the {} step: {}", id, phase, e);
                failure.get_or_insert(e);
            }
            Err(e) => {
                failure.get_or_insert(HarnessError::Other(anyhow::anyhow!(
                    "a dispatch task panicked: {}",
                    e
                )));
            }
        }
    }
    match failure {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// A workload step with no parameters of its own inherits the benchmark
/// defaults, so the agent never has to guess.
fn resolve_task(task: &TaskSpec, defaults: &WorkloadParams) -> TaskSpec {
    match task {
        TaskSpec::Workload { operation, params } => TaskSpec::Workload {
            operation: operation.clone(),
            params: Some(params.unwrap_or(*defaults)),
        },
        exec => exec.clone(),
    }
}

fn step_timeout(task: &TaskSpec, control: &ControlConfig) -> Duration {
    match task {
        TaskSpec::Workload {
            params: Some(params),
            ..
        } => Duration::from_secs(
            params.warmup_secs + params.duration_secs + WORKLOAD_TIMEOUT_SLACK_SECS,
        ),
        _ => Duration::from_secs(control.call_timeout_secs),
    }
}

async fn pull_results(
    infra: &dyn Infrastructure,
    mappings: &[WorkerMapping],
    run_dir: &Path,
) -> HarnessResult<()> {
    std::fs::create_dir_all(run_dir)
        .context(format!("Unable to create run directory {:?}", run_dir))
        .map_err(HarnessError::Other)?;

    for mapping in mappings {
        let src = launcher::worker_output_dir(&mapping.role, mapping.id);
        let dest = run_dir.join(format!("{}-{}", mapping.role, mapping.id));
        infra
            .pull_tree(&mapping.node, &src, &dest)
            .await
            .context(format!("Unable to pull results from worker {}", mapping.id))?;
    }
    Ok(())
}
