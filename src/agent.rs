/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

mod errors;

use crate::config::{Redirect, TaskSpec};
use crate::control::{RegisterRequest, TaskContext, TaskOutcome, TaskRequest};
use crate::range::KeyRange;
use crate::workload;
use anyhow::Context;
use axum::{extract, routing::post, Json, Router};
use errors::AgentError;
use itertools::Itertools;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use subprocess::{Exec, NullFile, Redirection};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const PING_INTERVAL_MS: u64 = 1000;
const REGISTER_ATTEMPTS: usize = 10;

/// Everything an agent knows about itself, fixed at launch.
#[derive(Clone, Debug)]
pub struct AgentSettings {
    pub id: usize,
    pub role: String,
    pub coordinator: String,
    pub advertise_host: String,
    pub output_dir: PathBuf,
    pub worker_args: Vec<String>,
}

/// Runs the given command as a detached process. This function does not block
/// because the process is managed by the OS and running separately from this
/// thread.
fn run_command_detached(
    command: &str,
    redirect: &Option<Redirect>,
    env: &[(String, String)],
) -> Result<u32, AgentError> {
    let redirect = redirect.unwrap_or(Redirect::File);

    // break command string into POSIX words
    let words = shlex::split(command).ok_or_else(|| {
        AgentError::TaskFailed(format!("Command string is not POSIX compliant: {}", command))
    })?;

    match &words[..] {
        [command, args @ ..] => {
            let mut exec = Exec::cmd(command).args(args);
            for (key, value) in env {
                exec = exec.env(key, value);
            }

            let exec = match redirect {
                Redirect::Null => exec.stdout(NullFile).stderr(NullFile),
                Redirect::Parent => exec,
                Redirect::File => {
                    let out_file = File::create(Path::new("./.stdout"))
                        .context("Unable to create ./.stdout")?;
                    let err_file = File::create(Path::new("./.stderr"))
                        .context("Unable to create ./.stderr")?;

                    exec.stdout(Redirection::File(out_file))
                        .stderr(Redirection::File(err_file))
                }
            };

            let pid = exec
                .detached()
                .popen()
                .context(format!(
                    "Failed to spawn detached process, command: {}",
                    command
                ))?
                .pid()
                .context("Process should have a PID")?;
            Ok(pid)
        }
        _ => Err(AgentError::TaskFailed(
            "Cannot run an empty command".to_string(),
        )),
    }
}

/// Runs a command to completion. A non-zero exit status is a task failure
/// carrying the command's stderr.
async fn run_command(command: &str, env: &[(String, String)]) -> Result<String, AgentError> {
    let words = shlex::split(command).ok_or_else(|| {
        AgentError::TaskFailed(format!("Command string is not POSIX compliant: {}", command))
    })?;
    let (program, args) = words.split_first().ok_or_else(|| {
        AgentError::TaskFailed("Cannot run an empty command".to_string())
    })?;

    let output = tokio::process::Command::new(program)
        .args(args)
        .envs(env.iter().map(|(key, value)| (key, value)))
        .kill_on_drop(true)
        .output()
        .await
        .context(format!("Failed to run {}", program))?;

    if output.status.success() {
        Ok(format!("{} exited cleanly", program))
    } else {
        Err(AgentError::TaskFailed(format!(
            "{} exited with status {}: {}",
            command,
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// The run context, flattened into the environment so exec'd steps can find
/// their peers without speaking the control protocol.
fn task_environment(settings: &AgentSettings, context: &TaskContext) -> Vec<(String, String)> {
    let mut env = vec![
        ("FLOTILLA_WORKER_ID".to_string(), settings.id.to_string()),
        ("FLOTILLA_ROLE".to_string(), settings.role.clone()),
        (
            "FLOTILLA_OUTPUT_DIR".to_string(),
            settings.output_dir.to_string_lossy().to_string(),
        ),
    ];
    if !settings.worker_args.is_empty() {
        env.push((
            "FLOTILLA_WORKER_ARGS".to_string(),
            settings.worker_args.join(" "),
        ));
    }
    for role in context
        .mappings
        .iter()
        .map(|mapping| mapping.role.as_str())
        .unique()
    {
        let var = role
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect::<String>();
        env.push((
            format!("FLOTILLA_HOSTS_{}", var),
            context.hosts_for_role(role).join(","),
        ));
    }
    env
}

async fn execute(
    extract::State(settings): extract::State<Arc<AgentSettings>>,
    extract::Json(request): extract::Json<TaskRequest>,
) -> Result<Json<TaskOutcome>, AgentError> {
    info!(
        "worker {} running a {} {} task",
        settings.id, request.benchmark, request.phase
    );

    let detail = match request.task {
        TaskSpec::Exec {
            command,
            detach,
            redirect,
        } => {
            let env = task_environment(&settings, &request.context);
            if detach {
                let pid = run_command_detached(&command, &redirect, &env)?;
                format!("detached pid {}", pid)
            } else {
                run_command(&command, &env).await?
            }
        }
        TaskSpec::Workload { operation, params } => {
            let params = params.unwrap_or_default();
            // this worker's share of the keyspace, by rank among its role peers
            let peers = request.context.ids_for_role(&settings.role);
            let position = peers.iter().position(|id| *id == settings.id).unwrap_or(0);
            let key_range =
                KeyRange::new(0, params.keys as i64)?.slice_for(peers.len().max(1), position);

            let output_dir = settings.output_dir.clone();
            let report = tokio::task::spawn_blocking(move || {
                workload::run(&operation, &params, key_range, &output_dir)
            })
            .await
            .map_err(|e| anyhow::anyhow!("Workload task panicked: {}", e))??;
            format!(
                "ran {} ops at {:.2} ops/sec",
                report.total_ops, report.mean_ops_per_sec
            )
        }
    };

    Ok(Json(TaskOutcome { detail }))
}

fn create_app(settings: Arc<AgentSettings>) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .with_state(settings)
}

async fn register(settings: &AgentSettings, endpoint: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let request = RegisterRequest {
        id: settings.id,
        role: settings.role.clone(),
        endpoint: endpoint.to_string(),
    };

    let mut last_error = String::new();
    for attempt in 1..=REGISTER_ATTEMPTS {
        match client
            .post(format!("{}/register", settings.coordinator))
            .timeout(Duration::from_secs(5))
            .json(&request)
            .send()
            .await
            .and_then(|response| response.error_for_status())
        {
            Ok(_) => return Ok(()),
            Err(e) => {
                debug!("registration attempt {} failed: {}", attempt, e);
                last_error = e.to_string();
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    Err(anyhow::anyhow!(
        "Unable to register with the coordinator at {}: {}",
        settings.coordinator,
        last_error
    ))
}

/// Polls the coordinator and exits the process once it stops answering. The
/// coordinator going away is the orderly end of a run, not a failure.
pub fn start_liveness_probe(coordinator: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let mut tick = tokio::time::interval(Duration::from_millis(PING_INTERVAL_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tick.tick().await;
            let alive = client
                .get(format!("{}/alive", coordinator))
                .timeout(Duration::from_secs(5))
                .send()
                .await
                .map(|response| response.status().is_success())
                .unwrap_or(false);
            if !alive {
                info!("coordinator at {} is gone, shutting down", coordinator);
                std::process::exit(0);
            }
        }
    })
}

/// Binds the task endpoint on an ephemeral port, announces it to the
/// coordinator and serves until the liveness probe ends the process.
pub async fn serve(settings: AgentSettings) -> anyhow::Result<()> {
    std::fs::create_dir_all(&settings.output_dir).context(format!(
        "Unable to create output directory {:?}",
        settings.output_dir
    ))?;

    let listener = tokio::net::TcpListener::bind("0.0.0.0:0")
        .await
        .context("Unable to bind the task endpoint")?;
    let endpoint = format!(
        "http://{}:{}",
        settings.advertise_host,
        listener.local_addr()?.port()
    );

    register(&settings, &endpoint).await?;
    start_liveness_probe(settings.coordinator.clone());

    info!(
        "agent {} ({}) serving tasks at {}",
        settings.id, settings.role, endpoint
    );
    let app = create_app(Arc::new(settings));
    axum::serve(listener, app)
        .await
        .context("Error serving the task endpoint")
}
