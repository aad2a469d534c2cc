/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::config::{Phase, TaskSpec};
use crate::errors::{HarnessError, HarnessResult};
use crate::infra::Node;
use anyhow::Context;
use axum::{
    extract,
    routing::{get, post},
    Json, Router,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where one worker ended up after placement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerMapping {
    pub id: usize,
    pub role: String,
    pub node: Node,
}

/// Sent by an agent once its task endpoint is listening.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub id: usize,
    pub role: String,
    pub endpoint: String,
}

/// A task plus everything the agent needs to run it without calling home.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRequest {
    pub benchmark: String,
    pub phase: Phase,
    pub task: TaskSpec,
    pub context: TaskContext,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskContext {
    pub mappings: Vec<WorkerMapping>,
}

impl TaskContext {
    /// Addresses of the nodes hosting a role, deduplicated in placement order.
    pub fn hosts_for_role(&self, role: &str) -> Vec<String> {
        self.mappings
            .iter()
            .filter(|mapping| mapping.role == role)
            .map(|mapping| mapping.node.address.clone())
            .unique()
            .collect()
    }

    /// Worker ids holding `role`, in ascending order. A worker's position in
    /// this list is its stable rank among peers, used to carve up shared
    /// work such as a keyspace.
    pub fn ids_for_role(&self, role: &str) -> Vec<usize> {
        self.mappings
            .iter()
            .filter(|mapping| mapping.role == role)
            .map(|mapping| mapping.id)
            .sorted()
            .collect()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub detail: String,
}

#[derive(Clone, Debug)]
pub struct WorkerHandle {
    pub role: String,
    pub endpoint: String,
}

// ******** ******** ********
// **       REGISTRY       **
// ******** ******** ********

/// Tracks which workers have checked in. Shared between the control server,
/// which fills it, and the scheduler, which waits on it.
#[derive(Clone, Default)]
pub struct Registry {
    workers: Arc<RwLock<HashMap<usize, WorkerHandle>>>,
    arrivals: Arc<Notify>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Re-registration overwrites the previous endpoint, so a restarted
    /// worker simply takes over its old id.
    pub async fn register(&self, req: RegisterRequest) {
        debug!("worker {} ({}) registered at {}", req.id, req.role, req.endpoint);
        self.workers.write().await.insert(
            req.id,
            WorkerHandle {
                role: req.role,
                endpoint: req.endpoint,
            },
        );
        self.arrivals.notify_one();
    }

    pub async fn endpoint(&self, id: usize) -> Option<String> {
        self.workers
            .read()
            .await
            .get(&id)
            .map(|handle| handle.endpoint.clone())
    }

    async fn missing_ids(&self, expected: &[usize]) -> Vec<usize> {
        let workers = self.workers.read().await;
        expected
            .iter()
            .filter(|id| !workers.contains_key(id))
            .copied()
            .sorted()
            .collect()
    }

    /// Blocks until every expected worker has registered, or fails naming
    /// the ones that never arrived.
    pub async fn await_registration(
        &self,
        expected: &[usize],
        timeout: Duration,
    ) -> HarnessResult<()> {
        let all_arrived = async {
            loop {
                if self.missing_ids(expected).await.is_empty() {
                    return;
                }
                self.arrivals.notified().await;
            }
        };

        match tokio::time::timeout(timeout, all_arrived).await {
            Ok(()) => {
                info!("all {} workers registered", expected.len());
                Ok(())
            }
            Err(_) => Err(HarnessError::RegistrationTimeout {
                timeout_secs: timeout.as_secs(),
                missing: self.missing_ids(expected).await,
            }),
        }
    }
}

// ******** ******** ********
// **   CONTROL  SERVER    **
// ******** ******** ********

async fn register_worker(
    extract::State(registry): extract::State<Registry>,
    extract::Json(body): extract::Json<RegisterRequest>,
) -> Json<serde_json::Value> {
    registry.register(body).await;
    Json(json!({ "ok": true }))
}

async fn alive() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

/// Binds the coordinator endpoint and serves it on a background task. The
/// bind happens before spawning so a port clash fails the run up front.
pub async fn start(registry: Registry, port: u16) -> anyhow::Result<JoinHandle<()>> {
    let app = Router::new()
        .route("/register", post(register_worker))
        .route("/alive", get(alive))
        .with_state(registry);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .context(format!("Unable to bind control port {}", port))?;
    info!("control channel listening on port {}", port);

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("control channel stopped: {}", e);
        }
    }))
}

// ******** ******** ********
// **       DISPATCH       **
// ******** ******** ********

/// Sends tasks to registered workers and translates every way the exchange
/// can go wrong into a distinct error.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Registry,
    client: reqwest::Client,
}

impl Dispatcher {
    pub fn new(registry: Registry) -> Self {
        Dispatcher {
            registry,
            client: reqwest::Client::new(),
        }
    }

    pub async fn dispatch(
        &self,
        id: usize,
        request: &TaskRequest,
        timeout: Duration,
        token: &CancellationToken,
    ) -> HarnessResult<TaskOutcome> {
        let endpoint = self
            .registry
            .endpoint(id)
            .await
            .ok_or(HarnessError::UnknownWorker(id))?;

        debug!(
            "dispatching {} {} task to worker {}",
            request.benchmark, request.phase, id
        );
        let call = self
            .client
            .post(format!("{}/execute", endpoint))
            .timeout(timeout)
            .json(request)
            .send();

        let response = tokio::select! {
            response = call => response,
            _ = token.cancelled() => return Err(HarnessError::Cancelled { worker: id }),
        };

        // transport problems and timeouts mean the worker cannot be reached,
        // an error body means the worker ran the task and it failed
        let response = response.map_err(|e| HarnessError::WorkerUnreachable {
            worker: id,
            detail: e.to_string(),
        })?;

        if response.status().is_success() {
            response
                .json::<TaskOutcome>()
                .await
                .map_err(|e| HarnessError::WorkerUnreachable {
                    worker: id,
                    detail: e.to_string(),
                })
        } else {
            let detail = match response.json::<serde_json::Value>().await {
                Ok(body) => body["error"]
                    .as_str()
                    .unwrap_or("worker returned no detail")
                    .to_string(),
                Err(e) => e.to_string(),
            };
            Err(HarnessError::TaskFailed { worker: id, detail })
        }
    }
}
