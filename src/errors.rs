use std::path::PathBuf;
use thiserror::Error;

/// Errors that can abort a benchmark run or its analysis.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to provision infrastructure: {0}")]
    Provisioning(String),

    #[error("workers failed to register within {timeout_secs}s, missing ids: {missing:?}")]
    RegistrationTimeout {
        timeout_secs: u64,
        missing: Vec<usize>,
    },

    #[error("worker {0} is not registered")]
    UnknownWorker(usize),

    #[error("task failed on worker {worker}: {detail}")]
    TaskFailed { worker: usize, detail: String },

    #[error("worker {worker} became unreachable during a task: {detail}")]
    WorkerUnreachable { worker: usize, detail: String },

    #[error("dispatch to worker {worker} was cancelled")]
    Cancelled { worker: usize },

    #[error("benchmark output directory already exists: {0:?}")]
    DuplicateRun(PathBuf),

    #[error("missing probe data file: {0:?}")]
    MissingProbeData(PathBuf),

    #[error("invalid data line in {path:?}: {line}")]
    MalformedLine { path: PathBuf, line: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;
