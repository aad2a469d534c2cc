use crate::workload::{Operation, WorkloadParams};
use anyhow::Context;
use itertools::Itertools;
use std::{
    collections::HashMap,
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONTROL_PORT: u16 = 33333;
pub const DEFAULT_REGISTRATION_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 600;

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub infrastructure: InfrastructureConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    #[serde(rename(serialize = "benchmark", deserialize = "benchmark"))]
    pub benchmarks: Vec<Benchmark>,
}
impl Config {
    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config file {:?}", path))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        let config =
            toml::from_str::<Config>(conf_str).map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))?;
        for benchmark in config.benchmarks.iter() {
            benchmark.validate()?;
        }
        Ok(config)
    }

    pub fn find_benchmark(&self, benchmark_name: &str) -> anyhow::Result<&Benchmark> {
        self.benchmarks
            .iter()
            .find(|benchmark| benchmark.name == benchmark_name)
            .context(format!(
                "Unable to find benchmark with name {}",
                benchmark_name
            ))
    }

    /// Resolves the given names to benchmarks, or every configured benchmark
    /// when no names are given.
    pub fn find_benchmarks(&self, benchmark_names: &[String]) -> anyhow::Result<Vec<&Benchmark>> {
        if benchmark_names.is_empty() {
            return Ok(self.benchmarks.iter().collect());
        }

        let mut benchmarks = vec![];
        for benchmark_name in benchmark_names {
            let benchmark = self.find_benchmark(benchmark_name)?;
            benchmarks.push(benchmark);
        }
        Ok(benchmarks)
    }
}

fn default_output_root() -> PathBuf {
    PathBuf::from("./results")
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum InfrastructureConfig {
    Local,
    Ssh {
        hosts: Vec<String>,
        user: Option<String>,
    },
    Cloud {
        name_prefix: String,
        user: Option<String>,
        project: Option<String>,
    },
}
impl Default for InfrastructureConfig {
    fn default() -> Self {
        InfrastructureConfig::Local
    }
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
pub struct ControlConfig {
    #[serde(default = "default_control_port")]
    pub port: u16,
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_secs: u64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    pub advertise_host: Option<String>,
}
impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            port: DEFAULT_CONTROL_PORT,
            registration_timeout_secs: DEFAULT_REGISTRATION_TIMEOUT_SECS,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            advertise_host: None,
        }
    }
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_registration_timeout() -> u64 {
    DEFAULT_REGISTRATION_TIMEOUT_SECS
}

fn default_call_timeout() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}

/// How worker instances are placed onto provisioned nodes.
#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    /// One worker per node, wrapping round when there are more workers than
    /// nodes.
    #[default]
    Spread,
    /// Every worker on the first node.
    Pack,
}

#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Serialize)]
#[serde(tag = "to", rename_all = "lowercase")]
pub enum Redirect {
    Null,
    Parent,
    File,
}

#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Benchmark {
    pub name: String,
    #[serde(rename(serialize = "role", deserialize = "role"))]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub before: Vec<Step>,
    #[serde(default)]
    pub workload: Vec<Step>,
    #[serde(default)]
    pub after: Vec<Step>,
    #[serde(flatten)]
    pub params: WorkloadParams,
    #[serde(default)]
    pub placement: Placement,
    /// Extra launch arguments passed to every agent of the given role.
    #[serde(default)]
    pub worker_args: HashMap<String, Vec<String>>,
    /// Extra files or directories shipped to every node alongside the agent.
    #[serde(default)]
    pub payload: Vec<PathBuf>,
}
impl Benchmark {
    pub fn total_workers(&self) -> usize {
        self.roles.iter().map(|role| role.count).sum()
    }

    pub fn steps_for(&self, phase: Phase) -> &[Step] {
        match phase {
            Phase::Before => &self.before,
            Phase::Workload => &self.workload,
            Phase::After => &self.after,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow::anyhow!("Benchmark must have a name."));
        }
        if self.roles.is_empty() {
            return Err(anyhow::anyhow!(
                "Benchmark {} does not declare any roles.",
                self.name
            ));
        }
        for role in self.roles.iter() {
            if role.name.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "Benchmark {} contains a role with an empty name.",
                    self.name
                ));
            }
            if role.count == 0 {
                return Err(anyhow::anyhow!(
                    "Benchmark {}: role {} must have a count of at least 1.",
                    self.name,
                    role.name
                ));
            }
        }
        let duplicates = self
            .roles
            .iter()
            .map(|role| role.name.as_str())
            .duplicates()
            .collect_vec();
        if !duplicates.is_empty() {
            return Err(anyhow::anyhow!(
                "Benchmark {} declares duplicate roles: {:?}",
                self.name,
                duplicates
            ));
        }

        let role_names = self
            .roles
            .iter()
            .map(|role| role.name.as_str())
            .collect_vec();
        for (phase, steps) in [
            (Phase::Before, &self.before),
            (Phase::Workload, &self.workload),
            (Phase::After, &self.after),
        ] {
            for step in steps.iter() {
                if step.roles.is_empty() {
                    return Err(anyhow::anyhow!(
                        "Benchmark {}: a {} step does not target any roles.",
                        self.name,
                        phase
                    ));
                }
                for role in step.roles.iter() {
                    if !role_names.contains(&role.as_str()) {
                        return Err(anyhow::anyhow!(
                            "Benchmark {}: a {} step targets unknown role {}.",
                            self.name,
                            phase,
                            role
                        ));
                    }
                }
            }
        }

        for role in self.worker_args.keys() {
            if !role_names.contains(&role.as_str()) {
                return Err(anyhow::anyhow!(
                    "Benchmark {}: worker_args given for unknown role {}.",
                    self.name,
                    role
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Role {
    pub name: String,
    pub count: usize,
}

/// The three fixed phases of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Before,
    Workload,
    After,
}
impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Before => write!(f, "before"),
            Phase::Workload => write!(f, "workload"),
            Phase::After => write!(f, "after"),
        }
    }
}

/// One dispatchable unit of work bound to the roles it targets.
#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
pub struct Step {
    #[serde(flatten)]
    pub task: TaskSpec,
    pub roles: Vec<String>,
}

/// Data-only command interpreted by the agent's dispatcher. Nothing
/// executable crosses the wire.
#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
#[serde(tag = "task", rename_all = "lowercase")]
pub enum TaskSpec {
    Exec {
        command: String,
        /// Spawn without waiting for completion, e.g. to start a server the
        /// workload runs against.
        #[serde(default)]
        detach: bool,
        redirect: Option<Redirect>,
    },
    Workload {
        operation: Operation,
        /// Filled in from the benchmark defaults at dispatch time when not
        /// set on the step itself.
        params: Option<WorkloadParams>,
    },
}
