use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run benchmarks from a config file
    Run {
        /// Path to the config file
        #[arg(short, long, default_value = "./flotilla.toml")]
        config: String,

        /// Names of the benchmarks to run, every benchmark in the config
        /// when empty
        benchmarks: Vec<String>,
    },

    /// Compare the result trees of two finished runs
    Compare {
        /// Output tree of the run under test
        candidate_dir: String,

        /// Output tree to compare against
        baseline_dir: String,

        /// Print the plain fixed-width report instead of the table
        #[arg(long)]
        text: bool,
    },
}

pub fn parse() -> Args {
    Args::parse()
}

/// Launch arguments of the worker agent. The coordinator builds this exact
/// command line when it starts an agent on a provisioned node.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct AgentArgs {
    /// Base url of the coordinator's control server
    #[arg(long)]
    pub coordinator: String,

    /// This worker's id, unique within the run
    #[arg(long)]
    pub id: usize,

    /// Role this worker fills
    #[arg(long)]
    pub role: String,

    /// Directory the worker writes its results into
    #[arg(long)]
    pub output_dir: String,

    /// Host the control server can reach this worker on
    #[arg(long)]
    pub advertise_host: String,

    /// Extra argument handed to every task this worker runs, repeatable
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    pub worker_args: Vec<String>,
}

pub fn parse_agent() -> AgentArgs {
    AgentArgs::parse()
}
