use anyhow::{bail, Context};
use dotenvy::dotenv;
use flotilla::{analysis, clap_args, config::Config, scheduler};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, subscriber::set_global_default, warn, Subscriber};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let args = clap_args::parse();
    let subscriber = get_subscriber(if args.verbose { "debug" } else { "info" }.into());
    init_subscriber(subscriber);

    match args.command {
        clap_args::Commands::Run { config, benchmarks } => {
            let config = Config::try_from_path(Path::new(&config))?;

            // an interrupt cancels in-flight dispatches; teardown still runs
            let token = CancellationToken::new();
            let handler_token = token.clone();
            ctrlc::set_handler(move || {
                warn!("interrupt received, cancelling the run");
                handler_token.cancel();
            })
            .context("Unable to install the interrupt handler")?;

            let run_dirs = scheduler::run(&config, &benchmarks, &token).await?;
            for run_dir in run_dirs {
                info!("results in {:?}", run_dir);
            }
        }

        clap_args::Commands::Compare {
            candidate_dir,
            baseline_dir,
            text,
        } => {
            let candidate = Path::new(&candidate_dir);
            let baseline = Path::new(&baseline_dir);
            if !candidate.is_dir() {
                bail!("candidate directory {} does not exist", candidate_dir);
            }
            if !baseline.is_dir() {
                bail!("baseline directory {} does not exist", baseline_dir);
            }

            let comparison = analysis::analyze(candidate, baseline)?;
            if text {
                analysis::report::write_text(&comparison, &mut std::io::stdout())?;
            } else {
                analysis::report::print_summary(&comparison);
            }
        }
    }

    Ok(())
}

fn get_subscriber(env_filter: String) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish()
}

fn init_subscriber(subscriber: impl Subscriber + Sync + Send) {
    set_global_default(subscriber).expect("Failed to set subscriber");
}
