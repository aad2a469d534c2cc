use flotilla::agent::{self, AgentSettings};
use flotilla::clap_args;
use std::path::PathBuf;
use tracing::{error, subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = clap_args::parse_agent();
    let subscriber = get_subscriber("info".into());
    init_subscriber(subscriber);

    let settings = AgentSettings {
        id: args.id,
        role: args.role,
        coordinator: args.coordinator,
        advertise_host: args.advertise_host,
        output_dir: PathBuf::from(args.output_dir),
        worker_args: args.worker_args,
    };

    // an orderly shutdown never reaches this point, the liveness probe ends
    // the process once the coordinator goes away
    if let Err(e) = agent::serve(settings).await {
        error!("agent failed to start: {:#}", e);
        std::process::exit(1);
    }
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
