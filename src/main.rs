use anyhow::Result;
use lightmon::{
    cli::{self, Command},
    config::LightmonConfig,
    daemon,
};

#[tokio::main]
async fn main() {
    // Parse cli and handle clap errors
    let options = cli::parse_from_args();

    // Override the default log_level if there is a greater verbosity flag
    lightmon::init_logger(options.override_log_level());

    match run(&options).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            cli::report_error(&e);
            std::process::exit(1);
        }
    }
}

async fn run(options: &cli::LightmonOpts) -> Result<()> {
    let config = LightmonConfig::load(options)?;
    match options.command {
        Some(Command::Containers) => daemon::list_containers(&config),
        None => daemon::lightmon_daemon_run(config).await,
    }
}
