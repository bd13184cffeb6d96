// src/main.rs - roadopt entry point

use clap::Parser;

use roadopt::cli::{run, Cli};
use roadopt::infra::config::Config;
use roadopt::infra::logger;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logger::init_logging(&cli.log_level, cli.verbose);

    if let Err(e) = execute(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let mut config = if let Some(ref path) = cli.config {
        Config::load_from(std::path::Path::new(path))?
    } else {
        Config::load()?
    };
    cli.apply_overrides(&mut config);
    config.validate()?;

    let report = run::run_search(cli.command.strategy(), &config).await?;
    run::print_report(&report, cli.json)
}
