//! brickflow developer CLI.
//!
//! Binary name: `brickflow`
//!
//! Validates workflow documents and lists what the engine knows about
//! without running anything.

mod cli;

use clap::Parser;

use brickflow_infra::{load_engine_config, resolve_data_dir};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.clone().unwrap_or_else(resolve_data_dir);
    let mut config = load_engine_config(&data_dir).await;
    config.log.level = match cli.verbose {
        0 if cli.quiet => "error".to_string(),
        0 => "warn".to_string(),
        1 => "info,brickflow_core=debug".to_string(),
        _ => "trace".to_string(),
    };
    if let Err(e) = brickflow_observe::init_tracing(&config.log) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = match cli.command {
        Commands::Validate { file } => cli::validate(&file, cli.json).await,
        Commands::Types => cli::list_types(cli.json),
        Commands::List { dir } => {
            let dir = dir.unwrap_or_else(|| {
                brickflow_infra::resolve_storage_path(&data_dir, &config.storage.workflow_dir)
            });
            cli::list_workflows(&dir, cli.json).await
        }
    };

    brickflow_observe::shutdown_tracing();
    result
}
