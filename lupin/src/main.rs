use anyhow::Result;
use clap::Parser;
use lupin::cli::{generate, train, Cli, Commands};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => {
            train::run(args)?;
        }
        Commands::Generate(args) => {
            generate::run(args)?;
        }
    }

    Ok(())
}
