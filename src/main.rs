use clap::Parser;
use tracing::error;

use datum::cli::{run, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::from(config.log_level))
        .with_writer(std::io::stderr)
        .init();

    let mut stdout = std::io::stdout().lock();
    if let Err(e) = run(&cli.command, &config, &mut stdout).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
