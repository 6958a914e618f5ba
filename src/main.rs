// src/main.rs — promptloop entry point

use clap::Parser;

use promptloop::cli::{self, Cli};
use promptloop::infra::logger;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level
    logger::init_logging(&cli.log_level);

    if let Err(e) = cli::dispatch(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
