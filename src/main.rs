use clap::Parser;

use cu::cli::{self, Cli};
use cu::telemetry;

fn main() {
    let _telemetry = telemetry::init();
    let cli = Cli::parse();
    if let Err(err) = cli::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
