use t2server_cli::cli::{self, run_workflow};
use t2server_cli::logging;

#[tokio::main]
async fn main() {
    logging::init();
    let args: run_workflow::Cli = cli::parse_or_exit();

    if let Err(e) = run_workflow::run(args).await {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}
