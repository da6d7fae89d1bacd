use t2server_cli::cli::{self, get_output};
use t2server_cli::logging;

#[tokio::main]
async fn main() {
    logging::init();
    let args: get_output::Cli = cli::parse_or_exit();

    if let Err(e) = get_output::run(args).await {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}
