use clawdbot::cli;

#[tokio::main]
async fn main() {
    if let Err(e) = cli::run_main().await {
        cli::output::print_error(&format!("{e}"));
        if e.downcast_ref::<cli::Misuse>().is_some() {
            std::process::exit(2);
        }
        std::process::exit(1);
    }
}
