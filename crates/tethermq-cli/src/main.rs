use clap::Parser;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = tethermq_cli::Cli::parse();
    tethermq_cli::init_tracing(cli.verbose);

    if let Err(e) = tethermq_cli::run(cli).await {
        let code = tethermq_cli::error::display_error(&e);
        std::process::exit(code);
    }
}
