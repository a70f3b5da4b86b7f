use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = lookupctl::Cli::parse();
    lookupctl::init_tracing();
    if let Err(err) = lookupctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
