use clap::Parser;
use sshgate::app::App;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "sshgate", about = "Credential-isolating SSH execution gateway")]
struct Cli {
    /// Path to the operations policy file (defaults to the built-in table).
    #[arg(long)]
    operations_file: Option<PathBuf>,
    /// Overrides the LOG_LEVEL environment variable.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Some(level) = cli.log_level.as_deref() {
        std::env::set_var("LOG_LEVEL", level);
    }

    let app = match App::initialize(cli.operations_file.as_deref()).await {
        Ok(app) => Arc::new(app),
        Err(err) => {
            eprintln!("sshgate: {}", err);
            std::process::exit(1);
        }
    };

    let result = sshgate::mcp::server::run_stdio(app.clone()).await;
    app.shutdown().await;
    if let Err(err) = result {
        eprintln!("sshgate: {}", err);
        std::process::exit(1);
    }
}
