use clap::Parser;
use log::info;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};

use server::server::{load_template, MazeServer, DEFAULT_TEMPLATE};

/// Multi-player maze combat server.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// TCP port to listen on
    #[clap(short = 'p', long, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Maze template file: one row per line, all rows the same width
    #[clap(short = 't', long)]
    template: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Note: set RUST_LOG=info to see server logs");
    }

    let args = Args::parse();

    let template: Vec<String> = match &args.template {
        Some(path) => load_template(path)
            .map_err(|err| format!("cannot read maze template {}: {}", path.display(), err))?,
        None => DEFAULT_TEMPLATE.iter().map(|row| row.to_string()).collect(),
    };

    let server = MazeServer::bind(&format!("0.0.0.0:{}", args.port), &template).await?;

    // SIGHUP triggers graceful teardown: stop accepting, drain, exit 0.
    let handle = server.shutdown_handle();
    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        hangup.recv().await;
        info!("SIGHUP received; shutting down");
        handle.shutdown();
    });

    server.run().await;
    Ok(())
}
