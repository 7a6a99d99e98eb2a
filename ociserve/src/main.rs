use std::path::PathBuf;

use clap::Parser;
use log::info;

use ociserve::Registry;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8000")]
    listen: String,

    /// Store blobs under this directory; defaults to in-memory.
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let registry = match &args.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            info!("storing blobs under {}", dir.display());
            Registry::on_disk(dir)
        }
        None => {
            info!("storing blobs in memory");
            Registry::in_memory()
        }
    };

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, registry.router())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
}
