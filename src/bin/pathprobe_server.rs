use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:4700")]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let listener = TcpListener::bind(&cli.listen).await?;
    info!(listen = %cli.listen, "responder listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        tokio::spawn(async move {
            let ws = match tokio_tungstenite::accept_async(socket).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%peer, error = %e, "handshake failed");
                    return;
                }
            };
            info!(%peer, "connection accepted");
            if let Err(e) = pathprobe::responder::serve(ws).await {
                warn!(%peer, error = %e, "connection ended with error");
            } else {
                info!(%peer, "connection closed");
            }
        });
    }
}
