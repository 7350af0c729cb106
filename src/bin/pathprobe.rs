use std::time::Duration;

use clap::Parser;
use pathprobe::config::SessionConfig;
use pathprobe::report::{HumanReadableReporter, JsonReporter, Reporter};
use pathprobe::sample::{Direction, RunBound, RunKind};
use pathprobe::session::Session;

#[derive(Clone, Debug, clap::ValueEnum)]
enum Format {
    Human,
    Json,
}

#[derive(Parser, Debug)]
struct Cli {
    /// Measurement endpoint, e.g. ws://host:4700/measure
    url: String,
    /// Output format to use: 'human' or 'json' for batch processing
    #[arg(long, default_value = "human")]
    format: Format,
    /// Skip the download measurement
    #[arg(long)]
    no_download: bool,
    /// Skip the upload measurement
    #[arg(long)]
    no_upload: bool,
    /// Skip latency probing
    #[arg(long)]
    no_probe: bool,
    /// Duration of each throughput run, in seconds
    #[arg(long, default_value_t = 10)]
    duration: u64,
    /// Interval between latency probes, in milliseconds
    #[arg(long, default_value_t = 250)]
    probe_interval_ms: u64,
    /// Chunk size for throughput runs, in bytes
    #[arg(long, default_value_t = 8192)]
    chunk_size: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.no_download && cli.no_upload && cli.no_probe {
        eprintln!("error: nothing to do, all measurements are disabled");
        std::process::exit(1);
    }

    let cfg = SessionConfig {
        chunk_size: cli.chunk_size,
        probe_interval: Duration::from_millis(cli.probe_interval_ms),
        run_bound: RunBound::Duration(Duration::from_secs(cli.duration)),
        ..Default::default()
    };
    let bound = cfg.run_bound;

    let reporter: Box<dyn Reporter + Send> = match cli.format {
        Format::Human => Box::new(HumanReadableReporter::new(std::io::stdout())),
        Format::Json => Box::new(JsonReporter::new(std::io::stdout())),
    };

    let session = Session::connect(&cli.url, cfg, reporter).await?;

    if !cli.no_probe {
        session.start_latency_run()?;
        if cli.no_download && cli.no_upload {
            // probe-only: idle baseline for one run duration
            tokio::time::sleep(Duration::from_secs(cli.duration)).await;
        }
    }

    if !cli.no_download {
        let done = session.start_throughput_run(Direction::Download, bound)?;
        let _ = done.await;
    }

    if !cli.no_upload {
        let done = session.start_throughput_run(Direction::Upload, bound)?;
        let _ = done.await;
    }

    if !cli.no_probe {
        session.stop(RunKind::Probe);
    }
    session.close().await;

    Ok(())
}
