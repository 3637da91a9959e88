use std::process;

use clap::Parser;
use tracing::{Level, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use weir_hls::Recorder;
use weir_net::Pool;

/// Record an HLS live or VOD stream to a transport-stream file in the
/// current directory.
#[derive(Parser)]
#[command(name = "weir", version, about)]
struct Args {
    /// Master or media playlist URL (http or https).
    url: Option<String>,

    /// Log segment-level detail.
    #[arg(short, long)]
    verbose: bool,

    /// Log errors only.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    // Asking for nothing is not a failure.
    let Some(url) = args.url else {
        eprintln!("Usage: weir <playlist URL>");
        return;
    };

    let recorder = Recorder::new(Pool::new());
    if let Err(err) = recorder.record(&url).await {
        error!("{err}");
        process::exit(1);
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("trace")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}
