use std::io;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use netif_cni::commands::{emit, run_cni};

fn main() {
    // stdout belongs to the CNI result, so logs go to stderr
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);

    let outcome = run_cni().and_then(|output| match output {
        Some(output) => emit(&output, &mut io::stdout().lock()),
        None => Ok(()),
    });
    let status = match outcome {
        Ok(()) => 0,
        Err(failure) => failure.report(&mut io::stdout().lock()),
    };

    std::process::exit(status);
}
