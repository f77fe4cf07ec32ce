//! Supervisor binary for a chain daemon: launches the managed node and
//! coordinates on-chain-announced binary upgrades.

use clap::Parser;
use tracing_subscriber::EnvFilter;
use visor_supervisor::{Config, Supervisor};

use crate::opts::Opts;

mod opts;

/// Force-install the default crypto provider.
///
/// This is necessary in case there are more than one available backends
/// enabled in rustls (ring, aws-lc-rs).
///
/// This should be called high in the main fn.
fn install_crypto_provider() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install default rustls crypto provider");
}

#[tokio::main]
async fn main() {
    install_crypto_provider();

    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    if let Err(err) = run(opts).await {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

async fn run(opts: Opts) -> eyre::Result<()> {
    let config = Config::from_env()?;
    Supervisor::new(config, opts.daemon_args).run().await
}
