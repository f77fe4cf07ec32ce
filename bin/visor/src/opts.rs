use clap::Parser;

/// Supervise a chain daemon and apply on-chain-announced binary upgrades.
///
/// Configuration comes from the DAEMON_HOME, DAEMON_NAME,
/// DAEMON_ALLOW_DOWNLOAD and DAEMON_NODE_RPC environment variables. All
/// trailing arguments are forwarded verbatim to the daemon on every launch.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Opts {
    /// Arguments passed through to the managed daemon.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub daemon_args: Vec<String>,
}
