//! The fatal error classes carried on the supervisor's shared error channel.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed upgrade announcement: {0}")]
    ParseUpgrade(String),

    #[error("upgrade {name} targets height {height} but the chain is already at {current}")]
    UnreachableHeight {
        name: String,
        height: u64,
        current: u64,
    },

    #[error("upgrade binary {path:?} is not usable: {reason}")]
    BinaryMissing { path: PathBuf, reason: String },

    #[error("downloading upgrade binary failed: {0}")]
    Download(String),

    #[error("failed to {action} child process: {source}")]
    Process {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("binary swap failed: {0}")]
    Swap(std::io::Error),

    #[error("event subscription failed: {0}")]
    Subscription(String),
}
