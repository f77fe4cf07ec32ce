//! Environment-driven configuration and the managed on-disk layout.
//!
//! The layout under `DAEMON_HOME` is fixed:
//!
//! ```text
//! <home>/current              -> symlink to <home>/upgrades/<name>/bin
//! <home>/upgrades/<name>/bin  (executable)
//! ```
//!
//! The `current` symlink is the only mutable piece; it is repointed
//! atomically when an upgrade activates.

use std::path::PathBuf;

use url::Url;

use crate::error::Error;

pub const ENV_HOME: &str = "DAEMON_HOME";
pub const ENV_NAME: &str = "DAEMON_NAME";
pub const ENV_ALLOW_DOWNLOAD: &str = "DAEMON_ALLOW_DOWNLOAD";
pub const ENV_NODE_RPC: &str = "DAEMON_NODE_RPC";

/// Immutable per-run configuration for the supervisor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for the upgrade tree and the `current` symlink.
    pub home: PathBuf,
    /// Base name of the managed binary, used for log context.
    pub name: String,
    /// Whether missing upgrade binaries may be fetched over the network.
    pub allow_download: bool,
    /// Websocket URL of the daemon's RPC event endpoint.
    pub node_rpc: Url,
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let home = PathBuf::from(require(&lookup, ENV_HOME)?);
        if !home.is_dir() {
            return Err(Error::Config(format!(
                "{ENV_HOME} {home:?} is not an existing directory"
            )));
        }

        let name = require(&lookup, ENV_NAME)?;
        if name.trim().is_empty() {
            return Err(Error::Config(format!("{ENV_NAME} must not be empty")));
        }

        let allow_download = match lookup(ENV_ALLOW_DOWNLOAD) {
            None => false,
            Some(raw) => parse_bool(&raw).ok_or_else(|| {
                Error::Config(format!("{ENV_ALLOW_DOWNLOAD} must be a boolean, got {raw:?}"))
            })?,
        };

        let raw_rpc = require(&lookup, ENV_NODE_RPC)?;
        let node_rpc = Url::parse(&raw_rpc)
            .map_err(|err| Error::Config(format!("{ENV_NODE_RPC} is not a valid URL: {err}")))?;
        match node_rpc.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::Config(format!(
                    "{ENV_NODE_RPC} must use ws:// or wss://, got {other}://"
                )));
            }
        }

        Ok(Self {
            home,
            name,
            allow_download,
            node_rpc,
        })
    }

    /// The replaceable symlink the child is launched through.
    pub fn current_bin(&self) -> PathBuf {
        self.home.join("current")
    }

    /// Directory holding the binary for the named upgrade.
    pub fn upgrade_dir(&self, name: &str) -> PathBuf {
        self.home.join("upgrades").join(name)
    }

    /// The executable installed for the named upgrade.
    pub fn upgrade_bin(&self, name: &str) -> PathBuf {
        self.upgrade_dir(name).join("bin")
    }
}

fn require(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, Error> {
    lookup(key).ok_or_else(|| Error::Config(format!("{key} is not set")))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}
