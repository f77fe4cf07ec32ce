//! Coordinated upgrade supervisor for a long-running chain daemon.
//!
//! The supervisor launches the daemon as a child process, follows its
//! websocket event streams, and acts on governance upgrade announcements:
//! at the announced block height it kills the child, atomically repoints
//! the `current` symlink at the new binary, relaunches, and resubscribes —
//! without losing events across the restart boundary.
//!
//! All supervisor state is rebuilt from the daemon's event stream after
//! each restart; nothing is persisted on disk besides the binaries and the
//! symlink itself.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod binary;
pub mod config;
pub mod error;
pub mod events;
pub mod process;
pub mod supervisor;
pub mod upgrade;
pub mod watchers;

pub use config::Config;
pub use error::Error;
pub use events::{EventListener, EventStreams, HeaderEvent, ListenerConfig, TxEvent};
pub use process::ProcessHandle;
pub use supervisor::Supervisor;
pub use upgrade::{DownloadInfo, UpgradeInfo};
