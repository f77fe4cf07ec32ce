//! The per-generation event consumers that coordinate an upgrade.
//!
//! Two tasks run per child incarnation. The upgrade watcher reads the tx
//! stream, recognizes announcements, makes sure the target binary exists,
//! and forwards the parsed [`UpgradeInfo`] on the rendezvous `upgrades`
//! channel. The height watcher latches one pending upgrade at a time and,
//! when a header matches its target height, performs the kill → swap →
//! relaunch sequence and hands the new child off on `commands`.
//!
//! Neither task terminates the process: fatal conditions are forwarded on
//! the shared errors channel and the supervisor decides.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    binary,
    config::Config,
    error::Error,
    events::{HeaderEvent, TxEvent},
    process::{self, ProcessHandle},
    upgrade::UpgradeInfo,
};

/// Attribute key announcing an upgrade on the tx stream.
pub const UPGRADE_ACTION_KEY: &str = "upgrade.action";
/// Attribute key carrying the inclusion height of a tx event.
const TX_HEIGHT_KEY: &str = "tx.height";

/// Consumes the tx stream and forwards validated upgrade announcements.
pub struct UpgradeWatcher {
    pub token: CancellationToken,
    pub config: Config,
    pub txs: mpsc::Receiver<TxEvent>,
    pub upgrades: mpsc::Sender<UpgradeInfo>,
    pub errors: mpsc::Sender<Error>,
}

impl UpgradeWatcher {
    pub async fn run(mut self) {
        loop {
            let event = tokio::select! {
                _ = self.token.cancelled() => return,
                event = self.txs.recv() => match event {
                    Some(event) => event,
                    // closed stream is equivalent to cancellation
                    None => return,
                },
            };

            let Some(values) = event.events.get(UPGRADE_ACTION_KEY) else {
                continue;
            };
            if values.len() != 1 {
                debug!(count = values.len(), "ignoring tx without a single upgrade action");
                continue;
            }

            let upgrade = match values[0].parse::<UpgradeInfo>() {
                Ok(upgrade) => upgrade,
                Err(err) => {
                    forward(&self.token, &self.errors, err).await;
                    continue;
                }
            };

            if let Some(current) = tx_height(&event) {
                if upgrade.height <= current {
                    let err = Error::UnreachableHeight {
                        name: upgrade.name,
                        height: upgrade.height,
                        current,
                    };
                    forward(&self.token, &self.errors, err).await;
                    continue;
                }
            }

            if let Err(missing) = binary::check_binary(&self.config.upgrade_bin(&upgrade.name)) {
                if !self.config.allow_download {
                    forward(&self.token, &self.errors, missing).await;
                    continue;
                }
                if let Err(err) = binary::download_binary(&self.config, &upgrade).await {
                    forward(&self.token, &self.errors, err).await;
                    continue;
                }
            }

            info!(upgrade = %upgrade, "upgrade announced");
            tokio::select! {
                _ = self.token.cancelled() => return,
                sent = self.upgrades.send(upgrade) => if sent.is_err() {
                    return;
                },
            }
        }
    }
}

/// Consumes the header stream and activates the pending upgrade at its
/// target height.
pub struct HeightWatcher {
    pub token: CancellationToken,
    pub config: Config,
    pub daemon_args: Vec<String>,
    /// Shared slot holding the live child; also killed by the supervisor on
    /// shutdown.
    pub current: Arc<Mutex<ProcessHandle>>,
    pub headers: mpsc::Receiver<HeaderEvent>,
    pub upgrades: mpsc::Receiver<UpgradeInfo>,
    pub commands: mpsc::Sender<ProcessHandle>,
    pub errors: mpsc::Sender<Error>,
}

impl HeightWatcher {
    pub async fn run(mut self) {
        // single-slot latch: at most one upgrade is pending at any instant
        let mut pending: Option<UpgradeInfo> = None;
        loop {
            let header = tokio::select! {
                _ = self.token.cancelled() => return,
                header = self.headers.recv() => match header {
                    Some(header) => header,
                    None => return,
                },
            };

            let upgrade = match pending.take() {
                Some(upgrade) => upgrade,
                // nothing pending: hold this header until an upgrade arrives
                None => {
                    debug!(height = header.height, "waiting for an upgrade announcement");
                    tokio::select! {
                        _ = self.token.cancelled() => return,
                        upgrade = self.upgrades.recv() => match upgrade {
                            Some(upgrade) => upgrade,
                            None => return,
                        },
                    }
                }
            };

            if header.height != upgrade.height {
                debug!(
                    height = header.height,
                    target = upgrade.height,
                    "header does not match the pending upgrade"
                );
                pending = Some(upgrade);
                continue;
            }

            match self.perform(&upgrade).await {
                Ok(replacement) => {
                    info!(upgrade = %upgrade, "upgrade performed successfully");
                    tokio::select! {
                        _ = self.token.cancelled() => return,
                        sent = self.commands.send(replacement) => if sent.is_err() {
                            return;
                        },
                    }
                }
                Err(err) => {
                    forward(&self.token, &self.errors, err).await;
                    return;
                }
            }
        }
    }

    /// Kill the child, repoint the symlink, relaunch.
    ///
    /// The child must be dead before the symlink moves, and the current-slot
    /// lock is held across all three steps so no other reader of the binary
    /// path exists in between.
    async fn perform(&self, upgrade: &UpgradeInfo) -> Result<ProcessHandle, Error> {
        info!(upgrade = %upgrade, "target height reached");
        let mut child = self.current.lock().await;
        child.kill().await?;
        binary::upgrade(&self.config, upgrade)?;
        process::launch(&self.config, &self.daemon_args, false)
    }
}

fn tx_height(event: &TxEvent) -> Option<u64> {
    event
        .events
        .get(TX_HEIGHT_KEY)?
        .first()?
        .parse()
        .ok()
}

async fn forward(token: &CancellationToken, errors: &mpsc::Sender<Error>, err: Error) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = errors.send(err) => {}
    }
}
