//! Top-level orchestration: child lifecycle, watcher generations, signals.
//!
//! The supervisor owns the only live child at any instant. Each child
//! incarnation gets its own watcher pair under a fresh cancellation token;
//! when the height watcher hands a new child over on `commands`, the old
//! generation is cancelled, the listener is rebuilt, and a new pair is
//! spawned. The first error received on the shared errors channel stops the
//! process with a nonzero exit; an OS signal stops it cleanly.

use std::{sync::Arc, time::Duration};

use eyre::Context as _;
use tokio::{
    signal::unix::{signal, Signal, SignalKind},
    sync::{mpsc, Mutex},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    config::Config,
    error::Error,
    events::{EventListener, EventStreams, ListenerConfig},
    process::{self, ProcessHandle},
    watchers::{HeightWatcher, UpgradeWatcher},
};

/// Delay after the initial launch before subscribing, so the daemon's RPC
/// endpoint has time to come up.
const BOOTSTRAP_DELAY: Duration = Duration::from_secs(10);
/// Delay after cancelling a generation before resubscribing, so the
/// relaunched daemon's RPC settles.
const SETTLE_DELAY: Duration = Duration::from_secs(5);

pub struct Supervisor {
    config: Config,
    daemon_args: Vec<String>,
    bootstrap_delay: Duration,
    settle_delay: Duration,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(config: Config, daemon_args: Vec<String>) -> Self {
        Self {
            config,
            daemon_args,
            bootstrap_delay: BOOTSTRAP_DELAY,
            settle_delay: SETTLE_DELAY,
            shutdown: CancellationToken::new(),
        }
    }

    /// Override the bootstrap and settle delays. Integration tests shrink
    /// them; production keeps the defaults.
    pub fn with_delays(mut self, bootstrap: Duration, settle: Duration) -> Self {
        self.bootstrap_delay = bootstrap;
        self.settle_delay = settle;
        self
    }

    /// Cancelling this token requests the same clean shutdown an OS signal
    /// would.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until a fatal error or a shutdown request.
    ///
    /// On shutdown: cancel the watchers, stop the listener, kill the child,
    /// return `Ok`. The first fatal error tears everything down the same way
    /// and is returned to the caller.
    pub async fn run(self) -> eyre::Result<()> {
        // the only launch that may prompt on a terminal
        let first = process::launch(&self.config, &self.daemon_args, true)?;
        info!(delay = ?self.bootstrap_delay, "child launched, waiting for its RPC");
        time::sleep(self.bootstrap_delay).await;

        let (errors_tx, mut errors_rx) = mpsc::channel::<Error>(1);
        let (commands_tx, commands_rx) = mpsc::channel::<ProcessHandle>(1);
        let current = Arc::new(Mutex::new(first));

        let (listener, streams) =
            EventListener::start(ListenerConfig::from(&self.config), errors_tx.clone()).await?;
        info!("event streams subscribed, starting watchers");

        let generations = tokio::spawn(
            Generations {
                config: self.config.clone(),
                daemon_args: self.daemon_args.clone(),
                settle_delay: self.settle_delay,
                root: self.shutdown.clone(),
                current: current.clone(),
                commands_tx,
                commands_rx,
                errors_tx: errors_tx.clone(),
            }
            .run(listener, streams),
        );

        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut sigquit = signal(SignalKind::quit()).context("failed to install SIGQUIT handler")?;

        tokio::select! {
            Some(err) = errors_rx.recv() => {
                error!(error = %err, "fatal supervisor error");
                self.shutdown.cancel();
                let _ = generations.await;
                let _ = current.lock().await.kill().await;
                Err(err.into())
            }
            _ = shutdown_requested(&mut sigint, &mut sigterm, &mut sigquit, &self.shutdown) => {
                info!("shutdown requested");
                self.shutdown.cancel();
                let _ = generations.await;
                current.lock().await.kill().await?;
                info!("supervisor stopped");
                Ok(())
            }
        }
    }
}

async fn shutdown_requested(
    sigint: &mut Signal,
    sigterm: &mut Signal,
    sigquit: &mut Signal,
    token: &CancellationToken,
) {
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigquit.recv() => info!("received SIGQUIT"),
        _ = token.cancelled() => {}
    }
}

/// Spawns the watcher pair for each child incarnation and rolls generations
/// forward on every upgrade handoff.
struct Generations {
    config: Config,
    daemon_args: Vec<String>,
    settle_delay: Duration,
    root: CancellationToken,
    current: Arc<Mutex<ProcessHandle>>,
    commands_tx: mpsc::Sender<ProcessHandle>,
    commands_rx: mpsc::Receiver<ProcessHandle>,
    errors_tx: mpsc::Sender<Error>,
}

impl Generations {
    async fn run(mut self, mut listener: EventListener, first_streams: EventStreams) {
        let mut generation = self.spawn_watchers(first_streams);
        loop {
            tokio::select! {
                _ = self.root.cancelled() => {
                    generation.cancel();
                    listener.stop().await;
                    return;
                }
                handle = self.commands_rx.recv() => {
                    let Some(handle) = handle else {
                        listener.stop().await;
                        return;
                    };
                    // the handoff is complete: retire the old generation
                    generation.cancel();
                    info!(delay = ?self.settle_delay, "upgrade handoff received, restarting watchers");
                    time::sleep(self.settle_delay).await;
                    *self.current.lock().await = handle;
                    match listener
                        .reset(ListenerConfig::from(&self.config), self.errors_tx.clone())
                        .await
                    {
                        Ok((next, streams)) => {
                            listener = next;
                            generation = self.spawn_watchers(streams);
                        }
                        Err(err) => {
                            let _ = self.errors_tx.send(err).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    fn spawn_watchers(&self, streams: EventStreams) -> CancellationToken {
        let generation = CancellationToken::new();
        let (upgrades_tx, upgrades_rx) = mpsc::channel(1);

        tokio::spawn(
            UpgradeWatcher {
                token: generation.clone(),
                config: self.config.clone(),
                txs: streams.txs,
                upgrades: upgrades_tx,
                errors: self.errors_tx.clone(),
            }
            .run(),
        );
        tokio::spawn(
            HeightWatcher {
                token: generation.clone(),
                config: self.config.clone(),
                daemon_args: self.daemon_args.clone(),
                current: self.current.clone(),
                headers: streams.headers,
                upgrades: upgrades_rx,
                commands: self.commands_tx.clone(),
                errors: self.errors_tx.clone(),
            }
            .run(),
        );
        generation
    }
}
