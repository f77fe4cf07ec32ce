//! Child process launch and the exclusive handle used to signal it.

use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tracing::info;

use crate::{binary, config::Config, error::Error};

/// Exclusive owner of one running child incarnation.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
}

impl ProcessHandle {
    /// Send SIGKILL and wait for the child to exit.
    ///
    /// Killing a child that already exited and was reaped is a no-op.
    pub async fn kill(&mut self) -> Result<(), Error> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(source) => Err(Error::Process {
                action: "kill",
                source,
            }),
        }
    }

    /// Wait for the child to exit on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus, Error> {
        self.child.wait().await.map_err(|source| Error::Process {
            action: "wait for",
            source,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Launch the `current` binary with the passthrough arguments.
///
/// stdout and stderr are inherited from the supervisor. stdin is inherited
/// only for the first launch, which may prompt for a passphrase; relaunches
/// during an upgrade must not read from a terminal.
pub fn launch(config: &Config, args: &[String], interactive: bool) -> Result<ProcessHandle, Error> {
    let bin = config.current_bin();
    binary::check_binary(&bin)?;

    let stdin = if interactive {
        Stdio::inherit()
    } else {
        Stdio::null()
    };
    let child = Command::new(&bin)
        .args(args)
        .stdin(stdin)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| Error::Process {
            action: "launch",
            source,
        })?;

    info!(name = %config.name, pid = ?child.id(), path = ?bin, "launched child process");
    Ok(ProcessHandle { child })
}
