//! Managed-binary checks, downloads, and the atomic symlink swap.

use std::{
    fs,
    io::Write,
    os::unix::fs::PermissionsExt,
    path::Path,
};

use sha2::{Digest, Sha256};
use tracing::info;

use crate::{config::Config, error::Error, upgrade::UpgradeInfo};

/// Succeeds iff `path` resolves to an existing regular file with an execute
/// permission bit set.
pub fn check_binary(path: &Path) -> Result<(), Error> {
    let metadata = fs::metadata(path).map_err(|err| Error::BinaryMissing {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    if !metadata.is_file() {
        return Err(Error::BinaryMissing {
            path: path.to_path_buf(),
            reason: "not a regular file".to_string(),
        });
    }
    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(Error::BinaryMissing {
            path: path.to_path_buf(),
            reason: "not executable".to_string(),
        });
    }
    Ok(())
}

/// Fetch the binary named by the announcement and install it under
/// `upgrades/<name>/bin`.
///
/// The body is written to a temporary file in the destination directory and
/// committed by rename, so a failed download never leaves a partial binary
/// at the final path.
pub async fn download_binary(config: &Config, upgrade: &UpgradeInfo) -> Result<(), Error> {
    let Some(download) = &upgrade.download else {
        return Err(Error::Download(format!(
            "announcement for {} carries no download url",
            upgrade.name
        )));
    };

    info!(name = %upgrade.name, url = %download.url, "downloading upgrade binary");

    let response = reqwest::get(download.url.clone())
        .await
        .map_err(|err| Error::Download(err.to_string()))?
        .error_for_status()
        .map_err(|err| Error::Download(err.to_string()))?;
    let body = response
        .bytes()
        .await
        .map_err(|err| Error::Download(err.to_string()))?;

    if let Some(expected) = &download.checksum {
        let actual = const_hex::encode(Sha256::digest(&body));
        if !expected.eq_ignore_ascii_case(&actual) {
            return Err(Error::Download(format!(
                "checksum mismatch: expected {expected}, got {actual}"
            )));
        }
    }

    let dir = config.upgrade_dir(&upgrade.name);
    fs::create_dir_all(&dir).map_err(|err| Error::Download(format!("creating {dir:?}: {err}")))?;

    let mut staged = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|err| Error::Download(format!("staging download: {err}")))?;
    staged
        .write_all(&body)
        .map_err(|err| Error::Download(format!("writing download: {err}")))?;
    staged
        .as_file()
        .set_permissions(fs::Permissions::from_mode(0o755))
        .map_err(|err| Error::Download(format!("marking download executable: {err}")))?;

    let target = config.upgrade_bin(&upgrade.name);
    staged
        .persist(&target)
        .map_err(|err| Error::Download(format!("installing to {target:?}: {err}")))?;

    check_binary(&target)?;
    info!(name = %upgrade.name, path = ?target, "upgrade binary installed");
    Ok(())
}

/// Repoint the `current` symlink at the named upgrade's binary.
///
/// The new link is written at a staging path and renamed over `current`;
/// the rename is the commit point, so readers of the path observe either
/// the old target or the new one, never a missing link.
pub fn upgrade(config: &Config, upgrade: &UpgradeInfo) -> Result<(), Error> {
    let target = config.upgrade_bin(&upgrade.name);
    check_binary(&target)?;

    let current = config.current_bin();
    let staged = current.with_extension("staged");
    match fs::remove_file(&staged) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(Error::Swap(err)),
    }
    std::os::unix::fs::symlink(&target, &staged).map_err(Error::Swap)?;
    fs::rename(&staged, &current).map_err(Error::Swap)?;

    info!(name = %upgrade.name, target = ?target, "current binary repointed");
    Ok(())
}
