//! Parsed upgrade announcements.
//!
//! The daemon announces an upgrade through a single tx event attribute whose
//! value is a comma-separated list of `key=value` pairs, e.g.
//! `name=v2,height=50` or
//! `name=v2,height=50,url=https://example.org/v2,checksum=sha256:ab..ef`.

use std::{fmt, str::FromStr};

use url::Url;

use crate::error::Error;

/// Where to fetch a missing upgrade binary from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadInfo {
    pub url: Url,
    /// Hex-encoded sha256 of the binary, when the announcement carries one.
    pub checksum: Option<String>,
}

/// A validated upgrade announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeInfo {
    /// Upgrade identifier, doubles as the directory name under `upgrades/`.
    pub name: String,
    /// Block height at which the upgrade activates.
    pub height: u64,
    pub download: Option<DownloadInfo>,
}

impl fmt::Display for UpgradeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at height {}", self.name, self.height)
    }
}

impl FromStr for UpgradeInfo {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Error> {
        let mut name: Option<String> = None;
        let mut height: Option<u64> = None;
        let mut url: Option<Url> = None;
        let mut checksum: Option<String> = None;

        for pair in raw.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let Some((key, value)) = pair.split_once('=') else {
                return Err(malformed(raw, &format!("expected key=value, got {pair:?}")));
            };
            match key.trim() {
                "name" => name = Some(value.trim().to_owned()),
                "height" => {
                    let parsed = value.trim().parse::<u64>().map_err(|err| {
                        malformed(raw, &format!("height {value:?} is not an integer: {err}"))
                    })?;
                    height = Some(parsed);
                }
                "url" => {
                    let parsed = Url::parse(value.trim()).map_err(|err| {
                        malformed(raw, &format!("download url {value:?} is invalid: {err}"))
                    })?;
                    url = Some(parsed);
                }
                "checksum" => {
                    let digest = value.trim().trim_start_matches("sha256:").to_owned();
                    let decoded = const_hex::decode(&digest).map_err(|err| {
                        malformed(raw, &format!("checksum {value:?} is not hex: {err}"))
                    })?;
                    if decoded.len() != 32 {
                        return Err(malformed(
                            raw,
                            &format!("checksum must be 32 bytes, got {}", decoded.len()),
                        ));
                    }
                    checksum = Some(digest);
                }
                other => return Err(malformed(raw, &format!("unknown key {other:?}"))),
            }
        }

        let name = name.ok_or_else(|| malformed(raw, "missing name"))?;
        if name.is_empty() {
            return Err(malformed(raw, "name must not be empty"));
        }
        if name.contains(['/', '\\']) || name == ".." {
            return Err(malformed(raw, &format!("name {name:?} is not a valid directory name")));
        }

        let height = height.ok_or_else(|| malformed(raw, "missing height"))?;
        if height == 0 {
            return Err(malformed(raw, "height must be positive"));
        }

        if checksum.is_some() && url.is_none() {
            return Err(malformed(raw, "checksum given without a download url"));
        }

        Ok(Self {
            name,
            height,
            download: url.map(|url| DownloadInfo { url, checksum }),
        })
    }
}

fn malformed(raw: &str, reason: &str) -> Error {
    Error::ParseUpgrade(format!("{raw:?}: {reason}"))
}
