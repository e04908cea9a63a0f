//! Token Store
//!
//! File-based token storage. One JSON record per account lives in the
//! accounts directory (`~/.google-mcp-accounts/` by default); the legacy
//! single-account layout is one fixed file. Token files are always written
//! owner-only (0600) inside an owner-only (0700) directory.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::credential::TokenRecord;
use crate::error::{AuthError, Result};

const TOKEN_EXT: &str = "json";
const TMP_SUFFIX: &str = ".tmp";

/// Normalise an email address for use as an account key.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// ── TokenStore ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TokenStore {
    /// Accounts directory
    dir: PathBuf,
}

impl TokenStore {
    /// Open the accounts directory, creating it owner-only if missing.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        create_private_dir(&dir)?;
        debug!("Token store opened at {:?}", dir);
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Per-account token file path, derived from the normalised email.
    pub fn account_path(&self, email: &str) -> PathBuf {
        self.dir.join(token_file_name(email))
    }

    /// Every persisted account file, in a stable order.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == TOKEN_EXT) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Read a record without judging whether it is still usable.
    pub fn read(path: &Path) -> Result<TokenRecord> {
        let data = match fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AuthError::NotFound(format!("token file {}", path.display())));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// Read a record and reject it if it can never be used again.
    pub fn load(path: &Path) -> Result<TokenRecord> {
        let record = Self::read(path)?;
        if !record.credential.is_usable(Utc::now()) {
            return Err(AuthError::Expired(format!(
                "expired at {} ({})",
                record.credential.expiry.to_rfc3339(),
                path.display()
            )));
        }
        Ok(record)
    }

    /// Write a record atomically with owner-only permissions.
    pub fn save(path: &Path, record: &TokenRecord) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_private_dir(parent)?;
            }
        }

        let mut json = serde_json::to_vec_pretty(record)?;
        json.push(b'\n');

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        {
            let mut file = private_file(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        restrict_permissions(path)?;

        debug!("Saved token file {:?}", path);
        Ok(())
    }

    /// Remove a token file. A file that is already gone is not an error.
    pub fn delete(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {
                info!("Deleted token file {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// SHA-256 of the normalised email; first 8 bytes as hex is enough to be unique.
fn token_file_name(email: &str) -> String {
    let hash = Sha256::digest(normalize_email(email).as_bytes());
    format!("{}.{}", hex::encode(&hash[..8]), TOKEN_EXT)
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if dir.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(unix)]
fn private_file(path: &Path) -> Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() is ignored when the file already existed
    restrict_permissions(path)?;
    Ok(file)
}

#[cfg(not(unix))]
fn private_file(path: &Path) -> Result<fs::File> {
    Ok(fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
