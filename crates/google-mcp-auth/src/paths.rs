//! Path Utilities
//!
//! Default locations for token files and configuration.

use std::path::{Path, PathBuf};

use crate::error::{AuthError, Result};

/// Legacy single-account token file name (in the home directory)
pub const LEGACY_TOKEN_FILE: &str = ".google-mcp-token.json";
/// Multi-account token directory name (in the home directory)
pub const ACCOUNTS_DIR: &str = ".google-mcp-accounts";

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| AuthError::Config("Could not determine home directory".into()))
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(home_dir()?.join(rest)),
        Err(_) => Ok(path.to_path_buf()),
    }
}

/// `~/.google-mcp-token.json`
pub fn default_token_file() -> Result<PathBuf> {
    Ok(home_dir()?.join(LEGACY_TOKEN_FILE))
}

/// `~/.google-mcp-accounts/`
pub fn default_accounts_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(ACCOUNTS_DIR))
}

/// Config files tried in order; the first one that parses wins.
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("config.json"), PathBuf::from("config.local.json")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".google-mcp-server").join("config.json"));
    }
    paths.push(PathBuf::from("/etc/google-mcp-server/config.json"));
    paths
}
