//! Utility functions

use serde::{Deserialize, Serialize};
use url::Url;

/// Version information for stackd
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("STACKD_GIT_REVISION").unwrap_or("unknown").to_string(),
        build_time: option_env!("STACKD_BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Generate a random UUID v4
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Strip any user info from a repository URL so it can be logged.
///
/// scp-like SSH addresses (`git@host:org/repo.git`) are returned unchanged.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.has_host() => {
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.to_string()
        }
        _ => raw.to_string(),
    }
}

/// True for URLs git understands: `http(s)://`, `ssh://`, `git://`, `file://`,
/// scp-like `user@host:path`, or a local path.
pub fn is_valid_git_url(raw: &str) -> bool {
    let raw = raw.trim();
    if raw.is_empty() {
        return false;
    }
    if let Ok(url) = Url::parse(raw) {
        return matches!(url.scheme(), "http" | "https" | "ssh" | "git" | "file");
    }
    if let Some((user_host, path)) = raw.split_once(':') {
        return user_host.contains('@') && !path.is_empty();
    }
    raw.starts_with('/') || raw.starts_with('.')
}
