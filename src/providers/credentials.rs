//! Locally persisted OAuth tokens.
//!
//! Credential files are written by the providers' own login CLIs and may hold
//! fields we know nothing about, so saving never goes through a typed struct:
//! the document is re-read as an open JSON map, only our token fields inside
//! one nested object are replaced, and the whole document is written back.

use crate::error::FetchError;
use crate::providers::oauth::TokenGrant;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Tokens for one provider, loaded fresh for every fetch cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OAuthCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub plan: Option<String>,
    pub id_token: Option<String>,
    pub account_id: Option<String>,
}

impl OAuthCredentials {
    /// True when the token expires within `margin` (or already has).
    /// Credentials without an expiry are never considered expiring.
    pub fn expires_within(&self, margin: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now >= expires_at - margin,
            None => false,
        }
    }

    /// The access token always changes; the others only when the grant carries them.
    pub fn apply(&mut self, grant: TokenGrant) {
        self.access_token = grant.access_token;
        if let Some(refresh_token) = grant.refresh_token {
            self.refresh_token = Some(refresh_token);
        }
        if let Some(id_token) = grant.id_token {
            self.id_token = Some(id_token);
        }
        if let Some(expires_at) = grant.expires_at {
            self.expires_at = Some(expires_at);
        }
    }
}

pub fn read_file(path: &Path, missing_hint: &str) -> Result<String, FetchError> {
    fs::read_to_string(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            FetchError::credentials(format!(
                "credentials not found at {}. {}",
                path.display(),
                missing_hint
            ))
        } else {
            FetchError::credentials(format!("failed to read {}: {}", path.display(), e))
        }
    })
}

/// Replace `fields` inside the `section` object of the JSON document at `path`
/// (creating the object if needed) and set `top_level` keys on the root.
/// Everything else in the document is written back unchanged.
pub fn merge_token_fields(
    path: &Path,
    section: &str,
    fields: Map<String, Value>,
    top_level: Map<String, Value>,
) -> io::Result<()> {
    let content = fs::read_to_string(path)?;
    let mut document: Map<String, Value> = serde_json::from_str(&content)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let nested = document
        .entry(section.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !nested.is_object() {
        *nested = Value::Object(Map::new());
    }
    if let Value::Object(nested) = nested {
        nested.extend(fields);
    }
    document.extend(top_level);

    let updated = serde_json::to_vec(&Value::Object(document))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_private(path, &updated)
}

/// Atomic owner-only write: temp file with 0600, then rename over `path`.
pub fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let temp = temp_path(path);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&temp)?;
    #[cfg(unix)]
    {
        // mode() is ignored when the temp file already existed
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, path)
}

/// Sibling of `path` unique to this process, so concurrent writers never
/// share a temp file.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}
