use crate::models::UsageResult;
use crate::providers::credentials::write_private;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Last fetch cycle, as consumed by the Waybar and status commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheState {
    pub fetched_at: DateTime<Utc>,
    pub results: Vec<UsageResult>,
}

impl CacheState {
    pub fn new(results: Vec<UsageResult>) -> Self {
        Self {
            fetched_at: Utc::now(),
            results,
        }
    }

    pub fn cache_path() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("usage-bar")
            .join("cache.json")
    }

    /// Cached results if they are younger than `max_age` and error-free.
    /// Missing, stale, or corrupt caches all read as "nothing cached".
    pub fn load_fresh(path: &Path, max_age: Duration, now: DateTime<Utc>) -> Option<Vec<UsageResult>> {
        let content = std::fs::read_to_string(path).ok()?;
        let state: CacheState = match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(err) => {
                debug!(error = %err, "ignoring corrupt cache");
                return None;
            }
        };

        if now - state.fetched_at > max_age {
            debug!(fetched_at = %state.fetched_at, "cache is stale");
            return None;
        }

        // an error is worth retrying on the next run instead of replaying it
        if state.results.iter().any(UsageResult::is_error) {
            debug!("cache holds a provider error, refetching");
            return None;
        }

        Some(state.results)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            create_private_dir(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = serde_json::to_vec(self)?;
        write_private(path, &content)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(())
    }

    pub fn clear(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to remove {}", path.display()))
            }
        }
    }
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}
