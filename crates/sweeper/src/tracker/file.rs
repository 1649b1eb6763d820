//! Attempt markers in a local JSON file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

use super::{AttemptRecord, MarkerStore};
use crate::source::{Repository, WorkItem};

type MarkerMap = BTreeMap<String, AttemptRecord>;

/// Marker store keeping one record per `repo#id` in a JSON map.
///
/// Writes go to a sibling temp file that is then renamed over the original,
/// so an interrupted write never leaves a half-written record behind.
#[derive(Debug, Clone)]
pub struct FileMarkerStore {
    path: PathBuf,
}

impl FileMarkerStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_map(&self) -> Result<MarkerMap> {
        match fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(MarkerMap::new()),
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MarkerMap::new()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        }
    }

    async fn write_map(&self, map: &MarkerMap) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(map)?;
        fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))
    }
}

#[async_trait]
impl MarkerStore for FileMarkerStore {
    async fn last_attempt(
        &self,
        _repository: &Repository,
        item: &WorkItem,
    ) -> Result<Option<AttemptRecord>> {
        let map = self.read_map().await?;
        Ok(map.get(&item.key().to_string()).cloned())
    }

    async fn record_attempt(&self, _repository: &Repository, record: &AttemptRecord) -> Result<()> {
        let mut map = match self.read_map().await {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %self.path.display(), error = %format!("{e:#}"), "Marker file unreadable, starting a new one");
                MarkerMap::new()
            }
        };
        map.insert(record.item.to_string(), record.clone());
        self.write_map(&map).await
    }
}
