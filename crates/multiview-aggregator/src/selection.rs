//! The viewer's ordered source selection and the projections derived from it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;

use multiview_common::config::MAX_SOURCES;
use multiview_common::{Error, Result, SourceId};

/// External, eventually consistent store of the selection list. Re-read on
/// demand; an empty list means "no filter".
#[async_trait]
pub trait SelectionStore: Send + Sync + 'static {
    async fn load(&self) -> Result<Vec<SourceId>>;

    async fn store(&self, selection: Vec<SourceId>) -> Result<()>;
}

/// Drops duplicates (first occurrence wins) and caps the list.
pub fn normalize(selection: impl IntoIterator<Item = SourceId>) -> Vec<SourceId> {
    let mut seen = HashSet::new();
    selection
        .into_iter()
        .filter(|id| seen.insert(*id))
        .take(MAX_SOURCES)
        .collect()
}

/// Moves `moved` to the position currently held by `target`. `None` when
/// either is missing or they are the same source.
pub fn reorder(selection: &[SourceId], moved: SourceId, target: SourceId) -> Option<Vec<SourceId>> {
    if moved == target {
        return None;
    }
    let from = selection.iter().position(|id| *id == moved)?;
    let to = selection.iter().position(|id| *id == target)?;
    let mut reordered = selection.to_vec();
    let id = reordered.remove(from);
    reordered.insert(to, id);
    Some(reordered)
}

/// Display order of `exposed`: listed sources by their selection index,
/// unlisted ones after them, ties by source id.
pub fn visible_order(
    selection: &[SourceId],
    exposed: impl IntoIterator<Item = SourceId>,
) -> Vec<SourceId> {
    let rank: HashMap<SourceId, usize> = selection
        .iter()
        .enumerate()
        .map(|(index, id)| (*id, index))
        .collect();
    let mut order: Vec<SourceId> = exposed.into_iter().collect();
    order.sort_by_key(|id| (rank.get(id).copied().unwrap_or(usize::MAX), *id));
    order.truncate(MAX_SOURCES);
    order
}

/// Selected sources without a live stream, in selection order.
pub fn missing_sources(selection: &[SourceId], live: impl Fn(SourceId) -> bool) -> Vec<SourceId> {
    selection.iter().copied().filter(|id| !live(*id)).collect()
}

#[derive(Debug, Default)]
pub struct MemorySelection {
    selection: RwLock<Vec<SourceId>>,
}

impl MemorySelection {
    pub fn new(selection: impl IntoIterator<Item = SourceId>) -> Self {
        Self {
            selection: RwLock::new(normalize(selection)),
        }
    }
}

#[async_trait]
impl SelectionStore for MemorySelection {
    async fn load(&self) -> Result<Vec<SourceId>> {
        Ok(self.selection.read().await.clone())
    }

    async fn store(&self, selection: Vec<SourceId>) -> Result<()> {
        *self.selection.write().await = normalize(selection);
        Ok(())
    }
}

/// Selection persisted as a JSON array of source ids. A missing file is an
/// empty selection.
#[derive(Debug, Clone)]
pub struct JsonFileSelection {
    path: PathBuf,
}

impl JsonFileSelection {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SelectionStore for JsonFileSelection {
    async fn load(&self) -> Result<Vec<SourceId>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let ids: Vec<SourceId> = serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("{}: {e}", self.path.display())))?;
        Ok(normalize(ids))
    }

    async fn store(&self, selection: Vec<SourceId>) -> Result<()> {
        let json = serde_json::to_vec(&normalize(selection))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
