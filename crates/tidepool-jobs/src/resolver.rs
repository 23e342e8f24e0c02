//! Dataset resolution.
//!
//! A resolver turns a dataset id and a variable projection into a handle
//! that can report its size before any data is fetched and slice itself to
//! a time window. Two catalogs are provided: an in-memory one, and one
//! backed by a directory of `<id>.json` files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tidepool_core::{Dataset, TimeWindow};
use tracing::debug;

use crate::error::{ResolveError, ResolveResult};

/// A resolved dataset, already restricted to the requested projection.
#[async_trait]
pub trait DatasetHandle: Send + Sync {
    fn dataset_id(&self) -> &str;

    /// Estimated bytes of the projected variables.
    fn size_estimate(&self) -> u64;

    /// Samples inside `window`. `None` means the dataset holds no data at all.
    async fn slice(&self, window: &TimeWindow) -> ResolveResult<Option<Dataset>>;
}

#[async_trait]
pub trait DatasetResolver: Send + Sync {
    async fn resolve(&self, id: &str, projection: &[String]) -> ResolveResult<Arc<dyn DatasetHandle>>;
}

/// Handle over data that is already in memory.
struct LoadedHandle {
    id: String,
    data: Option<Dataset>,
}

impl LoadedHandle {
    fn new(id: &str, data: Option<&Dataset>, projection: &[String]) -> Self {
        Self {
            id: id.to_string(),
            data: data.map(|ds| ds.project(projection)),
        }
    }
}

#[async_trait]
impl DatasetHandle for LoadedHandle {
    fn dataset_id(&self) -> &str {
        &self.id
    }

    fn size_estimate(&self) -> u64 {
        self.data.as_ref().map_or(0, Dataset::nbytes)
    }

    async fn slice(&self, window: &TimeWindow) -> ResolveResult<Option<Dataset>> {
        Ok(self.data.as_ref().map(|ds| ds.slice(window)))
    }
}

// ── In-memory catalog ──────────────────────────────────────────────

/// Catalog held in memory. Used by tests and by the daemon when no
/// catalog directory is configured.
#[derive(Default, Clone)]
pub struct MemoryCatalog {
    datasets: Arc<RwLock<HashMap<String, Option<Dataset>>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `dataset` under its name, replacing any previous entry.
    pub fn insert(&self, dataset: Dataset) {
        let mut map = self.datasets.write().unwrap_or_else(|e| e.into_inner());
        map.insert(dataset.name.clone(), Some(dataset.normalized()));
    }

    /// Register an id that resolves but holds no data.
    pub fn insert_without_data(&self, id: impl Into<String>) {
        let mut map = self.datasets.write().unwrap_or_else(|e| e.into_inner());
        map.insert(id.into(), None);
    }

    pub fn len(&self) -> usize {
        self.datasets.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DatasetResolver for MemoryCatalog {
    async fn resolve(&self, id: &str, projection: &[String]) -> ResolveResult<Arc<dyn DatasetHandle>> {
        let map = self.datasets.read().unwrap_or_else(|e| e.into_inner());
        let entry = map.get(id).ok_or_else(|| ResolveError::NotFound(id.to_string()))?;
        Ok(Arc::new(LoadedHandle::new(id, entry.as_ref(), projection)))
    }
}

// ── Directory catalog ──────────────────────────────────────────────

/// Catalog of `<dir>/<id>.json` files, each a serialized [`Dataset`] or
/// `null` for a dataset without data.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    dir: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> ResolveResult<PathBuf> {
        let invalid = id.is_empty()
            || id.contains("..")
            || id.contains('/')
            || id.contains('\\')
            || id.contains('\0');
        if invalid {
            return Err(ResolveError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

#[async_trait]
impl DatasetResolver for DirectoryCatalog {
    async fn resolve(&self, id: &str, projection: &[String]) -> ResolveResult<Arc<dyn DatasetHandle>> {
        let path = self.path_for(id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ResolveError::NotFound(id.to_string()));
            }
            Err(e) => {
                return Err(ResolveError::Io {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        let data: Option<Dataset> = serde_json::from_slice(&bytes).map_err(|e| ResolveError::Parse {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        if let Some(ds) = &data {
            ds.validate().map_err(|source| ResolveError::Malformed {
                id: id.to_string(),
                source,
            })?;
        }
        debug!(id, path = %path.display(), has_data = data.is_some(), "dataset loaded from catalog");
        let data = data.map(Dataset::normalized);
        Ok(Arc::new(LoadedHandle::new(id, data.as_ref(), projection)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str) -> Dataset {
        Dataset::new(name, vec![0, 1_000, 2_000, 3_000])
            .with_variable("temperature", vec![1.0, 2.0, 3.0, 4.0])
            .unwrap()
            .with_variable("salinity", vec![30.0, 31.0, 32.0, 33.0])
            .unwrap()
    }

    fn projection(vars: &[&str]) -> Vec<String> {
        vars.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn memory_catalog_projects_and_slices() {
        let catalog = MemoryCatalog::new();
        catalog.insert(sample("glider"));

        let handle = catalog
            .resolve("glider", &projection(&["temperature", "time"]))
            .await
            .unwrap();
        assert_eq!(handle.dataset_id(), "glider");
        // time + one variable, 4 samples each
        assert_eq!(handle.size_estimate(), 8 * 8);

        let window = TimeWindow::new(1_000, 2_000).unwrap();
        let sliced = handle.slice(&window).await.unwrap().unwrap();
        assert_eq!(sliced.time, vec![1_000, 2_000]);
        assert!(sliced.variable("salinity").is_none());
        assert_eq!(sliced.variable("temperature").unwrap().values, vec![2.0, 3.0]);
    }

    #[tokio::test]
    async fn memory_catalog_reports_missing_and_empty() {
        let catalog = MemoryCatalog::new();
        catalog.insert_without_data("ghost");

        let err = catalog.resolve("nope", &[]).await.err().unwrap();
        assert!(matches!(err, ResolveError::NotFound(id) if id == "nope"));

        let handle = catalog.resolve("ghost", &[]).await.unwrap();
        assert_eq!(handle.size_estimate(), 0);
        let window = TimeWindow::new(0, 1_000).unwrap();
        assert!(handle.slice(&window).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn directory_catalog_reads_json_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("glider.json"),
            serde_json::to_vec(&sample("glider")).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("ghost.json"), b"null").unwrap();

        let catalog = DirectoryCatalog::new(dir.path());
        let handle = catalog
            .resolve("glider", &projection(&["salinity", "time"]))
            .await
            .unwrap();
        let window = TimeWindow::new(0, 10_000).unwrap();
        let data = handle.slice(&window).await.unwrap().unwrap();
        assert_eq!(data.len(), 4);
        assert!(data.variable("temperature").is_none());

        let ghost = catalog.resolve("ghost", &[]).await.unwrap();
        assert!(ghost.slice(&window).await.unwrap().is_none());

        let missing = catalog.resolve("absent", &[]).await.err().unwrap();
        assert!(matches!(missing, ResolveError::NotFound(_)));
    }

    #[tokio::test]
    async fn directory_catalog_rejects_path_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = DirectoryCatalog::new(dir.path());
        for id in ["../etc/passwd", "a/b", "", "..", "a\\b"] {
            let err = catalog.resolve(id, &[]).await.err().unwrap();
            assert!(matches!(err, ResolveError::InvalidId(_)), "{id} accepted");
        }
    }

    #[tokio::test]
    async fn directory_catalog_rejects_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        std::fs::write(
            dir.path().join("ragged.json"),
            br#"{"name":"ragged","time":[0,1000],"variables":{"t":{"values":[1.0]}}}"#,
        )
        .unwrap();

        let catalog = DirectoryCatalog::new(dir.path());
        assert!(matches!(
            catalog.resolve("broken", &[]).await.err().unwrap(),
            ResolveError::Parse { .. }
        ));
        assert!(matches!(
            catalog.resolve("ragged", &[]).await.err().unwrap(),
            ResolveError::Malformed { .. }
        ));
    }
}
