//! Tracks which cluster objects each manifest file declared, so a rewritten
//! or removed file deletes exactly the objects that disappeared from it.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use lbsync_core::{manifest, CoreError, ObjectRef};
use lbsync_sync::ClusterCache;

/// What one file reload did to the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadStats {
    pub applied: usize,
    pub deleted: usize,
}

#[derive(Debug, Default)]
pub struct ManifestIndex {
    files: HashMap<PathBuf, BTreeSet<ObjectRef>>,
}

impl ManifestIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every manifest file under `dir` into the cache.
    pub fn load_dir(&mut self, cache: &ClusterCache, dir: &Path) -> Result<ReloadStats, CoreError> {
        let mut total = ReloadStats::default();
        for (path, manifests) in manifest::load_dir_at(dir)? {
            let stats = self.replace(cache, path, manifests);
            total.applied += stats.applied;
            total.deleted += stats.deleted;
        }
        Ok(total)
    }

    /// Re-read one file. A missing file deletes everything it declared.
    ///
    /// On a parse error the previously loaded objects are kept.
    pub fn reload(&mut self, cache: &ClusterCache, path: &Path) -> Result<ReloadStats, CoreError> {
        if !path.exists() {
            return Ok(self.forget(cache, path));
        }
        let manifests = manifest::load_file_at(path)?;
        Ok(self.replace(cache, path.to_path_buf(), manifests))
    }

    /// Drop a file from the index, deleting its objects from the cache.
    pub fn forget(&mut self, cache: &ClusterCache, path: &Path) -> ReloadStats {
        let deleted = self
            .files
            .remove(path)
            .unwrap_or_default()
            .iter()
            .filter(|object| self.declared_elsewhere(object).is_none() && cache.delete(object))
            .count();
        ReloadStats {
            applied: 0,
            deleted,
        }
    }

    fn replace(
        &mut self,
        cache: &ClusterCache,
        path: PathBuf,
        manifests: Vec<manifest::Manifest>,
    ) -> ReloadStats {
        let declared: BTreeSet<ObjectRef> = manifests.iter().map(|m| m.object_ref()).collect();
        let previous = self.files.insert(path, declared.clone()).unwrap_or_default();

        let applied = manifests.into_iter().filter_map(|m| cache.apply(m).then_some(())).count();
        let deleted = previous
            .difference(&declared)
            .filter(|object| self.declared_elsewhere(object).is_none() && cache.delete(object))
            .count();
        ReloadStats { applied, deleted }
    }

    fn declared_elsewhere(&self, object: &ObjectRef) -> Option<&Path> {
        self.files
            .iter()
            .find(|(_, objects)| objects.contains(object))
            .map(|(path, _)| path.as_path())
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn object_count(&self) -> usize {
        self.files.values().map(BTreeSet::len).sum()
    }
}
