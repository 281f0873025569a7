use crate::layout::{CacheLayout, ENTRY_RECORD_FILE};
use crate::tree::FileTree;
use crate::{fsync_dir, StoreError};
use pollapo_schema::{parse_manifest_file, DependencyRef, Manifest, Revision};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Current entry record format. Entries with another version are treated as absent.
pub const ENTRY_FORMAT_VERSION: u32 = 1;

/// Metadata written last into a cache entry; its presence marks the entry complete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryRecord {
    pub format_version: u32,
    pub owner: String,
    pub repo: String,
    pub revision: Revision,
    pub files: usize,
    pub tree_digest: String,
    pub fetched_at: String,
}

impl EntryRecord {
    pub fn dependency(&self) -> DependencyRef {
        DependencyRef {
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            revision: self.revision.clone(),
        }
    }
}

/// Outcome of [`CacheStore::materialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialized {
    Written,
    AlreadyPresent,
}

/// Cache of dependency file trees keyed by `(owner, repo, immutable revision)`.
///
/// Entries are staged in a temp directory and renamed into place only after the
/// record file is written, so a crash never leaves something that `exists()`
/// reports as complete. Entries are never modified once written.
#[derive(Debug, Clone)]
pub struct CacheStore {
    layout: CacheLayout,
}

impl CacheStore {
    pub fn new(layout: CacheLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Create the cache root with its staging and lock directories.
    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.layout.root())?;
        fs::create_dir_all(self.layout.staging_dir())?;
        fs::create_dir_all(self.layout.locks_dir())?;
        Ok(())
    }

    /// Discard leftovers from interrupted materializations.
    ///
    /// Only safe while no other process is writing to the cache; callers hold
    /// the exclusive cache lock.
    pub fn purge_staging(&self) -> Result<usize, StoreError> {
        let staging = self.layout.staging_dir();
        if !staging.exists() {
            return Ok(0);
        }
        let mut purged = 0;
        for entry in fs::read_dir(&staging)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
            purged += 1;
        }
        if purged > 0 {
            debug!("purged {purged} stale staging entries");
        }
        Ok(purged)
    }

    pub fn exists(&self, dep: &DependencyRef) -> bool {
        self.record(dep).is_ok()
    }

    pub fn manifest_path(&self, dep: &DependencyRef) -> PathBuf {
        self.layout.manifest_path(dep)
    }

    pub fn entry_dir(&self, dep: &DependencyRef) -> PathBuf {
        self.layout.entry_dir(dep)
    }

    /// The nested manifest of a complete entry, or `None` if the repository has none.
    pub fn load_manifest(&self, dep: &DependencyRef) -> Result<Option<Manifest>, StoreError> {
        if !self.exists(dep) {
            return Err(StoreError::EntryNotFound(dep.to_string()));
        }
        let path = self.layout.manifest_path(dep);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(parse_manifest_file(&path)?))
    }

    pub fn record(&self, dep: &DependencyRef) -> Result<EntryRecord, StoreError> {
        let path = self.layout.record_path(dep);
        if !path.is_file() {
            return Err(StoreError::EntryNotFound(dep.to_string()));
        }
        let content = fs::read_to_string(&path)?;
        let record: EntryRecord = serde_json::from_str(&content)?;
        if record.format_version != ENTRY_FORMAT_VERSION {
            return Err(StoreError::EntryNotFound(dep.to_string()));
        }
        Ok(record)
    }

    /// Write `tree` as the entry for `dep`. Idempotent: an existing complete
    /// entry is left untouched.
    ///
    /// Callers must not materialize the same triple concurrently; use a
    /// per-entry lock around this call.
    pub fn materialize(
        &self,
        dep: &DependencyRef,
        tree: &FileTree,
    ) -> Result<Materialized, StoreError> {
        if self.exists(dep) {
            return Ok(Materialized::AlreadyPresent);
        }

        let staging_root = self.layout.staging_dir();
        fs::create_dir_all(&staging_root)?;
        let staging = TempDir::new_in(&staging_root)?;

        for (rel, contents) in tree.iter() {
            let dest = staging.path().join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, contents)?;
        }

        let record = EntryRecord {
            format_version: ENTRY_FORMAT_VERSION,
            owner: dep.owner.clone(),
            repo: dep.repo.clone(),
            revision: dep.revision.clone(),
            files: tree.len(),
            tree_digest: tree.digest(),
            fetched_at: chrono::Utc::now().to_rfc3339(),
        };
        let mut record_file = fs::File::create(staging.path().join(ENTRY_RECORD_FILE))?;
        record_file.write_all(serde_json::to_string_pretty(&record)?.as_bytes())?;
        record_file.sync_all()?;
        fsync_dir(staging.path())?;

        let dest = self.layout.entry_dir(dep);
        let owner_dir = self.layout.owner_dir(&dep.owner);
        fs::create_dir_all(&owner_dir)?;
        if dest.exists() {
            // no record, so a leftover from an older layout or a foreign write
            warn!("replacing incomplete cache entry {}", dest.display());
            fs::remove_dir_all(&dest)?;
        }
        if let Err(e) = fs::rename(staging.path(), &dest) {
            if self.exists(dep) {
                return Ok(Materialized::AlreadyPresent);
            }
            return Err(StoreError::Io(e));
        }
        fsync_dir(&owner_dir)?;
        debug!("cached {dep} ({} files)", tree.len());
        Ok(Materialized::Written)
    }

    /// Read a complete entry back into a tree (record file excluded).
    pub fn read_tree(&self, dep: &DependencyRef) -> Result<FileTree, StoreError> {
        if !self.exists(dep) {
            return Err(StoreError::EntryNotFound(dep.to_string()));
        }
        let root = self.layout.entry_dir(dep);
        let mut tree = FileTree::new();
        collect_files(&root, &root, &mut tree)?;
        Ok(tree)
    }

    /// Read an entry and check its tree digest against the record.
    pub fn verify(&self, dep: &DependencyRef) -> Result<FileTree, StoreError> {
        let record = self.record(dep)?;
        let tree = self.read_tree(dep)?;
        let actual = tree.digest();
        if actual != record.tree_digest {
            return Err(StoreError::IntegrityFailure {
                entry: dep.to_string(),
                expected: record.tree_digest,
                actual,
            });
        }
        Ok(tree)
    }

    /// All complete entries, sorted by dependency.
    pub fn list(&self) -> Result<Vec<EntryRecord>, StoreError> {
        let root = self.layout.root();
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for owner in fs::read_dir(root)? {
            let owner = owner?;
            if owner.file_name().to_string_lossy().starts_with('.') || !owner.path().is_dir() {
                continue;
            }
            for entry in fs::read_dir(owner.path())? {
                let record_path = entry?.path().join(ENTRY_RECORD_FILE);
                if !record_path.is_file() {
                    continue;
                }
                let content = fs::read_to_string(&record_path)?;
                match serde_json::from_str::<EntryRecord>(&content) {
                    Ok(record) if record.format_version == ENTRY_FORMAT_VERSION => {
                        records.push(record);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("skipping unreadable record {}: {e}", record_path.display()),
                }
            }
        }
        records.sort_by_key(EntryRecord::dependency);
        Ok(records)
    }

    /// Remove the whole cache root.
    ///
    /// Failure is reported, never swallowed: resolution must not continue
    /// believing the cache is empty when it is not.
    pub fn clear(&self) -> Result<(), StoreError> {
        let root = self.layout.root();
        if root.exists() {
            fs::remove_dir_all(root).map_err(|source| StoreError::ClearFailed {
                path: root.to_owned(),
                source,
            })?;
        }
        if root.exists() {
            return Err(StoreError::ClearFailed {
                path: root.to_owned(),
                source: std::io::Error::other("cache root still present after removal"),
            });
        }
        debug!("cleared cache {}", root.display());
        Ok(())
    }
}

fn collect_files(base: &Path, dir: &Path, tree: &mut FileTree) -> Result<(), StoreError> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(fs::DirEntry::file_name);
    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(base, &path, tree)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(base)
                .map_err(|_| StoreError::InvalidPath(path.display().to_string()))?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if rel == ENTRY_RECORD_FILE {
                continue;
            }
            tree.insert(&rel, fs::read(&path)?)?;
        }
    }
    Ok(())
}
