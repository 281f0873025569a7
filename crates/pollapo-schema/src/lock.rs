use crate::dependency::DependencyRef;
use crate::manifest::ManifestError;
use crate::types::CommitHash;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Pins branch dependencies to the commit they resolved to.
///
/// Keys are full dependency refs (`owner/repo@branch`); only dependencies whose
/// revision is a branch ever get an entry. Iteration is sorted, so writing the
/// table back produces a stable document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockTable {
    entries: BTreeMap<DependencyRef, CommitHash>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dep: &DependencyRef) -> Option<&CommitHash> {
        self.entries.get(dep)
    }

    pub fn contains(&self, dep: &DependencyRef) -> bool {
        self.entries.contains_key(dep)
    }

    /// Insert or replace a pin, returning the previous commit.
    pub fn insert(&mut self, dep: DependencyRef, hash: CommitHash) -> Option<CommitHash> {
        self.entries.insert(dep, hash)
    }

    pub fn remove(&mut self, dep: &DependencyRef) -> Option<CommitHash> {
        self.entries.remove(dep)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&DependencyRef, &CommitHash) -> bool) {
        self.entries.retain(|dep, hash| keep(dep, hash));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DependencyRef, &CommitHash)> {
        self.entries.iter()
    }
}

impl FromIterator<(DependencyRef, CommitHash)> for LockTable {
    fn from_iter<I: IntoIterator<Item = (DependencyRef, CommitHash)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Replace `root.lock` in the manifest at `path`, keeping every other key.
///
/// The file is rewritten atomically: a temp file in the same directory is
/// synced and renamed over the original.
pub fn write_lock_table(path: impl AsRef<Path>, table: &LockTable) -> Result<(), ManifestError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_owned(),
        source,
    })?;

    let mut document: Value = if content.trim().is_empty() {
        Value::Mapping(Mapping::new())
    } else {
        serde_yaml::from_str(&content).map_err(|e| ManifestError::Parse {
            path: path.to_owned(),
            message: e.to_string(),
        })?
    };
    let not_a_mapping = || ManifestError::NotAMapping {
        path: path.to_owned(),
    };
    let Value::Mapping(top) = &mut document else {
        return Err(not_a_mapping());
    };
    if top.get("root").map_or(true, Value::is_null) {
        top.insert(Value::String("root".to_owned()), Value::Mapping(Mapping::new()));
    }
    let Some(Value::Mapping(root)) = top.get_mut("root") else {
        return Err(not_a_mapping());
    };
    root.insert(Value::String("lock".to_owned()), serde_yaml::to_value(table)?);

    let rendered = serde_yaml::to_string(&document)?;
    let write_err = |source: std::io::Error| ManifestError::Write {
        path: path.to_owned(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(rendered.as_bytes()).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    if let Ok(f) = fs::File::open(dir) {
        let _ = f.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_manifest_file;

    fn dep(s: &str) -> DependencyRef {
        s.parse().unwrap()
    }

    #[test]
    fn insert_and_lookup_by_structured_key() {
        let mut table = LockTable::new();
        assert!(table.insert(dep("acme/widget@main"), CommitHash::new("abc")).is_none());
        assert_eq!(
            table.insert(dep("acme/widget@main"), CommitHash::new("def")),
            Some(CommitHash::new("abc"))
        );
        assert_eq!(table.get(&dep("acme/widget@main")).unwrap(), "def");
        assert!(!table.contains(&dep("acme/widget@develop")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn retain_drops_entries() {
        let mut table: LockTable = [
            (dep("a/b@main"), CommitHash::new("1")),
            (dep("c/d@main"), CommitHash::new("2")),
        ]
        .into_iter()
        .collect();
        table.retain(|d, _| d.owner == "a");
        assert_eq!(table.len(), 1);
        assert!(table.contains(&dep("a/b@main")));
    }

    #[test]
    fn write_back_preserves_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pollapo.yml");
        fs::write(
            &path,
            "deps:\n  - acme/widget@main\nroot:\n  replace-file-option:\n    go_package:\n      regex: x\n      value: y\n",
        )
        .unwrap();

        let table: LockTable = [(dep("acme/widget@main"), CommitHash::new("abc123"))]
            .into_iter()
            .collect();
        write_lock_table(&path, &table).unwrap();

        let reloaded = parse_manifest_file(&path).unwrap();
        assert_eq!(reloaded.deps, vec![dep("acme/widget@main")]);
        assert_eq!(reloaded.lock_table(), table);
        assert_eq!(reloaded.replace_file_options()["go_package"].value, "y");
    }

    #[test]
    fn write_back_creates_root_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pollapo.yml");
        fs::write(&path, "deps:\n  - a/b@main\n").unwrap();

        let table: LockTable = [(dep("a/b@main"), CommitHash::new("ff"))]
            .into_iter()
            .collect();
        write_lock_table(&path, &table).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("a/b@main: ff"), "{content}");
    }

    #[test]
    fn write_back_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pollapo.yml");
        fs::write(&path, "deps: []\n").unwrap();

        let table: LockTable = [
            (dep("zeta/z@main"), CommitHash::new("1")),
            (dep("alpha/a@main"), CommitHash::new("2")),
        ]
        .into_iter()
        .collect();
        write_lock_table(&path, &table).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        let alpha = content.find("alpha/a@main").unwrap();
        let zeta = content.find("zeta/z@main").unwrap();
        assert!(alpha < zeta);
    }

    #[test]
    fn write_back_rejects_non_mapping_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pollapo.yml");
        fs::write(&path, "- just\n- a list\n").unwrap();
        let err = write_lock_table(&path, &LockTable::new()).unwrap_err();
        assert!(matches!(err, ManifestError::NotAMapping { .. }));
    }
}
