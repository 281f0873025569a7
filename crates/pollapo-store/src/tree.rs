use crate::StoreError;
use pollapo_schema::MANIFEST_FILE_NAME;
use std::collections::BTreeMap;

/// The files of one repository at one revision, keyed by `/`-separated relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    files: BTreeMap<String, Vec<u8>>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file. Absolute paths and `.`/`..` components are rejected so a
    /// tree can never write outside the directory it is materialized into.
    pub fn insert(&mut self, path: &str, contents: impl Into<Vec<u8>>) -> Result<(), StoreError> {
        validate_relative_path(path)?;
        self.files.insert(path.to_owned(), contents.into());
        Ok(())
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_file(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Result<Self, StoreError> {
        self.insert(path, contents)?;
        Ok(self)
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// The nested `pollapo.yml`, if the repository has one at its top level.
    pub fn manifest(&self) -> Option<&[u8]> {
        self.get(MANIFEST_FILE_NAME)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// blake3 over paths and contents in sorted order.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (path, contents) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update(&[0]);
            hasher.update(&(contents.len() as u64).to_le_bytes());
            hasher.update(contents);
        }
        hasher.finalize().to_hex().to_string()
    }
}

fn validate_relative_path(path: &str) -> Result<(), StoreError> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.contains('\0')
        || path
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StoreError::InvalidPath(path.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut tree = FileTree::new();
        tree.insert("proto/a.proto", "syntax = \"proto3\";").unwrap();
        assert_eq!(tree.get("proto/a.proto").unwrap(), b"syntax = \"proto3\";");
        assert_eq!(tree.len(), 1);
        assert!(tree.manifest().is_none());
    }

    #[test]
    fn manifest_is_found_at_top_level_only() {
        let tree = FileTree::new()
            .with_file("sub/pollapo.yml", "deps: []")
            .unwrap();
        assert!(tree.manifest().is_none());
        let tree = tree.with_file("pollapo.yml", "deps: []").unwrap();
        assert_eq!(tree.manifest().unwrap(), b"deps: []");
    }

    #[test]
    fn rejects_escaping_paths() {
        let mut tree = FileTree::new();
        for bad in ["", "/etc/passwd", "../x", "a/../../x", "a//b", "./a", "a\\b"] {
            assert!(tree.insert(bad, "x").is_err(), "{bad:?} must be rejected");
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn digest_is_order_independent_and_content_sensitive() {
        let a = FileTree::new()
            .with_file("x", "1")
            .unwrap()
            .with_file("y", "2")
            .unwrap();
        let b = FileTree::new()
            .with_file("y", "2")
            .unwrap()
            .with_file("x", "1")
            .unwrap();
        assert_eq!(a.digest(), b.digest());

        let c = FileTree::new()
            .with_file("x", "1")
            .unwrap()
            .with_file("y", "3")
            .unwrap();
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn digest_separates_path_from_contents() {
        let a = FileTree::new().with_file("ab", "c").unwrap();
        let b = FileTree::new().with_file("a", "bc").unwrap();
        assert_ne!(a.digest(), b.digest());
    }
}
