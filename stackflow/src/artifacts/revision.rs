//! Revision identifiers derived from source-tree state.

use crate::errors::ArtifactError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Number of hex characters kept from the tree digest.
pub const REVISION_LEN: usize = 12;

/// An immutable revision key for a template bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId(String);

impl RevisionId {
    /// Wraps an explicit revision (e.g. a commit hash).
    ///
    /// # Errors
    ///
    /// Returns an error if the revision is empty, contains characters other
    /// than ASCII alphanumerics, `-`, `_`, `.`, or is the reserved alias `latest`.
    pub fn new(revision: impl Into<String>) -> Result<Self, ArtifactError> {
        let revision = revision.into();
        let valid = !revision.is_empty()
            && revision != "latest"
            && revision
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(Self(revision))
        } else {
            Err(ArtifactError::InvalidRevision(revision))
        }
    }

    /// Computes the revision of in-memory files.
    ///
    /// Files are hashed in path order so the result does not depend on
    /// iteration order.
    #[must_use]
    pub fn from_files<'a>(files: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Self {
        let mut files: Vec<_> = files.into_iter().collect();
        files.sort_by(|a, b| a.0.cmp(b.0));

        let mut hasher = Sha256::new();
        for (path, body) in files {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update((body.len() as u64).to_be_bytes());
            hasher.update(body);
        }
        let digest = hex::encode(hasher.finalize());
        Self(digest[..REVISION_LEN].to_string())
    }

    /// Computes the revision of every file under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be read.
    pub fn from_source_tree(root: &Path) -> Result<Self, ArtifactError> {
        Ok(Self::from_loaded(&read_tree(root)?))
    }

    /// Computes the revision of (relative path, body) pairs already in memory.
    #[must_use]
    pub fn from_loaded(files: &[(String, Vec<u8>)]) -> Self {
        Self::from_files(files.iter().map(|(rel, body)| (rel.as_str(), body.as_slice())))
    }

    /// Returns the revision string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RevisionId {
    type Error = ArtifactError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RevisionId> for String {
    fn from(value: RevisionId) -> Self {
        value.0
    }
}

/// Lists files under `root` as (forward-slash relative path, absolute path),
/// sorted by relative path. Symlinked directories are followed.
///
/// # Errors
///
/// Returns [`ArtifactError::NonUtf8Path`] for a path that is not valid UTF-8.
pub(crate) fn collect_files(root: &Path) -> Result<Vec<(String, PathBuf)>, ArtifactError> {
    let mut out = Vec::new();

    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel_path = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| ArtifactError::Storage(e.to_string()))?;
        let rel = rel_path
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| ArtifactError::NonUtf8Path {
                path: rel_path.to_path_buf(),
            })?
            .join("/");
        out.push((rel, entry.into_path()));
    }

    // Walk order is per-directory; keys compare as whole strings.
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Reads every file under `root` into memory, keyed like [`collect_files`].
///
/// # Errors
///
/// Returns an error if the tree cannot be walked or a file cannot be read.
pub(crate) fn read_tree(root: &Path) -> Result<Vec<(String, Vec<u8>)>, ArtifactError> {
    collect_files(root)?
        .into_iter()
        .map(|(rel, path)| std::fs::read(path).map(|body| (rel, body)).map_err(ArtifactError::from))
        .collect()
}
