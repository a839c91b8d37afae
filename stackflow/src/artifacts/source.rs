//! Where template bodies come from before they are published.

use super::revision::{collect_files, RevisionId};
use crate::errors::ArtifactError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Supplies template bodies for a given revision.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    /// Returns the body of `template` at `revision`, or `None` if this source
    /// cannot produce that revision.
    async fn load(
        &self,
        template: &str,
        revision: &RevisionId,
    ) -> Result<Option<Vec<u8>>, ArtifactError>;
}

/// A working-tree directory whose revision is computed when opened.
#[derive(Debug, Clone)]
pub struct DirectoryTemplateSource {
    root: PathBuf,
    revision: RevisionId,
}

impl DirectoryTemplateSource {
    /// Opens `root` and computes its revision.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let root = root.into();
        let revision = RevisionId::from_source_tree(&root)?;
        Ok(Self { root, revision })
    }

    /// Returns the revision of the tree as opened.
    #[must_use]
    pub fn revision(&self) -> &RevisionId {
        &self.revision
    }

    /// Returns the tree root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lists the template names in the tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn templates(&self) -> Result<Vec<String>, ArtifactError> {
        Ok(collect_files(&self.root)?.into_iter().map(|(rel, _)| rel).collect())
    }
}

#[async_trait]
impl TemplateSource for DirectoryTemplateSource {
    async fn load(
        &self,
        template: &str,
        revision: &RevisionId,
    ) -> Result<Option<Vec<u8>>, ArtifactError> {
        if revision != &self.revision {
            return Ok(None);
        }
        match tokio::fs::read(self.root.join(template)).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Template bodies held in memory under a single revision.
#[derive(Debug, Clone)]
pub struct InMemoryTemplateSource {
    revision: RevisionId,
    templates: BTreeMap<String, Vec<u8>>,
}

impl InMemoryTemplateSource {
    /// Creates a source whose revision is derived from `templates`.
    #[must_use]
    pub fn new<I, K, V>(templates: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let templates: BTreeMap<String, Vec<u8>> = templates
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let revision = RevisionId::from_files(
            templates
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_slice())),
        );
        Self {
            revision,
            templates,
        }
    }

    /// Returns the revision of the held bodies.
    #[must_use]
    pub fn revision(&self) -> &RevisionId {
        &self.revision
    }
}

#[async_trait]
impl TemplateSource for InMemoryTemplateSource {
    async fn load(
        &self,
        template: &str,
        revision: &RevisionId,
    ) -> Result<Option<Vec<u8>>, ArtifactError> {
        if revision != &self.revision {
            return Ok(None);
        }
        Ok(self.templates.get(template).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_only_serves_its_revision() {
        let source = InMemoryTemplateSource::new([("iam.json", "{}")]);
        let revision = source.revision().clone();

        assert_eq!(source.load("iam.json", &revision).await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(source.load("s3.json", &revision).await.unwrap(), None);

        let other = RevisionId::new("deadbeef").unwrap();
        assert_eq!(source.load("iam.json", &other).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/sg.json"), b"sg").unwrap();
        std::fs::write(dir.path().join("iam.json"), b"iam").unwrap();

        let source = DirectoryTemplateSource::open(dir.path()).unwrap();
        assert_eq!(source.templates().unwrap(), vec!["iam.json", "nested/sg.json"]);

        let revision = source.revision().clone();
        assert_eq!(
            source.load("nested/sg.json", &revision).await.unwrap(),
            Some(b"sg".to_vec())
        );
    }
}
