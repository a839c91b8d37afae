//! Object storage backends for template artifacts.

use crate::errors::ArtifactError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Plain key/value object storage.
///
/// Keys are `/`-separated paths. Access control is the store's concern.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Writes an object, replacing any previous body.
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<(), ArtifactError>;

    /// Reads an object.
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, ArtifactError>;

    /// Lists keys starting with `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ArtifactError>;

    /// Returns the URL a provisioner uses to fetch `key`.
    fn object_url(&self, key: &str) -> String;
}

/// In-memory artifact store.
#[derive(Debug)]
pub struct InMemoryArtifactStore {
    base_url: String,
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::new("memory://artifacts")
    }
}

impl InMemoryArtifactStore {
    /// Creates a store whose URLs start with `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<(), ArtifactError> {
        self.objects.write().insert(key.to_string(), body);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, ArtifactError> {
        Ok(self.objects.read().get(key).cloned())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ArtifactError> {
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}

/// Artifact store backed by a local directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ArtifactError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(ArtifactError::Storage(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<(), ArtifactError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Readers never see a partial body.
        let mut tmp = path.clone().into_os_string();
        tmp.push(".partial");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, ArtifactError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ArtifactError> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || {
            if root.exists() {
                super::revision::collect_files(&root)
            } else {
                Ok(Vec::new())
            }
        })
        .await
        .map_err(|e| ArtifactError::Storage(e.to_string()))??;

        Ok(files
            .into_iter()
            .map(|(rel, _)| rel)
            .filter(|k| k.starts_with(prefix) && !k.ends_with(".partial"))
            .collect())
    }

    fn object_url(&self, key: &str) -> String {
        format!("file://{}/{}", self.root.display(), key)
    }
}
