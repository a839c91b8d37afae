//! Publishing template bundles under revision and alias keys.

use super::revision::{read_tree, RevisionId};
use super::store::ArtifactStore;
use crate::core::{TemplateArtifactRef, LATEST_ALIAS};
use crate::errors::ArtifactError;
use base64::Engine;
use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of publishing one template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedArtifact {
    /// Template object name.
    pub template: String,
    /// Revision the body was published under.
    pub revision: RevisionId,
    /// Immutable revision-addressed key.
    pub revision_key: String,
    /// Mutable alias key.
    pub latest_key: String,
    /// URL of the revision-addressed object.
    pub revision_url: String,
    /// URL of the alias object.
    pub latest_url: String,
    /// Hex MD5 of the body, as an object store ETag.
    pub etag: String,
    /// Base64 MD5 of the body, as a Content-MD5 header.
    pub content_md5: String,
    /// Hex SHA-256 of the body.
    pub sha256: String,
    /// Body size in bytes.
    pub size: usize,
    /// True if the revision key already held this exact body.
    pub reused: bool,
    /// Publication time (ISO 8601).
    pub published_at: String,
}

/// All templates of one source tree published under a single revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundlePublication {
    /// The bundle revision.
    pub revision: RevisionId,
    /// Per-template results, sorted by template name.
    pub artifacts: Vec<PublishedArtifact>,
}

/// Writes template bodies to an [`ArtifactStore`] and locates them again.
///
/// Every publish writes two plain object keys:
/// `{prefix}/{revision}/{template}` (never rewritten once present) and
/// `{prefix}/latest/{template}` (repointed on each publish).
#[derive(Clone)]
pub struct ArtifactPublisher {
    store: Arc<dyn ArtifactStore>,
    prefix: String,
}

impl std::fmt::Debug for ArtifactPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactPublisher")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ArtifactPublisher {
    /// Creates a publisher writing under `prefix`.
    #[must_use]
    pub fn new(store: Arc<dyn ArtifactStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    fn key(&self, segment: &str, template: &str) -> String {
        if self.prefix.is_empty() {
            format!("{segment}/{template}")
        } else {
            format!("{}/{segment}/{template}", self.prefix)
        }
    }

    /// Returns the immutable key of `template` at `revision`.
    #[must_use]
    pub fn revision_key(&self, template: &str, revision: &RevisionId) -> String {
        self.key(revision.as_str(), template)
    }

    /// Returns the mutable key of `template` under `alias`.
    #[must_use]
    pub fn alias_key(&self, template: &str, alias: &str) -> String {
        self.key(alias, template)
    }

    /// Publishes one template body at `revision` and repoints `latest`.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::ImmutableRevision`] if the revision key
    /// already holds a different body, or a storage error.
    pub async fn publish(
        &self,
        template: &str,
        body: &[u8],
        revision: &RevisionId,
    ) -> Result<PublishedArtifact, ArtifactError> {
        let revision_key = self.revision_key(template, revision);
        let latest_key = self.alias_key(template, LATEST_ALIAS);

        let reused = match self.store.get_object(&revision_key).await? {
            Some(existing) if existing == body => true,
            Some(_) => return Err(ArtifactError::ImmutableRevision { key: revision_key }),
            None => false,
        };

        if reused {
            debug!(key = %revision_key, "Revision already published with identical body");
        } else {
            self.store.put_object(&revision_key, body.to_vec()).await?;
        }
        self.store.put_object(&latest_key, body.to_vec()).await?;

        let md5 = Md5::digest(body);
        let artifact = PublishedArtifact {
            template: template.to_string(),
            revision: revision.clone(),
            revision_url: self.store.object_url(&revision_key),
            latest_url: self.store.object_url(&latest_key),
            revision_key,
            latest_key,
            etag: hex::encode(md5),
            content_md5: base64::engine::general_purpose::STANDARD.encode(md5),
            sha256: hex::encode(Sha256::digest(body)),
            size: body.len(),
            reused,
            published_at: crate::utils::iso_timestamp(),
        };

        info!(
            template = %artifact.template,
            revision = %artifact.revision,
            etag = %artifact.etag,
            reused,
            "Published template artifact"
        );
        Ok(artifact)
    }

    /// Publishes every file under `root` using the tree's revision.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be read or any publish fails.
    pub async fn publish_bundle(&self, root: &Path) -> Result<BundlePublication, ArtifactError> {
        let root = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || read_tree(&root))
            .await
            .map_err(|e| ArtifactError::Storage(e.to_string()))??;
        let revision = RevisionId::from_loaded(&files);

        let mut artifacts = Vec::with_capacity(files.len());
        for (template, body) in files {
            artifacts.push(self.publish(&template, &body, &revision).await?);
        }

        Ok(BundlePublication {
            revision,
            artifacts,
        })
    }

    /// Returns the revision-addressed URL a stack should deploy from.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::Unpinned`] if the reference has no revision.
    pub fn template_url(&self, reference: &TemplateArtifactRef) -> Result<String, ArtifactError> {
        let revision = pinned(reference)?;
        Ok(self
            .store
            .object_url(&self.revision_key(&reference.template, revision)))
    }

    /// Returns true if the referenced revision is present in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference is unpinned or the store fails.
    pub async fn is_published(&self, reference: &TemplateArtifactRef) -> Result<bool, ArtifactError> {
        let revision = pinned(reference)?;
        Ok(self
            .store
            .get_object(&self.revision_key(&reference.template, revision))
            .await?
            .is_some())
    }

    /// Fetches the body at the referenced revision.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::NotPublished`] if the revision is absent.
    pub async fn fetch(&self, reference: &TemplateArtifactRef) -> Result<Vec<u8>, ArtifactError> {
        let revision = pinned(reference)?;
        let key = self.revision_key(&reference.template, revision);
        self.store
            .get_object(&key)
            .await?
            .ok_or(ArtifactError::NotPublished { key })
    }

    /// Fetches the body currently behind the reference's alias.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::NotPublished`] if nothing was published yet.
    pub async fn fetch_alias(&self, reference: &TemplateArtifactRef) -> Result<Vec<u8>, ArtifactError> {
        let key = self.alias_key(&reference.template, &reference.alias);
        self.store
            .get_object(&key)
            .await?
            .ok_or(ArtifactError::NotPublished { key })
    }
}

fn pinned(reference: &TemplateArtifactRef) -> Result<&RevisionId, ArtifactError> {
    reference
        .revision
        .as_ref()
        .ok_or_else(|| ArtifactError::Unpinned {
            template: reference.template.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::InMemoryArtifactStore;
    use pretty_assertions::assert_eq;

    fn publisher() -> (Arc<InMemoryArtifactStore>, ArtifactPublisher) {
        let store = Arc::new(InMemoryArtifactStore::new("https://artifacts.example"));
        let publisher = ArtifactPublisher::new(store.clone(), "infra");
        (store, publisher)
    }

    fn rev(s: &str) -> RevisionId {
        RevisionId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_publish_writes_revision_and_latest() {
        let (store, publisher) = publisher();
        let published = publisher.publish("iam.json", b"{}", &rev("abc123")).await.unwrap();

        assert_eq!(published.revision_key, "infra/abc123/iam.json");
        assert_eq!(published.latest_key, "infra/latest/iam.json");
        assert_eq!(published.revision_url, "https://artifacts.example/infra/abc123/iam.json");
        assert_eq!(published.etag, "99914b932bd37a50b983c5e7c90ae93b");
        assert_eq!(published.content_md5, "mZFLkyvTelC5g8XnyQrpOw==");
        assert!(!published.reused);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_revision_is_immutable_latest_is_repointed() {
        let (_store, publisher) = publisher();
        publisher.publish("iam.json", b"v1", &rev("r1")).await.unwrap();

        let again = publisher.publish("iam.json", b"v1", &rev("r1")).await.unwrap();
        assert!(again.reused);

        let conflict = publisher.publish("iam.json", b"v2", &rev("r1")).await;
        assert_eq!(
            conflict,
            Err(ArtifactError::ImmutableRevision {
                key: "infra/r1/iam.json".into()
            })
        );

        publisher.publish("iam.json", b"v2", &rev("r2")).await.unwrap();
        let latest = TemplateArtifactRef::new("iam.json");
        assert_eq!(publisher.fetch_alias(&latest).await.unwrap(), b"v2".to_vec());
        assert_eq!(
            publisher.fetch(&latest.clone().at(rev("r1"))).await.unwrap(),
            b"v1".to_vec()
        );
    }

    #[tokio::test]
    async fn test_unpinned_reference_has_no_url() {
        let (_store, publisher) = publisher();
        let reference = TemplateArtifactRef::new("iam.json");

        assert!(matches!(
            publisher.template_url(&reference),
            Err(ArtifactError::Unpinned { .. })
        ));
        assert!(matches!(
            publisher.fetch(&reference.at(rev("nope"))).await,
            Err(ArtifactError::NotPublished { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_bundle_uses_tree_revision() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("iam.json"), b"{\"iam\":1}").unwrap();
        std::fs::write(dir.path().join("s3.json"), b"{\"s3\":1}").unwrap();

        let (_store, publisher) = publisher();
        let bundle = publisher.publish_bundle(dir.path()).await.unwrap();

        assert_eq!(bundle.revision, RevisionId::from_source_tree(dir.path()).unwrap());
        let templates: Vec<_> = bundle.artifacts.iter().map(|a| a.template.as_str()).collect();
        assert_eq!(templates, vec!["iam.json", "s3.json"]);

        let reference = TemplateArtifactRef::new("s3.json").at(bundle.revision.clone());
        assert!(publisher.is_published(&reference).await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_bundle_revision_covers_published_bodies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("network")).unwrap();
        std::fs::write(dir.path().join("iam.json"), b"iam").unwrap();
        std::fs::write(dir.path().join("network/vpc.json"), b"vpc").unwrap();

        let (_store, publisher) = publisher();
        let bundle = publisher.publish_bundle(dir.path()).await.unwrap();

        let mut published = Vec::new();
        for artifact in &bundle.artifacts {
            let reference = TemplateArtifactRef::new(artifact.template.as_str()).at(bundle.revision.clone());
            published.push((artifact.template.clone(), publisher.fetch(&reference).await.unwrap()));
        }
        assert_eq!(
            published,
            vec![
                ("iam.json".to_string(), b"iam".to_vec()),
                ("network/vpc.json".to_string(), b"vpc".to_vec()),
            ]
        );
        assert_eq!(bundle.revision, RevisionId::from_loaded(&published));
    }
}
