//! Versioned template artifacts.
//!
//! Templates are published under an immutable revision key and a mutable
//! `latest` alias. Stacks deploy from the revision-addressed URL so a running
//! stack can always be traced back to the exact source tree it came from.

mod publisher;
mod revision;
mod source;
mod store;

pub use publisher::{ArtifactPublisher, BundlePublication, PublishedArtifact};
pub use revision::{RevisionId, REVISION_LEN};
pub use source::{DirectoryTemplateSource, InMemoryTemplateSource, TemplateSource};
pub use store::{ArtifactStore, FsArtifactStore, InMemoryArtifactStore};
