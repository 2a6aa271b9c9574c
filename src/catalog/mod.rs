pub mod cache;
pub mod sync;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::installer::InstallState;
use crate::launcher::{LaunchOption, Runner};
use crate::remote::TitleMetadata;

pub use cache::CatalogCache;
pub use sync::Catalog;

/// One owned title as known locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleRecord {
    /// Stable remote identifier
    pub id: String,

    /// Display name
    pub name: String,

    /// Version of the remote metadata
    pub metadata_version: String,

    /// Installation state
    #[serde(default)]
    pub install_state: InstallState,

    /// Install directory, set while installed
    #[serde(default)]
    pub install_path: Option<PathBuf>,

    /// Artifact size reported by the catalog service
    #[serde(default)]
    pub size_bytes: u64,

    /// Launch options of this title, applied over the global defaults
    #[serde(default)]
    pub launch_options: Vec<LaunchOption>,

    /// Runner chosen for this title; picked from the executable when unset
    #[serde(default)]
    pub runner: Option<Runner>,
}

impl TitleRecord {
    /// New record for a title first seen remotely
    pub fn from_metadata(metadata: TitleMetadata) -> Self {
        Self {
            id: metadata.id,
            name: metadata.name,
            metadata_version: metadata.metadata_version,
            install_state: InstallState::NotInstalled,
            install_path: None,
            size_bytes: metadata.size_bytes,
            launch_options: Vec::new(),
            runner: None,
        }
    }

    /// Whether the remote metadata differs from this record
    fn metadata_differs(&self, metadata: &TitleMetadata) -> bool {
        self.name != metadata.name
            || self.metadata_version != metadata.metadata_version
            || self.size_bytes != metadata.size_bytes
    }

    /// Take remote metadata while keeping local state
    fn apply_metadata(&mut self, metadata: TitleMetadata) {
        self.name = metadata.name;
        self.metadata_version = metadata.metadata_version;
        self.size_bytes = metadata.size_bytes;
    }
}

/// Result of a catalog sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogDiff {
    pub added: Vec<TitleRecord>,
    /// Ids of titles no longer owned
    pub removed: Vec<String>,
    pub changed: Vec<TitleRecord>,
}

impl CatalogDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Local search over a snapshot of the catalog
///
/// Matching happens lazily while iterating; `iter` can be called any number
/// of times and always starts over.
#[derive(Debug, Clone)]
pub struct SearchResults {
    records: Arc<[TitleRecord]>,
    needle: String,
}

impl SearchResults {
    fn new(records: Arc<[TitleRecord]>, query: &str) -> Self {
        Self {
            records,
            needle: query.trim().to_lowercase(),
        }
    }

    /// Iterate the matching records in name order
    pub fn iter(&self) -> impl Iterator<Item = &TitleRecord> + '_ {
        self.records
            .iter()
            .filter(move |record| record.name.to_lowercase().contains(&self.needle))
    }
}

impl<'a> IntoIterator for &'a SearchResults {
    type Item = &'a TitleRecord;
    type IntoIter = Box<dyn Iterator<Item = &'a TitleRecord> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}
