use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::catalog::{CatalogProject, CatalogVersion, ResourceCatalog};
use crate::modpack::types::LoaderType;
use crate::utils::hash::{digests_match, ContentHashes};

/// Catalog backed by a fixed set of versions. Used for offline installs and tests.
pub struct InMemoryCatalog {
    name: String,
    versions: Vec<CatalogVersion>,
    projects: HashMap<String, CatalogProject>,
    unavailable: bool,
    hash_lookups: AtomicUsize,
}

impl InMemoryCatalog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            versions: Vec::new(),
            projects: HashMap::new(),
            unavailable: false,
            hash_lookups: AtomicUsize::new(0),
        }
    }

    pub fn with_version(mut self, version: CatalogVersion) -> Self {
        self.versions.push(version);
        self
    }

    pub fn with_project(mut self, project: CatalogProject) -> Self {
        self.projects.insert(project.id.clone(), project);
        self
    }

    /// Every call fails as if the network were down.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn hash_lookups(&self) -> usize {
        self.hash_lookups.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable {
            Err(anyhow!("{} catalog is unavailable", self.name))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ResourceCatalog for InMemoryCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolves_bare_version_ids(&self) -> bool {
        true
    }

    async fn find_by_hash(&self, hashes: &ContentHashes) -> Result<Option<CatalogVersion>> {
        self.hash_lookups.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;
        Ok(self
            .versions
            .iter()
            .find(|v| {
                v.files
                    .iter()
                    .any(|f| f.sha1().map(|h| digests_match(h, &hashes.sha1)).unwrap_or(false))
            })
            .cloned())
    }

    async fn get_version(&self, project_id: &str, version_id: &str) -> Result<CatalogVersion> {
        self.ensure_available()?;
        self.versions
            .iter()
            .find(|v| v.id == version_id && (project_id.is_empty() || v.project_id == project_id))
            .cloned()
            .ok_or_else(|| anyhow!("version {} of {} not found", version_id, project_id))
    }

    async fn get_versions(
        &self,
        project_id: &str,
        game_version: &str,
        loader: LoaderType,
    ) -> Result<Vec<CatalogVersion>> {
        self.ensure_available()?;
        Ok(self
            .versions
            .iter()
            .filter(|v| v.project_id == project_id)
            .filter(|v| v.game_versions.is_empty() || v.game_versions.iter().any(|g| g == game_version))
            .filter(|v| {
                loader == LoaderType::Vanilla
                    || v.loaders.is_empty()
                    || v.loaders.iter().any(|l| l.eq_ignore_ascii_case(loader.as_str()))
            })
            .cloned()
            .collect())
    }

    async fn get_project(&self, project_id: &str) -> Result<CatalogProject> {
        self.ensure_available()?;
        self.projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| anyhow!("project {} not found", project_id))
    }
}
