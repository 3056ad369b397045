//! Remote resource catalogs used to resolve files by hash or by project/version id.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::InstallerConfig;
use crate::modpack::types::{DependencyRequirement, EnvRequirement, LoaderType, SourceFormat};
use crate::utils::hash::{digests_match, ContentHashes, HashAlgorithm};

pub mod curseforge;
pub mod memory;
pub mod modrinth;

pub use curseforge::CurseForgeCatalog;
pub use memory::InMemoryCatalog;
pub use modrinth::ModrinthCatalog;

/// What a piece of content is, which decides the profile folder it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceRole {
    Mod,
    DataPack,
    ResourcePack,
    ShaderPack,
}

impl ResourceRole {
    pub const ALL: [ResourceRole; 4] = [
        ResourceRole::Mod,
        ResourceRole::DataPack,
        ResourceRole::ResourcePack,
        ResourceRole::ShaderPack,
    ];

    pub fn subfolder(&self) -> &'static str {
        match self {
            ResourceRole::Mod => "mods",
            ResourceRole::DataPack => "datapacks",
            ResourceRole::ResourcePack => "resourcepacks",
            ResourceRole::ShaderPack => "shaderpacks",
        }
    }

    pub fn from_subfolder(folder: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.subfolder() == folder)
    }

    /// Role from a `/`-separated relative path's first segment.
    pub fn from_relative_path(path: &str) -> Option<Self> {
        path.split('/').next().and_then(Self::from_subfolder)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogFile {
    pub file_name: String,
    pub url: String,
    /// algorithm name → hex digest
    pub hashes: BTreeMap<String, String>,
    pub size: u64,
    pub primary: bool,
}

impl CatalogFile {
    pub fn sha1(&self) -> Option<&str> {
        self.hashes.get(HashAlgorithm::Sha1.as_str()).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogDependency {
    pub project_id: Option<String>,
    pub version_id: Option<String>,
    pub requirement: DependencyRequirement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogVersion {
    pub id: String,
    pub project_id: String,
    pub version_number: String,
    pub game_versions: Vec<String>,
    pub loaders: Vec<String>,
    pub files: Vec<CatalogFile>,
    pub dependencies: Vec<CatalogDependency>,
}

impl CatalogVersion {
    /// The file a fresh install should download: primary, else the first listed.
    pub fn primary_file(&self) -> Option<&CatalogFile> {
        self.files
            .iter()
            .find(|f| f.primary)
            .or_else(|| self.files.first())
    }

    /// The file whose sha1 equals `sha1`, with an exact-match flag.
    ///
    /// Falls back to the first listed file when nothing matches. That is an
    /// approximation: the metadata may belong to a sibling file of the version.
    pub fn file_for_hash(&self, sha1: &str) -> Option<(&CatalogFile, bool)> {
        if let Some(exact) = self
            .files
            .iter()
            .find(|f| f.sha1().map(|h| digests_match(h, sha1)).unwrap_or(false))
        {
            return Some((exact, true));
        }
        self.files.first().map(|f| (f, false))
    }

    pub fn required_dependencies(&self) -> impl Iterator<Item = &CatalogDependency> {
        self.dependencies
            .iter()
            .filter(|d| d.requirement == DependencyRequirement::Required)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogProject {
    pub id: String,
    pub slug: Option<String>,
    pub title: String,
    pub role: ResourceRole,
    pub client: EnvRequirement,
    pub server: EnvRequirement,
}

/// A remote catalog of installable resources.
#[async_trait]
pub trait ResourceCatalog: Send + Sync {
    fn name(&self) -> &str;

    /// Looks a local file up by content. A miss is `Ok(None)`.
    async fn find_by_hash(&self, hashes: &ContentHashes) -> Result<Option<CatalogVersion>>;

    async fn get_version(&self, project_id: &str, version_id: &str) -> Result<CatalogVersion>;

    /// Whether `get_version` works with an empty project id.
    fn resolves_bare_version_ids(&self) -> bool {
        false
    }

    /// Versions compatible with a game version and loader, newest first.
    async fn get_versions(
        &self,
        project_id: &str,
        game_version: &str,
        loader: LoaderType,
    ) -> Result<Vec<CatalogVersion>>;

    async fn get_project(&self, project_id: &str) -> Result<CatalogProject>;
}

/// The catalogs available to one installer, keyed by the id scheme they understand.
#[derive(Clone, Default)]
pub struct CatalogSet {
    modrinth: Option<Arc<dyn ResourceCatalog>>,
    curseforge: Option<Arc<dyn ResourceCatalog>>,
}

impl CatalogSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Modrinth always, CurseForge alongside it.
    pub fn from_config(config: &InstallerConfig) -> Result<Self> {
        Ok(Self::new()
            .with_modrinth(Arc::new(ModrinthCatalog::from_config(config)?))
            .with_curseforge(Arc::new(CurseForgeCatalog::from_config(config)?)))
    }

    pub fn with_modrinth(mut self, catalog: Arc<dyn ResourceCatalog>) -> Self {
        self.modrinth = Some(catalog);
        self
    }

    pub fn with_curseforge(mut self, catalog: Arc<dyn ResourceCatalog>) -> Self {
        self.curseforge = Some(catalog);
        self
    }

    /// Catalog whose ids a manifest of `format` references.
    pub fn for_format(&self, format: SourceFormat) -> Option<Arc<dyn ResourceCatalog>> {
        match format {
            SourceFormat::Modrinth => self.modrinth.clone(),
            SourceFormat::CurseForge => self.curseforge.clone(),
        }
    }

    /// Lookup order for hash identification
    pub fn all(&self) -> Vec<Arc<dyn ResourceCatalog>> {
        self.modrinth
            .iter()
            .chain(self.curseforge.iter())
            .cloned()
            .collect()
    }
}
