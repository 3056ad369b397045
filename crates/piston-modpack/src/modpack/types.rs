use crate::error::{InstallError, InstallResult};
use crate::utils::hash::{ExpectedHash, HashAlgorithm};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MODRINTH_INDEX_FILE: &str = "modrinth.index.json";
pub const CURSEFORGE_MANIFEST_FILE: &str = "manifest.json";

// ---------------------------------------------------------------------------
// External schemas
// ---------------------------------------------------------------------------

/// Modrinth modpack index (modrinth.index.json)
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ModrinthIndex {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    #[serde(default = "default_game")]
    pub game: String,
    pub version_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub files: Vec<ModrinthFile>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

fn default_format_version() -> u32 { 1 }
fn default_game() -> String { "minecraft".to_string() }

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ModrinthFile {
    pub path: String,
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<ModrinthEnv>,
    #[serde(default)]
    pub downloads: Vec<String>,
    #[serde(default)]
    pub file_size: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
pub struct ModrinthEnv {
    #[serde(default = "default_required")]
    pub client: String, // "required", "optional", "unsupported"
    #[serde(default = "default_required")]
    pub server: String,
}

fn default_required() -> String { "required".to_string() }

/// CurseForge modpack manifest (manifest.json)
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CurseForgeManifest {
    pub minecraft: CurseForgeMinecraft,
    #[serde(default = "default_modpack")]
    pub manifest_type: String,
    #[serde(default = "default_manifest_version")]
    pub manifest_version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub files: Vec<CurseForgeFile>,
    #[serde(default = "default_overrides")]
    pub overrides: String,
}

fn default_manifest_version() -> u32 { 1 }
fn default_modpack() -> String { "minecraftModpack".to_string() }
fn default_overrides() -> String { "overrides".to_string() }

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CurseForgeMinecraft {
    pub version: String,
    #[serde(default)]
    pub mod_loaders: Vec<CurseForgeModLoader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_ram: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CurseForgeModLoader {
    pub id: String,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CurseForgeFile {
    #[serde(rename = "projectID", alias = "projectId")]
    pub project_id: Option<u32>,
    #[serde(rename = "fileID", alias = "fileId")]
    pub file_id: Option<u32>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<Vec<CurseForgeHash>>,
}

fn default_true() -> bool { true }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CurseForgeHash {
    pub value: String,
    pub algo: u32, // 1 = sha1, 2 = md5
}

// ---------------------------------------------------------------------------
// Canonical model
// ---------------------------------------------------------------------------

/// Modloader type. Every canonical index resolves to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoaderType {
    #[default]
    Vanilla,
    Forge,
    Fabric,
    Quilt,
    NeoForge,
}

impl LoaderType {
    pub const ALL: [LoaderType; 5] = [
        LoaderType::Vanilla,
        LoaderType::Forge,
        LoaderType::Fabric,
        LoaderType::Quilt,
        LoaderType::NeoForge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoaderType::Vanilla => "vanilla",
            LoaderType::Forge => "forge",
            LoaderType::Fabric => "fabric",
            LoaderType::Quilt => "quilt",
            LoaderType::NeoForge => "neoforge",
        }
    }

    /// Key used for this loader in the `dependencies` map of modrinth.index.json
    pub fn modrinth_dependency_key(&self) -> Option<&'static str> {
        match self {
            LoaderType::Vanilla => None,
            LoaderType::Forge => Some("forge"),
            LoaderType::Fabric => Some("fabric-loader"),
            LoaderType::Quilt => Some("quilt-loader"),
            LoaderType::NeoForge => Some("neoforge"),
        }
    }

    /// Loaders whose installation runs post-install processors
    pub fn uses_processors(&self) -> bool {
        matches!(self, LoaderType::Forge | LoaderType::NeoForge)
    }
}

impl std::fmt::Display for LoaderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LoaderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vanilla" => Ok(LoaderType::Vanilla),
            "forge" => Ok(LoaderType::Forge),
            "fabric" | "fabric-loader" => Ok(LoaderType::Fabric),
            "quilt" | "quilt-loader" => Ok(LoaderType::Quilt),
            "neoforge" => Ok(LoaderType::NeoForge),
            other => Err(format!("unknown loader: {}", other)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// modrinth.index.json
    Modrinth,
    /// manifest.json
    CurseForge,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnvRequirement {
    Required,
    Optional,
    Unsupported,
}

impl EnvRequirement {
    /// Translate catalog/manifest vocabulary; unknown words are treated as optional.
    pub fn from_catalog(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "required" => EnvRequirement::Required,
            "unsupported" => EnvRequirement::Unsupported,
            _ => EnvRequirement::Optional,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvRequirement::Required => "required",
            EnvRequirement::Optional => "optional",
            EnvRequirement::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct FileEnvironment {
    pub client: EnvRequirement,
    pub server: EnvRequirement,
}

/// A file whose download metadata is fully known.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    /// Relative to the profile root, `/`-separated
    pub relative_path: String,
    /// algorithm name → hex digest
    pub hashes: BTreeMap<String, String>,
    /// Fallback mirrors, tried in order
    pub download_urls: Vec<String>,
    pub size: u64,
}

impl ResolvedFile {
    /// Digest to verify downloads against. sha1 first, sha512 otherwise.
    pub fn expected_hash(&self) -> Option<ExpectedHash> {
        if let Some(sha1) = self.hashes.get(HashAlgorithm::Sha1.as_str()) {
            return Some(ExpectedHash::sha1(sha1.clone()));
        }
        self.hashes
            .get(HashAlgorithm::Sha512.as_str())
            .map(|h| ExpectedHash::sha512(h.clone()))
    }

    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }
}

/// Origin hints for a file whose download metadata must be looked up at install time.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct OriginHint {
    pub project_id: String,
    pub file_id: String,
    /// Some manifests carry a sha1 alongside the ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum FileSource {
    Resolved(ResolvedFile),
    Unresolved(OriginHint),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct IndexFile {
    pub source: FileSource,
    pub environment: Option<FileEnvironment>,
}

impl IndexFile {
    pub fn resolved(file: ResolvedFile, environment: Option<FileEnvironment>) -> Self {
        Self {
            source: FileSource::Resolved(file),
            environment,
        }
    }

    pub fn unresolved(hint: OriginHint) -> Self {
        Self {
            source: FileSource::Unresolved(hint),
            environment: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.source, FileSource::Resolved(_))
    }

    pub fn relative_path(&self) -> Option<&str> {
        match &self.source {
            FileSource::Resolved(f) => Some(&f.relative_path),
            FileSource::Unresolved(_) => None,
        }
    }

    pub fn origin_hint(&self) -> Option<&OriginHint> {
        match &self.source {
            FileSource::Unresolved(hint) => Some(hint),
            FileSource::Resolved(_) => None,
        }
    }

    /// Human readable label for logs and progress.
    pub fn display_name(&self) -> String {
        match &self.source {
            FileSource::Resolved(f) => f.file_name().to_string(),
            FileSource::Unresolved(h) => format!("project {} file {}", h.project_id, h.file_id),
        }
    }

    /// Files the client will never load are skipped during installation.
    pub fn is_client_supported(&self) -> bool {
        self.environment
            .map(|env| env.client != EnvRequirement::Unsupported)
            .unwrap_or(true)
    }

    /// Every file needs a hash or an origin hint to be identifiable.
    pub fn has_identifying_key(&self) -> bool {
        match &self.source {
            FileSource::Resolved(f) => f.hashes.values().any(|h| !h.trim().is_empty()),
            FileSource::Unresolved(h) => !h.project_id.is_empty() && !h.file_id.is_empty(),
        }
    }

    /// Replace the origin hint with concrete metadata. A resolved file is frozen.
    pub fn into_resolved(
        self,
        resolved: ResolvedFile,
        environment: Option<FileEnvironment>,
    ) -> InstallResult<IndexFile> {
        match self.source {
            FileSource::Unresolved(_) => Ok(IndexFile {
                source: FileSource::Resolved(resolved),
                environment: environment.or(self.environment),
            }),
            FileSource::Resolved(existing) => Err(InstallError::UnresolvableFile {
                path: existing.relative_path,
                reason: "file is already resolved".to_string(),
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DependencyRequirement {
    Required,
    Optional,
    Incompatible,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProjectDependency {
    pub project_id: Option<String>,
    pub version_id: Option<String>,
    pub requirement: DependencyRequirement,
}

impl ProjectDependency {
    pub fn required(project_id: impl Into<String>, version_id: Option<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            version_id,
            requirement: DependencyRequirement::Required,
        }
    }

    pub fn is_installable(&self) -> bool {
        self.requirement == DependencyRequirement::Required
            && (self.project_id.is_some() || self.version_id.is_some())
    }

    pub fn display_name(&self) -> String {
        match (&self.project_id, &self.version_id) {
            (Some(p), Some(v)) => format!("{} ({})", p, v),
            (Some(p), None) => p.clone(),
            (None, Some(v)) => format!("version {}", v),
            (None, None) => "unknown dependency".to_string(),
        }
    }
}

/// The unified representation of a modpack, independent of its source schema.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CanonicalIndex {
    pub game_version: String,
    pub loader_type: LoaderType,
    pub loader_version: String,
    pub pack_name: String,
    pub pack_version: String,
    /// `pack_version` was synthesized because the manifest had none
    pub auto_versioned: bool,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub recommended_ram_mb: Option<u32>,
    pub files: Vec<IndexFile>,
    pub dependencies: Vec<ProjectDependency>,
    pub source_format: SourceFormat,
    /// Folder (relative to the pack root) that holds verbatim overrides
    pub overrides_dir: String,
    /// Set if the pack is nested in a folder within the archive
    pub root_prefix: Option<String>,
}

impl CanonicalIndex {
    pub fn required_dependencies(&self) -> impl Iterator<Item = &ProjectDependency> {
        self.dependencies.iter().filter(|d| d.is_installable())
    }

    pub fn unresolved_count(&self) -> usize {
        self.files.iter().filter(|f| !f.is_resolved()).count()
    }

    /// Profile id used on disk, e.g. "forge-loader-47.2.0-1.20.1".
    pub fn installed_version_id(&self) -> String {
        match self.loader_type {
            LoaderType::Vanilla => self.game_version.clone(),
            loader => format!(
                "{}-loader-{}-{}",
                loader.as_str(),
                self.loader_version,
                self.game_version
            ),
        }
    }
}

/// Memory recommendation used when the manifest does not declare one
pub fn estimate_recommended_ram(file_count: usize) -> u32 {
    if file_count > 200 {
        8192
    } else if file_count > 100 {
        6144
    } else if file_count > 20 {
        4096
    } else {
        2048
    }
}
