use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::catalog::{
    CatalogDependency, CatalogFile, CatalogProject, CatalogVersion, ResourceCatalog, ResourceRole,
};
use crate::config::InstallerConfig;
use crate::modpack::types::{DependencyRequirement, EnvRequirement, LoaderType};
use crate::utils::hash::ContentHashes;

#[derive(Deserialize)]
struct ModrinthVersion {
    id: String,
    project_id: String,
    #[serde(default)]
    version_number: String,
    #[serde(default)]
    game_versions: Vec<String>,
    #[serde(default)]
    loaders: Vec<String>,
    #[serde(default)]
    files: Vec<ModrinthFile>,
    #[serde(default)]
    dependencies: Vec<ModrinthDependency>,
}

#[derive(Deserialize)]
struct ModrinthDependency {
    version_id: Option<String>,
    project_id: Option<String>,
    dependency_type: String,
}

#[derive(Deserialize)]
struct ModrinthFile {
    url: String,
    filename: String,
    #[serde(default)]
    hashes: BTreeMap<String, String>,
    #[serde(default)]
    primary: bool,
    #[serde(default)]
    size: u64,
}

#[derive(Deserialize)]
struct ModrinthProject {
    id: String,
    slug: Option<String>,
    title: String,
    project_type: String,
    #[serde(default = "unknown_side")]
    client_side: String,
    #[serde(default = "unknown_side")]
    server_side: String,
}

fn unknown_side() -> String {
    "unknown".to_string()
}

impl From<ModrinthVersion> for CatalogVersion {
    fn from(v: ModrinthVersion) -> Self {
        CatalogVersion {
            id: v.id,
            project_id: v.project_id,
            version_number: v.version_number,
            game_versions: v.game_versions,
            loaders: v.loaders,
            files: v
                .files
                .into_iter()
                .map(|f| CatalogFile {
                    file_name: f.filename,
                    url: f.url,
                    hashes: f.hashes,
                    size: f.size,
                    primary: f.primary,
                })
                .collect(),
            dependencies: v
                .dependencies
                .into_iter()
                .filter(|d| d.project_id.is_some() || d.version_id.is_some())
                .map(|d| CatalogDependency {
                    project_id: d.project_id,
                    version_id: d.version_id,
                    requirement: match d.dependency_type.as_str() {
                        "required" => DependencyRequirement::Required,
                        "incompatible" => DependencyRequirement::Incompatible,
                        // "optional" and "embedded" are never installed
                        _ => DependencyRequirement::Optional,
                    },
                })
                .collect(),
        }
    }
}

/// Modrinth v2 API adapter.
pub struct ModrinthCatalog {
    client: Client,
    base_url: String,
}

impl ModrinthCatalog {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &InstallerConfig) -> Result<Self> {
        Ok(Self::new(config.http_client()?, config.modrinth_api_url.clone()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Modrinth API error ({}): {}", status, body));
        }

        response
            .json()
            .await
            .map_err(|e| anyhow!("Modrinth JSON decode error: {}. URL: {}", e, url))
    }
}

#[async_trait]
impl ResourceCatalog for ModrinthCatalog {
    fn name(&self) -> &str {
        "modrinth"
    }

    fn resolves_bare_version_ids(&self) -> bool {
        true
    }

    async fn find_by_hash(&self, hashes: &ContentHashes) -> Result<Option<CatalogVersion>> {
        let url = format!("{}/version_file/{}?algorithm=sha1", self.base_url, hashes.sha1);
        let response = self.client.get(&url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            log::debug!("[Modrinth] No version for hash {}", hashes.sha1);
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Modrinth hash lookup failed ({}): {}", status, body));
        }

        let v: ModrinthVersion = response.json().await.map_err(|e| {
            anyhow!("Modrinth hash lookup JSON decode error: {}. Hash: {}", e, hashes.sha1)
        })?;
        log::debug!("[Modrinth] Hash {} → version {}", hashes.sha1, v.id);
        Ok(Some(v.into()))
    }

    async fn get_version(&self, _project_id: &str, version_id: &str) -> Result<CatalogVersion> {
        let url = format!("{}/version/{}", self.base_url, version_id);
        let v: ModrinthVersion = self
            .get_json(&url)
            .await
            .with_context(|| format!("fetch Modrinth version {}", version_id))?;
        Ok(v.into())
    }

    async fn get_versions(
        &self,
        project_id: &str,
        game_version: &str,
        loader: LoaderType,
    ) -> Result<Vec<CatalogVersion>> {
        let mut url = format!(
            "{}/project/{}/version?game_versions={}",
            self.base_url,
            project_id,
            urlencode_json_list(game_version)
        );
        if let Some(key) = loader_filter(loader) {
            url.push_str(&format!("&loaders={}", urlencode_json_list(key)));
        }

        let versions: Vec<ModrinthVersion> = self
            .get_json(&url)
            .await
            .with_context(|| format!("list Modrinth versions of {}", project_id))?;
        Ok(versions.into_iter().map(Into::into).collect())
    }

    async fn get_project(&self, project_id: &str) -> Result<CatalogProject> {
        let url = format!("{}/project/{}", self.base_url, project_id);
        let p: ModrinthProject = self
            .get_json(&url)
            .await
            .with_context(|| format!("fetch Modrinth project {}", project_id))?;

        let role = match p.project_type.as_str() {
            "resourcepack" => ResourceRole::ResourcePack,
            "shader" => ResourceRole::ShaderPack,
            "datapack" => ResourceRole::DataPack,
            _ => ResourceRole::Mod,
        };

        Ok(CatalogProject {
            id: p.id,
            slug: p.slug,
            title: p.title,
            role,
            client: EnvRequirement::from_catalog(&p.client_side),
            server: EnvRequirement::from_catalog(&p.server_side),
        })
    }
}

fn loader_filter(loader: LoaderType) -> Option<&'static str> {
    match loader {
        LoaderType::Vanilla => None,
        other => Some(other.as_str()),
    }
}

/// `["value"]`, percent-encoded for a query string.
fn urlencode_json_list(value: &str) -> String {
    urlencoding::encode(&format!("[\"{}\"]", value)).into_owned()
}
