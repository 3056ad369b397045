use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::catalog::{
    CatalogDependency, CatalogFile, CatalogProject, CatalogVersion, ResourceCatalog, ResourceRole,
};
use crate::config::{InstallerConfig, CURSEFORGE_CDN_URL};
use crate::modpack::types::{DependencyRequirement, EnvRequirement, LoaderType};
use crate::utils::hash::ContentHashes;

const FILES_PAGE_SIZE: u32 = 50;
const SHA1_ALGO: u8 = 1;

#[derive(Deserialize)]
struct CFResponse<T> {
    data: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CFMod {
    id: u32,
    name: String,
    slug: Option<String>,
    class_id: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CFFile {
    id: u32,
    mod_id: u32,
    #[serde(default)]
    display_name: String,
    file_name: String,
    #[serde(default)]
    game_versions: Vec<String>,
    #[serde(default)]
    hashes: Vec<CFHash>,
    download_url: Option<String>,
    #[serde(default)]
    file_length: u64,
    #[serde(default)]
    dependencies: Vec<CFDependency>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CFDependency {
    mod_id: u32,
    relation_type: u8,
}

#[derive(Deserialize)]
struct CFHash {
    value: String,
    algo: u8, // 1 = Sha1, 2 = Md5
}

#[derive(Deserialize)]
struct CFFingerprintData {
    #[serde(rename = "exactMatches", default)]
    exact_matches: Vec<CFExactMatch>,
}

#[derive(Deserialize)]
struct CFExactMatch {
    #[allow(dead_code)]
    id: u32,
    file: CFFile,
}

/// CurseForge CDN location for files whose API entry hides the download URL.
pub fn cdn_url(cdn_base: &str, file_id: u32, file_name: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        cdn_base.trim_end_matches('/'),
        file_id / 1000,
        file_id % 1000,
        urlencoding::encode(file_name)
    )
}

/// CurseForge project class → profile role.
fn map_class_id(class_id: u32) -> ResourceRole {
    match class_id {
        12 => ResourceRole::ResourcePack,
        6552 => ResourceRole::ShaderPack,
        17 => ResourceRole::DataPack,
        _ => ResourceRole::Mod,
    }
}

fn mod_loader_type(loader: LoaderType) -> Option<u8> {
    match loader {
        LoaderType::Forge => Some(1),
        LoaderType::Fabric => Some(4),
        LoaderType::Quilt => Some(5),
        LoaderType::NeoForge => Some(6),
        LoaderType::Vanilla => None,
    }
}

/// CurseForge core API adapter.
pub struct CurseForgeCatalog {
    client: Client,
    base_url: String,
    cdn_url: String,
    api_key: Option<String>,
}

impl CurseForgeCatalog {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        if api_key.is_none() {
            log::warn!("[CurseForge] No API key configured, requests will likely be rejected");
        }
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cdn_url: CURSEFORGE_CDN_URL.to_string(),
            api_key,
        }
    }

    pub fn from_config(config: &InstallerConfig) -> Result<Self> {
        Ok(Self::new(
            config.http_client()?,
            config.curseforge_api_url.clone(),
            config.curseforge_api_key.clone(),
        ))
    }

    pub fn with_cdn_url(mut self, cdn_url: impl Into<String>) -> Self {
        self.cdn_url = cdn_url.into();
        self
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(reqwest::header::ACCEPT, "application/json");
        match &self.api_key {
            Some(key) => request.header("x-api-key", key),
            None => request,
        }
    }

    async fn get_data<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.authorized(self.client.get(url)).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("CurseForge API error ({}): {}", status, body));
        }

        let wrapped: CFResponse<T> = response
            .json()
            .await
            .map_err(|e| anyhow!("CurseForge JSON decode error: {}. URL: {}", e, url))?;
        Ok(wrapped.data)
    }

    fn to_version(&self, file: CFFile) -> CatalogVersion {
        let mut hashes = BTreeMap::new();
        if let Some(sha1) = file.hashes.iter().find(|h| h.algo == SHA1_ALGO) {
            hashes.insert("sha1".to_string(), sha1.value.to_lowercase());
        }

        // gameVersions mixes game versions and loader names
        let mut loaders = Vec::new();
        let mut game_versions = Vec::new();
        for v in &file.game_versions {
            match v.to_lowercase().as_str() {
                "forge" | "fabric" | "quilt" | "neoforge" => loaders.push(v.to_lowercase()),
                _ => game_versions.push(v.clone()),
            }
        }

        let url = match file.download_url.filter(|u| !u.is_empty()) {
            Some(url) => url,
            None => {
                let url = cdn_url(&self.cdn_url, file.id, &file.file_name);
                log::debug!("[CurseForge] File {} has no download URL, using CDN {}", file.id, url);
                url
            }
        };

        CatalogVersion {
            id: file.id.to_string(),
            project_id: file.mod_id.to_string(),
            version_number: file.display_name,
            game_versions,
            loaders,
            files: vec![CatalogFile {
                file_name: file.file_name,
                url,
                hashes,
                size: file.file_length,
                primary: true,
            }],
            dependencies: file
                .dependencies
                .into_iter()
                .filter_map(|d| {
                    let requirement = match d.relation_type {
                        2 => DependencyRequirement::Optional,
                        3 => DependencyRequirement::Required,
                        5 => DependencyRequirement::Incompatible,
                        // embedded, tool and include are never resolved
                        _ => return None,
                    };
                    Some(CatalogDependency {
                        project_id: Some(d.mod_id.to_string()),
                        version_id: None,
                        requirement,
                    })
                })
                .collect(),
        }
    }
}

#[async_trait]
impl ResourceCatalog for CurseForgeCatalog {
    fn name(&self) -> &str {
        "curseforge"
    }

    async fn find_by_hash(&self, hashes: &ContentHashes) -> Result<Option<CatalogVersion>> {
        let url = format!("{}/v1/fingerprints", self.base_url);
        let body = serde_json::json!({ "fingerprints": [hashes.fingerprint] });

        let response = self.authorized(self.client.post(&url)).json(&body).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("CurseForge fingerprint lookup failed ({}): {}", status, body));
        }

        let result: CFResponse<CFFingerprintData> = response.json().await.map_err(|e| {
            anyhow!(
                "CurseForge fingerprint JSON decode error: {}. Fingerprint: {}",
                e,
                hashes.fingerprint
            )
        })?;

        Ok(result
            .data
            .exact_matches
            .into_iter()
            .next()
            .map(|m| self.to_version(m.file)))
    }

    async fn get_version(&self, project_id: &str, version_id: &str) -> Result<CatalogVersion> {
        let url = format!("{}/v1/mods/{}/files/{}", self.base_url, project_id, version_id);
        let file: CFFile = self
            .get_data(&url)
            .await
            .with_context(|| format!("fetch CurseForge file {} of project {}", version_id, project_id))?;
        Ok(self.to_version(file))
    }

    async fn get_versions(
        &self,
        project_id: &str,
        game_version: &str,
        loader: LoaderType,
    ) -> Result<Vec<CatalogVersion>> {
        let mut url = format!(
            "{}/v1/mods/{}/files?index=0&pageSize={}&gameVersion={}",
            self.base_url, project_id, FILES_PAGE_SIZE, game_version
        );
        if let Some(lt) = mod_loader_type(loader) {
            url.push_str(&format!("&modLoaderType={}", lt));
        }

        let files: Vec<CFFile> = self
            .get_data(&url)
            .await
            .with_context(|| format!("list CurseForge files of project {}", project_id))?;
        Ok(files.into_iter().map(|f| self.to_version(f)).collect())
    }

    async fn get_project(&self, project_id: &str) -> Result<CatalogProject> {
        let url = format!("{}/v1/mods/{}", self.base_url, project_id);
        let item: CFMod = self
            .get_data(&url)
            .await
            .with_context(|| format!("fetch CurseForge project {}", project_id))?;

        // CurseForge publishes no side information
        Ok(CatalogProject {
            id: item.id.to_string(),
            slug: item.slug,
            title: item.name,
            role: map_class_id(item.class_id.unwrap_or(6)),
            client: EnvRequirement::Required,
            server: EnvRequirement::Required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn file_json(download_url: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "id": 4712345,
            "modId": 238222,
            "displayName": "jei-1.20.1-forge-15.2.0.27.jar",
            "fileName": "jei-1.20.1-forge-15.2.0.27.jar",
            "gameVersions": ["1.20.1", "Forge"],
            "hashes": [{ "value": "ABCDEF", "algo": 1 }, { "value": "00", "algo": 2 }],
            "downloadUrl": download_url,
            "fileLength": 1234,
            "dependencies": [
                { "modId": 1, "relationType": 3 },
                { "modId": 2, "relationType": 1 }
            ]
        })
    }

    #[test]
    fn cdn_url_splits_file_id() {
        assert_eq!(
            cdn_url("https://edge.forgecdn.net/files", 4712345, "a.jar"),
            "https://edge.forgecdn.net/files/4712/345/a.jar"
        );
    }

    #[test]
    fn cdn_url_encodes_file_name() {
        assert_eq!(
            cdn_url("https://edge.forgecdn.net/files/", 5123045, "Better Foliage+ [1.20] #2.jar"),
            "https://edge.forgecdn.net/files/5123/45/Better%20Foliage%2B%20%5B1.20%5D%20%232.jar"
        );
    }

    #[tokio::test]
    async fn fingerprint_match_sends_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/fingerprints"))
            .and(header("x-api-key", "secret"))
            .and(body_json(serde_json::json!({ "fingerprints": [42] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "exactMatches": [{ "id": 238222, "file": file_json(Some("https://cdn/a.jar")) }] }
            })))
            .mount(&server)
            .await;

        let catalog = CurseForgeCatalog::new(Client::new(), server.uri(), Some("secret".into()));
        let hashes = ContentHashes {
            sha1: String::new(),
            sha512: String::new(),
            fingerprint: 42,
            size: 0,
        };
        let v = catalog.find_by_hash(&hashes).await.unwrap().unwrap();
        assert_eq!(v.project_id, "238222");
        assert_eq!(v.id, "4712345");
        assert_eq!(v.loaders, vec!["forge".to_string()]);
        assert_eq!(v.files[0].sha1(), Some("abcdef"));
        assert_eq!(v.dependencies.len(), 1);
        assert_eq!(v.required_dependencies().count(), 1);
    }

    #[tokio::test]
    async fn empty_fingerprint_result_is_a_miss() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/fingerprints"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "exactMatches": [] }
            })))
            .mount(&server)
            .await;

        let catalog = CurseForgeCatalog::new(Client::new(), server.uri(), None);
        let hashes = ContentHashes {
            sha1: String::new(),
            sha512: String::new(),
            fingerprint: 1,
            size: 0,
        };
        assert!(catalog.find_by_hash(&hashes).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hidden_download_url_uses_cdn() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/mods/238222/files/4712345"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": file_json(None) })),
            )
            .mount(&server)
            .await;

        let catalog = CurseForgeCatalog::new(Client::new(), server.uri(), None)
            .with_cdn_url("https://cdn.test/files");
        let v = catalog.get_version("238222", "4712345").await.unwrap();
        assert_eq!(
            v.files[0].url,
            "https://cdn.test/files/4712/345/jei-1.20.1-forge-15.2.0.27.jar"
        );
    }

    #[tokio::test]
    async fn versions_filter_by_loader_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/mods/238222/files"))
            .and(query_param("gameVersion", "1.20.1"))
            .and(query_param("modLoaderType", "6"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [file_json(Some("https://cdn/a.jar"))]
            })))
            .mount(&server)
            .await;

        let catalog = CurseForgeCatalog::new(Client::new(), server.uri(), None);
        let versions = catalog
            .get_versions("238222", "1.20.1", LoaderType::NeoForge)
            .await
            .unwrap();
        assert_eq!(versions.len(), 1);
    }

    #[tokio::test]
    async fn project_class_maps_to_role() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/mods/99"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "id": 99, "name": "Shiny", "slug": "shiny", "classId": 6552 }
            })))
            .mount(&server)
            .await;

        let catalog = CurseForgeCatalog::new(Client::new(), server.uri(), None);
        assert_eq!(catalog.get_project("99").await.unwrap().role, ResourceRole::ShaderPack);
    }
}
