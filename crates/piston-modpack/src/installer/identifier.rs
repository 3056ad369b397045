use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::catalog::{CatalogVersion, ResourceCatalog, ResourceRole};
use crate::error::InstallResult;
use crate::modpack::types::{FileEnvironment, IndexFile, ResolvedFile};
use crate::utils::hash::{content_hashes_async, ContentHashes, HashAlgorithm};

/// A local file matched to a catalog record.
#[derive(Debug, Clone)]
pub struct KnownArtifact {
    pub file: IndexFile,
    pub catalog: String,
    pub project_id: String,
    pub version_id: String,
    /// False when the first-file fallback was used
    pub exact: bool,
}

#[derive(Debug, Clone)]
pub enum Identification {
    Known(KnownArtifact),
    /// Must be preserved verbatim as an override
    Unrecognized,
}

impl Identification {
    pub fn is_known(&self) -> bool {
        matches!(self, Identification::Known(_))
    }
}

/// Decides whether a local file is a re-downloadable catalog artifact.
#[derive(Clone)]
pub struct ResourceIdentifier {
    catalogs: Vec<Arc<dyn ResourceCatalog>>,
}

impl ResourceIdentifier {
    /// Catalogs are queried in order; the first hit wins.
    pub fn new(catalogs: Vec<Arc<dyn ResourceCatalog>>) -> Self {
        Self { catalogs }
    }

    pub async fn identify(&self, path: &Path, role: ResourceRole) -> InstallResult<Identification> {
        let hashes = content_hashes_async(path.to_path_buf()).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        for catalog in &self.catalogs {
            let version = match catalog.find_by_hash(&hashes).await {
                Ok(Some(version)) => version,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!(
                        "[Identifier] {} lookup failed for {}: {:#}",
                        catalog.name(),
                        file_name,
                        e
                    );
                    continue;
                }
            };

            if let Some(known) = self
                .synthesize(catalog.as_ref(), &version, &hashes, &file_name, role)
                .await
            {
                log::debug!(
                    "[Identifier] {} → {} project {} version {}",
                    file_name,
                    catalog.name(),
                    known.project_id,
                    known.version_id
                );
                return Ok(Identification::Known(known));
            }
        }

        log::debug!("[Identifier] {} is not in any catalog, keeping as override", file_name);
        Ok(Identification::Unrecognized)
    }

    async fn synthesize(
        &self,
        catalog: &dyn ResourceCatalog,
        version: &CatalogVersion,
        hashes: &ContentHashes,
        file_name: &str,
        role: ResourceRole,
    ) -> Option<KnownArtifact> {
        let (remote, exact) = version.file_for_hash(&hashes.sha1)?;
        if !exact {
            log::warn!(
                "[Identifier] No file of {} version {} matches {} byte-for-byte; using first listed file {} (approximate match)",
                catalog.name(),
                version.id,
                file_name,
                remote.file_name
            );
        }

        let environment = match catalog.get_project(&version.project_id).await {
            Ok(project) => Some(FileEnvironment {
                client: project.client,
                server: project.server,
            }),
            Err(e) => {
                log::warn!(
                    "[Identifier] Could not fetch project {} for side info: {:#}",
                    version.project_id,
                    e
                );
                None
            }
        };

        let file_hashes = if exact {
            BTreeMap::from([
                (HashAlgorithm::Sha1.as_str().to_string(), hashes.sha1.clone()),
                (HashAlgorithm::Sha512.as_str().to_string(), hashes.sha512.clone()),
            ])
        } else {
            remote.hashes.clone()
        };
        if file_hashes.is_empty() {
            return None;
        }

        let resolved = ResolvedFile {
            relative_path: format!("{}/{}", role.subfolder(), file_name),
            hashes: file_hashes,
            download_urls: vec![remote.url.clone()],
            size: if exact { hashes.size } else { remote.size },
        };

        Some(KnownArtifact {
            file: IndexFile::resolved(resolved, environment),
            catalog: catalog.name().to_string(),
            project_id: version.project_id.clone(),
            version_id: version.id.clone(),
            exact,
        })
    }
}
