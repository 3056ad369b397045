use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{InstallError, InstallResult, IoResultExt};
use crate::installer::processor::Processor;
use crate::modpack::types::LoaderType;

const INSTALL_PROFILE_ENTRY: &str = "install_profile.json";

#[derive(Debug, Deserialize)]
struct RawInstallProfile {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    data: HashMap<String, RawDataEntry>,
    #[serde(default)]
    processors: Vec<RawProcessor>,
}

#[derive(Debug, Deserialize)]
struct RawDataEntry {
    client: String,
}

#[derive(Debug, Deserialize)]
struct RawProcessor {
    jar: String,
    #[serde(default)]
    classpath: Vec<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    sides: Option<Vec<String>>,
}

impl RawProcessor {
    fn runs_on_client(&self) -> bool {
        self.sides
            .as_ref()
            .map(|sides| sides.iter().any(|s| s == "client" || s == "extract"))
            .unwrap_or(true)
    }
}

/// Client-side processors and substitution data of a Forge/NeoForge installer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderProfile {
    /// e.g. "1.20.1-forge-47.2.0"
    pub version_name: Option<String>,
    pub processors: Vec<Processor>,
    pub data: BTreeMap<String, String>,
}

impl LoaderProfile {
    pub fn from_json(json: &str) -> InstallResult<Self> {
        let raw: RawInstallProfile = serde_json::from_str(json)?;
        let total = raw.processors.len();

        let processors: Vec<Processor> = raw
            .processors
            .into_iter()
            .filter(RawProcessor::runs_on_client)
            .map(|p| Processor {
                jar: p.jar,
                classpath: p.classpath,
                args: p.args,
                remaps: BTreeMap::new(),
            })
            .collect();
        log::debug!(
            "[LoaderProfile] {} of {} processors run on the client",
            processors.len(),
            total
        );

        Ok(Self {
            version_name: raw.version,
            processors,
            data: raw.data.into_iter().map(|(k, v)| (k, v.client)).collect(),
        })
    }

    /// Reads `install_profile.json` from an installer jar. Data entries that
    /// point inside the jar (`/data/client.lzma`) are extracted below `data_dir`.
    pub fn from_installer_jar(installer: &Path, data_dir: &Path) -> InstallResult<Self> {
        let file = std::fs::File::open(installer).at_path(installer)?;
        let mut archive = zip::ZipArchive::new(file)?;

        let json = {
            let mut entry = archive.by_name(INSTALL_PROFILE_ENTRY).map_err(|_| {
                InstallError::manifest(format!(
                    "{} not found in {:?}",
                    INSTALL_PROFILE_ENTRY, installer
                ))
            })?;
            let mut json = String::new();
            entry.read_to_string(&mut json).at_path(installer)?;
            json
        };

        let mut profile = Self::from_json(&json)?;
        for value in profile.data.values_mut() {
            let Some(internal) = value.strip_prefix('/') else {
                continue;
            };
            let destination = data_dir.join(internal);
            if !destination.starts_with(data_dir) || internal.split('/').any(|s| s == "..") {
                return Err(InstallError::manifest(format!(
                    "installer data entry escapes the data directory: {}",
                    value
                )));
            }
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent).map_err(|source| {
                    InstallError::DirectoryCreationFailed {
                        path: parent.to_path_buf(),
                        source,
                    }
                })?;
            }

            let mut entry = archive.by_name(internal).map_err(|_| {
                InstallError::manifest(format!("{} not found in installer jar", internal))
            })?;
            let mut out = std::fs::File::create(&destination).at_path(&destination)?;
            std::io::copy(&mut entry, &mut out).at_path(&destination)?;

            log::debug!("[LoaderProfile] Extracted data file {} → {:?}", value, destination);
            *value = destination.to_string_lossy().to_string();
        }

        Ok(profile)
    }
}

/// Copies the `maven/` tree embedded in an installer jar into the libraries root.
pub fn extract_embedded_libraries(installer: &Path, libraries_dir: &Path) -> InstallResult<usize> {
    let file = std::fs::File::open(installer).at_path(installer)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut extracted = 0;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let Some(relative) = entry.name().strip_prefix("maven/").map(str::to_string) else {
            continue;
        };
        let Some(safe) = entry.enclosed_name() else {
            log::warn!("[LoaderProfile] Skipping unsafe entry {}", entry.name());
            continue;
        };
        if !safe.starts_with("maven") {
            continue;
        }

        let destination = libraries_dir.join(&relative);
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(|source| InstallError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut out = std::fs::File::create(&destination).at_path(&destination)?;
        std::io::copy(&mut entry, &mut out).at_path(&destination)?;
        extracted += 1;
    }

    log::debug!("[LoaderProfile] Extracted {} embedded libraries", extracted);
    Ok(extracted)
}

/// Where the coordinator gets post-install processors for a loader.
#[async_trait]
pub trait LoaderProfileSource: Send + Sync {
    /// `Ok(None)` when the loader needs no processors.
    async fn load(
        &self,
        loader: LoaderType,
        loader_version: &str,
        game_version: &str,
        libraries_dir: &Path,
        work_dir: &Path,
    ) -> InstallResult<Option<LoaderProfile>>;
}

/// Reads processors from an installer jar already on disk.
pub struct InstallerJarProfileSource {
    installer: PathBuf,
}

impl InstallerJarProfileSource {
    pub fn new(installer: impl Into<PathBuf>) -> Self {
        Self {
            installer: installer.into(),
        }
    }
}

#[async_trait]
impl LoaderProfileSource for InstallerJarProfileSource {
    async fn load(
        &self,
        loader: LoaderType,
        loader_version: &str,
        game_version: &str,
        libraries_dir: &Path,
        work_dir: &Path,
    ) -> InstallResult<Option<LoaderProfile>> {
        if !loader.uses_processors() {
            return Ok(None);
        }
        log::info!(
            "[LoaderProfile] Reading {} {} for Minecraft {} from {:?}",
            loader,
            loader_version,
            game_version,
            self.installer
        );

        let installer = self.installer.clone();
        let libraries = libraries_dir.to_path_buf();
        let data_dir = work_dir.join("installer-data");
        let profile = tokio::task::spawn_blocking(move || -> InstallResult<LoaderProfile> {
            extract_embedded_libraries(&installer, &libraries)?;
            LoaderProfile::from_installer_jar(&installer, &data_dir)
        })
        .await
        .map_err(|e| InstallError::io(&self.installer, std::io::Error::other(e)))??;

        Ok(Some(profile))
    }
}
