use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use crate::catalog::{CatalogDependency, CatalogSet, CatalogVersion, ResourceCatalog, ResourceRole};
use crate::config::InstallerConfig;
use crate::error::{InstallError, InstallResult, IoResultExt};
use crate::installer::downloader::{DownloadOutcome, VerifiedDownloader};
use crate::installer::progress::{CancelToken, Phase, ProgressSender};
use crate::installer::transaction::InstallJournal;
use crate::installer::types::InstallSummary;
use crate::modpack::archive::{list_files, override_roots};
use crate::modpack::parser::validate_relative_path;
use crate::modpack::types::{
    CanonicalIndex, DependencyRequirement, FileEnvironment, FileSource, IndexFile, OriginHint,
    ProjectDependency, ResolvedFile,
};
use crate::utils::hash::HashAlgorithm;

/// Run `f` over `items` with at most `concurrency` futures in flight.
///
/// The first error is returned immediately; dropping the stream cancels the
/// remaining in-flight futures.
pub(crate) async fn run_bounded<T, R, F, Fut>(
    items: Vec<T>,
    concurrency: usize,
    f: F,
) -> InstallResult<Vec<R>>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = InstallResult<R>>,
{
    let mut results = Vec::with_capacity(items.len());
    let mut pool = stream::iter(items).map(f).buffer_unordered(concurrency.max(1));
    while let Some(result) = pool.next().await {
        results.push(result?);
    }
    Ok(results)
}

/// What the primary-file phase leaves behind for the dependency phase.
#[derive(Debug, Default, Clone)]
pub struct FilesReport {
    /// Every file now present in the profile, fully resolved
    pub installed: Vec<IndexFile>,
    /// Catalog projects the installed files belong to, where known
    pub projects: HashSet<String>,
    /// Required dependencies declared by the resolved catalog versions
    pub transitive: Vec<ProjectDependency>,
}

struct InstalledFile {
    file: IndexFile,
    project_id: Option<String>,
    dependencies: Vec<ProjectDependency>,
}

/// Installs the overrides, primary files and dependencies of a canonical index.
#[derive(Clone)]
pub struct DependencyInstaller {
    downloader: VerifiedDownloader,
    catalogs: CatalogSet,
    concurrency: usize,
    resolve_transitive: bool,
    journal: Option<InstallJournal>,
}

impl DependencyInstaller {
    pub fn new(downloader: VerifiedDownloader, catalogs: CatalogSet, config: &InstallerConfig) -> Self {
        Self {
            downloader,
            catalogs,
            concurrency: config.concurrency.max(1),
            resolve_transitive: config.resolve_transitive_dependencies,
            journal: None,
        }
    }

    /// Record every profile write so a rollback can undo it.
    pub fn with_journal(mut self, journal: InstallJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// All three phases in order. Any failure aborts the remaining work.
    pub async fn install(
        &self,
        index: &CanonicalIndex,
        extracted_root: &Path,
        profile_dir: &Path,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> InstallResult<InstallSummary> {
        let overrides = self
            .copy_overrides(extracted_root, index, profile_dir, progress, cancel)
            .await?;
        let report = self.install_files(index, profile_dir, progress, cancel).await?;
        let dependencies = self
            .install_dependencies(index, &report, profile_dir, progress, cancel)
            .await?;

        Ok(InstallSummary {
            overrides,
            files: report.installed.len(),
            dependencies,
        })
    }

    /// Copy override folders into the profile byte-for-byte. Later roots win on conflicts.
    pub async fn copy_overrides(
        &self,
        extracted_root: &Path,
        index: &CanonicalIndex,
        profile_dir: &Path,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> InstallResult<usize> {
        let mut entries = Vec::new();
        for root in override_roots(extracted_root, index) {
            let files = list_files(&root)?;
            log::debug!("[Installer] {} override files in {:?}", files.len(), root);
            entries.extend(files);
        }

        progress.phase_started(Phase::Overrides, entries.len());
        for (source, relative) in &entries {
            cancel.check()?;
            progress.item_started(Phase::Overrides, relative.as_str());

            let destination = profile_dir.join(relative);
            self.prepare_destination(&destination).await?;
            tokio::fs::copy(source, &destination).await.at_path(&destination)?;

            progress.item_finished(Phase::Overrides, relative.as_str());
        }

        log::info!("[Installer] Copied {} override files", entries.len());
        Ok(entries.len())
    }

    /// Resolve placeholders and download every client-side file of the index.
    pub async fn install_files(
        &self,
        index: &CanonicalIndex,
        profile_dir: &Path,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> InstallResult<FilesReport> {
        let mut seen_paths = HashSet::new();
        let mut pending = Vec::new();
        for file in &index.files {
            if !file.is_client_supported() {
                log::debug!("[Installer] Skipping server-only file {}", file.display_name());
                continue;
            }
            if let Some(path) = file.relative_path() {
                if !seen_paths.insert(path.to_string()) {
                    log::warn!("[Installer] Duplicate entry for {}, keeping the first", path);
                    continue;
                }
            }
            pending.push(file.clone());
        }

        log::info!(
            "[Installer] Installing {} files ({} to resolve) with {} workers",
            pending.len(),
            index.unresolved_count(),
            self.concurrency
        );
        progress.phase_started(Phase::Files, pending.len());

        let catalog = self.catalogs.for_format(index.source_format);
        let installed = run_bounded(pending, self.concurrency, |file| {
            let catalog = catalog.clone();
            async move {
                self.install_file(file, catalog.as_deref(), profile_dir, progress, cancel)
                    .await
            }
        })
        .await?;

        let mut report = FilesReport::default();
        for entry in installed.into_iter().flatten() {
            if let Some(project) = entry.project_id {
                report.projects.insert(project);
            }
            report.transitive.extend(entry.dependencies);
            report.installed.push(entry.file);
        }
        Ok(report)
    }

    async fn install_file(
        &self,
        file: IndexFile,
        catalog: Option<&dyn ResourceCatalog>,
        profile_dir: &Path,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> InstallResult<Option<InstalledFile>> {
        cancel.check()?;
        let name = file.display_name();
        progress.item_started(Phase::Files, name.as_str());

        let (entry, resolved) = match file.source.clone() {
            FileSource::Resolved(resolved) => {
                let entry = InstalledFile {
                    project_id: project_from_urls(&resolved.download_urls),
                    file,
                    dependencies: Vec::new(),
                };
                (entry, resolved)
            }
            FileSource::Unresolved(hint) => self.resolve_placeholder(file, &hint, catalog).await?,
        };

        if !entry.file.is_client_supported() {
            log::debug!("[Installer] {} is not used by the client, skipping", resolved.relative_path);
            progress.item_finished(Phase::Files, name);
            return Ok(None);
        }

        self.fetch(&resolved, profile_dir, progress, cancel).await?;
        progress.item_finished(Phase::Files, name);
        Ok(Some(entry))
    }

    async fn resolve_placeholder(
        &self,
        file: IndexFile,
        hint: &OriginHint,
        catalog: Option<&dyn ResourceCatalog>,
    ) -> InstallResult<(InstalledFile, ResolvedFile)> {
        let catalog = catalog.ok_or_else(|| InstallError::UnresolvableFile {
            path: file.display_name(),
            reason: "no catalog configured for this manifest format".to_string(),
        })?;

        let version = catalog
            .get_version(&hint.project_id, &hint.file_id)
            .await
            .map_err(|e| {
                InstallError::catalog(
                    format!(
                        "{} file {} of project {}",
                        catalog.name(),
                        hint.file_id,
                        hint.project_id
                    ),
                    e,
                )
            })?;

        let (mut resolved, environment) =
            resolve_artifact(catalog, &version, &file.display_name()).await?;
        if let Some(sha1) = &hint.sha1 {
            resolved
                .hashes
                .entry(HashAlgorithm::Sha1.as_str().to_string())
                .or_insert_with(|| sha1.clone());
        }
        log::debug!(
            "[Installer] Resolved project {} file {} → {}",
            hint.project_id,
            hint.file_id,
            resolved.relative_path
        );

        let entry = InstalledFile {
            file: file.into_resolved(resolved.clone(), environment)?,
            project_id: Some(hint.project_id.clone()),
            dependencies: version.required_dependencies().map(to_project_dependency).collect(),
        };
        Ok((entry, resolved))
    }

    /// Install required dependencies, including the ones discovered while installing them.
    pub async fn install_dependencies(
        &self,
        index: &CanonicalIndex,
        report: &FilesReport,
        profile_dir: &Path,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> InstallResult<usize> {
        let mut seen = report.projects.clone();
        let mut pending = Vec::new();

        let transitive: &[ProjectDependency] = if self.resolve_transitive {
            report.transitive.as_slice()
        } else {
            &[]
        };
        for dependency in index.required_dependencies().chain(transitive.iter()) {
            if claim(&mut seen, dependency) {
                pending.push(dependency.clone());
            } else {
                log::debug!(
                    "[Installer] Dependency {} already satisfied",
                    dependency.display_name()
                );
            }
        }

        progress.phase_started(Phase::Dependencies, pending.len());
        if pending.is_empty() {
            return Ok(0);
        }

        let catalog = self
            .catalogs
            .for_format(index.source_format)
            .ok_or_else(|| InstallError::UnresolvableFile {
                path: pending[0].display_name(),
                reason: "no catalog configured for this manifest format".to_string(),
            })?;

        log::info!("[Installer] Installing {} dependencies", pending.len());
        let mut installed = 0;
        while !pending.is_empty() {
            let round = std::mem::take(&mut pending);
            let results = run_bounded(round, self.concurrency, |dependency| {
                let catalog = catalog.clone();
                async move {
                    self.install_dependency(dependency, catalog, index, profile_dir, progress, cancel)
                        .await
                }
            })
            .await?;

            for entry in results.into_iter().flatten() {
                installed += 1;
                if let Some(project) = entry.project_id {
                    seen.insert(project);
                }
                if self.resolve_transitive {
                    for dependency in entry.dependencies {
                        if claim(&mut seen, &dependency) {
                            pending.push(dependency);
                        }
                    }
                }
            }
            progress.phase_grown(Phase::Dependencies, pending.len());
        }

        Ok(installed)
    }

    async fn install_dependency(
        &self,
        dependency: ProjectDependency,
        catalog: Arc<dyn ResourceCatalog>,
        index: &CanonicalIndex,
        profile_dir: &Path,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> InstallResult<Option<InstalledFile>> {
        cancel.check()?;
        let name = dependency.display_name();
        progress.item_started(Phase::Dependencies, name.as_str());

        let version = match (&dependency.version_id, &dependency.project_id) {
            (Some(version_id), None) if !catalog.resolves_bare_version_ids() => {
                log::warn!(
                    "[Installer] {} cannot look up version {} without its project, skipping",
                    catalog.name(),
                    version_id
                );
                progress.item_finished(Phase::Dependencies, name);
                return Ok(None);
            }
            (Some(version_id), project_id) => catalog
                .get_version(project_id.as_deref().unwrap_or_default(), version_id)
                .await
                .map_err(|e| InstallError::catalog(format!("{} dependency {}", catalog.name(), name), e))?,
            (None, Some(project_id)) => catalog
                .get_versions(project_id, &index.game_version, index.loader_type)
                .await
                .map_err(|e| InstallError::catalog(format!("{} dependency {}", catalog.name(), name), e))?
                .into_iter()
                .next()
                .ok_or_else(|| InstallError::UnresolvableFile {
                    path: name.clone(),
                    reason: format!(
                        "no version for Minecraft {} with {}",
                        index.game_version, index.loader_type
                    ),
                })?,
            (None, None) => return Ok(None),
        };

        let (resolved, environment) = resolve_artifact(catalog.as_ref(), &version, &name).await?;
        let file = IndexFile::resolved(resolved.clone(), environment);
        if !file.is_client_supported() {
            log::debug!("[Installer] Dependency {} is server-only, skipping", name);
            progress.item_finished(Phase::Dependencies, name);
            return Ok(None);
        }

        self.fetch(&resolved, profile_dir, progress, cancel).await?;
        log::debug!("[Installer] Installed dependency {} as {}", name, resolved.relative_path);
        progress.item_finished(Phase::Dependencies, name);

        Ok(Some(InstalledFile {
            file,
            project_id: Some(version.project_id.clone()).filter(|p| !p.is_empty()),
            dependencies: version.required_dependencies().map(to_project_dependency).collect(),
        }))
    }

    async fn fetch(
        &self,
        file: &ResolvedFile,
        profile_dir: &Path,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> InstallResult<DownloadOutcome> {
        let destination = profile_dir.join(&file.relative_path);
        self.prepare_destination(&destination).await?;
        let expected = file.expected_hash();
        let size = Some(file.size).filter(|s| *s > 0);
        self.downloader
            .download(&file.download_urls, &destination, expected.as_ref(), size, progress, cancel)
            .await
    }

    async fn prepare_destination(&self, destination: &Path) -> InstallResult<()> {
        if let Some(journal) = &self.journal {
            return journal.prepare_write(destination).await;
        }
        match destination.parent() {
            Some(parent) => tokio::fs::create_dir_all(parent).await.map_err(|source| {
                InstallError::DirectoryCreationFailed {
                    path: parent.to_path_buf(),
                    source,
                }
            }),
            None => Ok(()),
        }
    }
}

/// Download target for a catalog version: its primary file, placed under the project's role folder.
async fn resolve_artifact(
    catalog: &dyn ResourceCatalog,
    version: &CatalogVersion,
    label: &str,
) -> InstallResult<(ResolvedFile, Option<FileEnvironment>)> {
    let file = version
        .primary_file()
        .ok_or_else(|| InstallError::UnresolvableFile {
            path: label.to_string(),
            reason: format!("version {} lists no files", version.id),
        })?;

    let (role, environment) = match catalog.get_project(&version.project_id).await {
        Ok(project) => (
            project.role,
            Some(FileEnvironment {
                client: project.client,
                server: project.server,
            }),
        ),
        Err(e) => {
            log::warn!(
                "[Installer] Could not fetch project {}, assuming a mod: {:#}",
                version.project_id,
                e
            );
            (ResourceRole::Mod, None)
        }
    };

    let relative_path = validate_relative_path(&format!("{}/{}", role.subfolder(), file.file_name))?;
    Ok((
        ResolvedFile {
            relative_path,
            hashes: file.hashes.clone(),
            download_urls: vec![file.url.clone()],
            size: file.size,
        },
        environment,
    ))
}

fn to_project_dependency(dependency: &CatalogDependency) -> ProjectDependency {
    ProjectDependency {
        project_id: dependency.project_id.clone(),
        version_id: dependency.version_id.clone(),
        requirement: dependency.requirement,
    }
}

/// Marks a dependency as handled. False if it is not installable or was seen before.
fn claim(seen: &mut HashSet<String>, dependency: &ProjectDependency) -> bool {
    if dependency.requirement != DependencyRequirement::Required || !dependency.is_installable() {
        return false;
    }
    let key = match (&dependency.project_id, &dependency.version_id) {
        (Some(project), _) => project.clone(),
        (None, Some(version)) => format!("version:{}", version),
        (None, None) => return false,
    };
    seen.insert(key)
}

/// Modrinth CDN urls embed the project id: `/data/{project}/versions/{version}/{file}`.
fn project_from_urls(urls: &[String]) -> Option<String> {
    urls.iter().find_map(|url| {
        let rest = url.split("/data/").nth(1)?;
        let (project, tail) = rest.split_once('/')?;
        tail.starts_with("versions/").then(|| project.to_string())
    })
}
