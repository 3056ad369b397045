use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::catalog::{CatalogSet, ResourceRole};
use crate::config::InstallerConfig;
use crate::error::{InstallError, InstallResult};
use crate::installer::dependencies::DependencyInstaller;
use crate::installer::downloader::VerifiedDownloader;
use crate::installer::processor::{ProcessorContext, ProcessorExecutor};
use crate::installer::profile::LoaderProfileSource;
use crate::installer::progress::{CancelToken, ProgressEvent, ProgressSender};
use crate::installer::transaction::InstallTransaction;
use crate::installer::types::{InstallOutcome, InstallRequest, InstallState, InstallSummary, InstalledProfile};
use crate::modpack::archive::extract_archive_async;
use crate::modpack::parser::parse_index;
use crate::modpack::types::CanonicalIndex;

/// Notified once an installation has completed so the launcher can persist the profile.
#[async_trait]
pub trait ProfileRegistrar: Send + Sync {
    async fn register(&self, profile: &InstalledProfile) -> InstallResult<()>;
}

/// Registrar that only logs. For callers that persist profiles themselves.
pub struct LoggingRegistrar;

#[async_trait]
impl ProfileRegistrar for LoggingRegistrar {
    async fn register(&self, profile: &InstalledProfile) -> InstallResult<()> {
        log::info!(
            "[Coordinator] Installed profile {} ({}) at {:?}",
            profile.name,
            profile.version_id,
            profile.profile_dir
        );
        Ok(())
    }
}

/// Current state plus its observers.
struct StateMachine {
    state: InstallState,
    progress: ProgressSender,
}

impl StateMachine {
    fn new(progress: ProgressSender) -> Self {
        Self {
            state: InstallState::Idle,
            progress,
        }
    }

    fn advance(&mut self, next: InstallState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        log::debug!("[Coordinator] {} → {}", self.state, next);
        self.state = next;
        self.progress.state(next);
    }
}

/// Sequences one modpack installation from archive to registered profile.
pub struct InstallCoordinator {
    config: InstallerConfig,
    catalogs: CatalogSet,
    downloader: VerifiedDownloader,
    processors: ProcessorExecutor,
    registrar: Arc<dyn ProfileRegistrar>,
    loader_profiles: Option<Arc<dyn LoaderProfileSource>>,
}

impl InstallCoordinator {
    pub fn new(
        config: InstallerConfig,
        catalogs: CatalogSet,
        registrar: Arc<dyn ProfileRegistrar>,
    ) -> anyhow::Result<Self> {
        let client = config.http_client()?;
        Ok(Self::with_client(config, client, catalogs, registrar))
    }

    pub fn with_client(
        config: InstallerConfig,
        client: reqwest::Client,
        catalogs: CatalogSet,
        registrar: Arc<dyn ProfileRegistrar>,
    ) -> Self {
        Self {
            downloader: VerifiedDownloader::new(client, &config),
            processors: ProcessorExecutor::new(&config),
            config,
            catalogs,
            registrar,
            loader_profiles: None,
        }
    }

    pub fn with_loader_profiles(mut self, source: Arc<dyn LoaderProfileSource>) -> Self {
        self.loader_profiles = Some(source);
        self
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    pub fn dependency_installer(&self) -> DependencyInstaller {
        DependencyInstaller::new(self.downloader.clone(), self.catalogs.clone(), &self.config)
    }

    /// Install `request.archive` into `request.profile_dir`.
    ///
    /// Failures and cancellation both roll back what this attempt created.
    /// Cancellation is reported as `Ok(InstallOutcome::Cancelled)`.
    pub async fn install(
        &self,
        request: &InstallRequest,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> InstallResult<InstallOutcome> {
        progress.send(ProgressEvent::Reset);
        let mut machine = StateMachine::new(progress.clone());
        let started = Instant::now();
        log::info!(
            "[Coordinator] Installing {:?} into {:?}",
            request.archive,
            request.profile_dir
        );

        let mut txn = match InstallTransaction::begin(&request.profile_dir, &self.config.temp_root()) {
            Ok(txn) => txn,
            Err(e) => {
                log::error!("[Coordinator] Could not start installation: {}", e);
                machine.advance(InstallState::Failed);
                finish(progress, false, Some(e.to_string()));
                return Err(e);
            }
        };

        match self.run(request, &mut txn, &mut machine, progress, cancel).await {
            Ok(profile) => {
                if let Err(e) = txn.commit() {
                    log::warn!("[Coordinator] Could not remove temporary files: {}", e);
                }
                machine.advance(InstallState::Completed);
                log::info!(
                    "[Coordinator] Installed {} {} in {:.1}s ({} overrides, {} files, {} dependencies, {} processors)",
                    profile.pack_name,
                    profile.pack_version,
                    started.elapsed().as_secs_f64(),
                    profile.summary.overrides,
                    profile.summary.files,
                    profile.summary.dependencies,
                    profile.processors_run
                );
                finish(progress, true, None);
                Ok(InstallOutcome::Completed(profile))
            }
            Err(e) if e.is_cancelled() => {
                log::info!("[Coordinator] Installation cancelled during {}", machine.state);
                if let Err(cleanup) = txn.rollback("cancelled") {
                    log::warn!("[Coordinator] Cleanup after cancel incomplete: {}", cleanup);
                }
                machine.advance(InstallState::Cancelled);
                finish(progress, false, Some("Installation cancelled".to_string()));
                Ok(InstallOutcome::Cancelled)
            }
            Err(e) => {
                log::error!("[Coordinator] Installation failed during {}: {}", machine.state, e);
                if let Err(cleanup) = txn.rollback(&e.to_string()) {
                    log::warn!("[Coordinator] Cleanup after failure incomplete: {}", cleanup);
                }
                machine.advance(InstallState::Failed);
                finish(progress, false, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: &InstallRequest,
        txn: &mut InstallTransaction,
        machine: &mut StateMachine,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> InstallResult<InstalledProfile> {
        cancel.check()?;
        machine.advance(InstallState::Extracting);
        let extract_dir = txn.extract_dir();
        let entries = extract_archive_async(request.archive.clone(), extract_dir.clone()).await?;
        txn.checkpoint(&format!("extracted {} entries", entries));

        cancel.check()?;
        machine.advance(InstallState::ParsingManifest);
        let index = parse_index(&extract_dir, &request.archive_stem())?;
        progress.message(format!("{} {}", index.pack_name, index.pack_version));
        log::info!(
            "[Coordinator] {} {} for Minecraft {} with {} {}",
            index.pack_name,
            index.pack_version,
            index.game_version,
            index.loader_type,
            index.loader_version
        );

        cancel.check()?;
        machine.advance(InstallState::CreatingDirectories);
        let mut subdirs: Vec<&str> = ResourceRole::ALL.iter().map(|r| r.subfolder()).collect();
        subdirs.push("config");
        txn.create_dirs(&subdirs)?;

        let installer = self.dependency_installer().with_journal(txn.journal());
        let profile_dir = request.profile_dir.as_path();

        cancel.check()?;
        machine.advance(InstallState::CopyingOverrides);
        let overrides = installer
            .copy_overrides(&extract_dir, &index, profile_dir, progress, cancel)
            .await?;
        txn.checkpoint("overrides");

        cancel.check()?;
        machine.advance(InstallState::InstallingFiles);
        let report = installer.install_files(&index, profile_dir, progress, cancel).await?;
        txn.checkpoint("files");

        cancel.check()?;
        machine.advance(InstallState::InstallingDependencies);
        let dependencies = installer
            .install_dependencies(&index, &report, profile_dir, progress, cancel)
            .await?;
        txn.checkpoint("dependencies");

        cancel.check()?;
        machine.advance(InstallState::RunningProcessors);
        let processors_run = self.run_processors(&index, request, txn, progress, cancel).await?;

        cancel.check()?;
        machine.advance(InstallState::Finalizing);
        let profile = InstalledProfile {
            name: request
                .profile_name
                .clone()
                .unwrap_or_else(|| index.pack_name.clone()),
            profile_dir: request.profile_dir.clone(),
            version_id: index.installed_version_id(),
            game_version: index.game_version.clone(),
            loader_type: index.loader_type,
            loader_version: index.loader_version.clone(),
            pack_name: index.pack_name.clone(),
            pack_version: index.pack_version.clone(),
            recommended_ram_mb: index.recommended_ram_mb,
            summary: InstallSummary {
                overrides,
                files: report.installed.len(),
                dependencies,
            },
            processors_run,
        };
        self.registrar.register(&profile).await?;
        Ok(profile)
    }

    async fn run_processors(
        &self,
        index: &CanonicalIndex,
        request: &InstallRequest,
        txn: &InstallTransaction,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> InstallResult<usize> {
        if !index.loader_type.uses_processors() {
            return Ok(0);
        }
        let Some(source) = &self.loader_profiles else {
            log::info!(
                "[Coordinator] No loader profile source configured, skipping {} processors",
                index.loader_type
            );
            return Ok(0);
        };

        let libraries = &request.libraries_dir;
        tokio::fs::create_dir_all(libraries).await.map_err(|source| {
            InstallError::DirectoryCreationFailed {
                path: libraries.clone(),
                source,
            }
        })?;

        let Some(profile) = source
            .load(
                index.loader_type,
                &index.loader_version,
                &index.game_version,
                libraries,
                txn.temp_dir(),
            )
            .await?
        else {
            return Ok(0);
        };

        let java = request
            .java_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("java"));
        let root = libraries.parent().unwrap_or(libraries.as_path());
        let ctx = ProcessorContext::new(libraries, &index.game_version, java)
            .with_version_name(
                profile
                    .version_name
                    .clone()
                    .unwrap_or_else(|| index.installed_version_id()),
            )
            .with_root(root)
            .with_data(profile.data.clone());

        self.processors
            .execute_all(&profile.processors, &ctx, progress, cancel)
            .await
    }
}

fn finish(progress: &ProgressSender, success: bool, message: Option<String>) {
    progress.send(ProgressEvent::Finished { success, message });
}
