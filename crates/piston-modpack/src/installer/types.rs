use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::modpack::types::LoaderType;

/// Progress reporter trait for installer operations
/// Implementations forward updates to the UI/notification system
pub trait ProgressReporter: Send + Sync {
    /// Start a new step with optional total steps
    fn start_step(&self, name: &str, total_steps: Option<u32>);

    /// Update bytes transferred for download progress
    fn update_bytes(&self, transferred: u64, total: Option<u64>);

    /// Set a short status message
    fn set_message(&self, message: &str);

    /// Set a numeric step count for the current step (e.g. "3/12").
    /// `total` may be None when unknown.
    fn set_step_count(&self, current: u32, total: Option<u32>);

    /// Mark operation as complete
    fn done(&self, success: bool, message: Option<&str>);
}

/// A progress reporter that does nothing (silent).
/// Useful for background verification or tests.
pub struct SilentProgressReporter;

impl ProgressReporter for SilentProgressReporter {
    fn start_step(&self, _name: &str, _total_steps: Option<u32>) {}
    fn update_bytes(&self, _transferred: u64, _total: Option<u64>) {}
    fn set_message(&self, _message: &str) {}
    fn set_step_count(&self, _current: u32, _total: Option<u32>) {}
    fn done(&self, _success: bool, _message: Option<&str>) {}
}

/// Installation state machine. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum InstallState {
    #[default]
    Idle,
    Extracting,
    ParsingManifest,
    CreatingDirectories,
    CopyingOverrides,
    InstallingFiles,
    InstallingDependencies,
    RunningProcessors,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl InstallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstallState::Completed | InstallState::Failed | InstallState::Cancelled
        )
    }

    /// Forward-only: any later working state, or a terminal one from a non-terminal state.
    pub fn can_transition_to(&self, next: InstallState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            InstallState::Failed | InstallState::Cancelled => true,
            InstallState::Completed => *self == InstallState::Finalizing,
            other => other > *self,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            InstallState::Idle => "Idle",
            InstallState::Extracting => "Extracting archive",
            InstallState::ParsingManifest => "Reading manifest",
            InstallState::CreatingDirectories => "Creating directories",
            InstallState::CopyingOverrides => "Copying overrides",
            InstallState::InstallingFiles => "Installing files",
            InstallState::InstallingDependencies => "Installing dependencies",
            InstallState::RunningProcessors => "Running processors",
            InstallState::Finalizing => "Finalizing",
            InstallState::Completed => "Completed",
            InstallState::Failed => "Failed",
            InstallState::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for InstallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Installation request for one modpack archive
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// Modpack archive (.mrpack or CurseForge .zip)
    pub archive: PathBuf,

    /// Profile root the pack is installed into
    pub profile_dir: PathBuf,

    /// Shared libraries root used by loader processors
    pub libraries_dir: PathBuf,

    /// Java executable for processors (required for forge/neoforge packs)
    pub java_path: Option<PathBuf>,

    /// Display name; defaults to the pack name
    pub profile_name: Option<String>,
}

impl InstallRequest {
    pub fn new(archive: impl Into<PathBuf>, profile_dir: impl Into<PathBuf>) -> Self {
        let profile_dir = profile_dir.into();
        Self {
            archive: archive.into(),
            libraries_dir: profile_dir.join("libraries"),
            profile_dir,
            java_path: None,
            profile_name: None,
        }
    }

    pub fn with_libraries_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.libraries_dir = dir.into();
        self
    }

    pub fn with_java(mut self, java: impl Into<PathBuf>) -> Self {
        self.java_path = Some(java.into());
        self
    }

    pub fn with_profile_name(mut self, name: impl Into<String>) -> Self {
        self.profile_name = Some(name.into());
        self
    }

    /// Archive file name without extension
    pub fn archive_stem(&self) -> String {
        self.archive
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "Modpack".to_string())
    }
}

/// Items processed per install phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSummary {
    pub overrides: usize,
    pub files: usize,
    pub dependencies: usize,
}

/// Result of a completed installation, handed to the profile registrar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledProfile {
    pub name: String,
    pub profile_dir: PathBuf,
    /// e.g. "forge-loader-47.2.0-1.20.1"
    pub version_id: String,
    pub game_version: String,
    pub loader_type: LoaderType,
    pub loader_version: String,
    pub pack_name: String,
    pub pack_version: String,
    pub recommended_ram_mb: Option<u32>,
    pub summary: InstallSummary,
    pub processors_run: usize,
}

/// Terminal outcome of `InstallCoordinator::install`. Failures are `Err(InstallError)`.
#[derive(Debug, Clone)]
pub enum InstallOutcome {
    Completed(InstalledProfile),
    Cancelled,
}

impl InstallOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, InstallOutcome::Completed(_))
    }
}
