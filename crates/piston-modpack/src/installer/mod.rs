pub mod coordinator;
pub mod dependencies;
pub mod downloader;
pub mod identifier;
pub mod processor;
pub mod profile;
pub mod progress;
pub mod transaction;
pub mod types;

pub use coordinator::{InstallCoordinator, LoggingRegistrar, ProfileRegistrar};
pub use dependencies::DependencyInstaller;
pub use downloader::{DownloadOutcome, VerifiedDownloader};
pub use identifier::{Identification, KnownArtifact, ResourceIdentifier};
pub use processor::{Processor, ProcessorContext, ProcessorExecutor};
pub use profile::{InstallerJarProfileSource, LoaderProfile, LoaderProfileSource};
pub use progress::{CancelToken, InstallProgress, Phase, ProgressEvent, ProgressSender, ProgressTracker};
pub use transaction::{InstallJournal, InstallTransaction};
pub use types::{
    InstallOutcome, InstallRequest, InstallState, InstallSummary, InstalledProfile,
    ProgressReporter, SilentProgressReporter,
};
