//! Modpack installation pipeline: archive parsing, verified downloads,
//! catalog resolution and loader post-processing for launcher profiles.

pub mod catalog;
pub mod config;
pub mod error;
pub mod installer;
pub mod modpack;
pub mod utils;

// Re-export commonly used types
pub use catalog::{CatalogSet, ResourceCatalog, ResourceRole};
pub use config::InstallerConfig;
pub use error::{InstallError, InstallResult};
pub use installer::{
    CancelToken, InstallCoordinator, InstallOutcome, InstallRequest, InstallState,
    InstalledProfile, ProfileRegistrar, ProgressTracker,
};
pub use modpack::{export_profile, CanonicalIndex, ExportSpec, LoaderType, SourceFormat};
