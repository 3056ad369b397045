use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the modpack installation pipeline.
///
/// Every phase returns `InstallResult<T>`; the coordinator turns the first
/// failure into a single consolidated outcome after cleanup has run.
#[derive(Debug, Error)]
pub enum InstallError {
    // ── Manifest ────────────────────────────────────────
    #[error("Invalid modpack manifest: {reason}")]
    ManifestInvalid { reason: String },

    #[error("No supported modpack manifest (modrinth.index.json or manifest.json) found")]
    UnsupportedFormat,

    // ── Network / integrity ─────────────────────────────
    #[error("{algorithm} mismatch for {path:?}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        path: PathBuf,
        algorithm: String,
        expected: String,
        actual: String,
    },

    #[error("Download failed for {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("Catalog error ({context}): {message}")]
    Catalog { context: String, message: String },

    #[error("Could not resolve {path}: {reason}")]
    UnresolvableFile { path: String, reason: String },

    // ── Processors ──────────────────────────────────────
    #[error("Processor jar {coordinate} not found at {path:?}")]
    ProcessorJarMissing { coordinate: String, path: PathBuf },

    #[error("Main-Class not found in {jar:?}: {reason}")]
    MainClassNotFound { jar: PathBuf, reason: String },

    #[error("Processor {jar} exited with code {exit_code:?}")]
    ProcessorExecutionFailed { jar: String, exit_code: Option<i32> },

    #[error("Invalid Maven coordinate: {0}")]
    InvalidMavenCoordinate(String),

    // ── Filesystem ──────────────────────────────────────
    #[error("Failed to create directory {path:?}: {source}")]
    DirectoryCreationFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Profile {profile:?} is already being installed")]
    ProfileBusy { profile: PathBuf },

    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Zip archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ── Control flow ────────────────────────────────────
    #[error("Installation cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the pipeline.
pub type InstallResult<T> = Result<T, InstallError>;

impl InstallError {
    pub fn manifest(reason: impl Into<String>) -> Self {
        InstallError::ManifestInvalid {
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        InstallError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn download(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        InstallError::DownloadFailed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Wrap an error coming from a catalog adapter. The `{:#}` form keeps the
    /// anyhow context chain in the message.
    pub fn catalog(context: impl Into<String>, err: anyhow::Error) -> Self {
        InstallError::Catalog {
            context: context.into(),
            message: format!("{:#}", err),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, InstallError::Cancelled)
    }
}

impl From<std::io::Error> for InstallError {
    fn from(source: std::io::Error) -> Self {
        InstallError::Io {
            path: PathBuf::new(),
            source,
        }
    }
}

/// Attach a path to an `std::io::Result`, the way `anyhow::Context` would.
pub(crate) trait IoResultExt<T> {
    fn at_path(self, path: &std::path::Path) -> InstallResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at_path(self, path: &std::path::Path) -> InstallResult<T> {
        self.map_err(|e| InstallError::io(path, e))
    }
}
