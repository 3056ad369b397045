use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{InstallError, InstallResult};

/// Profile directories with an installation in progress, process-wide.
static ACTIVE_PROFILES: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn lock_key(profile_dir: &Path) -> PathBuf {
    if let Ok(canonical) = profile_dir.canonicalize() {
        return canonical;
    }
    // Not created yet: canonicalize the parent instead
    match (profile_dir.parent(), profile_dir.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| profile_dir.to_path_buf()),
        _ => profile_dir.to_path_buf(),
    }
}

/// Exclusive claim on a profile directory, released on drop.
#[derive(Debug)]
pub struct ProfileLock {
    key: PathBuf,
}

impl ProfileLock {
    pub fn acquire(profile_dir: &Path) -> InstallResult<Self> {
        let key = lock_key(profile_dir);
        let mut active = ACTIVE_PROFILES.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(key.clone()) {
            return Err(InstallError::ProfileBusy {
                profile: profile_dir.to_path_buf(),
            });
        }
        Ok(Self { key })
    }
}

impl Drop for ProfileLock {
    fn drop(&mut self) {
        let mut active = ACTIVE_PROFILES.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.key);
    }
}

/// Everything one attempt added to or replaced in the profile.
///
/// Cloned into every install worker. Files are recorded before they are first
/// written, so rollback can delete new paths and put replaced files back.
#[derive(Debug, Clone)]
pub struct InstallJournal {
    state: Arc<Mutex<JournalState>>,
}

#[derive(Debug)]
struct JournalState {
    txn_id: String,
    profile_dir: PathBuf,
    backup_dir: PathBuf,
    /// In creation order, parents first
    created_dirs: Vec<PathBuf>,
    new_files: Vec<PathBuf>,
    /// (destination, saved original)
    replaced: Vec<(PathBuf, PathBuf)>,
    seen: HashSet<PathBuf>,
}

impl InstallJournal {
    fn new(txn_id: &str, profile_dir: &Path, backup_dir: PathBuf) -> Self {
        Self {
            state: Arc::new(Mutex::new(JournalState {
                txn_id: txn_id.to_string(),
                profile_dir: profile_dir.to_path_buf(),
                backup_dir,
                created_dirs: Vec::new(),
                new_files: Vec::new(),
                replaced: Vec::new(),
                seen: HashSet::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JournalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates the parents of `destination` and records the file before it is written.
    pub async fn prepare_write(&self, destination: &Path) -> InstallResult<()> {
        let journal = self.clone();
        let target = destination.to_path_buf();
        tokio::task::spawn_blocking(move || journal.record_write(&target))
            .await
            .map_err(|e| InstallError::io(destination, std::io::Error::other(e.to_string())))?
    }

    fn record_write(&self, destination: &Path) -> InstallResult<()> {
        let mut state = self.lock();
        if let Some(parent) = destination.parent() {
            state.ensure_dir(parent)?;
        }
        if !state.seen.insert(destination.to_path_buf()) {
            return Ok(());
        }
        if destination.is_file() {
            fs::create_dir_all(&state.backup_dir).map_err(|source| InstallError::DirectoryCreationFailed {
                path: state.backup_dir.clone(),
                source,
            })?;
            let backup = state.backup_dir.join(state.replaced.len().to_string());
            fs::copy(destination, &backup).map_err(|e| InstallError::io(destination, e))?;
            log::debug!("[txn:{}] saved {:?} before replacing it", state.txn_id, destination);
            state.replaced.push((destination.to_path_buf(), backup));
        } else {
            state.new_files.push(destination.to_path_buf());
        }
        Ok(())
    }

    fn ensure_dir(&self, dir: &Path) -> InstallResult<()> {
        self.lock().ensure_dir(dir)
    }

    /// Undo in reverse: restore replaced files, drop new files, then new directories.
    /// Every path is attempted; the first error is returned.
    fn undo(&self) -> Option<InstallError> {
        let state = self.lock();
        let mut first_err = None;

        for (destination, backup) in state.replaced.iter().rev() {
            if let Err(e) = fs::copy(backup, destination) {
                log::warn!("[txn:{}] could not restore {:?}: {}", state.txn_id, destination, e);
                first_err.get_or_insert(InstallError::io(destination, e));
            }
        }
        for file in state.new_files.iter().rev() {
            match fs::remove_file(file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::warn!("[txn:{}] could not remove {:?}: {}", state.txn_id, file, e);
                    first_err.get_or_insert(InstallError::io(file, e));
                }
            }
        }
        // Children before parents; a created profile root takes everything with it
        for dir in state.created_dirs.iter().rev() {
            if let Err(e) = remove_dir(dir) {
                log::warn!("[txn:{}] could not remove {:?}: {}", state.txn_id, dir, e);
                first_err.get_or_insert(e);
            }
        }
        first_err
    }
}

impl JournalState {
    /// Creates `dir`, recording each missing level inside the profile. Missing
    /// parents of the profile root are created but not recorded.
    fn ensure_dir(&mut self, dir: &Path) -> InstallResult<()> {
        let mut missing = Vec::new();
        let mut cursor = dir;
        while !cursor.is_dir() && cursor.starts_with(&self.profile_dir) {
            missing.push(cursor.to_path_buf());
            match cursor.parent() {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        if !cursor.is_dir() {
            fs::create_dir_all(cursor).map_err(|source| InstallError::DirectoryCreationFailed {
                path: cursor.to_path_buf(),
                source,
            })?;
        }

        for path in missing.into_iter().rev() {
            match fs::create_dir(&path) {
                Ok(()) => {
                    log::debug!("[txn:{}] created {:?}", self.txn_id, path);
                    self.created_dirs.push(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(source) => return Err(InstallError::DirectoryCreationFailed { path, source }),
            }
        }
        Ok(())
    }
}

/// Tracks what one installation attempt created so a failure can undo it.
///
/// The profile root is only removed on rollback when this attempt created it.
/// Inside a pre-existing profile, new files and directories are removed and
/// replaced files get their original content back.
#[derive(Debug)]
pub struct InstallTransaction {
    id: String,
    profile_dir: PathBuf,
    temp_dir: PathBuf,
    journal: InstallJournal,
    finished: bool,
    _lock: ProfileLock,
}

impl InstallTransaction {
    /// Claims `profile_dir` and creates `<temp_root>/piston-modpack-<uuid>`.
    pub fn begin(profile_dir: &Path, temp_root: &Path) -> InstallResult<Self> {
        let lock = ProfileLock::acquire(profile_dir)?;
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let id = uuid[..8].to_string();
        let temp_dir = temp_root.join(format!("piston-modpack-{}", uuid));

        fs::create_dir_all(&temp_dir).map_err(|source| InstallError::DirectoryCreationFailed {
            path: temp_dir.clone(),
            source,
        })?;

        log::info!("[txn:{}] begin {:?} (temp {:?})", id, profile_dir, temp_dir);
        Ok(Self {
            journal: InstallJournal::new(&id, profile_dir, temp_dir.join("replaced")),
            id,
            profile_dir: profile_dir.to_path_buf(),
            temp_dir,
            finished: false,
            _lock: lock,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn profile_dir(&self) -> &Path {
        &self.profile_dir
    }

    /// Where the archive is unpacked for this attempt
    pub fn extract_dir(&self) -> PathBuf {
        self.temp_dir.join("extracted")
    }

    /// Handle for the workers writing into the profile.
    pub fn journal(&self) -> InstallJournal {
        self.journal.clone()
    }

    /// Creates the profile root and `subdirs`, remembering the ones that did not exist.
    pub fn create_dirs(&mut self, subdirs: &[&str]) -> InstallResult<()> {
        self.journal.ensure_dir(&self.profile_dir)?;
        for sub in subdirs {
            self.journal.ensure_dir(&self.profile_dir.join(sub))?;
        }
        Ok(())
    }

    pub fn checkpoint(&self, label: &str) {
        log::debug!("[txn:{}] checkpoint {}", self.id, label);
    }

    /// Keeps the profile and removes temporaries.
    pub fn commit(mut self) -> InstallResult<()> {
        self.finished = true;
        remove_dir(&self.temp_dir)?;
        log::info!("[txn:{}] commit", self.id);
        Ok(())
    }

    /// Undoes every change recorded in the journal, then removes temporaries.
    /// Best effort: every path is attempted, the first error is returned.
    pub fn rollback(mut self, reason: &str) -> InstallResult<()> {
        self.finished = true;
        log::warn!("[txn:{}] rollback: {}", self.id, reason);

        // Saved originals live in the temp dir
        let mut first_err = self.journal.undo();
        if let Err(e) = remove_dir(&self.temp_dir) {
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for InstallTransaction {
    fn drop(&mut self) {
        if !self.finished {
            log::warn!("[txn:{}] dropped without commit, removing temporaries", self.id);
            let _ = remove_dir(&self.temp_dir);
        }
    }
}

fn remove_dir(dir: &Path) -> InstallResult<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(InstallError::io(dir, e)),
    }
}
