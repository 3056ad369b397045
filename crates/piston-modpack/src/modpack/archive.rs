use std::fs::File;
use std::path::{Component, Path, PathBuf};

use zip::ZipArchive;

use crate::error::{InstallError, InstallResult, IoResultExt};
use crate::modpack::types::{CanonicalIndex, SourceFormat};

/// Alternate spellings of the override folder seen in the wild.
const OVERRIDE_ALIASES: [&str; 3] = ["overrides", "Overrides", "override"];
const OVERRIDE_ALIAS_CAPITALISED: &str = "Override";

/// Extracts a zip archive into `destination`, refusing entries that would escape it.
///
/// Returns the number of files written.
pub fn extract_archive(zip_path: &Path, destination: &Path) -> InstallResult<usize> {
    let file = File::open(zip_path).at_path(zip_path)?;
    let mut archive = ZipArchive::new(file)?;
    log::info!(
        "[Archive] Extracting {:?} ({} entries) to {:?}",
        zip_path,
        archive.len(),
        destination
    );

    let mut written = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().replace('\\', "/");
        let Some(relative) = safe_entry_path(&name) else {
            return Err(InstallError::manifest(format!(
                "archive entry '{}' escapes the extraction directory",
                name
            )));
        };
        let target = destination.join(&relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target).at_path(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).at_path(parent)?;
        }
        let mut outfile = File::create(&target).at_path(&target)?;
        std::io::copy(&mut entry, &mut outfile).at_path(&target)?;
        written += 1;
    }

    log::debug!("[Archive] Extracted {} files", written);
    Ok(written)
}

/// Async wrapper running extraction on the blocking pool.
pub async fn extract_archive_async(zip_path: PathBuf, destination: PathBuf) -> InstallResult<usize> {
    tokio::task::spawn_blocking(move || extract_archive(&zip_path, &destination))
        .await
        .map_err(|e| InstallError::io(PathBuf::new(), std::io::Error::other(e)))?
}

fn safe_entry_path(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Directories whose contents are copied verbatim into the profile, in apply order.
pub fn override_roots(extracted_root: &Path, index: &CanonicalIndex) -> Vec<PathBuf> {
    let pack_root = match &index.root_prefix {
        Some(prefix) => extracted_root.join(prefix.trim_end_matches('/')),
        None => extracted_root.to_path_buf(),
    };

    let mut candidates: Vec<String> = Vec::new();
    match index.source_format {
        SourceFormat::Modrinth => {
            candidates.push("overrides".to_string());
        }
        SourceFormat::CurseForge => {
            candidates.push(index.overrides_dir.clone());
        }
    }
    // Alternately cased folders, only if the declared one is absent
    if !candidates.iter().any(|c| pack_root.join(c).is_dir()) {
        candidates.extend(OVERRIDE_ALIASES.iter().map(|s| s.to_string()));
        candidates.push(OVERRIDE_ALIAS_CAPITALISED.to_string());
    }
    if index.source_format == SourceFormat::Modrinth {
        candidates.push("client-overrides".to_string());
    }

    let mut roots: Vec<PathBuf> = Vec::new();
    for candidate in candidates {
        let dir = pack_root.join(&candidate);
        if dir.is_dir() && !roots.iter().any(|r| same_dir(r, &dir)) {
            roots.push(dir);
        }
    }
    roots
}

// Case-insensitive filesystems resolve "Overrides" and "overrides" to the same folder
fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Every regular file below `root` as `(absolute path, '/'-separated relative path)`.
pub fn list_files(root: &Path) -> InstallResult<Vec<(PathBuf, String)>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).at_path(&dir)? {
            let entry = entry.at_path(&dir)?;
            let path = entry.path();
            let file_type = entry.file_type().at_path(&path)?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .map(|p| {
                        p.components()
                            .map(|c| c.as_os_str().to_string_lossy().to_string())
                            .collect::<Vec<_>>()
                            .join("/")
                    })
                    .unwrap_or_default();
                out.push((path, relative));
            }
        }
    }

    out.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(out)
}
