use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use zip::ZipArchive;

use crate::error::{InstallError, InstallResult, IoResultExt};
use crate::modpack::types::{
    estimate_recommended_ram, CanonicalIndex, CurseForgeManifest, DependencyRequirement,
    EnvRequirement, FileEnvironment, IndexFile, LoaderType, ModrinthIndex, OriginHint,
    ProjectDependency, ResolvedFile, SourceFormat, CURSEFORGE_MANIFEST_FILE, MODRINTH_INDEX_FILE,
};

const CURSEFORGE_SHA1_ALGO: u32 = 1;
const UNKNOWN_LOADER_VERSION: &str = "unknown";

/// Outcome of reading one candidate index file.
enum Candidate<T> {
    Absent,
    Parsed(T),
    Broken(String),
}

/// Parses the modpack index of an extracted archive.
///
/// `root` is the extraction directory. The index may sit at the root or inside a
/// single top-level folder. `fallback_name` is used when the manifest carries no name.
pub fn parse_index(root: &Path, fallback_name: &str) -> InstallResult<CanonicalIndex> {
    parse_index_on(root, fallback_name, Local::now().date_naive())
}

pub(crate) fn parse_index_on(
    root: &Path,
    fallback_name: &str,
    today: NaiveDate,
) -> InstallResult<CanonicalIndex> {
    let (pack_root, prefix) = locate_pack_root(root)?;
    log::info!("[ManifestParser] Reading index from {:?} (prefix: {:?})", pack_root, prefix);

    let modrinth = read_candidate(&pack_root.join(MODRINTH_INDEX_FILE))?;
    let curseforge = read_candidate(&pack_root.join(CURSEFORGE_MANIFEST_FILE))?;

    let mut index = select_index(modrinth, curseforge, fallback_name, today)?;
    index.root_prefix = prefix;
    Ok(index)
}

/// Reads the index straight from a zip without extracting it, for previews.
pub fn read_archive_metadata<P: AsRef<Path>>(zip_path: P) -> InstallResult<CanonicalIndex> {
    let zip_path = zip_path.as_ref();
    log::info!("[ManifestParser] Opening ZIP: {:?}", zip_path);

    let file = File::open(zip_path).at_path(zip_path)?;
    let mut archive = ZipArchive::new(file)?;

    let mut modrinth: (Option<String>, Candidate<String>) = (None, Candidate::Absent);
    let mut curseforge: (Option<String>, Candidate<String>) = (None, Candidate::Absent);

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().replace('\\', "/");
        let Some((prefix, file_name)) = split_index_entry(&name) else {
            continue;
        };

        let slot = match file_name {
            MODRINTH_INDEX_FILE => &mut modrinth,
            CURSEFORGE_MANIFEST_FILE => &mut curseforge,
            _ => continue,
        };
        // Root-level entries win over nested ones
        if matches!(slot.1, Candidate::Parsed(_)) && prefix.is_some() {
            continue;
        }

        let mut content = String::new();
        entry.read_to_string(&mut content).map_err(|e| {
            InstallError::manifest(format!("failed to read {}: {}", name, e))
        })?;
        log::debug!(
            "[ManifestParser] {} content (first 100 chars): {}",
            name,
            &content.chars().take(100).collect::<String>()
        );
        *slot = (prefix, Candidate::Parsed(content));
    }

    let fallback_name = zip_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Modpack".to_string());

    let (modrinth_prefix, modrinth_content) = modrinth;
    let (curseforge_prefix, curseforge_content) = curseforge;
    let mut index = select_index(
        decode_candidate(MODRINTH_INDEX_FILE, modrinth_content),
        decode_candidate(CURSEFORGE_MANIFEST_FILE, curseforge_content),
        &fallback_name,
        Local::now().date_naive(),
    )?;
    index.root_prefix = match index.source_format {
        SourceFormat::Modrinth => modrinth_prefix,
        SourceFormat::CurseForge => curseforge_prefix,
    };
    Ok(index)
}

fn select_index(
    modrinth: Candidate<ModrinthIndex>,
    curseforge: Candidate<CurseForgeManifest>,
    fallback_name: &str,
    today: NaiveDate,
) -> InstallResult<CanonicalIndex> {
    let mut last_error: Option<String> = None;

    match modrinth {
        Candidate::Parsed(raw) => {
            log::info!("[ManifestParser] Using Modrinth index ({} v{})", raw.name, raw.version_id);
            return from_modrinth(raw);
        }
        Candidate::Broken(e) => {
            log::warn!("[ManifestParser] {}", e);
            last_error = Some(e);
        }
        Candidate::Absent => {}
    }

    match curseforge {
        Candidate::Parsed(raw) => {
            log::info!("[ManifestParser] Using CurseForge manifest ({})", raw.name);
            return from_curseforge(raw, fallback_name, today);
        }
        Candidate::Broken(e) => {
            log::warn!("[ManifestParser] {}", e);
            last_error = Some(e);
        }
        Candidate::Absent => {}
    }

    match last_error {
        Some(e) => Err(InstallError::manifest(e)),
        None => {
            log::error!("[ManifestParser] No modpack index found");
            Err(InstallError::UnsupportedFormat)
        }
    }
}

/// Finds the directory that holds the index: the root itself, or a single nested folder.
fn locate_pack_root(root: &Path) -> InstallResult<(PathBuf, Option<String>)> {
    if has_index_file(root) {
        return Ok((root.to_path_buf(), None));
    }

    let mut nested: Vec<PathBuf> = std::fs::read_dir(root)
        .at_path(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && has_index_file(p))
        .collect();
    nested.sort();

    match nested.into_iter().next() {
        Some(dir) => {
            let prefix = dir
                .file_name()
                .map(|n| format!("{}/", n.to_string_lossy()));
            Ok((dir, prefix))
        }
        None => Ok((root.to_path_buf(), None)),
    }
}

fn has_index_file(dir: &Path) -> bool {
    dir.join(MODRINTH_INDEX_FILE).is_file() || dir.join(CURSEFORGE_MANIFEST_FILE).is_file()
}

/// `"pack/manifest.json"` → `(Some("pack/"), "manifest.json")`. Deeper nesting is ignored.
fn split_index_entry(name: &str) -> Option<(Option<String>, &str)> {
    match name.split_once('/') {
        None => Some((None, name)),
        Some((folder, rest)) if !rest.contains('/') && !folder.is_empty() => {
            Some((Some(format!("{}/", folder)), rest))
        }
        _ => None,
    }
}

fn read_candidate<T: serde::de::DeserializeOwned>(path: &Path) -> InstallResult<Candidate<T>> {
    if !path.is_file() {
        return Ok(Candidate::Absent);
    }
    let content = std::fs::read_to_string(path).at_path(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(decode_candidate(&name, Candidate::Parsed(content)))
}

fn decode_candidate<T: serde::de::DeserializeOwned>(
    name: &str,
    content: Candidate<String>,
) -> Candidate<T> {
    match content {
        Candidate::Absent => Candidate::Absent,
        Candidate::Broken(e) => Candidate::Broken(e),
        Candidate::Parsed(text) if text.trim().is_empty() => {
            Candidate::Broken(format!("{} is empty", name))
        }
        Candidate::Parsed(text) => match serde_json::from_str::<T>(&text) {
            Ok(v) => Candidate::Parsed(v),
            Err(e) => Candidate::Broken(format!("found {} but failed to parse: {}", name, e)),
        },
    }
}

pub fn from_modrinth(index: ModrinthIndex) -> InstallResult<CanonicalIndex> {
    if index.game != "minecraft" {
        log::warn!("[ManifestParser] Unexpected game id '{}'", index.game);
    }

    let game_version = index
        .dependencies
        .get("minecraft")
        .cloned()
        .ok_or_else(|| InstallError::manifest("modrinth.index.json has no minecraft dependency"))?;

    // Detect modloader
    let (loader_type, loader_version) = [
        LoaderType::Fabric,
        LoaderType::Forge,
        LoaderType::NeoForge,
        LoaderType::Quilt,
    ]
    .into_iter()
    .find_map(|loader| {
        loader
            .modrinth_dependency_key()
            .and_then(|key| index.dependencies.get(key))
            .map(|v| (loader, v.clone()))
    })
    .unwrap_or((LoaderType::Vanilla, UNKNOWN_LOADER_VERSION.to_string()));

    let recommended_ram_mb = Some(estimate_recommended_ram(index.files.len()));

    let mut files = Vec::with_capacity(index.files.len());
    for f in index.files {
        let relative_path = validate_relative_path(&f.path)?;
        if f.downloads.is_empty() {
            return Err(InstallError::manifest(format!(
                "file {} has no download URLs",
                relative_path
            )));
        }
        let file = IndexFile::resolved(
            ResolvedFile {
                relative_path,
                hashes: f.hashes,
                download_urls: f.downloads,
                size: f.file_size,
            },
            f.env.map(|env| FileEnvironment {
                client: EnvRequirement::from_catalog(&env.client),
                server: EnvRequirement::from_catalog(&env.server),
            }),
        );
        if !file.has_identifying_key() {
            return Err(InstallError::manifest(format!(
                "file {} carries no hash",
                file.display_name()
            )));
        }
        files.push(file);
    }

    Ok(CanonicalIndex {
        game_version,
        loader_type,
        loader_version,
        pack_name: index.name,
        pack_version: index.version_id,
        auto_versioned: false,
        summary: index.summary,
        author: None,
        recommended_ram_mb,
        files,
        dependencies: Vec::new(),
        source_format: SourceFormat::Modrinth,
        overrides_dir: "overrides".to_string(),
        root_prefix: None,
    })
}

pub fn from_curseforge(
    manifest: CurseForgeManifest,
    fallback_name: &str,
    today: NaiveDate,
) -> InstallResult<CanonicalIndex> {
    let game_version = manifest.minecraft.version.trim().to_string();
    if game_version.is_empty() {
        return Err(InstallError::manifest("manifest.json has an empty minecraft.version"));
    }

    // Primary modloader, or the first one listed
    let (loader_type, loader_version) = manifest
        .minecraft
        .mod_loaders
        .iter()
        .find(|l| l.primary)
        .or_else(|| manifest.minecraft.mod_loaders.first())
        .map(|l| detect_loader(&l.id))
        .unwrap_or((LoaderType::Vanilla, UNKNOWN_LOADER_VERSION.to_string()));

    let (pack_version, auto_versioned) = match manifest.version.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => (v.to_string(), false),
        _ => {
            let synthesized = synthesize_pack_version(&game_version, loader_type, today);
            log::info!("[ManifestParser] No pack version, using {}", synthesized);
            (synthesized, true)
        }
    };

    let pack_name = if manifest.name.trim().is_empty() {
        fallback_name.to_string()
    } else {
        manifest.name
    };

    let recommended_ram_mb = manifest
        .minecraft
        .recommended_ram
        .or_else(|| Some(estimate_recommended_ram(manifest.files.len())));

    let mut files = Vec::new();
    let mut dependencies = Vec::new();
    for (i, f) in manifest.files.into_iter().enumerate() {
        let (Some(project_id), Some(file_id)) = (f.project_id, f.file_id) else {
            return Err(InstallError::manifest(format!(
                "files[{}] has no projectID/fileID",
                i
            )));
        };

        if !f.required {
            dependencies.push(ProjectDependency {
                project_id: Some(project_id.to_string()),
                version_id: Some(file_id.to_string()),
                requirement: DependencyRequirement::Optional,
            });
            continue;
        }

        let sha1 = f.hashes.as_ref().and_then(|list| {
            list.iter()
                .find(|h| h.algo == CURSEFORGE_SHA1_ALGO)
                .map(|h| h.value.clone())
        });

        files.push(IndexFile::unresolved(OriginHint {
            project_id: project_id.to_string(),
            file_id: file_id.to_string(),
            sha1,
        }));
    }

    let overrides_dir = validate_relative_path(&manifest.overrides)
        .unwrap_or_else(|_| "overrides".to_string());

    Ok(CanonicalIndex {
        game_version,
        loader_type,
        loader_version,
        pack_name,
        pack_version,
        auto_versioned,
        summary: None,
        author: manifest.author.filter(|a| !a.trim().is_empty()),
        recommended_ram_mb,
        files,
        dependencies,
        source_format: SourceFormat::CurseForge,
        overrides_dir,
        root_prefix: None,
    })
}

/// Resolves a CurseForge modloader id such as `"forge-47.2.0"` into a loader and version.
pub fn detect_loader(id: &str) -> (LoaderType, String) {
    let id = id.trim();
    let lower = id.to_lowercase();

    for (prefix, loader) in [
        ("fabric-loader-", LoaderType::Fabric),
        ("quilt-loader-", LoaderType::Quilt),
        ("neoforge-", LoaderType::NeoForge),
        ("forge-", LoaderType::Forge),
        ("fabric-", LoaderType::Fabric),
        ("quilt-", LoaderType::Quilt),
    ] {
        if let Some(version) = lower.strip_prefix(prefix) {
            if !version.is_empty() {
                return (loader, id.get(prefix.len()..).unwrap_or(version).to_string());
            }
        }
    }

    if let Some((kind, version)) = id.split_once('-') {
        if let Ok(loader) = kind.parse::<LoaderType>() {
            return (loader, version.to_string());
        }
    }

    // No usable separator: substring match, most specific name first
    let by_substring = [
        ("neoforge", LoaderType::NeoForge),
        ("forge", LoaderType::Forge),
        ("fabric", LoaderType::Fabric),
        ("quilt", LoaderType::Quilt),
    ]
    .into_iter()
    .find(|(name, _)| lower.contains(name))
    .map(|(_, loader)| loader);

    match by_substring {
        Some(loader) => (loader, UNKNOWN_LOADER_VERSION.to_string()),
        None => {
            log::warn!("[ManifestParser] Unrecognised modloader id '{}', assuming vanilla", id);
            (LoaderType::Vanilla, UNKNOWN_LOADER_VERSION.to_string())
        }
    }
}

/// `{gameVersion}-{loaderType}-{YYYYMMDD}`
pub fn synthesize_pack_version(game_version: &str, loader: LoaderType, date: NaiveDate) -> String {
    format!("{}-{}-{}", game_version, loader.as_str(), date.format("%Y%m%d"))
}

/// Normalizes a manifest path and rejects anything that could escape the profile.
pub fn validate_relative_path(path: &str) -> InstallResult<String> {
    let normalized = path.trim().replace('\\', "/");
    let escapes = normalized.is_empty()
        || normalized.starts_with('/')
        || normalized.chars().nth(1) == Some(':')
        || normalized.split('/').any(|segment| segment == "..");
    if escapes {
        return Err(InstallError::manifest(format!("unsafe file path '{}'", path)));
    }
    Ok(normalized.trim_start_matches("./").to_string())
}
