use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::catalog::ResourceRole;
use crate::installer::identifier::{Identification, ResourceIdentifier};
use crate::modpack::archive::list_files;
use crate::modpack::parser::validate_relative_path;
use crate::modpack::types::{
    CanonicalIndex, CurseForgeFile, CurseForgeManifest, CurseForgeMinecraft, CurseForgeModLoader,
    FileSource, IndexFile, LoaderType, ModrinthEnv, ModrinthFile, ModrinthIndex, SourceFormat,
    CURSEFORGE_MANIFEST_FILE, MODRINTH_INDEX_FILE,
};

const OVERRIDES_DIR: &str = "overrides";
const CURSEFORGE_CATALOG: &str = "curseforge";

/// Pack metadata written into the exported index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSpec {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    pub game_version: String,
    pub loader_type: LoaderType,
    pub loader_version: String,
    /// Profile-relative files or folders bundled verbatim, e.g. `config`
    #[serde(default)]
    pub extra_paths: Vec<String>,
}

impl ExportSpec {
    /// Metadata of the pack a profile was installed from.
    pub fn from_index(index: &CanonicalIndex) -> Self {
        Self {
            name: index.pack_name.clone(),
            version: index.pack_version.clone(),
            author: index.author.clone(),
            summary: index.summary.clone(),
            game_version: index.game_version.clone(),
            loader_type: index.loader_type,
            loader_version: index.loader_version.clone(),
            extra_paths: Vec::new(),
        }
    }

    pub fn with_extra_path(mut self, path: impl Into<String>) -> Self {
        self.extra_paths.push(path.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportReport {
    /// Files referenced from the index
    pub linked: usize,
    /// Files copied under `overrides/`
    pub overrides: usize,
}

/// What goes into the archive, decided before anything is written.
#[derive(Default)]
struct ExportPlan {
    linked: Vec<LinkedFile>,
    overrides: Vec<(PathBuf, String)>,
}

struct LinkedFile {
    path: PathBuf,
    file: IndexFile,
    catalog: String,
    project_id: String,
    version_id: String,
}

/// Writes the content of `profile_dir` as a modpack archive at `output`.
///
/// Files under the role folders that a catalog recognises are referenced from the index,
/// everything else is stored under `overrides/` at the same relative path.
pub async fn export_profile(
    profile_dir: &Path,
    spec: ExportSpec,
    output: &Path,
    format: SourceFormat,
    identifier: &ResourceIdentifier,
) -> Result<ExportReport> {
    log::info!(
        "[Exporter] Exporting {:?} as {:?} to {:?}",
        profile_dir,
        format,
        output
    );
    let mut plan = ExportPlan::default();

    for role in ResourceRole::ALL {
        let folder = profile_dir.join(role.subfolder());
        if !folder.is_dir() {
            continue;
        }
        for (path, relative) in list_files(&folder)? {
            let relative = format!("{}/{}", role.subfolder(), relative);
            let identification = identifier
                .identify(&path, role)
                .await
                .with_context(|| format!("Failed to identify {}", relative))?;

            match identification {
                Identification::Known(known) => {
                    let mut file = known.file;
                    // Keep the file where it is, not where the catalog would put it
                    if let FileSource::Resolved(resolved) = &mut file.source {
                        resolved.relative_path = relative.clone();
                    }
                    plan.linked.push(LinkedFile {
                        path,
                        file,
                        catalog: known.catalog,
                        project_id: known.project_id,
                        version_id: known.version_id,
                    });
                }
                Identification::Unrecognized => plan.overrides.push((path, relative)),
            }
        }
    }

    for extra in &spec.extra_paths {
        let relative = validate_relative_path(extra)?;
        let path = profile_dir.join(&relative);
        if path.is_file() {
            plan.overrides.push((path, relative));
        } else if path.is_dir() {
            for (file, nested) in list_files(&path)? {
                plan.overrides.push((file, format!("{}/{}", relative, nested)));
            }
        } else {
            log::warn!("[Exporter] Extra path {} does not exist, skipping", relative);
        }
    }

    let output = output.to_path_buf();
    let report = tokio::task::spawn_blocking(move || write_archive(&output, &spec, plan, format))
        .await
        .context("Export task panicked")??;

    log::info!(
        "[Exporter] Wrote {} linked files and {} overrides",
        report.linked,
        report.overrides
    );
    Ok(report)
}

fn write_archive(
    output: &Path,
    spec: &ExportSpec,
    mut plan: ExportPlan,
    format: SourceFormat,
) -> Result<ExportReport> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let file = File::create(output).with_context(|| format!("Failed to create {:?}", output))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let (index_name, index_json, linked) = match format {
        SourceFormat::Modrinth => {
            let linked = plan.linked.len();
            let index = modrinth_index(spec, plan.linked);
            (MODRINTH_INDEX_FILE, serde_json::to_string_pretty(&index)?, linked)
        }
        SourceFormat::CurseForge => {
            let (files, unlinked) = curseforge_files(plan.linked);
            plan.overrides.extend(unlinked);
            let linked = files.len();
            let manifest = curseforge_manifest(spec, files);
            (CURSEFORGE_MANIFEST_FILE, serde_json::to_string_pretty(&manifest)?, linked)
        }
    };

    zip.start_file(index_name, options)?;
    zip.write_all(index_json.as_bytes())?;

    plan.overrides.sort_by(|a, b| a.1.cmp(&b.1));
    plan.overrides.dedup_by(|a, b| a.1 == b.1);
    for (path, relative) in &plan.overrides {
        add_override(&mut zip, options, path, relative)?;
    }
    zip.finish()?;

    Ok(ExportReport {
        linked,
        overrides: plan.overrides.len(),
    })
}

fn modrinth_index(spec: &ExportSpec, linked: Vec<LinkedFile>) -> ModrinthIndex {
    let mut dependencies = BTreeMap::from([("minecraft".to_string(), spec.game_version.clone())]);
    if let Some(key) = spec.loader_type.modrinth_dependency_key() {
        dependencies.insert(key.to_string(), spec.loader_version.clone());
    }

    let files = linked
        .into_iter()
        .filter_map(|l| {
            let env = l.file.environment.map(|env| ModrinthEnv {
                client: env.client.as_str().to_string(),
                server: env.server.as_str().to_string(),
            });
            match l.file.source {
                FileSource::Resolved(resolved) => Some(ModrinthFile {
                    path: resolved.relative_path,
                    hashes: resolved.hashes,
                    env,
                    downloads: resolved.download_urls,
                    file_size: resolved.size,
                }),
                FileSource::Unresolved(_) => None,
            }
        })
        .collect();

    ModrinthIndex {
        format_version: 1,
        game: "minecraft".to_string(),
        version_id: spec.version.clone(),
        name: spec.name.clone(),
        summary: spec.summary.clone(),
        files,
        dependencies,
    }
}

/// CurseForge manifests can only reference numeric CurseForge ids; anything else
/// is returned for bundling as an override.
fn curseforge_files(linked: Vec<LinkedFile>) -> (Vec<CurseForgeFile>, Vec<(PathBuf, String)>) {
    let mut files = Vec::new();
    let mut unlinked = Vec::new();

    for l in linked {
        let ids = (l.catalog == CURSEFORGE_CATALOG)
            .then(|| (l.project_id.parse::<u32>().ok(), l.version_id.parse::<u32>().ok()));
        match ids {
            Some((Some(project_id), Some(file_id))) => files.push(CurseForgeFile {
                project_id: Some(project_id),
                file_id: Some(file_id),
                required: true,
                hashes: None,
            }),
            _ => {
                if let FileSource::Resolved(resolved) = l.file.source {
                    log::debug!(
                        "[Exporter] {} has no CurseForge ids, bundling as override",
                        resolved.relative_path
                    );
                    unlinked.push((l.path, resolved.relative_path));
                }
            }
        }
    }
    (files, unlinked)
}

fn curseforge_manifest(spec: &ExportSpec, files: Vec<CurseForgeFile>) -> CurseForgeManifest {
    let mod_loaders = match spec.loader_type {
        LoaderType::Vanilla => Vec::new(),
        loader => vec![CurseForgeModLoader {
            id: format!("{}-{}", loader.as_str(), spec.loader_version),
            primary: true,
        }],
    };

    CurseForgeManifest {
        minecraft: CurseForgeMinecraft {
            version: spec.game_version.clone(),
            mod_loaders,
            recommended_ram: None,
        },
        manifest_type: "minecraftModpack".to_string(),
        manifest_version: 1,
        name: spec.name.clone(),
        version: Some(spec.version.clone()),
        author: spec.author.clone(),
        files,
        overrides: OVERRIDES_DIR.to_string(),
    }
}

fn add_override<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    options: SimpleFileOptions,
    path: &Path,
    relative: &str,
) -> Result<()> {
    zip.start_file(format!("{}/{}", OVERRIDES_DIR, relative), options)?;
    let mut file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    std::io::copy(&mut file, zip).with_context(|| format!("Failed to add {}", relative))?;
    Ok(())
}
