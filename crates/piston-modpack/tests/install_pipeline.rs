use async_trait::async_trait;
use piston_modpack::catalog::{CatalogFile, CatalogProject, CatalogVersion, InMemoryCatalog};
use piston_modpack::installer::{
    InstallTransaction, LoaderProfile, LoaderProfileSource, ResourceIdentifier,
};
use piston_modpack::modpack::{read_archive_metadata, FileSource, IndexFile};
use piston_modpack::utils::hash::{HashAlgorithm, StreamingHasher};
use piston_modpack::{
    export_profile, CancelToken, CatalogSet, ExportSpec, InstallCoordinator, InstallError,
    InstallOutcome, InstallRequest, InstallResult, InstallState, InstalledProfile, InstallerConfig,
    LoaderType, ProfileRegistrar, ProgressTracker, ResourceCatalog, ResourceRole, SourceFormat,
};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;

const MOD_BODY: &[u8] = b"fake sodium jar contents";
const CF_BODY: &[u8] = b"fake jei jar contents";

#[derive(Default)]
struct RecordingRegistrar {
    profiles: Mutex<Vec<InstalledProfile>>,
}

#[async_trait]
impl ProfileRegistrar for RecordingRegistrar {
    async fn register(&self, profile: &InstalledProfile) -> InstallResult<()> {
        self.profiles.lock().unwrap().push(profile.clone());
        Ok(())
    }
}

/// Hands out an empty processor list and remembers what it was asked for.
#[derive(Default)]
struct StubProfileSource {
    requests: Mutex<Vec<(LoaderType, String, PathBuf)>>,
}

#[async_trait]
impl LoaderProfileSource for StubProfileSource {
    async fn load(
        &self,
        loader: LoaderType,
        loader_version: &str,
        _game_version: &str,
        libraries_dir: &Path,
        _work_dir: &Path,
    ) -> InstallResult<Option<LoaderProfile>> {
        self.requests
            .lock()
            .unwrap()
            .push((loader, loader_version.to_string(), libraries_dir.to_path_buf()));
        Ok(Some(LoaderProfile::default()))
    }
}

struct Fixture {
    dir: TempDir,
    server: MockServer,
    registrar: Arc<RecordingRegistrar>,
}

impl Fixture {
    async fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            dir: TempDir::new().unwrap(),
            server: MockServer::start().await,
            registrar: Arc::new(RecordingRegistrar::default()),
        }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    fn config(&self) -> InstallerConfig {
        InstallerConfig {
            max_retries: 1,
            retry_delay_ms: 0,
            concurrency: 4,
            temp_root: Some(self.path("tmp")),
            ..InstallerConfig::default()
        }
    }

    fn coordinator(&self, catalogs: CatalogSet) -> InstallCoordinator {
        InstallCoordinator::with_client(
            self.config(),
            reqwest::Client::new(),
            catalogs,
            self.registrar.clone(),
        )
    }

    async fn serve(&self, route: &str, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(&self.server)
            .await;
    }

    fn url(&self, route: &str) -> String {
        format!("{}{}", self.server.uri(), route)
    }

    fn temp_is_empty(&self) -> bool {
        match std::fs::read_dir(self.path("tmp")) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }
}

fn sha1_of(bytes: &[u8]) -> String {
    let mut hasher = StreamingHasher::new(HashAlgorithm::Sha1);
    hasher.update(bytes);
    hasher.finalize_hex()
}

fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let mut zip = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
    for (name, data) in entries {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

fn modrinth_pack(archive: &Path, mod_url: &str, loader: (&str, &str)) {
    let mut index = serde_json::json!({
        "formatVersion": 1,
        "game": "minecraft",
        "versionId": "1.0.0",
        "name": "Example Pack",
        "dependencies": { "minecraft": "1.20.1" },
        "files": [{
            "path": "mods/sodium.jar",
            "hashes": { "sha1": sha1_of(MOD_BODY) },
            "downloads": [mod_url],
            "fileSize": MOD_BODY.len(),
            "env": { "client": "required", "server": "optional" }
        }]
    });
    index["dependencies"][loader.0] = serde_json::json!(loader.1);
    let index = index.to_string();
    write_zip(
        archive,
        &[
            ("modrinth.index.json", index.as_bytes()),
            ("overrides/config/sodium.toml", b"quality = \"low\""),
            ("client-overrides/config/sodium.toml", b"quality = \"high\""),
            ("overrides/options.txt", b"fov:70"),
        ],
    );
}

fn curseforge_pack(archive: &Path) {
    let manifest = serde_json::json!({
        "minecraft": {
            "version": "1.20.1",
            "modLoaders": [{ "id": "forge-47.2.0", "primary": true }]
        },
        "manifestType": "minecraftModpack",
        "manifestVersion": 1,
        "name": "Forge Pack",
        "version": "3.1",
        "author": "packdev",
        "files": [
            { "projectID": 238222, "fileID": 4712345, "required": true },
            { "projectID": 999, "fileID": 1, "required": false }
        ],
        "overrides": "overrides"
    })
    .to_string();
    write_zip(
        archive,
        &[
            ("manifest.json", manifest.as_bytes()),
            ("overrides/config/jei.toml", b"enabled = true"),
        ],
    );
}

fn jei_catalog(url: String) -> InMemoryCatalog {
    InMemoryCatalog::new("curseforge")
        .with_version(CatalogVersion {
            id: "4712345".into(),
            project_id: "238222".into(),
            version_number: "15.2.0".into(),
            game_versions: vec!["1.20.1".into()],
            loaders: vec!["forge".into()],
            files: vec![CatalogFile {
                file_name: "jei.jar".into(),
                url,
                hashes: BTreeMap::from([("sha1".to_string(), sha1_of(CF_BODY))]),
                size: CF_BODY.len() as u64,
                primary: true,
            }],
            dependencies: vec![],
        })
        .with_project(CatalogProject {
            id: "238222".into(),
            slug: Some("jei".into()),
            title: "Just Enough Items".into(),
            role: ResourceRole::Mod,
            client: piston_modpack::modpack::EnvRequirement::Required,
            server: piston_modpack::modpack::EnvRequirement::Required,
        })
}

fn sodium_catalog(url: String) -> InMemoryCatalog {
    InMemoryCatalog::new("modrinth")
        .with_version(CatalogVersion {
            id: "OihdIimA".into(),
            project_id: "AANobbMI".into(),
            version_number: "0.5.8".into(),
            game_versions: vec!["1.20.1".into()],
            loaders: vec!["fabric".into()],
            files: vec![CatalogFile {
                file_name: "sodium.jar".into(),
                url,
                hashes: BTreeMap::from([("sha1".to_string(), sha1_of(MOD_BODY))]),
                size: MOD_BODY.len() as u64,
                primary: true,
            }],
            dependencies: vec![],
        })
        .with_project(CatalogProject {
            id: "AANobbMI".into(),
            slug: Some("sodium".into()),
            title: "Sodium".into(),
            role: ResourceRole::Mod,
            client: piston_modpack::modpack::EnvRequirement::Required,
            server: piston_modpack::modpack::EnvRequirement::Optional,
        })
}

/// `(relative path, sha1)` of every resolved file, or `(project, file)` ids of placeholders.
fn file_keys(files: &[IndexFile]) -> Vec<(String, String)> {
    let mut keys: Vec<_> = files
        .iter()
        .map(|f| match &f.source {
            FileSource::Resolved(r) => (
                r.relative_path.clone(),
                r.hashes.get("sha1").cloned().unwrap_or_default(),
            ),
            FileSource::Unresolved(h) => (h.project_id.clone(), h.file_id.clone()),
        })
        .collect();
    keys.sort();
    keys
}

#[tokio::test]
async fn modrinth_pack_installs_into_a_new_profile() {
    let fx = Fixture::new().await;
    fx.serve("/mods/sodium.jar", MOD_BODY).await;
    let archive = fx.path("example.mrpack");
    modrinth_pack(&archive, &fx.url("/mods/sodium.jar"), ("fabric-loader", "0.15.7"));

    let profile_dir = fx.path("profiles/example");
    let request = InstallRequest::new(&archive, &profile_dir).with_profile_name("My Pack");
    let tracker = ProgressTracker::new(None);
    let sender = tracker.sender();

    let outcome = fx
        .coordinator(CatalogSet::new())
        .install(&request, &sender, &CancelToken::new())
        .await
        .unwrap();
    drop(sender);
    let progress = tracker.finish().await;

    let InstallOutcome::Completed(profile) = outcome else {
        panic!("expected a completed install");
    };
    assert_eq!(profile.name, "My Pack");
    assert_eq!(profile.version_id, "fabric-loader-0.15.7-1.20.1");
    assert_eq!(profile.summary.files, 1);
    assert_eq!(profile.processors_run, 0);

    assert_eq!(std::fs::read(profile_dir.join("mods/sodium.jar")).unwrap(), MOD_BODY);
    // client-overrides are applied after overrides
    assert_eq!(
        std::fs::read_to_string(profile_dir.join("config/sodium.toml")).unwrap(),
        "quality = \"high\""
    );
    assert!(profile_dir.join("options.txt").exists());
    for folder in ["datapacks", "resourcepacks", "shaderpacks"] {
        assert!(profile_dir.join(folder).is_dir());
    }

    assert_eq!(progress.state, InstallState::Completed);
    assert_eq!(progress.files.completed, 1);
    assert_eq!(progress.files.total, 1);
    assert_eq!(fx.registrar.profiles.lock().unwrap().len(), 1);
    assert!(fx.temp_is_empty());
}

#[tokio::test]
async fn curseforge_pack_resolves_placeholders_through_the_catalog() {
    let fx = Fixture::new().await;
    fx.serve("/files/jei.jar", CF_BODY).await;
    let archive = fx.path("Forge Pack.zip");
    curseforge_pack(&archive);

    let source = Arc::new(StubProfileSource::default());
    let catalogs = CatalogSet::new().with_curseforge(Arc::new(jei_catalog(fx.url("/files/jei.jar"))));
    let coordinator = fx.coordinator(catalogs).with_loader_profiles(source.clone());

    let profile_dir = fx.path("profiles/forge");
    let libraries = fx.path("libraries");
    let request = InstallRequest::new(&archive, &profile_dir).with_libraries_dir(&libraries);
    let outcome = coordinator
        .install(&request, &piston_modpack::installer::ProgressSender::disconnected(), &CancelToken::new())
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(std::fs::read(profile_dir.join("mods/jei.jar")).unwrap(), CF_BODY);
    assert!(profile_dir.join("config/jei.toml").exists());

    let requests = source.requests.lock().unwrap();
    assert_eq!(
        *requests,
        vec![(LoaderType::Forge, "47.2.0".to_string(), libraries.clone())]
    );
    assert!(libraries.is_dir());

    let registered = fx.registrar.profiles.lock().unwrap();
    assert_eq!(registered[0].pack_name, "Forge Pack");
    assert_eq!(registered[0].version_id, "forge-loader-47.2.0-1.20.1");
    // The optional entry is never installed
    assert_eq!(registered[0].summary.files, 1);
    assert_eq!(registered[0].summary.dependencies, 0);
}

#[tokio::test]
async fn failed_download_rolls_back_the_profile() {
    let fx = Fixture::new().await;
    Mock::given(method("GET"))
        .and(path("/mods/sodium.jar"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&fx.server)
        .await;
    let archive = fx.path("broken.mrpack");
    modrinth_pack(&archive, &fx.url("/mods/sodium.jar"), ("fabric-loader", "0.15.7"));

    let profile_dir = fx.path("profiles/broken");
    let tracker = ProgressTracker::new(None);
    let sender = tracker.sender();
    let err = fx
        .coordinator(CatalogSet::new())
        .install(&InstallRequest::new(&archive, &profile_dir), &sender, &CancelToken::new())
        .await
        .unwrap_err();
    drop(sender);
    let progress = tracker.finish().await;

    assert!(matches!(err, InstallError::DownloadFailed { .. }), "{:?}", err);
    assert_eq!(progress.state, InstallState::Failed);
    assert!(!profile_dir.exists());
    assert!(fx.temp_is_empty());
    assert!(fx.registrar.profiles.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancelling_mid_download_leaves_no_files() {
    let fx = Fixture::new().await;
    Mock::given(method("GET"))
        .and(path("/mods/sodium.jar"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(MOD_BODY.to_vec())
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&fx.server)
        .await;
    let archive = fx.path("slow.mrpack");
    modrinth_pack(&archive, &fx.url("/mods/sodium.jar"), ("fabric-loader", "0.15.7"));

    let profile_dir = fx.path("profiles/slow");
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let tracker = ProgressTracker::new(None);
    let sender = tracker.sender();
    let outcome = fx
        .coordinator(CatalogSet::new())
        .install(&InstallRequest::new(&archive, &profile_dir), &sender, &cancel)
        .await
        .unwrap();
    drop(sender);
    let progress = tracker.finish().await;

    assert!(matches!(outcome, InstallOutcome::Cancelled));
    assert_eq!(progress.state, InstallState::Cancelled);
    assert!(!profile_dir.exists());
    assert!(fx.temp_is_empty());
}

#[tokio::test]
async fn cancellation_keeps_pre_existing_profile_content() {
    let fx = Fixture::new().await;
    let archive = fx.path("example.mrpack");
    modrinth_pack(&archive, &fx.url("/mods/sodium.jar"), ("fabric-loader", "0.15.7"));

    let profile_dir = fx.path("profiles/existing");
    std::fs::create_dir_all(profile_dir.join("saves")).unwrap();
    std::fs::write(profile_dir.join("saves/level.dat"), b"world").unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let outcome = fx
        .coordinator(CatalogSet::new())
        .install(
            &InstallRequest::new(&archive, &profile_dir),
            &piston_modpack::installer::ProgressSender::disconnected(),
            &cancel,
        )
        .await
        .unwrap();

    assert!(matches!(outcome, InstallOutcome::Cancelled));
    assert!(profile_dir.join("saves/level.dat").exists());
    assert!(!profile_dir.join("mods").exists());
}

/// Pack whose overrides add a nested folder and replace `options.txt`.
fn scripted_pack(archive: &Path, mod_url: &str) {
    let index = serde_json::json!({
        "formatVersion": 1,
        "game": "minecraft",
        "versionId": "2.0.0",
        "name": "Scripted Pack",
        "dependencies": { "minecraft": "1.20.1", "forge": "47.2.0" },
        "files": [{
            "path": "mods/sodium.jar",
            "hashes": { "sha1": sha1_of(MOD_BODY) },
            "downloads": [mod_url],
            "fileSize": MOD_BODY.len()
        }]
    })
    .to_string();
    write_zip(
        archive,
        &[
            ("modrinth.index.json", index.as_bytes()),
            ("overrides/kubejs/scripts/startup.js", b"console.info('hi')"),
            ("overrides/options.txt", b"fov:70"),
        ],
    );
}

/// Profile the player already uses: a world, their own mod and tuned options.
fn lived_in_profile(profile_dir: &Path) {
    std::fs::create_dir_all(profile_dir.join("saves/world")).unwrap();
    std::fs::create_dir_all(profile_dir.join("mods")).unwrap();
    std::fs::write(profile_dir.join("saves/world/level.dat"), b"world").unwrap();
    std::fs::write(profile_dir.join("mods/custom.jar"), b"own build").unwrap();
    std::fs::write(profile_dir.join("options.txt"), b"fov:110").unwrap();
}

fn assert_untouched(profile_dir: &Path) {
    assert_eq!(std::fs::read(profile_dir.join("saves/world/level.dat")).unwrap(), b"world");
    assert_eq!(std::fs::read(profile_dir.join("mods/custom.jar")).unwrap(), b"own build");
    assert_eq!(std::fs::read(profile_dir.join("options.txt")).unwrap(), b"fov:110");
    assert!(!profile_dir.join("kubejs").exists());
    assert!(!profile_dir.join("config").exists());
    assert!(!profile_dir.join("resourcepacks").exists());
    assert!(!profile_dir.join("mods/sodium.jar").exists());

    let mut mods: Vec<_> = std::fs::read_dir(profile_dir.join("mods"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    mods.sort();
    assert_eq!(mods, vec!["custom.jar".to_string()]);
}

#[tokio::test]
async fn failed_download_restores_an_existing_profile() {
    let fx = Fixture::new().await;
    Mock::given(method("GET"))
        .and(path("/mods/sodium.jar"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&fx.server)
        .await;
    let archive = fx.path("scripted.mrpack");
    scripted_pack(&archive, &fx.url("/mods/sodium.jar"));

    let profile_dir = fx.path("profiles/lived-in");
    lived_in_profile(&profile_dir);

    let tracker = ProgressTracker::new(None);
    let sender = tracker.sender();
    let err = fx
        .coordinator(CatalogSet::new())
        .install(&InstallRequest::new(&archive, &profile_dir), &sender, &CancelToken::new())
        .await
        .unwrap_err();
    drop(sender);
    let progress = tracker.finish().await;

    assert!(matches!(err, InstallError::DownloadFailed { .. }), "{:?}", err);
    // Overrides were copied before the download failed
    assert_eq!(progress.overrides.completed, 2);
    assert_eq!(progress.state, InstallState::Failed);
    assert_untouched(&profile_dir);
    assert!(fx.temp_is_empty());
}

#[tokio::test]
async fn cancelling_mid_download_restores_an_existing_profile() {
    let fx = Fixture::new().await;
    Mock::given(method("GET"))
        .and(path("/mods/sodium.jar"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(MOD_BODY.to_vec())
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&fx.server)
        .await;
    let archive = fx.path("scripted.mrpack");
    scripted_pack(&archive, &fx.url("/mods/sodium.jar"));

    let profile_dir = fx.path("profiles/lived-in");
    lived_in_profile(&profile_dir);

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let outcome = fx
        .coordinator(CatalogSet::new())
        .install(
            &InstallRequest::new(&archive, &profile_dir),
            &piston_modpack::installer::ProgressSender::disconnected(),
            &cancel,
        )
        .await
        .unwrap();

    assert!(matches!(outcome, InstallOutcome::Cancelled));
    assert_untouched(&profile_dir);
    assert!(fx.temp_is_empty());
}

#[tokio::test]
async fn concurrent_install_into_the_same_profile_is_rejected() {
    let fx = Fixture::new().await;
    let archive = fx.path("example.mrpack");
    modrinth_pack(&archive, &fx.url("/mods/sodium.jar"), ("fabric-loader", "0.15.7"));
    let profile_dir = fx.path("profiles/busy");

    let held = InstallTransaction::begin(&profile_dir, &fx.path("tmp")).unwrap();
    let err = fx
        .coordinator(CatalogSet::new())
        .install(
            &InstallRequest::new(&archive, &profile_dir),
            &piston_modpack::installer::ProgressSender::disconnected(),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, InstallError::ProfileBusy { .. }));
    drop(held);
}

#[tokio::test]
async fn exported_modrinth_profile_reparses_to_the_same_index() {
    let fx = Fixture::new().await;
    fx.serve("/mods/sodium.jar", MOD_BODY).await;
    let archive = fx.path("example.mrpack");
    modrinth_pack(&archive, &fx.url("/mods/sodium.jar"), ("fabric-loader", "0.15.7"));

    let profile_dir = fx.path("profiles/roundtrip");
    fx.coordinator(CatalogSet::new())
        .install(
            &InstallRequest::new(&archive, &profile_dir),
            &piston_modpack::installer::ProgressSender::disconnected(),
            &CancelToken::new(),
        )
        .await
        .unwrap();
    // A file nobody knows about must travel as an override
    std::fs::write(profile_dir.join("mods/handmade.jar"), b"local build").unwrap();

    let original = read_archive_metadata(&archive).unwrap();
    let identifier = ResourceIdentifier::new(vec![Arc::new(sodium_catalog(fx.url("/mods/sodium.jar")))]);
    let exported = fx.path("exported.mrpack");
    let report = export_profile(
        &profile_dir,
        ExportSpec::from_index(&original).with_extra_path("config"),
        &exported,
        SourceFormat::Modrinth,
        &identifier,
    )
    .await
    .unwrap();
    assert_eq!(report.linked, 1);

    let reparsed = read_archive_metadata(&exported).unwrap();
    assert_eq!(file_keys(&reparsed.files), file_keys(&original.files));
    assert_eq!(
        reparsed.required_dependencies().collect::<Vec<_>>(),
        original.required_dependencies().collect::<Vec<_>>()
    );
    assert_eq!(reparsed.loader_type, original.loader_type);
    assert_eq!(reparsed.game_version, original.game_version);

    // And it installs again
    let second = fx.path("profiles/second");
    let outcome = fx
        .coordinator(CatalogSet::new())
        .install(
            &InstallRequest::new(&exported, &second),
            &piston_modpack::installer::ProgressSender::disconnected(),
            &CancelToken::new(),
        )
        .await
        .unwrap();
    assert!(outcome.is_completed());
    assert_eq!(std::fs::read(second.join("mods/handmade.jar")).unwrap(), b"local build");
    assert_eq!(std::fs::read(second.join("mods/sodium.jar")).unwrap(), MOD_BODY);
}

#[tokio::test]
async fn exported_curseforge_profile_keeps_project_ids() {
    let fx = Fixture::new().await;
    fx.serve("/files/jei.jar", CF_BODY).await;
    let archive = fx.path("Forge Pack.zip");
    curseforge_pack(&archive);

    let catalog = Arc::new(jei_catalog(fx.url("/files/jei.jar")));
    let profile_dir = fx.path("profiles/cf");
    fx.coordinator(CatalogSet::new().with_curseforge(catalog.clone()))
        .install(
            &InstallRequest::new(&archive, &profile_dir),
            &piston_modpack::installer::ProgressSender::disconnected(),
            &CancelToken::new(),
        )
        .await
        .unwrap();

    let original = read_archive_metadata(&archive).unwrap();
    let exported = fx.path("exported.zip");
    export_profile(
        &profile_dir,
        ExportSpec::from_index(&original),
        &exported,
        SourceFormat::CurseForge,
        &ResourceIdentifier::new(vec![catalog as Arc<dyn ResourceCatalog>]),
    )
    .await
    .unwrap();

    let reparsed = read_archive_metadata(&exported).unwrap();
    assert_eq!(file_keys(&reparsed.files), file_keys(&original.files));
    assert_eq!(
        reparsed.required_dependencies().collect::<Vec<_>>(),
        original.required_dependencies().collect::<Vec<_>>()
    );
    assert_eq!(reparsed.loader_version, "47.2.0");
    assert_eq!(reparsed.pack_version, "3.1");
}
