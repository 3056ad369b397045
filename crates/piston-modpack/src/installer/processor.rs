use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::config::InstallerConfig;
use crate::error::{InstallError, InstallResult, IoResultExt};
use crate::installer::progress::{CancelToken, ProgressSender};
use crate::utils::maven::{maven_to_path, strip_coordinate_brackets};
use crate::utils::process::{classpath_separator, PistonCommandExt};

const STDERR_TAIL_LINES: usize = 20;

/// A mod-loader post-install step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Processor {
    /// Maven coordinate of the executable jar
    pub jar: String,
    #[serde(default)]
    pub classpath: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// source → destination, both relative to the libraries root
    #[serde(default)]
    pub remaps: BTreeMap<String, String>,
}

/// Everything a processor run may reference through placeholders.
#[derive(Debug, Clone)]
pub struct ProcessorContext {
    pub libraries_dir: PathBuf,
    pub game_version: String,
    pub version_name: String,
    pub java_path: PathBuf,
    /// Substituted for `{ROOT}`
    pub root: PathBuf,
    /// `{key}` → value; `[coord]` values become library paths, `'x'` values are unquoted
    pub data: BTreeMap<String, String>,
}

impl ProcessorContext {
    pub fn new(libraries_dir: impl Into<PathBuf>, game_version: impl Into<String>, java_path: impl Into<PathBuf>) -> Self {
        let libraries_dir = libraries_dir.into();
        let game_version = game_version.into();
        Self {
            root: libraries_dir.clone(),
            version_name: game_version.clone(),
            libraries_dir,
            game_version,
            java_path: java_path.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_version_name(mut self, name: impl Into<String>) -> Self {
        self.version_name = name.into();
        self
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_data(mut self, data: BTreeMap<String, String>) -> Self {
        self.data.extend(data);
        self
    }

    /// Token name → replacement. Literal tokens shadow data entries of the same name.
    fn tokens(&self) -> InstallResult<Tokens> {
        let mut tokens = Tokens::new();
        for (key, value) in &self.data {
            tokens.insert(key.clone(), self.data_value(value)?);
        }
        tokens.insert("SIDE".to_string(), "client".to_string());
        tokens.insert("MINECRAFT_VERSION".to_string(), self.game_version.clone());
        tokens.insert("VERSION_NAME".to_string(), self.version_name.clone());
        tokens.insert("LIBRARY_DIR".to_string(), path_string(&self.libraries_dir));
        tokens.insert("ROOT".to_string(), path_string(&self.root));
        Ok(tokens)
    }

    fn data_value(&self, value: &str) -> InstallResult<String> {
        if let Some(coords) = strip_coordinate_brackets(value) {
            return Ok(path_string(&maven_to_path(coords, &self.libraries_dir)?));
        }
        if let Some(literal) = value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')) {
            return Ok(literal.to_string());
        }
        Ok(value.to_string())
    }

    /// Substitute placeholders in one argument. An argument that ends up as
    /// `[coord]` is turned into the library path.
    pub fn substitute(&self, arg: &str) -> InstallResult<String> {
        self.substitute_with(arg, &self.tokens()?)
    }

    fn substitute_with(&self, arg: &str, tokens: &Tokens) -> InstallResult<String> {
        let out = replace_tokens(arg, tokens);
        match strip_coordinate_brackets(&out) {
            Some(coords) => Ok(path_string(&maven_to_path(coords, &self.libraries_dir)?)),
            None => Ok(out),
        }
    }
}

type Tokens = BTreeMap<String, String>;

/// Single left-to-right pass: replacement text is never scanned again.
/// Unknown `{NAME}` sequences are kept as they are.
fn replace_tokens(template: &str, tokens: &Tokens) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}').and_then(|close| tokens.get(&after[..close]).map(|v| (close, v))) {
            Some((close, value)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Runs processors as external JVM processes.
#[derive(Debug, Clone)]
pub struct ProcessorExecutor {
    timeout: Duration,
}

impl Default for ProcessorExecutor {
    fn default() -> Self {
        Self::new(&InstallerConfig::default())
    }
}

impl ProcessorExecutor {
    pub fn new(config: &InstallerConfig) -> Self {
        Self {
            timeout: config.processor_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs `processors` in order and stops at the first failure.
    pub async fn execute_all(
        &self,
        processors: &[Processor],
        ctx: &ProcessorContext,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> InstallResult<usize> {
        if processors.is_empty() {
            log::info!("[Processor] No processors to execute");
            return Ok(0);
        }

        log::info!("[Processor] Executing {} processors...", processors.len());
        for (idx, processor) in processors.iter().enumerate() {
            cancel.check()?;
            progress.message(format!(
                "Running processor {}/{}: {}",
                idx + 1,
                processors.len(),
                processor.jar
            ));
            self.execute(processor, ctx, cancel).await?;
        }
        Ok(processors.len())
    }

    pub async fn execute(
        &self,
        processor: &Processor,
        ctx: &ProcessorContext,
        cancel: &CancelToken,
    ) -> InstallResult<()> {
        let libraries = &ctx.libraries_dir;
        let jar_path = maven_to_path(&processor.jar, libraries)?;
        if !jar_path.is_file() {
            return Err(InstallError::ProcessorJarMissing {
                coordinate: processor.jar.clone(),
                path: jar_path,
            });
        }

        let mut classpath = vec![jar_path.clone()];
        for coords in &processor.classpath {
            let path = maven_to_path(coords, libraries)?;
            if path.exists() {
                classpath.push(path);
            } else {
                log::warn!("[Processor] Classpath entry {} missing at {:?}, skipping", coords, path);
            }
        }
        let classpath = classpath
            .iter()
            .map(|p| path_string(p))
            .collect::<Vec<_>>()
            .join(classpath_separator());

        let main_class = {
            let jar = jar_path.clone();
            tokio::task::spawn_blocking(move || read_main_class(&jar))
                .await
                .map_err(|e| InstallError::MainClassNotFound {
                    jar: jar_path.clone(),
                    reason: e.to_string(),
                })??
        };

        let tokens = ctx.tokens()?;
        let args = processor
            .args
            .iter()
            .map(|arg| ctx.substitute_with(arg, &tokens))
            .collect::<InstallResult<Vec<_>>>()?;

        log::debug!("[Processor] Classpath: {}", classpath);
        log::debug!("[Processor] Main class: {}", main_class);
        log::debug!("[Processor] Args: {:?}", args);

        let mut command = Command::new(&ctx.java_path);
        command
            .arg("-cp")
            .arg(&classpath)
            .arg(&main_class)
            .args(&args)
            .current_dir(libraries)
            .env("LIBRARY_DIR", libraries)
            .suppress_console()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let status = self.run(&mut command, &processor.jar, cancel).await?;
        if !status.success() {
            return Err(InstallError::ProcessorExecutionFailed {
                jar: processor.jar.clone(),
                exit_code: status.code(),
            });
        }
        log::info!(
            "[Processor] {} finished in {:.1}s",
            processor.jar,
            started.elapsed().as_secs_f64()
        );

        apply_remaps(processor, ctx, &tokens).await
    }

    async fn run(&self, command: &mut Command, jar: &str, cancel: &CancelToken) -> InstallResult<ExitStatus> {
        let mut child = command.spawn().map_err(|e| {
            log::error!("[Processor] Failed to spawn {}: {}", jar, e);
            InstallError::ProcessorExecutionFailed {
                jar: jar.to_string(),
                exit_code: None,
            }
        })?;

        // Both pipes are drained so the child never blocks on a full buffer
        let stdout = child.stdout.take().map(|out| tokio::spawn(drain(out, "stdout", 0)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(drain(err, "stderr", STDERR_TAIL_LINES)));

        let waited = tokio::select! {
            status = tokio::time::timeout(self.timeout, child.wait()) => match status {
                Ok(status) => Waited::Exited(status),
                Err(_) => Waited::TimedOut,
            },
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        let status = match waited {
            Waited::Exited(status) => status.map_err(|e| InstallError::io(PathBuf::from(jar), e))?,
            Waited::TimedOut => {
                log::error!("[Processor] {} timed out after {:?}", jar, self.timeout);
                let _ = child.kill().await;
                return Err(InstallError::ProcessorExecutionFailed {
                    jar: jar.to_string(),
                    exit_code: None,
                });
            }
            Waited::Cancelled => {
                log::info!("[Processor] Cancelled, killing {}", jar);
                let _ = child.kill().await;
                return Err(InstallError::Cancelled);
            }
        };

        if let Some(task) = stdout {
            let _ = task.await;
        }
        let tail = match stderr {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        if !status.success() {
            log::error!("[Processor] {} exited with {:?}", jar, status.code());
            for line in &tail {
                log::error!("[Processor]   {}", line);
            }
        }
        Ok(status)
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Logs every line at debug and keeps the last `keep` lines.
async fn drain<R: AsyncRead + Unpin>(reader: R, stream: &'static str, keep: usize) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = std::collections::VecDeque::with_capacity(keep);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                log::debug!("[Processor] {}: {}", stream, line);
                if keep > 0 {
                    if tail.len() == keep {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::debug!("[Processor] {} closed: {}", stream, e);
                break;
            }
        }
    }
    tail.into_iter().collect()
}

/// `Main-Class` attribute of a jar's `META-INF/MANIFEST.MF`.
pub fn read_main_class(jar: &Path) -> InstallResult<String> {
    let not_found = |reason: String| InstallError::MainClassNotFound {
        jar: jar.to_path_buf(),
        reason,
    };

    let file = std::fs::File::open(jar).map_err(|e| not_found(e.to_string()))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| not_found(e.to_string()))?;
    let mut manifest = archive
        .by_name("META-INF/MANIFEST.MF")
        .map_err(|_| not_found("MANIFEST.MF not found in jar".to_string()))?;

    let mut content = String::new();
    manifest
        .read_to_string(&mut content)
        .map_err(|e| not_found(e.to_string()))?;

    content
        .lines()
        .find_map(|line| line.strip_prefix("Main-Class:"))
        .map(|class| class.trim().to_string())
        .filter(|class| !class.is_empty())
        .ok_or_else(|| not_found("Main-Class attribute not found in manifest".to_string()))
}

async fn apply_remaps(processor: &Processor, ctx: &ProcessorContext, tokens: &Tokens) -> InstallResult<()> {
    for (source, destination) in &processor.remaps {
        let source = remap_path(ctx, source, tokens)?;
        let destination = remap_path(ctx, destination, tokens)?;

        if !source.exists() {
            log::warn!("[Processor] Declared output {:?} was not produced, skipping remap", source);
            continue;
        }
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| {
                InstallError::DirectoryCreationFailed {
                    path: parent.to_path_buf(),
                    source,
                }
            })?;
        }
        if tokio::fs::rename(&source, &destination).await.is_err() {
            // Different filesystem
            tokio::fs::copy(&source, &destination).await.at_path(&destination)?;
            tokio::fs::remove_file(&source).await.at_path(&source)?;
        }
        log::debug!("[Processor] Moved {:?} → {:?}", source, destination);
    }
    Ok(())
}

fn remap_path(ctx: &ProcessorContext, value: &str, tokens: &Tokens) -> InstallResult<PathBuf> {
    let substituted = ctx.substitute_with(value, tokens)?;
    let path = PathBuf::from(&substituted);
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(ctx.libraries_dir.join(substituted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_jar(path: &Path, manifest: Option<&str>) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        if let Some(manifest) = manifest {
            zip.start_file("META-INF/MANIFEST.MF", SimpleFileOptions::default())
                .unwrap();
            zip.write_all(manifest.as_bytes()).unwrap();
        }
        zip.start_file("Tool.class", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"cafebabe").unwrap();
        zip.finish().unwrap();
    }

    fn processor(jar: &str, args: &[&str]) -> Processor {
        Processor {
            jar: jar.into(),
            classpath: vec![],
            args: args.iter().map(|a| a.to_string()).collect(),
            remaps: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn missing_jar_fails_before_spawning() {
        let libs = TempDir::new().unwrap();
        let ctx = ProcessorContext::new(libs.path(), "1.20.1", "/definitely/not/java");
        let err = ProcessorExecutor::default()
            .execute(
                &processor("net.minecraftforge:binarypatcher:1.1.1:fatjar", &[]),
                &ctx,
                &CancelToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            InstallError::ProcessorJarMissing { coordinate, path } => {
                assert_eq!(coordinate, "net.minecraftforge:binarypatcher:1.1.1:fatjar");
                assert!(path.ends_with("binarypatcher-1.1.1-fatjar.jar"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn substitutes_tokens_and_data() {
        let libs = PathBuf::from("/libs");
        let ctx = ProcessorContext::new(&libs, "1.20.1", "java")
            .with_version_name("forge-47.2.0")
            .with_data(BTreeMap::from([
                ("MAPPINGS".to_string(), "[de.oceanlabs.mcp:mcp_config:1.20.1@zip]".to_string()),
                ("MC_SLIM_SHA".to_string(), "'abc123'".to_string()),
                ("BINPATCH".to_string(), "/tmp/client.lzma".to_string()),
            ]));

        assert_eq!(ctx.substitute("--side={SIDE}").unwrap(), "--side=client");
        assert_eq!(ctx.substitute("{MINECRAFT_VERSION}").unwrap(), "1.20.1");
        assert_eq!(ctx.substitute("{VERSION_NAME}").unwrap(), "forge-47.2.0");
        assert_eq!(ctx.substitute("{MC_SLIM_SHA}").unwrap(), "abc123");
        assert_eq!(ctx.substitute("{BINPATCH}").unwrap(), "/tmp/client.lzma");
        assert_eq!(
            PathBuf::from(ctx.substitute("{MAPPINGS}").unwrap()),
            libs.join("de").join("oceanlabs").join("mcp").join("mcp_config").join("1.20.1").join("mcp_config-1.20.1.zip")
        );
        assert_eq!(
            PathBuf::from(ctx.substitute("[net.minecraft:client:1.20.1:slim]").unwrap()),
            libs.join("net").join("minecraft").join("client").join("1.20.1").join("client-1.20.1-slim.jar")
        );
        assert_eq!(ctx.substitute("{UNKNOWN}").unwrap(), "{UNKNOWN}");
    }

    #[test]
    fn replacement_text_is_not_substituted_again() {
        let ctx = ProcessorContext::new("/libs", "1.20.1", "java").with_data(BTreeMap::from([
            ("PATCHED".to_string(), "'{SIDE}-{MINECRAFT_VERSION}'".to_string()),
            ("SIDE".to_string(), "server".to_string()),
        ]));

        assert_eq!(ctx.substitute("{PATCHED}").unwrap(), "{SIDE}-{MINECRAFT_VERSION}");
        assert_eq!(ctx.substitute("{SIDE}/{PATCHED}").unwrap(), "client/{SIDE}-{MINECRAFT_VERSION}");
        assert_eq!(ctx.substitute("{{SIDE}}").unwrap(), "{client}");
        assert_eq!(ctx.substitute("a{b").unwrap(), "a{b");
    }

    #[test]
    fn main_class_comes_from_manifest() {
        let dir = TempDir::new().unwrap();
        let jar = dir.path().join("tool.jar");
        write_jar(&jar, Some("Manifest-Version: 1.0\r\nMain-Class: net.minecraftforge.Tool\r\n"));
        assert_eq!(read_main_class(&jar).unwrap(), "net.minecraftforge.Tool");

        let bare = dir.path().join("bare.jar");
        write_jar(&bare, None);
        assert!(matches!(
            read_main_class(&bare),
            Err(InstallError::MainClassNotFound { .. })
        ));

        let no_attr = dir.path().join("noattr.jar");
        write_jar(&no_attr, Some("Manifest-Version: 1.0\n"));
        assert!(matches!(
            read_main_class(&no_attr),
            Err(InstallError::MainClassNotFound { .. })
        ));
    }

    #[cfg(unix)]
    fn fake_java(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        // $1=-cp $2=classpath $3=main class $4.. processor args
        let script = dir.join("java");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"running $3\"\nif [ \"$4\" = fail ]; then echo boom >&2; exit 3; fi\ntouch \"$LIBRARY_DIR/out.bin\"\nexit 0\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_processor_and_applies_remaps() {
        let libs = TempDir::new().unwrap();
        let bin = TempDir::new().unwrap();
        let java = fake_java(bin.path());
        let coordinate = "net.minecraftforge:installertools:1.3.0:fatjar";
        write_jar(
            &maven_to_path(coordinate, libs.path()).unwrap(),
            Some("Main-Class: net.minecraftforge.installertools.ConsoleTool\n"),
        );

        let mut step = processor(coordinate, &["ok"]);
        step.classpath = vec!["com.example:missing:1.0".into()];
        step.remaps = BTreeMap::from([
            ("out.bin".to_string(), "moved/{MINECRAFT_VERSION}/out.bin".to_string()),
            ("never-written.bin".to_string(), "elsewhere.bin".to_string()),
        ]);

        let ctx = ProcessorContext::new(libs.path(), "1.20.1", &java);
        let ran = ProcessorExecutor::default()
            .execute_all(&[step], &ctx, &ProgressSender::disconnected(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(ran, 1);
        assert!(libs.path().join("moved/1.20.1/out.bin").exists());
        assert!(!libs.path().join("out.bin").exists());
        assert!(!libs.path().join("elsewhere.bin").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_stops_the_sequence() {
        let libs = TempDir::new().unwrap();
        let bin = TempDir::new().unwrap();
        let java = fake_java(bin.path());
        let coordinate = "net.minecraftforge:binarypatcher:1.1.1:fatjar";
        write_jar(
            &maven_to_path(coordinate, libs.path()).unwrap(),
            Some("Main-Class: net.minecraftforge.binarypatcher.ConsoleTool\n"),
        );

        let mut second = processor(coordinate, &["ok"]);
        second.remaps = BTreeMap::from([("out.bin".to_string(), "second.bin".to_string())]);

        let ctx = ProcessorContext::new(libs.path(), "1.20.1", &java);
        let err = ProcessorExecutor::default()
            .execute_all(
                &[processor(coordinate, &["fail"]), second],
                &ctx,
                &ProgressSender::disconnected(),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            InstallError::ProcessorExecutionFailed { jar, exit_code } => {
                assert_eq!(jar, coordinate);
                assert_eq!(exit_code, Some(3));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!libs.path().join("second.bin").exists());
    }
}
