use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use piston_modpack::installer::{InstallerJarProfileSource, LoggingRegistrar, ProgressReporter};
use piston_modpack::{
    CancelToken, CatalogSet, InstallCoordinator, InstallOutcome, InstallRequest, InstallerConfig,
    ProgressTracker,
};

struct ConsoleReporter;

impl ProgressReporter for ConsoleReporter {
    fn start_step(&self, name: &str, total_steps: Option<u32>) {
        println!("[STEP START] {} (total: {:?})", name, total_steps);
    }

    fn update_bytes(&self, transferred: u64, total: Option<u64>) {
        if let Some(t) = total {
            println!("[BYTES] {}/{}", transferred, t);
        } else {
            println!("[BYTES] {}", transferred);
        }
    }

    fn set_message(&self, message: &str) {
        println!("[MSG] {}", message);
    }

    fn set_step_count(&self, current: u32, total: Option<u32>) {
        println!("[STEP COUNT] {}/{:?}", current, total);
    }

    fn done(&self, success: bool, message: Option<&str>) {
        println!("[DONE] success={} message={:?}", success, message);
    }
}

struct Args {
    archive: PathBuf,
    profile_dir: PathBuf,
    installer: Option<PathBuf>,
    java: Option<PathBuf>,
    config: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut positional = Vec::new();
    let mut installer = None;
    let mut java = None;
    let mut config = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--installer" => installer = Some(args.next().context("--installer needs a path")?.into()),
            "--java" => java = Some(args.next().context("--java needs a path")?.into()),
            "--config" => config = Some(args.next().context("--config needs a path")?.into()),
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    let [archive, profile_dir] = <[PathBuf; 2]>::try_from(positional).map_err(|_| {
        anyhow::anyhow!(
            "usage: install_modpack <archive> <profile-dir> [--installer forge-installer.jar] [--java path] [--config config.json]"
        )
    })?;
    Ok(Args {
        archive,
        profile_dir,
        installer,
        java,
        config,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = parse_args()?;

    let config = match &args.config {
        Some(path) => InstallerConfig::load(path)?,
        None => InstallerConfig::default(),
    }
    .with_env_overrides();

    let catalogs = CatalogSet::from_config(&config)?;
    let mut coordinator = InstallCoordinator::new(config, catalogs, Arc::new(LoggingRegistrar))?;
    if let Some(installer) = &args.installer {
        coordinator = coordinator.with_loader_profiles(Arc::new(InstallerJarProfileSource::new(installer)));
    }

    let mut request = InstallRequest::new(&args.archive, &args.profile_dir);
    if let Some(java) = &args.java {
        request = request.with_java(java);
    }

    let cancel = CancelToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Cancelling...");
            on_ctrl_c.cancel();
        }
    });

    let tracker = ProgressTracker::new(Some(Arc::new(ConsoleReporter)));
    let sender = tracker.sender();
    println!("Installing {} into {}", args.archive.display(), args.profile_dir.display());

    let outcome = coordinator.install(&request, &sender, &cancel).await;
    drop(sender);
    let progress = tracker.finish().await;

    match outcome {
        Ok(InstallOutcome::Completed(profile)) => {
            println!(
                "Installed {} ({}): {} files, {} dependencies, {} overrides",
                profile.name,
                profile.version_id,
                progress.files.completed,
                progress.dependencies.completed,
                progress.overrides.completed
            );
            Ok(())
        }
        Ok(InstallOutcome::Cancelled) => {
            println!("Installation cancelled, nothing was left behind");
            Ok(())
        }
        Err(e) => bail!("Install failed: {}", e),
    }
}
