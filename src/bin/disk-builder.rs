use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use disk_builder::artifact::disk::{DiskAssembler, GuestMount};
use disk_builder::bootloader::BootloaderConfigurator;
use disk_builder::config::{default_config_path, load_config, DiskConfig, ToolPaths};
use disk_builder::deploy::DeploymentManager;
use disk_builder::validate::BootValidator;
use disk_builder::{BootOutcome, ConsoleLogger, MainLoop, Pipeline, ProcessRunner};

const DEFAULT_DATA_DIR: &str = "/usr/share/disk-builder";

fn usage() -> &'static str {
    "Usage:\n  disk-builder create <disk> <os> [size_mb]\n  disk-builder deploy <disk> <source_repo> <os> <target_ref> [revision]\n  disk-builder boot <disk> <work_dir> <os> [data_dir]\n  disk-builder snapshot <disk> <new_disk>\n  disk-builder copy <src> <dest>\n  disk-builder build [config.toml]"
}

fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd, disk, os] if cmd == "create" => create(Path::new(disk), os, None),
        [cmd, disk, os, size] if cmd == "create" => create(Path::new(disk), os, Some(size)),
        [cmd, disk, repo, os, target] if cmd == "deploy" => {
            deploy(Path::new(disk), Path::new(repo), os, target, None)
        }
        [cmd, disk, repo, os, target, rev] if cmd == "deploy" => {
            deploy(Path::new(disk), Path::new(repo), os, target, Some(rev))
        }
        [cmd, disk, work_dir, os] if cmd == "boot" => boot(
            Path::new(disk),
            Path::new(work_dir),
            os,
            Path::new(DEFAULT_DATA_DIR),
        ),
        [cmd, disk, work_dir, os, data_dir] if cmd == "boot" => boot(
            Path::new(disk),
            Path::new(work_dir),
            os,
            Path::new(data_dir),
        ),
        [cmd, disk, new_disk] if cmd == "snapshot" => {
            assembler()
                .create_disk_snapshot(Path::new(disk), Path::new(new_disk))
                .with_context(|| format!("snapshotting '{}'", disk))?;
            Ok(ExitCode::SUCCESS)
        }
        [cmd, src, dest] if cmd == "copy" => {
            assembler()
                .copy_disk(Path::new(src), Path::new(dest))
                .with_context(|| format!("copying '{}' to '{}'", src, dest))?;
            Ok(ExitCode::SUCCESS)
        }
        [cmd] if cmd == "build" => build(None),
        [cmd, config] if cmd == "build" => build(Some(PathBuf::from(config))),
        _ => bail!(usage()),
    }
}

fn runner() -> ProcessRunner {
    ProcessRunner::new(ConsoleLogger::shared())
}

fn assembler() -> DiskAssembler {
    DiskAssembler::new(runner(), ToolPaths::default(), &DiskConfig::default())
}

fn create(disk: &Path, os: &str, size: Option<&String>) -> Result<ExitCode> {
    let size_mb = match size {
        Some(size) => size
            .parse::<u64>()
            .with_context(|| format!("invalid size_mb '{}'", size))?,
        None => DiskConfig::default().size_mb,
    };
    let layout = assembler()
        .create_disk(disk, os, size_mb)
        .with_context(|| format!("creating disk '{}'", disk.display()))?;
    log::info!(
        "Created {}: boot {} sectors, swap {} sectors, root {} sectors",
        disk.display(),
        layout.boot_sectors(),
        layout.swap_sectors(),
        layout.root_sectors()
    );
    Ok(ExitCode::SUCCESS)
}

fn deploy(
    disk: &Path,
    source_repo: &Path,
    os: &str,
    target_ref: &str,
    revision: Option<&String>,
) -> Result<ExitCode> {
    let mntdir = std::env::temp_dir().join(format!("disk-builder-mnt-{}", std::process::id()));
    deploy_at(
        &runner(),
        &ToolPaths::default(),
        &mntdir,
        disk,
        source_repo,
        os,
        target_ref,
        revision.map(String::as_str),
    )?;
    Ok(ExitCode::SUCCESS)
}

/// Mount `disk` at `mntdir`, roll out and configure, then unmount.
///
/// `mntdir` is removed afterwards whether or not the rollout succeeded.
#[allow(clippy::too_many_arguments)]
fn deploy_at(
    runner: &ProcessRunner,
    tools: &ToolPaths,
    mntdir: &Path,
    disk: &Path,
    source_repo: &Path,
    os: &str,
    target_ref: &str,
    revision: Option<&str>,
) -> Result<()> {
    let result = (|| -> Result<()> {
        let mount = GuestMount::new(&tools.guestmount, &tools.fusermount, disk)
            .read_write()
            .mount(runner, mntdir)
            .with_context(|| format!("mounting '{}'", disk.display()))?;
        DeploymentManager::new(runner.clone(), &tools.ostree)
            .pull_deploy(mount.path(), source_repo, os, target_ref, revision)
            .with_context(|| format!("deploying '{}'", target_ref))?;
        BootloaderConfigurator::new(runner.logger().clone())
            .configure(mount.path(), &mount.path().join("boot"), os)
            .context("configuring bootloader")?;
        mount.unmount()?;
        Ok(())
    })();

    if let Err(e) = std::fs::remove_dir(mntdir) {
        if mntdir.exists() {
            log::warn!("failed to remove {}: {}", mntdir.display(), e);
        }
    }
    result
}

fn boot(disk: &Path, work_dir: &Path, os: &str, data_dir: &Path) -> Result<ExitCode> {
    let mut main_loop = MainLoop::new();
    let session = BootValidator::new(runner(), ToolPaths::default(), data_dir)
        .boot_and_validate(&mut main_loop, disk, work_dir, os)
        .with_context(|| format!("booting '{}'", disk.display()))?;
    log::info!(
        "qemu running as pid {}, console output in {}",
        session.pid,
        session.console_output_path.display()
    );

    main_loop.run();
    Ok(exit_code(session.outcome()))
}

fn build(config: Option<PathBuf>) -> Result<ExitCode> {
    let config_path = match config {
        Some(path) => path,
        None => default_config_path().context("no config directory on this host")?,
    };
    let config = load_config(&config_path)?;

    let pipeline = Pipeline::new(config, ConsoleLogger::shared());
    let mut main_loop = MainLoop::new();
    let run = pipeline.run(&mut main_loop)?;
    log::info!("run {} waiting for qemu", run.manifest().run_id);

    main_loop.run();
    let outcome = run.complete()?;
    Ok(exit_code(Some(outcome)))
}

fn exit_code(outcome: Option<BootOutcome>) -> ExitCode {
    match outcome {
        Some(BootOutcome::Passed) => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
