//! End-to-end build: create → deploy → configure → boot.
//!
//! Each synchronous stage blocks until its tools return and aborts the run
//! on the first error. The final boot stage only launches the VM; its
//! result is reported through the returned session once the caller's
//! [`MainLoop`] has processed the exit.

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::artifact::disk::{DiskAssembler, GuestMount, PartitionLayout};
use crate::bootloader::{BootloaderConfig, BootloaderConfigurator};
use crate::config::Config;
use crate::deploy::{Deployment, DeploymentManager};
use crate::logger::SharedLogger;
use crate::manifest::{write_manifest, RunManifest, RunStatus};
use crate::preflight;
use crate::process::{MainLoop, ProcessRunner};
use crate::validate::{BootOutcome, BootValidator, VmBootSession};

/// Result of the deploy + configure stages.
#[derive(Debug)]
pub struct RolloutReport {
    pub deployment: Deployment,
    pub bootloader: BootloaderConfig,
}

pub struct Pipeline {
    config: Config,
    runner: ProcessRunner,
}

impl Pipeline {
    pub fn new(config: Config, logger: SharedLogger) -> Self {
        Self {
            config,
            runner: ProcessRunner::new(logger),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn create_disk(&self) -> Result<PartitionLayout> {
        let disk = &self.config.disk;
        DiskAssembler::new(self.runner.clone(), self.config.tools.clone(), disk)
            .create_disk(&disk.path, &self.config.os_name, disk.size_mb)
            .with_context(|| format!("creating disk '{}'", disk.path.display()))
    }

    /// Mount the image, roll out the OS and write boot configuration.
    ///
    /// The image is unmounted on every path out of this function.
    pub fn rollout(&self) -> Result<RolloutReport> {
        let cfg = &self.config;
        let mntdir = cfg.boot.work_dir.join("mnt");
        let mount = GuestMount::new(&cfg.tools.guestmount, &cfg.tools.fusermount, &cfg.disk.path)
            .read_write()
            .mount(&self.runner, &mntdir)
            .with_context(|| format!("mounting '{}'", cfg.disk.path.display()))?;

        let deployment = DeploymentManager::new(self.runner.clone(), &cfg.tools.ostree)
            .pull_deploy(
                mount.path(),
                &cfg.deploy.source_repo,
                &cfg.os_name,
                &cfg.deploy.target_ref,
                cfg.deploy.revision.as_deref(),
            )
            .with_context(|| format!("deploying '{}'", cfg.deploy.target_ref))?;

        let bootloader = BootloaderConfigurator::new(self.runner.logger().clone())
            .configure(mount.path(), &mount.path().join("boot"), &cfg.os_name)
            .context("configuring bootloader")?;

        mount.unmount().context("unmounting disk after rollout")?;

        Ok(RolloutReport {
            deployment,
            bootloader,
        })
    }

    pub fn boot(&self, main_loop: &mut MainLoop) -> Result<VmBootSession> {
        let cfg = &self.config;
        BootValidator::new(self.runner.clone(), cfg.tools.clone(), &cfg.boot.data_dir)
            .with_test_user(cfg.boot.test_user.clone())
            .boot_and_validate(main_loop, &cfg.disk.path, &cfg.boot.work_dir, &cfg.os_name)
            .context("launching validation boot")
    }

    /// Run every stage. The VM is still running when this returns.
    ///
    /// A run manifest is written to the work directory as soon as the run
    /// starts and marked failed if any stage errors.
    pub fn run(&self, main_loop: &mut MainLoop) -> Result<BuildRun> {
        let cfg = &self.config;
        let logger = self.runner.logger();
        preflight::check_host_tools(&cfg.tools)?;

        let mut manifest = RunManifest::start(&cfg.os_name, &cfg.disk.path);
        write_manifest(&cfg.boot.work_dir, &manifest)?;

        match self.run_stages(main_loop) {
            Ok(session) => Ok(BuildRun {
                session,
                manifest,
                work_dir: cfg.boot.work_dir.clone(),
            }),
            Err(e) => {
                logger.error(&format!("run {} failed: {:#}", manifest.run_id, e));
                manifest.finish(RunStatus::Failed);
                write_manifest(&cfg.boot.work_dir, &manifest)?;
                Err(e)
            }
        }
    }

    fn run_stages(&self, main_loop: &mut MainLoop) -> Result<VmBootSession> {
        let logger = self.runner.logger();

        logger.info(&format!("Creating {}", self.config.disk.path.display()));
        let layout = self.create_disk()?;
        logger.debug(&format!("layout: {:?}", layout));

        let report = self.rollout()?;
        logger.info(&format!(
            "Deployed {} ({}) with kernel {}",
            report.deployment.os_name,
            report.deployment.rev_or_target(),
            report.bootloader.kernel_release
        ));

        self.boot(main_loop)
    }
}

/// A pipeline run whose validation VM has been launched.
#[derive(Debug)]
pub struct BuildRun {
    pub session: VmBootSession,
    manifest: RunManifest,
    work_dir: PathBuf,
}

impl BuildRun {
    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    /// Record the boot outcome in the run manifest.
    ///
    /// Fails if the main loop has not yet processed the VM's exit.
    pub fn complete(mut self) -> Result<BootOutcome> {
        let outcome = self
            .session
            .outcome()
            .context("validation VM has not exited yet")?;
        let status = match outcome {
            BootOutcome::Passed => RunStatus::Success,
            BootOutcome::Failed { .. } => RunStatus::Failed,
        };
        self.manifest.finish(status);
        write_manifest(&self.work_dir, &self.manifest)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::inject::{EXPORT_JOURNAL_SCRIPT, EXPORT_JOURNAL_SERVICE};
    use crate::logger::CaptureLogger;
    use crate::manifest::load_manifest;
    use crate::test_support::{fake_tools, write_script};
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    /// All tools faked. ostree lays out a deployed tree with a kernel the
    /// way `deploy` + `update-kernel` would.
    fn pipeline(root: &Path) -> Pipeline {
        let text = format!(
            r#"
os_name = "maui"

[disk]
path = "{root}/x.qcow2"

[deploy]
source_repo = "/srv/repo"
target_ref = "maui/devel"

[boot]
work_dir = "{root}/work"
data_dir = "{root}/data"
"#,
            root = root.display()
        );
        let mut config = parse_config(&text).unwrap();

        let mut tools = fake_tools(root);
        tools.guestfish = write_script(
            root,
            "guestfish",
            "case \"$(cat)\" in *blockdev-getss*) printf '8589934592\\n512\\n' ;; esac\n",
        );
        tools.ostree = write_script(
            root,
            "ostree",
            r#"[ "$1" = admin ] || exit 0
dir="${2#--ostree-dir=}"
boot="${3#--boot-dir=}"
case "$4" in
  os-init) mkdir -p "$dir/deploy/$5/current/boot" "$dir/deploy/$5/current-etc" ;;
  update-kernel)
    touch "$dir/deploy/$6/current/boot/vmlinuz-6.1.0"
    mkdir -p "$boot/ostree"
    touch "$boot/ostree/vmlinuz-6.1.0" "$boot/ostree/initramfs-6.1.0.img" ;;
esac
"#,
        );
        tools.qemu = Some(write_script(root, "qemu-kvm", "exit 0\n"));
        config.tools = tools;

        fs::create_dir_all(root.join("data/tests")).unwrap();
        fs::write(root.join("data/tests").join(EXPORT_JOURNAL_SCRIPT), "#!/bin/sh\n").unwrap();
        fs::write(root.join("data/tests").join(EXPORT_JOURNAL_SERVICE), "[Unit]\n").unwrap();

        Pipeline::new(config, CaptureLogger::new())
    }

    #[test]
    fn test_full_pipeline_with_fake_tools() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let mut main_loop = MainLoop::new();

        let run = pipeline.run(&mut main_loop).unwrap();
        let work_dir = pipeline.config().boot.work_dir.clone();
        assert_eq!(
            load_manifest(&work_dir).unwrap().unwrap().status,
            RunStatus::Running
        );
        assert!(main_loop.run_for(Duration::from_secs(10)));

        assert_eq!(run.complete().unwrap(), BootOutcome::Passed);
        assert_eq!(
            load_manifest(&work_dir).unwrap().unwrap().status,
            RunStatus::Success
        );
        let conf = fs::read_to_string(dir.path().join("work/mnt/boot/syslinux/syslinux.cfg")).unwrap();
        assert!(conf.contains("LINUX /ostree/vmlinuz-6.1.0"));
    }

    #[test]
    fn test_rollout_failure_names_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path());
        pipeline.config.tools.ostree = write_script(dir.path(), "ostree-broken", "exit 1\n");

        let err = pipeline.rollout().unwrap_err();
        assert!(format!("{:#}", err).contains("deploying 'maui/devel'"));
        // Unmounted on the error path.
        assert!(crate::artifact::disk::DiskLock::acquire(&pipeline.config.disk.path).is_ok());
    }

    #[test]
    fn test_failed_run_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path());
        pipeline.config.tools.qemu_img = write_script(dir.path(), "qemu-img-broken", "exit 1\n");
        let mut main_loop = MainLoop::new();

        let err = pipeline.run(&mut main_loop).unwrap_err();
        assert!(format!("{:#}", err).contains("creating disk"));
        let manifest = load_manifest(&pipeline.config.boot.work_dir).unwrap().unwrap();
        assert_eq!(manifest.status, RunStatus::Failed);
        assert!(manifest.finished_at_utc.is_some());
    }

    #[test]
    fn test_missing_tool_fails_preflight() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path());
        pipeline.config.tools.guestmount = dir.path().join("missing/guestmount");

        let err = pipeline.run(&mut MainLoop::new()).unwrap_err();
        assert!(err.to_string().contains("Missing required host tools"));
        assert!(load_manifest(&pipeline.config.boot.work_dir).unwrap().is_none());
    }
}
