//! Boot validation: run the built image in QEMU.
//!
//! The kernel and initramfs are copied out of the image first because QEMU
//! needs plain files for `-kernel`/`-initrd`, and the image cannot stay
//! mounted while QEMU has it open. The launch returns immediately; the
//! result arrives through the [`MainLoop`] the caller keeps pumping.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::artifact::disk::GuestMount;
use crate::bootloader::{find_current_kernel, initramfs_path, parse_kernel_release};
use crate::config::{TestUser, ToolPaths};
use crate::deploy::deploy_dirs;
use crate::error::Result;
use crate::inject::{inject_export_journal, inject_test_user_creation};
use crate::process::{AsyncChild, MainLoop, ProcessResult, ProcessRunner};
use crate::qemu::{find_qemu, QemuBuilder};

pub const CONSOLE_OUTPUT: &str = "bootloader-console.out";
pub const JOURNAL_OUTPUT: &str = "bootloader-journal-json.txt";

/// How a validation boot ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    Passed,
    Failed {
        exited_normally: bool,
        exit_status: i32,
    },
}

impl BootOutcome {
    fn from_result(result: &ProcessResult) -> Self {
        if result.success() {
            BootOutcome::Passed
        } else {
            BootOutcome::Failed {
                exited_normally: result.exited_normally,
                exit_status: result.exit_status,
            }
        }
    }
}

/// A running validation VM.
#[derive(Debug)]
pub struct VmBootSession {
    pub pid: u32,
    pub console_output_path: PathBuf,
    pub journal_output_path: PathBuf,
    pub tmp_kernel_path: PathBuf,
    pub tmp_initrd_path: PathBuf,
    outcome: Rc<RefCell<Option<BootOutcome>>>,
}

impl VmBootSession {
    /// Set once the main loop has processed the VM's exit.
    pub fn outcome(&self) -> Option<BootOutcome> {
        *self.outcome.borrow()
    }
}

/// `console=ttyS0 ... systemd.unit=<os>-install-bootloader.target`.
pub fn install_bootloader_cmdline(os_name: &str) -> String {
    format!(
        "console=ttyS0 root=LABEL={os}-root rw ostree={os}/current systemd.unit={os}-install-bootloader.target",
        os = os_name
    )
}

pub struct BootValidator {
    runner: ProcessRunner,
    tools: ToolPaths,
    data_dir: PathBuf,
    test_user: Option<TestUser>,
}

impl BootValidator {
    pub fn new(runner: ProcessRunner, tools: ToolPaths, data_dir: &Path) -> Self {
        Self {
            runner,
            tools,
            data_dir: data_dir.to_path_buf(),
            test_user: None,
        }
    }

    /// Also create this user on first boot.
    pub fn with_test_user(mut self, user: Option<TestUser>) -> Self {
        self.test_user = user;
        self
    }

    /// Prepare the image and launch QEMU on it without waiting.
    ///
    /// Temporary kernel/initrd copies are deleted when `main_loop` processes
    /// the exit. A non-zero exit is logged and recorded in the session's
    /// outcome; it is not returned as an error.
    pub fn boot_and_validate(
        &self,
        main_loop: &mut MainLoop,
        disk_path: &Path,
        work_dir: &Path,
        os_name: &str,
    ) -> Result<VmBootSession> {
        let qemu = find_qemu(self.tools.qemu.as_deref())?;
        fs::create_dir_all(work_dir)?;

        let tmp_kernel_path = work_dir.join("kernel.img");
        let tmp_initrd_path = work_dir.join("initrd.img");

        let console_output_path = work_dir.join(CONSOLE_OUTPUT);
        let journal_output_path = work_dir.join(JOURNAL_OUTPUT);

        let launched = self.extract_and_launch(
            &qemu,
            disk_path,
            work_dir,
            os_name,
            &tmp_kernel_path,
            &tmp_initrd_path,
        );
        let child = match launched {
            Ok(child) => child,
            Err(e) => {
                remove_temp_files(&[tmp_kernel_path.as_path(), tmp_initrd_path.as_path()]);
                return Err(e);
            }
        };
        let pid = child.pid();
        self.runner
            .logger()
            .debug(&format!("waiting for pid {}", pid));

        let outcome = Rc::new(RefCell::new(None));
        let logger = self.runner.logger().clone();
        let (kernel, initrd, slot) = (
            tmp_kernel_path.clone(),
            tmp_initrd_path.clone(),
            outcome.clone(),
        );
        main_loop.child_watch_add(child, move |_pid, result| {
            for tmp in [&kernel, &initrd] {
                if let Err(e) = fs::remove_file(tmp) {
                    logger.warn(&format!("failed to remove {}: {}", tmp.display(), e));
                }
            }
            if !result.success() {
                logger.error(&format!(
                    "Couldn't install bootloader through qemu, error code: {}",
                    result.exit_status
                ));
            }
            *slot.borrow_mut() = Some(BootOutcome::from_result(&result));
        });

        Ok(VmBootSession {
            pid,
            console_output_path,
            journal_output_path,
            tmp_kernel_path,
            tmp_initrd_path,
            outcome,
        })
    }

    /// Copy the kernel artifacts out of the image, then start QEMU on it.
    fn extract_and_launch(
        &self,
        qemu: &Path,
        disk_path: &Path,
        work_dir: &Path,
        os_name: &str,
        tmp_kernel_path: &Path,
        tmp_initrd_path: &Path,
    ) -> Result<AsyncChild> {
        let mount = GuestMount::new(&self.tools.guestmount, &self.tools.fusermount, disk_path)
            .read_write()
            .mount(&self.runner, &work_dir.join("mnt"))?;
        self.prepare_guest(mount.path(), os_name, tmp_kernel_path, tmp_initrd_path)?;
        mount.unmount()?;

        QemuBuilder::new(qemu)
            .disk(disk_path)
            .console_output(&work_dir.join(CONSOLE_OUTPUT))
            .monitor()
            .journal_output(&work_dir.join(JOURNAL_OUTPUT))
            .kernel(tmp_kernel_path, tmp_initrd_path)
            .append(&install_bootloader_cmdline(os_name))
            .build(&self.runner)
            .current_dir(work_dir)
            .spawn()
    }

    fn prepare_guest(
        &self,
        mount_dir: &Path,
        os_name: &str,
        tmp_kernel_path: &Path,
        tmp_initrd_path: &Path,
    ) -> Result<()> {
        let (current_dir, current_etc_dir) = deploy_dirs(mount_dir, os_name);

        inject_export_journal(&current_dir, &current_etc_dir, &self.data_dir)?;
        if let Some(user) = &self.test_user {
            inject_test_user_creation(
                &current_etc_dir,
                os_name,
                &user.name,
                user.password.as_deref(),
            )?;
        }

        let kernel_path = find_current_kernel(mount_dir, os_name)?;
        let kernel_release = parse_kernel_release(&kernel_path)?;
        let initrd_path = initramfs_path(&mount_dir.join("boot"), &kernel_release)?;

        fs::copy(&kernel_path, tmp_kernel_path)?;
        fs::copy(&initrd_path, tmp_initrd_path)?;
        Ok(())
    }
}

fn remove_temp_files(paths: &[&Path]) {
    for path in paths {
        let _ = fs::remove_file(path);
    }
}
