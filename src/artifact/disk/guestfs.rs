//! libguestfs front-ends: scripted `guestfish` sessions and `guestmount`.
//!
//! Both take an exclusive lock on the disk image for as long as they hold
//! it. Only one session or read-write mount may be open against an image,
//! and qemu must not be started on it until the mount is released.

use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};
use crate::process::ProcessRunner;

/// Root on partition 3, boot on partition 1.
pub const DEFAULT_PARTITION_OPTS: &[&str] = &["-m", "/dev/sda3", "-m", "/dev/sda1:/boot"];

/// Exclusive advisory lock on `<disk>.lock`.
#[derive(Debug)]
pub struct DiskLock {
    _file: File,
    path: PathBuf,
}

impl DiskLock {
    pub fn acquire(disk: &Path) -> Result<Self> {
        let mut lock_name = OsString::from(disk.as_os_str());
        lock_name.push(".lock");
        let path = PathBuf::from(lock_name);

        // Never unlink the lock file: a second process could then lock a
        // fresh inode at the same path while we still hold the old one.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(BuildError::Locked(disk.to_path_buf()));
        }
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A `guestfish` invocation that interprets a newline-separated script.
pub struct GuestFish<'a> {
    runner: &'a ProcessRunner,
    program: PathBuf,
    disk: PathBuf,
    partition_opts: Vec<String>,
    read_write: bool,
}

impl<'a> GuestFish<'a> {
    pub fn new(runner: &'a ProcessRunner, program: &Path, disk: &Path) -> Self {
        Self {
            runner,
            program: program.to_path_buf(),
            disk: disk.to_path_buf(),
            partition_opts: Vec::new(),
            read_write: false,
        }
    }

    pub fn read_write(mut self) -> Self {
        self.read_write = true;
        self
    }

    pub fn partition_opts(mut self, opts: &[&str]) -> Self {
        self.partition_opts = opts.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Run `script` and return its output lines in order.
    ///
    /// Only the final newline is dropped; blank lines in between are kept so
    /// callers see every response the session produced.
    pub fn run(&self, script: &str) -> Result<Vec<String>> {
        let result = self
            .runner
            .cmd(&self.program)
            .arg("-a")
            .arg_path(&self.disk)
            .arg(if self.read_write { "--rw" } else { "--ro" })
            .args(&self.partition_opts)
            .error_msg("guestfish session failed")
            .run_with_input(script.as_bytes())?;
        Ok(response_lines(&result.output))
    }
}

fn response_lines(output: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(output);
    let body = text.strip_suffix('\n').unwrap_or(&text);
    if body.is_empty() {
        return Vec::new();
    }
    body.split('\n').map(str::to_string).collect()
}

/// Mounts a disk image through FUSE with `guestmount`.
pub struct GuestMount {
    guestmount: PathBuf,
    unmount: PathBuf,
    disk: PathBuf,
    partition_opts: Vec<String>,
    read_write: bool,
}

impl GuestMount {
    pub fn new(guestmount: &Path, unmount: &Path, disk: &Path) -> Self {
        Self {
            guestmount: guestmount.to_path_buf(),
            unmount: unmount.to_path_buf(),
            disk: disk.to_path_buf(),
            partition_opts: DEFAULT_PARTITION_OPTS.iter().map(|s| s.to_string()).collect(),
            read_write: false,
        }
    }

    pub fn read_write(mut self) -> Self {
        self.read_write = true;
        self
    }

    /// Mount at `mntdir`, creating it if needed.
    ///
    /// The returned guard unmounts when dropped; call
    /// [`MountGuard::unmount`] to observe unmount errors.
    pub fn mount(&self, runner: &ProcessRunner, mntdir: &Path) -> Result<MountGuard> {
        let lock = DiskLock::acquire(&self.disk)?;
        fs::create_dir_all(mntdir)?;

        runner
            .cmd(&self.guestmount)
            .arg("-a")
            .arg_path(&self.disk)
            .arg(if self.read_write { "--rw" } else { "--ro" })
            .args(&self.partition_opts)
            .arg_path(mntdir)
            .error_msg("guestmount failed")
            .run()?;

        Ok(MountGuard {
            runner: runner.clone(),
            unmount: self.unmount.clone(),
            mntdir: mntdir.to_path_buf(),
            mounted: true,
            _lock: lock,
        })
    }
}

/// A mounted disk image. Released on drop.
pub struct MountGuard {
    runner: ProcessRunner,
    unmount: PathBuf,
    mntdir: PathBuf,
    mounted: bool,
    _lock: DiskLock,
}

impl MountGuard {
    pub fn path(&self) -> &Path {
        &self.mntdir
    }

    pub fn unmount(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        self.mounted = false;
        self.runner
            .cmd(&self.unmount)
            .arg("-u")
            .arg_path(&self.mntdir)
            .error_msg("unmount failed")
            .run()?;
        Ok(())
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            self.runner.logger().error(&format!(
                "failed to unmount {}: {}",
                self.mntdir.display(),
                e
            ));
        }
    }
}
