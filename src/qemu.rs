//! QEMU command construction and binary discovery.
//!
//! The virtual hardware is fixed so boot results stay comparable between
//! runs: std VGA, 768M of memory, a USB tablet and a single core.

use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};
use crate::process::{Cmd, ProcessRunner};

pub const DEFAULT_QEMU_OPTS: &[&str] = &[
    "-vga",
    "std",
    "-m",
    "768M",
    "-usb",
    "-usbdevice",
    "tablet",
    "-smp",
    "1,sockets=1,cores=1,threads=1",
];

/// Name of the virtio-serial port the guest exports its journal on.
pub const JOURNAL_PORT_NAME: &str = "org.maui.journaljson";

/// Monitor socket, relative to the working directory qemu runs in.
pub const MONITOR_SOCKET: &str = "qemu.monitor";

const FALLBACK_PATHS: &[&str] = &["/usr/libexec/qemu-kvm"];

/// Find a KVM-capable qemu binary.
///
/// Order: `configured`, `qemu-kvm` and `kvm` on `PATH`, then distro
/// locations outside `PATH`.
pub fn find_qemu(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }
    for name in ["qemu-kvm", "kvm"] {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }
    FALLBACK_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .ok_or_else(|| BuildError::not_found("qemu-kvm", PathBuf::from("qemu-kvm")))
}

/// Builder for a direct-kernel-boot QEMU command.
#[derive(Default)]
pub struct QemuBuilder {
    program: PathBuf,
    disk: Option<PathBuf>,
    console_output: Option<PathBuf>,
    journal_output: Option<PathBuf>,
    monitor: bool,
    kernel: Option<PathBuf>,
    initrd: Option<PathBuf>,
    append: Option<String>,
}

impl QemuBuilder {
    pub fn new(program: &Path) -> Self {
        Self {
            program: program.to_path_buf(),
            ..Default::default()
        }
    }

    pub fn disk(mut self, path: &Path) -> Self {
        self.disk = Some(path.to_path_buf());
        self
    }

    /// Redirect the guest serial console to a file.
    pub fn console_output(mut self, path: &Path) -> Self {
        self.console_output = Some(path.to_path_buf());
        self
    }

    /// Capture the guest journal from the virtio-serial port into a file.
    pub fn journal_output(mut self, path: &Path) -> Self {
        self.journal_output = Some(path.to_path_buf());
        self
    }

    /// Expose a QMP monitor on [`MONITOR_SOCKET`].
    pub fn monitor(mut self) -> Self {
        self.monitor = true;
        self
    }

    pub fn kernel(mut self, kernel: &Path, initrd: &Path) -> Self {
        self.kernel = Some(kernel.to_path_buf());
        self.initrd = Some(initrd.to_path_buf());
        self
    }

    pub fn append(mut self, cmdline: &str) -> Self {
        self.append = Some(cmdline.to_string());
        self
    }

    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = DEFAULT_QEMU_OPTS.iter().map(|s| s.to_string()).collect();

        if let Some(disk) = &self.disk {
            args.push("-drive".into());
            args.push(format!("file={},if=virtio", disk.display()));
        }

        args.push("-vnc".into());
        args.push("none".into());

        if let Some(console) = &self.console_output {
            args.push("-serial".into());
            args.push(format!("file:{}", console.display()));
        }

        if self.monitor {
            args.extend([
                "-chardev".to_string(),
                format!("socket,id=charmonitor,path={},server,nowait", MONITOR_SOCKET),
                "-mon".to_string(),
                "chardev=charmonitor,id=monitor,mode=control".to_string(),
            ]);
        }

        if let Some(journal) = &self.journal_output {
            args.extend([
                "-device".to_string(),
                "virtio-serial".to_string(),
                "-chardev".to_string(),
                format!("file,id=journaljson,path={}", journal.display()),
                "-device".to_string(),
                format!("virtserialport,chardev=journaljson,name={}", JOURNAL_PORT_NAME),
            ]);
        }

        if let (Some(kernel), Some(initrd)) = (&self.kernel, &self.initrd) {
            args.push("-kernel".into());
            args.push(kernel.display().to_string());
            args.push("-initrd".into());
            args.push(initrd.display().to_string());
        }

        if let Some(append) = &self.append {
            args.push("-append".into());
            args.push(append.clone());
        }

        args
    }

    pub fn build(&self, runner: &ProcessRunner) -> Cmd {
        runner.cmd(&self.program).args(self.args())
    }
}
