//! syslinux and fstab configuration for a deployed image.

use std::fs;
use std::path::{Path, PathBuf};

use crate::deploy::deploy_dirs;
use crate::error::{BuildError, Result};
use crate::logger::SharedLogger;

pub const KERNEL_PREFIX: &str = "vmlinuz-";

/// Boot configuration derived from the deployed kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderConfig {
    pub kernel_path: PathBuf,
    pub initramfs_path: PathBuf,
    pub kernel_release: String,
    pub boot_relative_kernel_path: PathBuf,
    pub boot_relative_initramfs_path: PathBuf,
    pub cmdline: String,
}

/// First `vmlinuz-*` entry in the deployment's boot directory.
///
/// Entries are sorted by name so the pick is stable across runs.
pub fn find_current_kernel(mount_dir: &Path, os_name: &str) -> Result<PathBuf> {
    let (current_dir, _) = deploy_dirs(mount_dir, os_name);
    let deploy_boot_dir = current_dir.join("boot");

    let mut names = match fs::read_dir(&deploy_boot_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    names.sort();

    names
        .into_iter()
        .find(|name| name.starts_with(KERNEL_PREFIX))
        .map(|name| deploy_boot_dir.join(name))
        .ok_or_else(|| BuildError::not_found(format!("{}*", KERNEL_PREFIX), deploy_boot_dir))
}

/// Kernel release: everything after the first `-` of the file name.
pub fn parse_kernel_release(kernel_path: &Path) -> Result<String> {
    let name = kernel_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.split_once('-') {
        Some((_, release)) if !release.is_empty() => Ok(release.to_string()),
        _ => Err(BuildError::not_found(
            "kernel release in file name",
            kernel_path,
        )),
    }
}

/// `<boot>/ostree/initramfs-<release>.img`, which must exist.
pub fn initramfs_path(boot_dir: &Path, kernel_release: &str) -> Result<PathBuf> {
    let path = boot_dir
        .join("ostree")
        .join(format!("initramfs-{}.img", kernel_release));
    if !path.exists() {
        return Err(BuildError::not_found("initramfs", path));
    }
    Ok(path)
}

/// Kernel command line for the syslinux entry.
pub fn kernel_cmdline(os_name: &str) -> String {
    format!(
        "root=LABEL={os}-root rw quiet splash ostree={os}/current",
        os = os_name
    )
}

/// syslinux.cfg with one entry for `os_name`.
pub fn syslinux_config(os_name: &str, config: &BootloaderConfig) -> String {
    format!(
        "PROMPT 1
TIMEOUT 50
DEFAULT {os}

LABEL {os}
    LINUX /{kernel}
    APPEND {cmdline}
    INITRD /{initramfs}
",
        os = os_name,
        kernel = config.boot_relative_kernel_path.display(),
        cmdline = config.cmdline,
        initramfs = config.boot_relative_initramfs_path.display(),
    )
}

/// Writes boot configuration into a mounted image.
pub struct BootloaderConfigurator {
    logger: SharedLogger,
}

impl BootloaderConfigurator {
    pub fn new(logger: SharedLogger) -> Self {
        Self { logger }
    }

    /// Write fstab and syslinux.cfg for `os_name`.
    ///
    /// `boot_dir` is where the bootloader will see `/` once booted,
    /// normally `<mount_dir>/boot`; paths in the config are relative to it.
    pub fn configure(
        &self,
        mount_dir: &Path,
        boot_dir: &Path,
        os_name: &str,
    ) -> Result<BootloaderConfig> {
        let deploy_kernel_path = find_current_kernel(mount_dir, os_name)?;
        let kernel_name = deploy_kernel_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        let kernel_path = boot_dir.join("ostree").join(kernel_name);
        if !kernel_path.exists() {
            return Err(BuildError::not_found("kernel", kernel_path));
        }
        let kernel_release = parse_kernel_release(&deploy_kernel_path)?;
        let initramfs_path = initramfs_path(boot_dir, &kernel_release)?;

        // fstab generation isn't implemented yet; the deployment boots by
        // label from the kernel command line.
        let (_, current_etc_dir) = deploy_dirs(mount_dir, os_name);
        if !current_etc_dir.is_dir() {
            return Err(BuildError::not_found("deployment etc", current_etc_dir));
        }
        fs::write(current_etc_dir.join("fstab"), "")?;

        let config = BootloaderConfig {
            boot_relative_kernel_path: boot_relative(boot_dir, &kernel_path)?,
            boot_relative_initramfs_path: boot_relative(boot_dir, &initramfs_path)?,
            kernel_path,
            initramfs_path,
            kernel_release,
            cmdline: kernel_cmdline(os_name),
        };

        let syslinux_dir = boot_dir.join("syslinux");
        fs::create_dir_all(&syslinux_dir)?;
        let conf_path = syslinux_dir.join("syslinux.cfg");
        fs::write(&conf_path, syslinux_config(os_name, &config))?;
        self.logger.info(&format!(
            "Wrote {} for kernel {}",
            conf_path.display(),
            config.kernel_release
        ));

        Ok(config)
    }
}

/// Append `kernel_args` to every `APPEND` line of an existing syslinux.cfg.
pub fn append_kernel_args(boot_dir: &Path, kernel_args: &[&str]) -> Result<()> {
    let conf_path = boot_dir.join("syslinux").join("syslinux.cfg");
    let conf = fs::read_to_string(&conf_path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => BuildError::not_found("syslinux config", &conf_path),
        _ => e.into(),
    })?;

    let extra = kernel_args.join(" ");
    let modified = conf
        .split('\n')
        .map(|line| {
            if line.trim_start().starts_with("APPEND ") {
                format!("{} {}", line, extra)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(&conf_path, modified)?;
    Ok(())
}

fn boot_relative(boot_dir: &Path, path: &Path) -> Result<PathBuf> {
    path.strip_prefix(boot_dir)
        .map(Path::to_path_buf)
        .map_err(|_| BuildError::not_found("file under boot directory", path))
}
