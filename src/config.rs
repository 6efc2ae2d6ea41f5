//! Build configuration loaded from TOML.
//!
//! ```toml
//! os_name = "maui"
//!
//! [disk]
//! path = "build/maui.qcow2"
//! size_mb = 8192
//!
//! [deploy]
//! source_repo = "/srv/repo"
//! target_ref = "maui/buildmaster/x86_64-devel"
//!
//! [boot]
//! work_dir = "build/work"
//! data_dir = "/usr/share/disk-builder"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::disk::partitions::{DEFAULT_BOOT_SIZE_MB, DEFAULT_SWAP_SIZE_MB};

pub const CONFIG_FILENAME: &str = "config.toml";
pub const DEFAULT_DISK_SIZE_MB: u64 = 8 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub os_name: String,
    #[serde(default)]
    pub disk: DiskConfig,
    pub deploy: DeployConfig,
    pub boot: BootConfig,
    #[serde(default)]
    pub tools: ToolPaths,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DiskConfig {
    pub path: PathBuf,
    pub size_mb: u64,
    pub boot_size_mb: u64,
    pub swap_size_mb: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("disk.qcow2"),
            size_mb: DEFAULT_DISK_SIZE_MB,
            boot_size_mb: DEFAULT_BOOT_SIZE_MB,
            swap_size_mb: DEFAULT_SWAP_SIZE_MB,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployConfig {
    pub source_repo: PathBuf,
    pub target_ref: String,
    /// Pin a commit instead of following `target_ref`.
    pub revision: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootConfig {
    pub work_dir: PathBuf,
    /// Holds `tests/` with the journal export helper and its unit.
    pub data_dir: PathBuf,
    pub test_user: Option<TestUser>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestUser {
    pub name: String,
    pub password: Option<String>,
}

/// External programs. Each entry may be a bare name looked up in `PATH`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ToolPaths {
    pub qemu_img: PathBuf,
    pub guestfish: PathBuf,
    pub guestmount: PathBuf,
    pub fusermount: PathBuf,
    pub ostree: PathBuf,
    /// Discovered with [`crate::qemu::find_qemu`] when unset.
    pub qemu: Option<PathBuf>,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            qemu_img: PathBuf::from("qemu-img"),
            guestfish: PathBuf::from("guestfish"),
            guestmount: PathBuf::from("guestmount"),
            fusermount: PathBuf::from("fusermount"),
            ostree: PathBuf::from("ostree"),
            qemu: None,
        }
    }
}

/// Default config location: `<config dir>/disk-builder/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("disk-builder").join(CONFIG_FILENAME))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config '{}'", path.display()))?;
    parse_config(&text).with_context(|| format!("parsing config '{}'", path.display()))
}

pub fn parse_config(text: &str) -> Result<Config> {
    let config: Config = toml::from_str(text)?;

    let os_name = config.os_name.trim();
    if os_name.is_empty() || os_name.contains(['/', ' ']) {
        bail!(
            "invalid os_name '{}': must be a non-empty name without '/' or spaces",
            config.os_name
        );
    }
    if config.deploy.target_ref.trim().is_empty() {
        bail!("deploy.target_ref must not be empty");
    }
    Ok(config)
}
