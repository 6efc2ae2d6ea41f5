//! Preflight checks for build validation.
//!
//! Verifies the external tools the pipeline drives are installed before
//! any disk is touched, so a missing tool fails fast with install hints
//! instead of halfway through a build.
//!
//! # Example
//!
//! ```rust
//! use disk_builder::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("guestfish") {
//!     println!("libguestfs-tools not installed");
//! }
//!
//! let tools = &[("ostree", "ostree"), ("qemu-img", "qemu-img")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};
use std::path::Path;

use crate::config::ToolPaths;

/// Check if a command exists on the host system.
///
/// Absolute or relative paths are checked directly; bare names are looked
/// up in `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    if cmd.contains('/') {
        return Path::new(cmd).is_file();
    }
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// Each tuple is (command, package). Returns an error listing every missing
/// tool with the package that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check every tool named in `tools`.
///
/// qemu is only checked when configured explicitly; otherwise it is
/// discovered at boot time.
pub fn check_host_tools(tools: &ToolPaths) -> Result<()> {
    let mut required = vec![
        (tools.qemu_img.to_string_lossy().into_owned(), "qemu-img"),
        (tools.guestfish.to_string_lossy().into_owned(), "libguestfs-tools"),
        (tools.guestmount.to_string_lossy().into_owned(), "libguestfs-tools"),
        (tools.fusermount.to_string_lossy().into_owned(), "fuse"),
        (tools.ostree.to_string_lossy().into_owned(), "ostree"),
    ];
    if let Some(qemu) = &tools.qemu {
        required.push((qemu.to_string_lossy().into_owned(), "qemu-kvm"));
    }
    let borrowed: Vec<(&str, &str)> = required.iter().map(|(t, p)| (t.as_str(), *p)).collect();
    check_required_tools(&borrowed)
}
