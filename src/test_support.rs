//! Fake external tools for unit tests.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::ToolPaths;

/// Write an executable `/bin/sh` script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Every tool replaced by a script that succeeds without output.
pub fn fake_tools(dir: &Path) -> ToolPaths {
    ToolPaths {
        qemu_img: write_script(dir, "qemu-img", "exit 0\n"),
        guestfish: write_script(dir, "guestfish", "cat >/dev/null\nexit 0\n"),
        guestmount: write_script(dir, "guestmount", "exit 0\n"),
        fusermount: write_script(dir, "fusermount", "exit 0\n"),
        ostree: write_script(dir, "ostree", "exit 0\n"),
        qemu: None,
    }
}
