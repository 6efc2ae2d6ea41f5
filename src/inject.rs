//! Test payloads injected into a deployment before a validation boot.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};

pub const EXPORT_JOURNAL_SCRIPT: &str = "mauibuild-export-journal-to-serialdev";
pub const EXPORT_JOURNAL_SERVICE: &str = "mauibuild-export-journal-to-serialdev.service";

/// `<current-etc>/systemd/system/multi-user.target.wants`.
pub fn multiuser_wants_dir(current_etc_dir: &Path) -> PathBuf {
    current_etc_dir
        .join("systemd")
        .join("system")
        .join("multi-user.target.wants")
}

/// Install the journal export helper and enable its unit.
///
/// Both come from `<data_dir>/tests/`.
pub fn inject_export_journal(
    current_dir: &Path,
    current_etc_dir: &Path,
    data_dir: &Path,
) -> Result<()> {
    let tests_dir = data_dir.join("tests");
    let script = tests_dir.join(EXPORT_JOURNAL_SCRIPT);
    let service = tests_dir.join(EXPORT_JOURNAL_SERVICE);
    for payload in [&script, &service] {
        if !payload.is_file() {
            return Err(BuildError::not_found("test payload", payload));
        }
    }

    let bin_dir = current_dir.join("usr").join("bin");
    fs::create_dir_all(&bin_dir)?;
    let export_bin = bin_dir.join(EXPORT_JOURNAL_SCRIPT);
    fs::copy(&script, &export_bin)?;
    fs::set_permissions(&export_bin, fs::Permissions::from_mode(0o755))?;

    let wants_dir = multiuser_wants_dir(current_etc_dir);
    fs::create_dir_all(&wants_dir)?;
    fs::copy(&service, wants_dir.join(EXPORT_JOURNAL_SERVICE))?;
    Ok(())
}

/// Unit that creates `username` on first boot.
///
/// Without a password the account is left passwordless.
pub fn add_user_service(username: &str, password: Option<&str>) -> String {
    let exec_line = match password {
        Some(password) => format!(
            "/bin/sh -c \"/usr/sbin/useradd {user}; echo {password} | passwd --stdin {user}\"",
            user = username,
            password = password
        ),
        None => format!(
            "/bin/sh -c \"/usr/sbin/useradd {user}; passwd -d {user}\"",
            user = username
        ),
    };
    format!(
        "[Unit]
Description=Add user {}
Before=sddm.service

[Service]
ExecStart={}
Type=oneshot
",
        username, exec_line
    )
}

/// Enable a oneshot unit that creates a test user at boot.
pub fn inject_test_user_creation(
    current_etc_dir: &Path,
    os_name: &str,
    username: &str,
    password: Option<&str>,
) -> Result<PathBuf> {
    let wants_dir = multiuser_wants_dir(current_etc_dir);
    fs::create_dir_all(&wants_dir)?;
    let path = wants_dir.join(format!("{}-add-user-{}.service", os_name, username));
    fs::write(&path, add_user_service(username, password))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_dir(root: &Path) -> PathBuf {
        let data = root.join("data");
        fs::create_dir_all(data.join("tests")).unwrap();
        fs::write(data.join("tests").join(EXPORT_JOURNAL_SCRIPT), "#!/bin/sh\n").unwrap();
        fs::write(data.join("tests").join(EXPORT_JOURNAL_SERVICE), "[Unit]\n").unwrap();
        data
    }

    #[test]
    fn test_export_journal_is_installed_and_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join("current");
        let current_etc = dir.path().join("current-etc");

        inject_export_journal(&current, &current_etc, &data_dir(dir.path())).unwrap();

        let bin = current.join("usr/bin").join(EXPORT_JOURNAL_SCRIPT);
        let mode = fs::metadata(&bin).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(multiuser_wants_dir(&current_etc)
            .join(EXPORT_JOURNAL_SERVICE)
            .is_file());
    }

    #[test]
    fn test_missing_payload() {
        let dir = tempfile::tempdir().unwrap();
        let err = inject_export_journal(
            &dir.path().join("current"),
            &dir.path().join("current-etc"),
            &dir.path().join("nodata"),
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::ResourceNotFound { .. }));
    }

    #[test]
    fn test_user_unit_without_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = inject_test_user_creation(dir.path(), "maui", "tester", None).unwrap();

        assert!(path.ends_with("multi-user.target.wants/maui-add-user-tester.service"));
        let unit = fs::read_to_string(path).unwrap();
        assert!(unit.starts_with("[Unit]\nDescription=Add user tester\nBefore=sddm.service\n"));
        assert!(unit.contains("ExecStart=/bin/sh -c \"/usr/sbin/useradd tester; passwd -d tester\"\n"));
        assert!(unit.ends_with("Type=oneshot\n"));
    }

    #[test]
    fn test_user_unit_with_password() {
        let unit = add_user_service("tester", Some("secret"));
        assert!(unit.contains("echo secret | passwd --stdin tester"));
    }
}
