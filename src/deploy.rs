//! OSTree deployment rollout into a mounted disk image.
//!
//! Every rollout starts from a clean slate: an existing deployment directory
//! for the OS is deleted before `os-init`. Reusing a previous deployment
//! through the guestfs FUSE mount has produced filesystem inconsistencies
//! (https://bugzilla.redhat.com/show_bug.cgi?id=892834), so there is no
//! incremental update. Config files can still be adjusted after the
//! rollout by mounting the image again.

use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::Result;
use crate::process::{Cmd, ProcessRunner};

/// Set for every ostree invocation against a guestmount'ed tree.
pub const FUSE_WORKAROUND_ENV: (&str, &str) = ("LIBGSYSTEM_ENABLE_GUESTFS_FUSE_WORKAROUND", "1");

/// Progress of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployState {
    Uninitialized,
    FsInitialized,
    OsInitialized,
    Deployed,
    Pruned,
}

/// A rolled-out OS revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub os_name: String,
    pub target_ref: String,
    pub revision: Option<String>,
    /// Local repository inside the image.
    pub repo_path: PathBuf,
    pub deploy_root_dir: PathBuf,
    pub deploy_etc_dir: PathBuf,
}

impl Deployment {
    /// What was actually pulled: the pinned revision, or the ref.
    pub fn rev_or_target(&self) -> &str {
        self.revision.as_deref().unwrap_or(&self.target_ref)
    }
}

/// `<mnt>/ostree/deploy/<os>`.
pub fn os_deploy_dir(mount_dir: &Path, os_name: &str) -> PathBuf {
    mount_dir.join("ostree").join("deploy").join(os_name)
}

/// `(current, current-etc)` for an OS inside a mounted image.
pub fn deploy_dirs(mount_dir: &Path, os_name: &str) -> (PathBuf, PathBuf) {
    let base = os_deploy_dir(mount_dir, os_name);
    (base.join("current"), base.join("current-etc"))
}

/// Drives `ostree admin` against a mounted image.
pub struct DeploymentManager {
    runner: ProcessRunner,
    ostree: PathBuf,
}

impl DeploymentManager {
    pub fn new(runner: ProcessRunner, ostree: &Path) -> Self {
        Self {
            runner,
            ostree: ostree.to_path_buf(),
        }
    }

    /// Pull `revision` (or `target_ref`) from `source_repo` and deploy it.
    ///
    /// Stops at the first failing ostree invocation.
    pub fn pull_deploy(
        &self,
        mount_dir: &Path,
        source_repo: &Path,
        os_name: &str,
        target_ref: &str,
        revision: Option<&str>,
    ) -> Result<Deployment> {
        let boot_dir = mount_dir.join("boot");
        let ostree_dir = mount_dir.join("ostree");
        let os_dir = os_deploy_dir(mount_dir, os_name);
        let (deploy_root_dir, deploy_etc_dir) = deploy_dirs(mount_dir, os_name);
        let deployment = Deployment {
            os_name: os_name.to_string(),
            target_ref: target_ref.to_string(),
            revision: revision.map(str::to_string),
            repo_path: ostree_dir.join("repo"),
            deploy_root_dir,
            deploy_etc_dir,
        };
        let rev_or_target = deployment.rev_or_target();

        let mut state = DeployState::Uninitialized;

        if !mount_dir.join("proc").exists() {
            self.admin(&ostree_dir, &boot_dir)
                .arg("init-fs")
                .arg_path(mount_dir)
                .run_interactive()?;
        }
        self.advance(&mut state, DeployState::FsInitialized);

        if os_dir.exists() {
            let entries = WalkDir::new(&os_dir).into_iter().filter_map(|e| e.ok()).count();
            self.runner.logger().info(&format!(
                "Removing previous deployment {} ({} entries)",
                os_dir.display(),
                entries
            ));
            fs::remove_dir_all(&os_dir)?;
        }

        self.admin(&ostree_dir, &boot_dir)
            .args(["os-init", os_name])
            .run_interactive()?;
        self.advance(&mut state, DeployState::OsInitialized);

        self.ostree()
            .arg(format!("--repo={}", deployment.repo_path.display()))
            .arg("pull-local")
            .arg_path(source_repo)
            .arg(rev_or_target)
            .run_interactive()?;

        self.admin(&ostree_dir, &boot_dir)
            .args(["deploy", "--no-kernel", os_name, target_ref, rev_or_target])
            .run_interactive()?;

        self.admin(&ostree_dir, &boot_dir)
            .args(["update-kernel", "--no-bootloader", os_name])
            .run_interactive()?;
        self.advance(&mut state, DeployState::Deployed);

        self.admin(&ostree_dir, &boot_dir)
            .args(["prune", os_name])
            .run_interactive()?;
        self.advance(&mut state, DeployState::Pruned);

        Ok(deployment)
    }

    fn advance(&self, state: &mut DeployState, next: DeployState) {
        self.runner
            .logger()
            .debug(&format!("deployment {:?} -> {:?}", state, next));
        *state = next;
    }

    fn ostree(&self) -> Cmd {
        self.runner
            .cmd(&self.ostree)
            .env(FUSE_WORKAROUND_ENV.0, FUSE_WORKAROUND_ENV.1)
            .log_success()
    }

    fn admin(&self, ostree_dir: &Path, boot_dir: &Path) -> Cmd {
        self.ostree()
            .arg("admin")
            .arg(format!("--ostree-dir={}", ostree_dir.display()))
            .arg(format!("--boot-dir={}", boot_dir.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildError;
    use crate::logger::CaptureLogger;
    use crate::test_support::write_script;

    /// Stand-in for `ostree` that fakes the filesystem effects we rely on
    /// and logs each call with the workaround flag it saw.
    fn fake_ostree(dir: &Path, failing_subcommand: &str) -> PathBuf {
        let body = format!(
            r#"echo "$* flag=$LIBGSYSTEM_ENABLE_GUESTFS_FUSE_WORKAROUND" >> {log}
if [ "$1" = admin ]; then
  dir="${{2#--ostree-dir=}}"
  [ "$4" = "{fail}" ] && exit 1
  case "$4" in
    init-fs) mkdir -p "$5/proc" ;;
    os-init) mkdir -p "$dir/deploy/$5/current" "$dir/deploy/$5/current-etc" ;;
    deploy) touch "$dir/deploy/$6/current/deployed-$$" ;;
  esac
fi
exit 0
"#,
            log = dir.join("ostree.log").display(),
            fail = failing_subcommand,
        );
        write_script(dir, "ostree", &body)
    }

    fn calls(dir: &Path) -> Vec<String> {
        fs::read_to_string(dir.join("ostree.log"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_pull_deploy_runs_admin_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mnt = dir.path().join("mnt");
        fs::create_dir_all(&mnt).unwrap();
        let manager = DeploymentManager::new(
            ProcessRunner::new(CaptureLogger::new()),
            &fake_ostree(dir.path(), "none"),
        );

        let deployment = manager
            .pull_deploy(&mnt, Path::new("/srv/repo"), "maui", "maui/devel", None)
            .unwrap();

        assert_eq!(deployment.rev_or_target(), "maui/devel");
        assert_eq!(deployment.deploy_root_dir, mnt.join("ostree/deploy/maui/current"));
        assert_eq!(deployment.deploy_etc_dir, mnt.join("ostree/deploy/maui/current-etc"));

        let calls = calls(dir.path());
        let subcommands: Vec<&str> = calls
            .iter()
            .map(|c| {
                c.split_whitespace()
                    .find(|w| !w.starts_with("--") && *w != "admin")
                    .unwrap()
            })
            .collect();
        assert_eq!(
            subcommands,
            vec!["init-fs", "os-init", "pull-local", "deploy", "update-kernel", "prune"]
        );
        assert!(calls.iter().all(|c| c.ends_with("flag=1")));
        assert!(calls[3].contains("deploy --no-kernel maui maui/devel maui/devel"));
        assert!(calls[4].contains("update-kernel --no-bootloader maui"));
    }

    #[test]
    fn test_revision_takes_precedence_over_ref() {
        let dir = tempfile::tempdir().unwrap();
        let mnt = dir.path().join("mnt");
        fs::create_dir_all(mnt.join("proc")).unwrap();
        let manager = DeploymentManager::new(
            ProcessRunner::new(CaptureLogger::new()),
            &fake_ostree(dir.path(), "none"),
        );

        manager
            .pull_deploy(&mnt, Path::new("/srv/repo"), "maui", "maui/devel", Some("abc123"))
            .unwrap();

        let calls = calls(dir.path());
        // /proc already present: no init-fs.
        assert!(!calls.iter().any(|c| c.contains("init-fs")));
        assert!(calls[1].contains("pull-local /srv/repo abc123"));
        assert!(calls[2].contains("deploy --no-kernel maui maui/devel abc123"));
    }

    #[test]
    fn test_second_rollout_purges_first() {
        let dir = tempfile::tempdir().unwrap();
        let mnt = dir.path().join("mnt");
        fs::create_dir_all(&mnt).unwrap();
        let manager = DeploymentManager::new(
            ProcessRunner::new(CaptureLogger::new()),
            &fake_ostree(dir.path(), "none"),
        );
        let repo = Path::new("/srv/repo");

        let first = manager.pull_deploy(&mnt, repo, "maui", "maui/devel", None).unwrap();
        fs::write(first.deploy_etc_dir.join("hostname"), "stale\n").unwrap();
        let first_markers: Vec<_> = fs::read_dir(&first.deploy_root_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(first_markers.len(), 1);

        let second = manager.pull_deploy(&mnt, repo, "maui", "maui/devel", None).unwrap();

        let leftovers: Vec<_> = WalkDir::new(os_deploy_dir(&mnt, "maui"))
            .into_iter()
            .map(|e| e.unwrap().file_name().to_owned())
            .collect();
        assert!(!leftovers.contains(&first_markers[0]));
        assert!(!second.deploy_etc_dir.join("hostname").exists());
        assert_eq!(fs::read_dir(&second.deploy_root_dir).unwrap().count(), 1);
    }

    #[test]
    fn test_failure_aborts_remaining_steps() {
        let dir = tempfile::tempdir().unwrap();
        let mnt = dir.path().join("mnt");
        fs::create_dir_all(&mnt).unwrap();
        let manager = DeploymentManager::new(
            ProcessRunner::new(CaptureLogger::new()),
            &fake_ostree(dir.path(), "deploy"),
        );

        let err = manager
            .pull_deploy(&mnt, Path::new("/srv/repo"), "maui", "maui/devel", None)
            .unwrap_err();

        assert!(matches!(
            err,
            BuildError::ProcessExecutionFailure { exit_status: 1, .. }
        ));
        let calls = calls(dir.path());
        assert!(!calls.iter().any(|c| c.contains("update-kernel") || c.contains("prune")));
    }
}
