//! Run manifest written into the work directory of each pipeline run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub status: RunStatus,
    pub os_name: String,
    pub disk_path: PathBuf,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
}

impl RunManifest {
    pub fn start(os_name: &str, disk_path: &Path) -> Self {
        let now = utc_timestamp();
        Self {
            run_id: now.clone(),
            status: RunStatus::Running,
            os_name: os_name.to_string(),
            disk_path: disk_path.to_path_buf(),
            created_at_utc: now,
            finished_at_utc: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at_utc = Some(utc_timestamp());
    }
}

pub fn manifest_path(work_dir: &Path) -> PathBuf {
    work_dir.join(RUN_MANIFEST_FILENAME)
}

pub fn write_manifest(work_dir: &Path, manifest: &RunManifest) -> Result<()> {
    fs::create_dir_all(work_dir)
        .with_context(|| format!("creating work directory '{}'", work_dir.display()))?;
    let path = manifest_path(work_dir);
    let bytes = serde_json::to_vec_pretty(manifest)?;
    fs::write(&path, bytes)
        .with_context(|| format!("writing run manifest '{}'", path.display()))
}

pub fn load_manifest(work_dir: &Path) -> Result<Option<RunManifest>> {
    let path = manifest_path(work_dir);
    if !path.is_file() {
        return Ok(None);
    }
    let bytes =
        fs::read(&path).with_context(|| format!("reading run manifest '{}'", path.display()))?;
    let manifest = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing run manifest '{}'", path.display()))?;
    Ok(Some(manifest))
}

fn utc_timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_persists_final_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = RunManifest::start("maui", Path::new("/tmp/x.qcow2"));
        write_manifest(dir.path(), &manifest).unwrap();
        assert_eq!(
            load_manifest(dir.path()).unwrap().unwrap().status,
            RunStatus::Running
        );

        manifest.finish(RunStatus::Failed);
        write_manifest(dir.path(), &manifest).unwrap();

        let loaded = load_manifest(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, manifest);
        assert!(loaded.finished_at_utc.is_some());
        let raw = fs::read_to_string(manifest_path(dir.path())).unwrap();
        assert!(raw.contains("\"status\": \"failed\""));
    }

    #[test]
    fn test_missing_manifest_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_manifest(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_timestamp_shape() {
        let ts = utc_timestamp();
        assert_eq!(ts.len(), 16);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[8..9], "T");
    }
}
