//! qcow2 disk image creation and partitioning.
//!
//! The image is created with `qemu-img` and then partitioned, formatted and
//! labelled through two scripted `guestfish` sessions:
//!
//! 1. initialize an MBR table and query the disk's byte and sector size
//! 2. add boot/swap/root, format them, mount root and create `/boot`
//!
//! The layout between the two is computed by [`partitions::plan`].

pub mod guestfs;
pub mod partitions;

pub use guestfs::{DiskLock, GuestFish, GuestMount, MountGuard};
pub use partitions::{plan, PartitionLayout};

use std::path::{Path, PathBuf};

use crate::config::{DiskConfig, ToolPaths};
use crate::error::{BuildError, Result};
use crate::process::ProcessRunner;

pub const DISK_FORMAT: &str = "qcow2";
pub const DEVICE: &str = "/dev/sda";

const QUERY_SCRIPT: &str = "launch
part-init /dev/sda mbr
blockdev-getsize64 /dev/sda
blockdev-getss /dev/sda
";

/// Number of query commands in [`QUERY_SCRIPT`], one response line each.
const QUERY_RESPONSES: usize = 2;

/// A created disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    pub path: PathBuf,
    pub format: String,
    pub size_mb: u64,
}

/// Creates and partitions disk images.
pub struct DiskAssembler {
    runner: ProcessRunner,
    tools: ToolPaths,
    boot_size_mb: u64,
    swap_size_mb: u64,
}

impl DiskAssembler {
    pub fn new(runner: ProcessRunner, tools: ToolPaths, disk: &DiskConfig) -> Self {
        Self {
            runner,
            tools,
            boot_size_mb: disk.boot_size_mb,
            swap_size_mb: disk.swap_size_mb,
        }
    }

    /// Create a partitioned, formatted image at `path`.
    pub fn create_disk(&self, path: &Path, os_name: &str, size_mb: u64) -> Result<PartitionLayout> {
        let image = self.create_image(path, size_mb)?;
        self.partition(&image, os_name)
    }

    /// Create an empty qcow2 image.
    pub fn create_image(&self, path: &Path, size_mb: u64) -> Result<DiskImage> {
        self.runner
            .cmd(&self.tools.qemu_img)
            .args(["create", "-f", DISK_FORMAT])
            .arg_path(path)
            .arg(format!("{}M", size_mb))
            .error_msg("qemu-img create failed")
            .run_interactive()?;

        Ok(DiskImage {
            path: path.to_path_buf(),
            format: DISK_FORMAT.to_string(),
            size_mb,
        })
    }

    /// Partition and format an existing image.
    pub fn partition(&self, image: &DiskImage, os_name: &str) -> Result<PartitionLayout> {
        let _lock = DiskLock::acquire(&image.path)?;
        let gf = GuestFish::new(&self.runner, &self.tools.guestfish, &image.path).read_write();

        let lines = gf.run(QUERY_SCRIPT)?;
        let (disk_bytes, sector_size) = parse_disk_geometry(&lines)?;
        self.runner.logger().debug(&format!(
            "bytesize: {} sectorsize: {}",
            disk_bytes, sector_size
        ));

        let layout = plan(disk_bytes, sector_size, self.boot_size_mb, self.swap_size_mb)?;

        let script = partition_script(&layout, os_name);
        self.runner
            .logger()
            .debug(&format!("Partition config: {}", script.trim_end()));
        gf.run(&script)?;

        Ok(layout)
    }

    /// Create `new_disk` as a copy-on-write overlay of `disk`.
    pub fn create_disk_snapshot(&self, disk: &Path, new_disk: &Path) -> Result<DiskImage> {
        self.runner
            .cmd(&self.tools.qemu_img)
            .args(["create", "-f", DISK_FORMAT, "-o"])
            .arg(format!("backing_file={}", disk.display()))
            .arg_path(new_disk)
            .error_msg("qemu-img snapshot failed")
            .run_interactive()?;
        self.describe(new_disk)
    }

    /// Flatten `src` into a standalone qcow2 image at `dest`.
    pub fn copy_disk(&self, src: &Path, dest: &Path) -> Result<DiskImage> {
        self.runner
            .cmd(&self.tools.qemu_img)
            .args(["convert", "-O", DISK_FORMAT])
            .arg_path(src)
            .arg_path(dest)
            .error_msg("qemu-img convert failed")
            .run_interactive()?;
        self.describe(dest)
    }

    fn describe(&self, path: &Path) -> Result<DiskImage> {
        let result = self
            .runner
            .cmd(&self.tools.qemu_img)
            .args(["info", "--output=json"])
            .arg_path(path)
            .quiet()
            .run()?;
        let info: serde_json::Value = serde_json::from_slice(&result.output).map_err(|_| {
            BuildError::ToolResponse {
                line: result.stdout_str(),
            }
        })?;
        let virtual_size = info
            .get("virtual-size")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let format = info
            .get("format")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(DISK_FORMAT);
        Ok(DiskImage {
            path: path.to_path_buf(),
            format: format.to_string(),
            size_mb: virtual_size / (1024 * 1024),
        })
    }
}

/// Parse the `(byte size, sector size)` response of [`QUERY_SCRIPT`].
fn parse_disk_geometry(lines: &[String]) -> Result<(u64, u64)> {
    if lines.len() != QUERY_RESPONSES {
        return Err(BuildError::ToolProtocolError {
            expected: QUERY_RESPONSES,
            actual: lines.len(),
        });
    }
    let parse = |line: &String| {
        line.trim()
            .parse::<u64>()
            .map_err(|_| BuildError::ToolResponse { line: line.clone() })
    };
    Ok((parse(&lines[0])?, parse(&lines[1])?))
}

/// Guestfish script that creates and formats the three partitions.
pub fn partition_script(layout: &PartitionLayout, os_name: &str) -> String {
    let [boot, swap, root] = layout.ranges();
    format!(
        "launch
part-add {dev} p {} {}
part-add {dev} p {} {}
part-add {dev} p {} {}
part-set-bootable {dev} 1 true
mkfs ext4 {dev}1
set-e2label {dev}1 {os}-boot
mkswap-L {os}-swap {dev}2
mkfs ext4 {dev}3
set-e2label {dev}3 {os}-root
mount {dev}3 /
mkdir /boot
",
        boot.0,
        boot.1,
        swap.0,
        swap.1,
        root.0,
        root.1,
        dev = DEVICE,
        os = os_name,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::CaptureLogger;
    use crate::test_support::{fake_tools, write_script};
    use std::fs;

    fn assembler(tools: ToolPaths) -> DiskAssembler {
        DiskAssembler::new(
            ProcessRunner::new(CaptureLogger::new()),
            tools,
            &DiskConfig::default(),
        )
    }

    /// guestfish stand-in: answers the geometry queries, records every script.
    fn geometry_guestfish(dir: &Path, answer: &str) -> PathBuf {
        let record = dir.join("scripts.log");
        let body = format!(
            "script=$(cat)\nprintf '%s\\n---\\n' \"$script\" >> {}\ncase \"$script\" in *blockdev-getss*) printf '{}' ;; esac\n",
            record.display(),
            answer
        );
        write_script(dir, "guestfish", &body)
    }

    #[test]
    fn test_partition_script_labels_and_bootable_flag() {
        let layout = plan(8192 * 1024 * 1024, 512, 200, 64).unwrap();
        let script = partition_script(&layout, "maui");

        assert!(script.contains("set-e2label /dev/sda1 maui-boot"));
        assert!(script.contains("mkswap-L maui-swap /dev/sda2"));
        assert!(script.contains("set-e2label /dev/sda3 maui-root"));
        let bootable: Vec<&str> = script
            .lines()
            .filter(|l| l.starts_with("part-set-bootable"))
            .collect();
        assert_eq!(bootable, vec!["part-set-bootable /dev/sda 1 true"]);
    }

    #[test]
    fn test_partition_script_ranges() {
        let layout = plan(8192 * 1024 * 1024, 512, 200, 64).unwrap();
        let script = partition_script(&layout, "maui");
        let adds: Vec<&str> = script.lines().filter(|l| l.starts_with("part-add")).collect();
        assert_eq!(
            adds,
            vec![
                "part-add /dev/sda p 64 409663",
                "part-add /dev/sda p 409664 540735",
                "part-add /dev/sda p 540736 16777215",
            ]
        );
        assert!(script.ends_with("mount /dev/sda3 /\nmkdir /boot\n"));
    }

    #[test]
    fn test_geometry_line_count_must_match() {
        let three = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        let one = vec!["8589934592".to_string()];
        assert!(matches!(
            parse_disk_geometry(&three),
            Err(BuildError::ToolProtocolError { expected: 2, actual: 3 })
        ));
        assert!(matches!(
            parse_disk_geometry(&one),
            Err(BuildError::ToolProtocolError { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_geometry_rejects_garbage() {
        let lines = vec!["8589934592".to_string(), "libguestfs: error".to_string()];
        assert!(matches!(
            parse_disk_geometry(&lines),
            Err(BuildError::ToolResponse { .. })
        ));
    }

    #[test]
    fn test_create_disk_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut tools = fake_tools(dir.path());
        tools.guestfish = geometry_guestfish(dir.path(), "8589934592\\n512\\n");
        let disk = dir.path().join("x.qcow2");

        let layout = assembler(tools).create_disk(&disk, "maui", 8192).unwrap();

        assert_eq!(layout.boot_offset, 64);
        assert_eq!(layout.swap_offset, layout.boot_offset + 409_600);
        let scripts = fs::read_to_string(dir.path().join("scripts.log")).unwrap();
        assert!(scripts.starts_with("launch\npart-init /dev/sda mbr\n"));
        assert!(scripts.contains("set-e2label /dev/sda3 maui-root"));
    }

    #[test]
    fn test_create_disk_rejects_extra_response_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut tools = fake_tools(dir.path());
        tools.guestfish = geometry_guestfish(dir.path(), "8589934592\\n512\\n4096\\n");

        let err = assembler(tools)
            .create_disk(&dir.path().join("x.qcow2"), "maui", 8192)
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::ToolProtocolError { expected: 2, actual: 3 }
        ));
        // The partitioning script must never have been sent.
        let scripts = fs::read_to_string(dir.path().join("scripts.log")).unwrap();
        assert!(!scripts.contains("part-add"));
    }

    #[test]
    fn test_create_disk_rejects_blank_response_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut tools = fake_tools(dir.path());
        tools.guestfish = geometry_guestfish(dir.path(), "8589934592\\n\\n512\\n");

        let err = assembler(tools)
            .create_disk(&dir.path().join("x.qcow2"), "maui", 8192)
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::ToolProtocolError { expected: 2, actual: 3 }
        ));
    }

    #[test]
    fn test_create_disk_fails_when_qemu_img_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut tools = fake_tools(dir.path());
        tools.qemu_img = write_script(dir.path(), "qemu-img", "exit 1\n");

        let err = assembler(tools)
            .create_disk(&dir.path().join("x.qcow2"), "maui", 8192)
            .unwrap_err();
        assert!(matches!(err, BuildError::ProcessExecutionFailure { .. }));
    }

    #[test]
    fn test_snapshot_and_copy_describe_result() {
        let dir = tempfile::tempdir().unwrap();
        let mut tools = fake_tools(dir.path());
        let body = format!(
            "echo \"$*\" >> {}\n[ \"$1\" = info ] && printf '{{\"format\": \"qcow2\", \"virtual-size\": 8589934592}}'\nexit 0\n",
            dir.path().join("qemu-img.log").display()
        );
        tools.qemu_img = write_script(dir.path(), "qemu-img", &body);
        let base = dir.path().join("base.qcow2");
        let snap = dir.path().join("snap.qcow2");
        let flat = dir.path().join("flat.qcow2");
        let assembler = assembler(tools);

        let image = assembler.create_disk_snapshot(&base, &snap).unwrap();
        assert_eq!(image.size_mb, 8192);
        assert_eq!(image.format, "qcow2");
        assembler.copy_disk(&snap, &flat).unwrap();

        let log = fs::read_to_string(dir.path().join("qemu-img.log")).unwrap();
        let calls: Vec<&str> = log.lines().collect();
        assert_eq!(
            calls[0],
            format!("create -f qcow2 -o backing_file={} {}", base.display(), snap.display())
        );
        assert_eq!(calls[2], format!("convert -O qcow2 {} {}", snap.display(), flat.display()));
    }
}
