//! Build and boot-validate OSTree-based disk images.
//!
//! The pipeline drives external tools end to end:
//!
//! - **Disk creation** - `qemu-img` allocates a qcow2 image, `guestfish`
//!   partitions and formats it (boot, swap, root)
//! - **Deployment** - the image is mounted with `guestmount` and an OSTree
//!   revision is pulled and deployed into it
//! - **Boot configuration** - fstab and syslinux.cfg for the deployed kernel
//! - **Validation** - the image boots once under QEMU to install its
//!   bootloader; the exit is observed asynchronously
//!
//! # Architecture
//!
//! ```text
//! disk-builder (bin)
//!     │
//!     └── Pipeline
//!           ├── DiskAssembler ─── qemu-img, guestfish
//!           ├── GuestMount ────── guestmount, fusermount
//!           ├── DeploymentManager ─ ostree admin
//!           ├── BootloaderConfigurator
//!           └── BootValidator ─── qemu (watched by MainLoop)
//! ```
//!
//! Every external invocation goes through [`process::ProcessRunner`], which
//! logs failures through the injected [`logger::Logger`].

pub mod artifact;
pub mod bootloader;
pub mod config;
pub mod deploy;
pub mod error;
pub mod inject;
pub mod logger;
pub mod manifest;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod qemu;
pub mod validate;

#[cfg(test)]
pub(crate) mod test_support;

pub use artifact::disk::{DiskAssembler, GuestMount, PartitionLayout};
pub use config::{load_config, Config};
pub use error::{BuildError, Result};
pub use logger::{ConsoleLogger, Logger, SharedLogger};
pub use pipeline::{BuildRun, Pipeline};
pub use process::{MainLoop, ProcessResult, ProcessRunner};
pub use validate::{BootOutcome, VmBootSession};
