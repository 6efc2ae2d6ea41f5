//! Disk image artifacts.
//!
//! - [`disk`] - qcow2 creation, partitioning and guestfs access

pub mod disk;
