//! Partition layout for the boot/swap/root MBR scheme.

use crate::error::{BuildError, Result};

/// First usable sector; also reserved again at the end of the disk.
pub const RESERVED_SECTORS: u64 = 64;

pub const DEFAULT_BOOT_SIZE_MB: u64 = 200;
pub const DEFAULT_SWAP_SIZE_MB: u64 = 64;

/// Sector offsets of the three partitions.
///
/// Offsets are exclusive ends: partition 1 spans
/// `boot_offset..=swap_offset - 1`, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLayout {
    pub sector_size: u64,
    pub boot_offset: u64,
    pub swap_offset: u64,
    pub root_offset: u64,
    pub end_offset: u64,
}

impl PartitionLayout {
    pub fn boot_sectors(&self) -> u64 {
        self.swap_offset - self.boot_offset
    }

    pub fn swap_sectors(&self) -> u64 {
        self.root_offset - self.swap_offset
    }

    pub fn root_sectors(&self) -> u64 {
        self.end_offset - self.root_offset
    }

    /// Inclusive `(start, end)` sector ranges for boot, swap and root.
    pub fn ranges(&self) -> [(u64, u64); 3] {
        [
            (self.boot_offset, self.swap_offset - 1),
            (self.swap_offset, self.root_offset - 1),
            (self.root_offset, self.end_offset - 1),
        ]
    }
}

/// Convert a size in MB to sectors.
///
/// Integer arithmetic in exactly this order: `mb * 1024 / sector_size * 1024`.
/// For sector sizes that don't divide 1024 * mb this truncates before the
/// final multiply; layouts depend on that, so don't reorder it.
///
/// `None` when the result doesn't fit in a `u64` or `sector_size` is 0.
pub fn mb_to_sectors(size_mb: u64, sector_size: u64) -> Option<u64> {
    size_mb
        .checked_mul(1024)?
        .checked_div(sector_size)?
        .checked_mul(1024)
}

/// Compute the partition layout for a disk.
pub fn plan(
    disk_bytes: u64,
    sector_size: u64,
    boot_size_mb: u64,
    swap_size_mb: u64,
) -> Result<PartitionLayout> {
    if sector_size == 0 {
        return Err(BuildError::Layout("sector size is 0".to_string()));
    }

    let region_sectors = |what: &str, size_mb: u64| {
        mb_to_sectors(size_mb, sector_size).ok_or_else(|| {
            BuildError::Layout(format!("{} size of {} MB is out of range", what, size_mb))
        })
    };
    let boot_sectors = region_sectors("boot", boot_size_mb)?;
    let swap_sectors = region_sectors("swap", swap_size_mb)?;
    if boot_sectors == 0 || swap_sectors == 0 {
        return Err(BuildError::Layout(format!(
            "boot ({} MB) and swap ({} MB) must each span at least one {}-byte sector",
            boot_size_mb, swap_size_mb, sector_size
        )));
    }

    let disk_sectors = disk_bytes / sector_size;
    let root_sectors = boot_sectors
        .checked_add(swap_sectors)
        .and_then(|used| used.checked_add(RESERVED_SECTORS))
        .and_then(|used| disk_sectors.checked_sub(used))
        .filter(|&sectors| sectors > 0)
        .ok_or_else(|| {
            BuildError::Layout(format!(
                "no room for root: disk has {} sectors, boot {} + swap {} + reserve {}",
                disk_sectors, boot_sectors, swap_sectors, RESERVED_SECTORS
            ))
        })?;

    let boot_offset = RESERVED_SECTORS;
    let swap_offset = boot_offset + boot_sectors;
    let root_offset = swap_offset + swap_sectors;
    let end_offset = root_offset + root_sectors;

    Ok(PartitionLayout {
        sector_size,
        boot_offset,
        swap_offset,
        root_offset,
        end_offset,
    })
}
