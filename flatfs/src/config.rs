//! On-disk constants and volume geometry.
use crate::error::{FsError, Result};

/// Every block on the device, including the superblock, is 4K.
pub const BLOCK_SIZE: usize = 4096;

/// Identifies a formatted volume, "FLAT".
pub const MAGIC: u32 = 0x464C_4154;

/// Known locations.
pub const SUPERBLOCK_NR: u32 = 0;
pub const INODE_STORE_START: u32 = 1;

/// The root directory always lives in inode 0 and is never released.
pub const ROOT_INO: u32 = 0;

/// Width of the name field of a directory entry. Names shorter than the field are
/// NUL padded, names exactly this long are stored without a terminator.
pub const FILENAME_LEN: usize = 28;

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFREG: u32 = 0o100_000;
pub const PERM_MASK: u32 = 0o7777;
pub const ROOT_DEFAULT_MODE: u32 = S_IFDIR | 0o755;

/// Bits tracked by one bitmap block.
pub const BITS_PER_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;

/// Each inode record is five little endian u32 fields.
pub const INODE_SIZE: usize = 20;
pub const INODES_PER_BLOCK: u32 = (BLOCK_SIZE / INODE_SIZE) as u32;

/// Name field plus a 4 byte inode id.
pub const DIR_ENTRY_SIZE: usize = FILENAME_LEN + 4;
pub const MAX_DIR_ENTRIES: usize = BLOCK_SIZE / DIR_ENTRY_SIZE;

/// A file owns one extent block of u32 block pointers and nothing else, which
/// caps every file at 4 MiB.
pub const MAX_FILE_BLOCKS: usize = BLOCK_SIZE / 4;
pub const MAX_FILE_SIZE: u64 = (MAX_FILE_BLOCKS * BLOCK_SIZE) as u64;

/// Describes how a fresh volume should be carved out of a device.
///
/// ```
/// use flatfs::FormatOptions;
///
/// let opts = FormatOptions::new(64).with_inodes(80);
/// let geometry = opts.geometry().unwrap();
/// assert_eq!(geometry.data_start(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct FormatOptions {
    block_count: u32,
    inode_count: Option<u32>,
}

impl FormatOptions {
    /// Formats `block_count` blocks. By default one inode is reserved for every
    /// four blocks on the device.
    pub fn new(block_count: u32) -> Self {
        Self {
            block_count,
            inode_count: None,
        }
    }

    /// Sets the number of inodes, which is the upper bound on how many files and
    /// directories can exist on the volume.
    pub fn with_inodes(mut self, inode_count: u32) -> Self {
        self.inode_count = Some(inode_count);
        self
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Derives the block ranges of every metadata region. Fails when the device
    /// is too small to hold the metadata plus the root directory block.
    pub fn geometry(&self) -> Result<Geometry> {
        let inode_count = self
            .inode_count
            .unwrap_or_else(|| (self.block_count / 4).max(2));
        if inode_count == 0 {
            return Err(FsError::InvalidArgument(
                "a volume needs at least the root inode".to_string(),
            ));
        }

        let geometry = Geometry {
            block_count: self.block_count,
            inode_count,
            istore_blocks: div_ceil(inode_count, INODES_PER_BLOCK),
            ifree_blocks: div_ceil(inode_count, BITS_PER_BLOCK),
            bfree_blocks: div_ceil(self.block_count, BITS_PER_BLOCK),
        };
        // The root directory needs one data block of its own.
        if u64::from(geometry.data_start()) + 1 > u64::from(self.block_count) {
            return Err(FsError::InvalidArgument(format!(
                "{} blocks cannot hold {} metadata blocks and a root directory",
                self.block_count,
                geometry.data_start()
            )));
        }
        Ok(geometry)
    }
}

/// The block ranges of a volume. Block 0 is the superblock, the inode store
/// follows it, then the inode bitmap, the block bitmap and finally data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub block_count: u32,
    pub inode_count: u32,
    pub istore_blocks: u32,
    pub ifree_blocks: u32,
    pub bfree_blocks: u32,
}

impl Geometry {
    pub fn istore_start(&self) -> u32 {
        INODE_STORE_START
    }

    pub fn ifree_start(&self) -> u32 {
        self.istore_start() + self.istore_blocks
    }

    pub fn bfree_start(&self) -> u32 {
        self.ifree_start() + self.ifree_blocks
    }

    pub fn data_start(&self) -> u32 {
        self.bfree_start() + self.bfree_blocks
    }

    /// Checks the regions are large enough for the counts they track and fit in
    /// the device.
    pub fn validate(&self) -> Result<()> {
        if u64::from(self.istore_blocks) * u64::from(INODES_PER_BLOCK)
            < u64::from(self.inode_count)
        {
            return Err(FsError::Corrupted("inode store smaller than inode count"));
        }
        if u64::from(self.ifree_blocks) * u64::from(BITS_PER_BLOCK) < u64::from(self.inode_count) {
            return Err(FsError::Corrupted("inode bitmap smaller than inode count"));
        }
        if u64::from(self.bfree_blocks) * u64::from(BITS_PER_BLOCK) < u64::from(self.block_count) {
            return Err(FsError::Corrupted("block bitmap smaller than block count"));
        }
        let metadata = u64::from(INODE_STORE_START)
            + u64::from(self.istore_blocks)
            + u64::from(self.ifree_blocks)
            + u64::from(self.bfree_blocks);
        if metadata >= u64::from(self.block_count) {
            return Err(FsError::Corrupted("metadata regions exceed the device"));
        }
        Ok(())
    }
}

fn div_ceil(n: u32, d: u32) -> u32 {
    n / d + u32::from(n % d != 0)
}
