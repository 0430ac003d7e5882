use crate::config::{Geometry, BLOCK_SIZE, MAGIC};
use crate::error::{FsError, Result};
use std::mem;
use byteorder::LittleEndian;
use zerocopy::byteorder::U32;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

/// Superblock header as stored in the first bytes of block 0, every field little
/// endian. The rest of the block is zero.
#[repr(C)]
#[derive(FromBytes, AsBytes, Unaligned)]
struct RawSuperBlock {
    magic: U32<LittleEndian>,
    block_count: U32<LittleEndian>,
    inode_count: U32<LittleEndian>,
    istore_blocks: U32<LittleEndian>,
    ifree_blocks: U32<LittleEndian>,
    bfree_blocks: U32<LittleEndian>,
    free_inodes: U32<LittleEndian>,
    free_blocks: U32<LittleEndian>,
}

/// The first block of the file system storing information critical for mounting
/// the file system and verifying the underlying disk is formatted correctly.
///
/// Tracks the size of every metadata region so the location of the inode store and
/// both bitmaps can be computed. The free counters are only authoritative on disk
/// after a sync; while mounted the allocators own them.
#[derive(Debug, Clone, PartialEq)]
pub struct SuperBlock {
    /// A 32-bit identifying string, in this case FLAT.
    pub magic: u32,
    /// Every block on the device, metadata included.
    pub block_count: u32,
    /// The number of inodes, which bounds how many files can exist.
    pub inode_count: u32,
    /// Blocks holding packed inode records, starting at block 1.
    pub istore_blocks: u32,
    /// Blocks holding the inode free bitmap.
    pub ifree_blocks: u32,
    /// Blocks holding the block free bitmap.
    pub bfree_blocks: u32,
    /// The number of remaining available inodes.
    pub free_inodes: u32,
    /// All blocks available to be allocated by the system.
    pub free_blocks: u32,
}

impl SuperBlock {
    pub fn new(geometry: &Geometry) -> Self {
        Self {
            magic: MAGIC,
            block_count: geometry.block_count,
            inode_count: geometry.inode_count,
            istore_blocks: geometry.istore_blocks,
            ifree_blocks: geometry.ifree_blocks,
            bfree_blocks: geometry.bfree_blocks,
            free_inodes: 0,
            free_blocks: 0,
        }
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            block_count: self.block_count,
            inode_count: self.inode_count,
            istore_blocks: self.istore_blocks,
            ifree_blocks: self.ifree_blocks,
            bfree_blocks: self.bfree_blocks,
        }
    }

    /// Reads the super block from a buffer of exactly size BLOCK_SIZE and checks
    /// the magic number and region sizes.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() != BLOCK_SIZE {
            return Err(FsError::InvalidArgument(format!(
                "superblock buffer is {} bytes, expected {}",
                buf.len(),
                BLOCK_SIZE
            )));
        }
        let header = &buf[..mem::size_of::<RawSuperBlock>()];
        let raw = LayoutVerified::<_, RawSuperBlock>::new_unaligned(header)
            .ok_or(FsError::Corrupted("superblock header"))?;

        let magic = raw.magic.get();
        if magic != MAGIC {
            return Err(FsError::InvalidMagic(magic));
        }

        let sb = Self {
            magic,
            block_count: raw.block_count.get(),
            inode_count: raw.inode_count.get(),
            istore_blocks: raw.istore_blocks.get(),
            ifree_blocks: raw.ifree_blocks.get(),
            bfree_blocks: raw.bfree_blocks.get(),
            free_inodes: raw.free_inodes.get(),
            free_blocks: raw.free_blocks.get(),
        };
        sb.geometry().validate()?;
        Ok(sb)
    }

    /// Serializes the SuperBlock into a BLOCK_SIZE buffer for writing to disk.
    /// The encoding is a series of little endian struct fields, zero padded to the
    /// end of the block.
    pub fn serialize(&self) -> Vec<u8> {
        let raw = RawSuperBlock {
            magic: U32::new(self.magic),
            block_count: U32::new(self.block_count),
            inode_count: U32::new(self.inode_count),
            istore_blocks: U32::new(self.istore_blocks),
            ifree_blocks: U32::new(self.ifree_blocks),
            bfree_blocks: U32::new(self.bfree_blocks),
            free_inodes: U32::new(self.free_inodes),
            free_blocks: U32::new(self.free_blocks),
        };
        let mut sb_encoded = vec![0; BLOCK_SIZE];
        let header = raw.as_bytes();
        sb_encoded[..header.len()].copy_from_slice(header);
        sb_encoded
    }
}
