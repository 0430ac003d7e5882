use std::collections::HashSet;

use crate::alloc::State;
use crate::config::{BLOCK_SIZE, MAX_FILE_BLOCKS, MAX_FILE_SIZE};
use crate::error::{FsError, Result};
use crate::fs::Volume;
use crate::io::BlockStorage;
use crate::node::Inode;

use log::{debug, warn};
use byteorder::LittleEndian;
use zerocopy::byteorder::U32;
use zerocopy::LayoutVerified;

/// The extent list of a regular file: the file's index block read as an array of
/// little endian block pointers, the first `count` of which are in use.
#[derive(Clone)]
pub(crate) struct ExtentBlock {
    buf: Vec<u8>,
    count: usize,
}

impl ExtentBlock {
    pub(crate) fn parse(buf: Vec<u8>, count: usize) -> Result<Self> {
        if buf.len() != BLOCK_SIZE {
            return Err(FsError::InvalidArgument(format!(
                "extent block is {} bytes, expected {}",
                buf.len(),
                BLOCK_SIZE
            )));
        }
        if count > MAX_FILE_BLOCKS {
            return Err(FsError::Corrupted("used block count exceeds extent capacity"));
        }
        Ok(Self { buf, count })
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Block pointers of every used slot, in file order.
    pub(crate) fn pointers(&self) -> Vec<u32> {
        LayoutVerified::<_, [U32<LittleEndian>]>::new_slice_unaligned(&self.buf[..])
            .map(|ptrs| ptrs[..self.count].iter().map(|p| p.get()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn get(&self, slot: usize) -> Option<u32> {
        if slot >= self.count {
            return None;
        }
        let at = slot * 4;
        let mut raw = [0; 4];
        raw.copy_from_slice(&self.buf[at..at + 4]);
        Some(u32::from_le_bytes(raw))
    }

    pub(crate) fn push(&mut self, block: u32) -> Result<()> {
        if self.count == MAX_FILE_BLOCKS {
            return Err(FsError::FileTooLarge);
        }
        let at = self.count * 4;
        self.buf[at..at + 4].copy_from_slice(&block.to_le_bytes());
        self.count += 1;
        Ok(())
    }
}

impl<T: BlockStorage> Volume<T> {
    fn check_data_block(&self, block: u32) -> Result<()> {
        if block < self.data_start() || block >= self.super_block.block_count {
            return Err(FsError::InvalidBlock(block));
        }
        if self.block_map.get(block) != State::Used {
            return Err(FsError::Corrupted("file references a free block"));
        }
        Ok(())
    }

    fn check_file(&self, file: &Inode) -> Result<()> {
        if !file.is_file() {
            return Err(FsError::NotRegularFile(file.ino));
        }
        Ok(())
    }

    /// Reads the extent list of a regular file and checks every pointer is an
    /// in-use data block owned only once, so releasing them later cannot fail
    /// halfway.
    pub(crate) fn load_extents(&mut self, file: &Inode) -> Result<ExtentBlock> {
        self.check_file(file)?;
        self.check_data_block(file.index_block)?;
        let mut buf = vec![0; BLOCK_SIZE];
        self.read_block(file.index_block, &mut buf)?;
        let extents = ExtentBlock::parse(buf, file.used_blocks as usize)?;
        let mut seen = HashSet::new();
        seen.insert(file.index_block);
        for block in extents.pointers() {
            self.check_data_block(block)?;
            if !seen.insert(block) {
                return Err(FsError::Corrupted("block listed twice in extent list"));
            }
        }
        Ok(extents)
    }

    /// Frees everything a regular file owns: each data block, then the extent
    /// block itself, then the inode id.
    pub(crate) fn release_file(&mut self, file: &Inode, extents: &ExtentBlock) -> Result<()> {
        for block in extents.pointers() {
            self.block_map.release(block)?;
        }
        self.block_map.release(file.index_block)?;
        self.release_inode(file.ino)?;
        debug!(
            "deleted file inode {} with {} data blocks",
            file.ino,
            extents.len()
        );
        Ok(())
    }

    /// Writes `data` at byte `offset` of regular file `ino`, growing the file as
    /// needed. A gap between the old end of file and `offset` reads back as zeros.
    ///
    /// # Errors
    ///
    /// `FileTooLarge` if the write would end past the capacity of one extent block,
    /// in which case nothing is written. Blocks allocated by this call are given
    /// back if the allocator runs dry or a write fails.
    pub fn write_file(&mut self, ino: u32, offset: u64, data: &[u8]) -> Result<usize> {
        let mut file = self.read_inode(ino)?;
        self.check_file(&file)?;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FsError::FileTooLarge)?;
        if end > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let mut extents = self.load_extents(&file)?;
        let existing = extents.len();
        let needed = div_ceil(end, BLOCK_SIZE as u64) as usize;
        let mut fresh = Vec::new();
        while extents.len() < needed {
            let block = match self.block_map.allocate() {
                Ok(block) => block,
                Err(e) => {
                    self.give_back(&fresh);
                    return Err(e);
                }
            };
            fresh.push(block);
            if let Err(e) = extents.push(block) {
                self.give_back(&fresh);
                return Err(e);
            }
        }

        let result = self.write_extents(&file, &extents, existing, offset, data);
        let result = result.and_then(|_| {
            if !fresh.is_empty() {
                self.write_block(file.index_block, extents.as_bytes())?;
            }
            file.size = file.size.max(end as u32);
            file.used_blocks = extents.len() as u32;
            self.write_inode(&file)
        });
        if let Err(e) = result {
            self.give_back(&fresh);
            return Err(e);
        }
        Ok(data.len())
    }

    fn write_extents(
        &mut self,
        file: &Inode,
        extents: &ExtentBlock,
        existing: usize,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let bs = BLOCK_SIZE as u64;
        let old_size = u64::from(file.size);
        let end = offset + data.len() as u64;
        let first = offset.min(old_size) / bs;
        let last = (end - 1) / bs;

        let mut buf = vec![0; BLOCK_SIZE];
        for index in first..=last {
            let block = extents
                .get(index as usize)
                .ok_or(FsError::Corrupted("extent list shorter than file"))?;
            let block_start = index * bs;
            if (index as usize) < existing {
                self.read_block(block, &mut buf)?;
            } else {
                buf.iter_mut().for_each(|b| *b = 0);
            }
            // Bytes past the old end of file are stale.
            if old_size < block_start + bs {
                let stale = old_size.saturating_sub(block_start) as usize;
                buf[stale..].iter_mut().for_each(|b| *b = 0);
            }

            let from = offset.max(block_start);
            let to = end.min(block_start + bs);
            if from < to {
                let dest = (from - block_start) as usize..(to - block_start) as usize;
                let src = (from - offset) as usize..(to - offset) as usize;
                buf[dest].copy_from_slice(&data[src]);
            }
            self.write_block(block, &buf)?;
        }
        Ok(())
    }

    /// Reads from regular file `ino` at byte `offset` into `buf`. Returns the number
    /// of bytes read, which is zero at or past the end of the file.
    pub fn read_file(&mut self, ino: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let file = self.read_inode(ino)?;
        self.check_file(&file)?;
        let size = u64::from(file.size);
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = (size - offset).min(buf.len() as u64) as usize;
        let extents = self.load_extents(&file)?;

        let bs = BLOCK_SIZE as u64;
        let mut block_buf = vec![0; BLOCK_SIZE];
        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let block = extents
                .get((pos / bs) as usize)
                .ok_or(FsError::Corrupted("extent list shorter than file"))?;
            self.read_block(block, &mut block_buf)?;
            let within = (pos % bs) as usize;
            let n = (BLOCK_SIZE - within).min(len - done);
            buf[done..done + n].copy_from_slice(&block_buf[within..within + n]);
            done += n;
        }
        Ok(len)
    }

    /// Drops every data block of regular file `ino` and resets its size to zero.
    /// The extent block stays with the file.
    pub fn truncate(&mut self, ino: u32) -> Result<()> {
        let mut file = self.read_inode(ino)?;
        let extents = self.load_extents(&file)?;
        file.size = 0;
        file.used_blocks = 0;
        self.write_inode(&file)?;
        for block in extents.pointers() {
            self.block_map.release(block)?;
        }
        Ok(())
    }

    fn give_back(&mut self, blocks: &[u32]) {
        for &block in blocks {
            if let Err(e) = self.block_map.release(block) {
                warn!("unable to give back block {}: {}", block, e);
            }
        }
    }
}

fn div_ceil(n: u64, d: u64) -> u64 {
    n / d + u64::from(n % d != 0)
}
