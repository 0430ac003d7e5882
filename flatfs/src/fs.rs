use std::collections::{BTreeMap, BTreeSet};

use crate::alloc::{Bitmap, State};
use crate::config::{
    FormatOptions, BLOCK_SIZE, FILENAME_LEN, PERM_MASK, ROOT_DEFAULT_MODE, ROOT_INO, S_IFDIR,
    S_IFREG, SUPERBLOCK_NR,
};
use crate::dir::validate_name;
use crate::error::{FsError, Resource, Result};
use crate::io::BlockStorage;
use crate::node::Inode;
use crate::sb::SuperBlock;

use log::{debug, error, info, warn};

/// Summary of space usage, as reported by `statfs(2)`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks: u32,
    pub free_blocks: u32,
    pub inodes: u32,
    pub free_inodes: u32,
    pub max_name_len: u32,
}

/// One mounted volume.
///
/// Owns the device, the superblock and the in-memory copies of both free bitmaps
/// for as long as the volume is mounted. Bitmaps and counters only reach the disk
/// on `sync` (or `unmount`). Inode records are written through immediately by
/// `write_inode`; newly allocated inodes and directories whose entry count changed
/// wait for write-back in a pending set that `sync` drains.
///
/// A volume is not safe for concurrent use. Every operation takes `&mut self` and
/// runs to completion, callers sharing a volume must serialize access to it.
pub struct Volume<T: BlockStorage> {
    pub(crate) dev: T,
    pub(crate) super_block: SuperBlock,
    pub(crate) inode_map: Bitmap,
    pub(crate) block_map: Bitmap,
    pub(crate) dirty: BTreeMap<u32, Inode>,
}

fn read_raw<T: BlockStorage>(dev: &mut T, block: u32, buf: &mut [u8]) -> Result<()> {
    dev.read_block(block as usize, buf).map_err(|source| {
        error!("unable to read block {}: {}", block, source);
        FsError::BlockRead { block, source }
    })
}

impl<T: BlockStorage> Volume<T> {
    /// Initializes a fresh file system onto owned block storage and mounts it.
    ///
    /// # Layout
    /// ==============================================================================
    /// | SuperBlock | Inode store | Bitmap (inodes) | Bitmap (blocks) | Data Region |
    /// ==============================================================================
    ///
    /// Every inode id is free except the root (0). Every data block is free except
    /// the root directory's entry table, which takes the first one.
    pub fn format(mut dev: T, options: &FormatOptions) -> Result<Self> {
        let geometry = options.geometry()?;
        if geometry.block_count as usize > dev.block_count() {
            return Err(FsError::InvalidArgument(format!(
                "device has {} blocks, cannot format {}",
                dev.block_count(),
                geometry.block_count
            )));
        }

        let zero = vec![0; BLOCK_SIZE];
        for block in geometry.istore_start()..geometry.ifree_start() {
            dev.write_block(block as usize, &zero)
                .map_err(|source| FsError::BlockWrite { block, source })?;
        }

        let mut inode_map = Bitmap::new(
            Resource::Inode,
            geometry.ifree_blocks,
            geometry.inode_count,
        );
        for ino in 1..geometry.inode_count {
            inode_map.release(ino)?;
        }
        let mut block_map = Bitmap::new(
            Resource::Block,
            geometry.bfree_blocks,
            geometry.block_count,
        );
        for block in geometry.data_start()..geometry.block_count {
            block_map.release(block)?;
        }

        let root_block = block_map.allocate()?;
        let mut vol = Volume {
            dev,
            super_block: SuperBlock::new(&geometry),
            inode_map,
            block_map,
            dirty: BTreeMap::new(),
        };
        vol.write_block(root_block, &zero)?;
        vol.write_inode(&Inode::new(ROOT_INO, ROOT_DEFAULT_MODE, root_block))?;
        vol.sync()?;

        info!(
            "formatted {} blocks with {} inodes, data starts at block {}",
            geometry.block_count,
            geometry.inode_count,
            geometry.data_start()
        );
        Ok(vol)
    }

    /// Mounts an existing volume: reads the superblock, both bitmaps and the root
    /// inode. Nothing is kept if any of those reads fails.
    pub fn mount(mut dev: T) -> Result<Self> {
        let mut buf = vec![0; BLOCK_SIZE];
        read_raw(&mut dev, SUPERBLOCK_NR, &mut buf)?;
        let mut super_block = SuperBlock::parse(&buf)?;
        if super_block.block_count as usize > dev.block_count() {
            return Err(FsError::Corrupted("volume is larger than the device"));
        }
        let geometry = super_block.geometry();

        let mut inode_map = Bitmap::new(
            Resource::Inode,
            super_block.ifree_blocks,
            super_block.inode_count,
        );
        for i in 0..super_block.ifree_blocks {
            read_raw(&mut dev, geometry.ifree_start() + i, &mut buf)?;
            inode_map.load_block(i as usize, &buf)?;
        }
        let free_inodes = inode_map.finish_load();
        if free_inodes != super_block.free_inodes {
            warn!(
                "superblock claims {} free inodes, bitmap has {}",
                super_block.free_inodes, free_inodes
            );
            super_block.free_inodes = free_inodes;
        }

        let mut block_map = Bitmap::new(
            Resource::Block,
            super_block.bfree_blocks,
            super_block.block_count,
        );
        for i in 0..super_block.bfree_blocks {
            read_raw(&mut dev, geometry.bfree_start() + i, &mut buf)?;
            block_map.load_block(i as usize, &buf)?;
        }
        let free_blocks = block_map.finish_load();
        if free_blocks != super_block.free_blocks {
            warn!(
                "superblock claims {} free blocks, bitmap has {}",
                super_block.free_blocks, free_blocks
            );
            super_block.free_blocks = free_blocks;
        }

        let mut vol = Volume {
            dev,
            super_block,
            inode_map,
            block_map,
            dirty: BTreeMap::new(),
        };
        let root = vol.read_inode(ROOT_INO)?;
        if !root.is_dir() {
            return Err(FsError::Corrupted("root inode is not a directory"));
        }
        if vol.inode_map.get(ROOT_INO) == State::Free {
            warn!("root inode was marked free, reserving it");
            vol.inode_map.set_reserved(ROOT_INO)?;
        }

        info!(
            "mounted volume: {} blocks ({} free), {} inodes ({} free)",
            vol.super_block.block_count,
            vol.block_map.free_count(),
            vol.super_block.inode_count,
            vol.inode_map.free_count()
        );
        Ok(vol)
    }

    /// Writes pending inodes, the free counters and both bitmaps to disk, flushing
    /// after every block. Stops at the first failure; blocks written before it stay
    /// written.
    pub fn sync(&mut self) -> Result<()> {
        self.flush_dirty()?;

        self.super_block.free_inodes = self.inode_map.free_count();
        self.super_block.free_blocks = self.block_map.free_count();
        let sb = self.super_block.serialize();
        self.write_block_sync(SUPERBLOCK_NR, &sb)?;

        let geometry = self.super_block.geometry();
        let mut buf = vec![0; BLOCK_SIZE];
        for i in 0..self.super_block.ifree_blocks {
            self.inode_map.store_block(i as usize, &mut buf)?;
            self.write_block_sync(geometry.ifree_start() + i, &buf)?;
        }
        for i in 0..self.super_block.bfree_blocks {
            self.block_map.store_block(i as usize, &mut buf)?;
            self.write_block_sync(geometry.bfree_start() + i, &buf)?;
        }
        debug!(
            "synced {} free inodes, {} free blocks",
            self.super_block.free_inodes, self.super_block.free_blocks
        );
        Ok(())
    }

    /// Syncs the volume and hands the device back.
    pub fn unmount(mut self) -> Result<T> {
        self.sync()?;
        info!("unmounted volume");
        Ok(self.dev)
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    pub fn inode_bitmap(&self) -> &Bitmap {
        &self.inode_map
    }

    pub fn block_bitmap(&self) -> &Bitmap {
        &self.block_map
    }

    pub fn free_inodes(&self) -> u32 {
        self.inode_map.free_count()
    }

    pub fn free_blocks(&self) -> u32 {
        self.block_map.free_count()
    }

    pub fn data_start(&self) -> u32 {
        self.super_block.geometry().data_start()
    }

    pub fn statfs(&self) -> StatFs {
        StatFs {
            block_size: BLOCK_SIZE as u32,
            blocks: self.super_block.block_count,
            free_blocks: self.block_map.free_count(),
            inodes: self.super_block.inode_count,
            free_inodes: self.inode_map.free_count(),
            max_name_len: FILENAME_LEN as u32,
        }
    }

    pub(crate) fn read_block(&mut self, block: u32, buf: &mut [u8]) -> Result<()> {
        read_raw(&mut self.dev, block, buf)
    }

    pub(crate) fn write_block(&mut self, block: u32, buf: &[u8]) -> Result<()> {
        self.dev.write_block(block as usize, buf).map_err(|source| {
            error!("unable to write block {}: {}", block, source);
            FsError::BlockWrite { block, source }
        })
    }

    /// Writes a block and waits for the device to flush it.
    pub(crate) fn write_block_sync(&mut self, block: u32, buf: &[u8]) -> Result<()> {
        self.write_block(block, buf)?;
        self.dev.sync_disk().map_err(|source| {
            error!("unable to flush block {}: {}", block, source);
            FsError::BlockWrite { block, source }
        })
    }

    /// Creates an empty regular file called `name` in directory `parent`.
    pub fn create(&mut self, parent: u32, name: &str, mode: u32) -> Result<Inode> {
        self.link_new(parent, name, S_IFREG | (mode & PERM_MASK))
    }

    /// Creates an empty directory called `name` in directory `parent`.
    pub fn mkdir(&mut self, parent: u32, name: &str, mode: u32) -> Result<Inode> {
        self.link_new(parent, name, S_IFDIR | (mode & PERM_MASK))
    }

    /// Allocates an inode and records it in the parent. Every check that can fail
    /// runs before the allocation, and the inode and its index block are released
    /// again if recording the entry fails.
    fn link_new(&mut self, parent: u32, name: &str, mode: u32) -> Result<Inode> {
        let name = validate_name(name)?;
        let mut dir = self.read_inode(parent)?;
        let mut block = self.load_dir(&dir)?;
        if block.lookup(name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        if block.is_full() {
            return Err(FsError::DirectoryFull);
        }

        let inode = self.allocate_inode(mode)?;
        let linked = block
            .insert(name, inode.ino)
            .and_then(|_| self.store_dir(&dir, &block));
        if let Err(e) = linked {
            self.abandon(&inode);
            return Err(e);
        }

        dir.entries = block.len() as u32;
        self.mark_dirty(&dir);
        debug!(
            "linked inode {} as {:?} in directory {}",
            inode.ino,
            String::from_utf8_lossy(name),
            parent
        );
        Ok(inode)
    }

    fn abandon(&mut self, inode: &Inode) {
        if let Err(e) = self.block_map.release(inode.index_block) {
            warn!("unable to give back block {}: {}", inode.index_block, e);
        }
        if let Err(e) = self.release_inode(inode.ino) {
            warn!("unable to give back inode {}: {}", inode.ino, e);
        }
    }

    /// Removes regular file `name` from directory `parent` and frees its data
    /// blocks, extent block and inode.
    pub fn unlink(&mut self, parent: u32, name: &str) -> Result<()> {
        let name = validate_name(name)?;
        let mut dir = self.read_inode(parent)?;
        let mut block = self.load_dir(&dir)?;
        if block.len() == 0 {
            return Err(FsError::EmptyDirectory);
        }
        let ino = block.lookup(name).ok_or(FsError::NotFound)?;
        let file = self.read_inode(ino)?;
        let extents = self.load_extents(&file)?;

        block.remove(name)?;
        self.store_dir(&dir, &block)?;
        dir.entries = block.len() as u32;
        self.mark_dirty(&dir);

        self.release_file(&file, &extents)
    }

    /// Removes empty directory `name` from directory `parent` and frees its entry
    /// table and inode.
    pub fn rmdir(&mut self, parent: u32, name: &str) -> Result<()> {
        let name = validate_name(name)?;
        let mut dir = self.read_inode(parent)?;
        let mut block = self.load_dir(&dir)?;
        if block.len() == 0 {
            return Err(FsError::EmptyDirectory);
        }
        let ino = block.lookup(name).ok_or(FsError::NotFound)?;
        let target = self.read_inode(ino)?;
        self.check_removable_dir(&target)?;

        block.remove(name)?;
        self.store_dir(&dir, &block)?;
        dir.entries = block.len() as u32;
        self.mark_dirty(&dir);

        self.release_dir(&target)
    }

    fn check_removable_dir(&self, target: &Inode) -> Result<()> {
        if !target.is_dir() {
            return Err(FsError::NotADirectory(target.ino));
        }
        if target.entries != 0 {
            return Err(FsError::DirectoryNotEmpty(target.ino));
        }
        if target.ino == ROOT_INO
            || target.index_block >= self.super_block.block_count
            || self.block_map.get(target.index_block) != State::Used
        {
            return Err(FsError::Corrupted("directory entry points at an invalid inode"));
        }
        Ok(())
    }

    fn release_dir(&mut self, target: &Inode) -> Result<()> {
        self.block_map.release(target.index_block)?;
        self.release_inode(target.ino)?;
        debug!("removed directory inode {}", target.ino);
        Ok(())
    }

    /// Whether directory `dir` is `top` or sits anywhere below it. Walks entry tables
    /// depth first, visiting each directory once.
    fn subtree_contains(&mut self, top: &Inode, dir: u32) -> Result<bool> {
        let mut pending = vec![top.clone()];
        let mut visited = BTreeSet::new();
        while let Some(node) = pending.pop() {
            if node.ino == dir {
                return Ok(true);
            }
            if !visited.insert(node.ino) {
                continue;
            }
            let block = self.load_dir(&node)?;
            for slot in 0..block.len() {
                if let Some((_, child)) = block.get(slot) {
                    let child = self.read_inode(child)?;
                    if child.is_dir() {
                        pending.push(child);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Moves entry `old_name` of directory `old_dir` to `new_name` in `new_dir`.
    ///
    /// The entry leaves its slot in `old_dir` and is appended to `new_dir`, even when
    /// both are the same directory. An existing `new_name` is replaced when it is a
    /// regular file and the moved entry is one too, or when both are directories and
    /// the replaced one is empty.
    ///
    /// Both entry tables are updated in memory first. The destination is written
    /// before the source, and if the source write fails the destination is put back,
    /// so the entry is never lost from both directories.
    pub fn rename(
        &mut self,
        old_dir: u32,
        old_name: &str,
        new_dir: u32,
        new_name: &str,
    ) -> Result<()> {
        let old_name = validate_name(old_name)?;
        let new_name = validate_name(new_name)?;

        let mut src_dir = self.read_inode(old_dir)?;
        let mut src = self.load_dir(&src_dir)?;
        if src.len() == 0 {
            return Err(FsError::EmptyDirectory);
        }
        let ino = src.lookup(old_name).ok_or(FsError::NotFound)?;
        let moving = self.read_inode(ino)?;
        if moving.is_dir() && self.subtree_contains(&moving, new_dir)? {
            return Err(FsError::InvalidArgument(
                "cannot move a directory into itself".to_string(),
            ));
        }

        let same_dir = old_dir == new_dir;
        let (mut dst_dir, mut dst) = if same_dir {
            (src_dir.clone(), src.clone())
        } else {
            let dst_dir = self.read_inode(new_dir)?;
            let dst = self.load_dir(&dst_dir)?;
            (dst_dir, dst)
        };
        let dst_before = dst.clone();

        // Anything replaced is checked and read before the first mutation.
        let mut replaced = None;
        if let Some(target_ino) = dst.lookup(new_name) {
            if target_ino == ino {
                return Ok(());
            }
            let target = self.read_inode(target_ino)?;
            let extents = match (moving.is_dir(), target.is_dir()) {
                (false, false) => Some(self.load_extents(&target)?),
                (true, true) => {
                    self.check_removable_dir(&target)?;
                    None
                }
                (true, false) => return Err(FsError::NotADirectory(target_ino)),
                (false, true) => return Err(FsError::AlreadyExists),
            };
            dst.remove(new_name)?;
            replaced = Some((target, extents));
        }

        if same_dir {
            dst.remove(old_name)?;
        } else {
            src.remove(old_name)?;
        }
        dst.insert(new_name, ino)?;

        self.store_dir(&dst_dir, &dst)?;
        if !same_dir {
            if let Err(e) = self.store_dir(&src_dir, &src) {
                if let Err(undo) = self.store_dir(&dst_dir, &dst_before) {
                    error!("unable to restore directory {}: {}", new_dir, undo);
                }
                return Err(e);
            }
            src_dir.entries = src.len() as u32;
            self.mark_dirty(&src_dir);
        }
        dst_dir.entries = dst.len() as u32;
        self.mark_dirty(&dst_dir);
        debug!(
            "renamed inode {} from directory {} to {}",
            ino, old_dir, new_dir
        );

        match replaced {
            Some((target, Some(extents))) => self.release_file(&target, &extents),
            Some((target, None)) => self.release_dir(&target),
            None => Ok(()),
        }
    }
}
