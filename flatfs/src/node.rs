use crate::config::{
  BLOCK_SIZE, INODES_PER_BLOCK, INODE_SIZE, INODE_STORE_START, PERM_MASK, ROOT_INO, S_IFDIR,
  S_IFMT, S_IFREG,
};
use crate::error::{FsError, Result};
use crate::fs::Volume;
use crate::io::BlockStorage;

use log::{debug, trace};
use byteorder::LittleEndian;
use zerocopy::byteorder::U32;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

#[repr(C)]
#[derive(FromBytes, AsBytes, Unaligned)]
/// This structure __must be exactly INODE_SIZE bytes.__ Records are packed back to
/// back inside the inode store blocks and indexed by inode id.
struct RawInode {
  mode: U32<LittleEndian>,
  index_block: U32<LittleEndian>,
  size: U32<LittleEndian>,
  used_blocks: U32<LittleEndian>,
  entries: U32<LittleEndian>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileType {
  Directory,
  Regular,
  Unknown,
}

/// In-memory copy of an inode record.
#[derive(Debug, Clone, PartialEq)]
pub struct Inode {
  pub ino: u32,
  /// File type and permission bits, as in `st_mode`.
  pub mode: u32,
  /// The one block this inode owns: an entry table for directories, an extent
  /// list for regular files.
  pub index_block: u32,
  /// The total size of the file in bytes.
  pub size: u32,
  /// Data blocks referenced by the extent list of a regular file.
  pub used_blocks: u32,
  /// Occupied slots of a directory's entry table.
  pub entries: u32,
}

impl Inode {
  pub(crate) fn new(ino: u32, mode: u32, index_block: u32) -> Self {
    Self {
      ino,
      mode,
      index_block,
      size: 0,
      used_blocks: 0,
      entries: 0,
    }
  }

  pub fn file_type(&self) -> FileType {
    match self.mode & S_IFMT {
      S_IFDIR => FileType::Directory,
      S_IFREG => FileType::Regular,
      _ => FileType::Unknown,
    }
  }

  pub fn is_dir(&self) -> bool {
    self.file_type() == FileType::Directory
  }

  pub fn is_file(&self) -> bool {
    self.file_type() == FileType::Regular
  }

  pub fn permissions(&self) -> u32 {
    self.mode & PERM_MASK
  }

  fn decode(ino: u32, raw: &RawInode) -> Self {
    Self {
      ino,
      mode: raw.mode.get(),
      index_block: raw.index_block.get(),
      size: raw.size.get(),
      used_blocks: raw.used_blocks.get(),
      entries: raw.entries.get(),
    }
  }

  fn encode(&self, raw: &mut RawInode) {
    raw.mode.set(self.mode);
    raw.index_block.set(self.index_block);
    raw.size.set(self.size);
    raw.used_blocks.set(self.used_blocks);
    raw.entries.set(self.entries);
  }
}

/// Inode store block holding `ino` and the byte offset of its record in it.
fn locate(ino: u32) -> (u32, usize) {
  let block = INODE_STORE_START + ino / INODES_PER_BLOCK;
  let offset = (ino % INODES_PER_BLOCK) as usize * INODE_SIZE;
  (block, offset)
}

fn record(buf: &[u8], offset: usize) -> Result<LayoutVerified<&[u8], RawInode>> {
  LayoutVerified::new_unaligned(&buf[offset..offset + INODE_SIZE])
    .ok_or(FsError::Corrupted("inode record"))
}

fn record_mut(buf: &mut [u8], offset: usize) -> Result<LayoutVerified<&mut [u8], RawInode>> {
  LayoutVerified::new_unaligned(&mut buf[offset..offset + INODE_SIZE])
    .ok_or(FsError::Corrupted("inode record"))
}

impl<T: BlockStorage> Volume<T> {
  pub(crate) fn check_ino(&self, ino: u32) -> Result<()> {
    if ino >= self.super_block.inode_count {
      return Err(FsError::InvalidInode(ino));
    }
    Ok(())
  }

  /// Loads inode `ino`. Records waiting for write-back are returned from memory,
  /// everything else is decoded from its inode store block.
  pub fn read_inode(&mut self, ino: u32) -> Result<Inode> {
    self.check_ino(ino)?;
    if let Some(inode) = self.dirty.get(&ino) {
      return Ok(inode.clone());
    }

    let (block, offset) = locate(ino);
    let mut buf = [0; BLOCK_SIZE];
    self.read_block(block, &mut buf)?;
    let raw = record(&buf, offset)?;
    Ok(Inode::decode(ino, &raw))
  }

  /// Persists `inode` into its inode store block and flushes the device before
  /// returning. Any pending write-back for the same inode is dropped.
  pub fn write_inode(&mut self, inode: &Inode) -> Result<()> {
    self.check_ino(inode.ino)?;
    let (block, offset) = locate(inode.ino);
    let mut buf = [0; BLOCK_SIZE];
    self.read_block(block, &mut buf)?;
    {
      let mut raw = record_mut(&mut buf, offset)?;
      inode.encode(&mut raw);
    }
    self.write_block_sync(block, &buf)?;
    self.dirty.remove(&inode.ino);
    trace!("wrote inode {} to block {}", inode.ino, block);
    Ok(())
  }

  /// Schedules `inode` for deferred write-back. It is persisted by the next
  /// `sync`, `evict` or `write_inode` of the same id.
  pub fn mark_dirty(&mut self, inode: &Inode) {
    self.dirty.insert(inode.ino, inode.clone());
  }

  /// Writes back a pending record for `ino`, if there is one.
  pub fn evict(&mut self, ino: u32) -> Result<()> {
    if let Some(inode) = self.dirty.get(&ino).cloned() {
      self.write_inode(&inode)?;
    }
    Ok(())
  }

  /// Ids with a pending write-back, lowest first.
  pub fn dirty_inodes(&self) -> Vec<u32> {
    self.dirty.keys().copied().collect()
  }

  pub(crate) fn flush_dirty(&mut self) -> Result<()> {
    let pending: Vec<Inode> = self.dirty.values().cloned().collect();
    for inode in pending.iter() {
      self.write_inode(inode)?;
    }
    Ok(())
  }

  /// Takes a fresh inode id and index block. The record starts empty with the
  /// given mode and is only scheduled for write-back. Nothing stays allocated if
  /// either allocation fails.
  pub(crate) fn allocate_inode(&mut self, mode: u32) -> Result<Inode> {
    let ino = self.inode_map.allocate()?;
    let index_block = match self.block_map.allocate() {
      Ok(block) => block,
      Err(e) => {
        self.inode_map.release(ino)?;
        return Err(e);
      }
    };

    let inode = Inode::new(ino, mode, index_block);
    self.mark_dirty(&inode);
    debug!("allocated inode {} mode {:o} index block {}", ino, mode, index_block);
    Ok(inode)
  }

  /// Gives the inode id back to the allocator and forgets any pending write-back.
  pub(crate) fn release_inode(&mut self, ino: u32) -> Result<()> {
    if ino == ROOT_INO {
      return Err(FsError::InvalidArgument(
        "the root inode is never released".to_string(),
      ));
    }
    self.inode_map.release(ino)?;
    self.dirty.remove(&ino);
    debug!("released inode {}", ino);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fs::tests::test_volume;
  use std::mem;

  #[test]
  fn raw_record_matches_inode_size() {
    assert_eq!(mem::size_of::<RawInode>(), INODE_SIZE);
  }

  #[test]
  fn records_are_packed_from_block_one() {
    assert_eq!(locate(0), (1, 0));
    assert_eq!(locate(1), (1, 20));
    assert_eq!(locate(203), (1, 203 * 20));
    assert_eq!(locate(204), (2, 0));
    assert_eq!(locate(409), (3, 20));
  }

  #[test]
  fn can_encode_and_decode_records() {
    let inode = Inode {
      ino: 7,
      mode: S_IFREG | 0o644,
      index_block: 42,
      size: 12_345,
      used_blocks: 4,
      entries: 0,
    };
    let mut buf = [0; BLOCK_SIZE];
    inode.encode(&mut record_mut(&mut buf, 140).unwrap());

    assert_eq!(&buf[140..144], &(S_IFREG | 0o644).to_le_bytes());
    assert_eq!(&buf[144..148], &[42, 0, 0, 0]);
    assert_eq!(Inode::decode(7, &record(&buf, 140).unwrap()), inode);
  }

  #[test]
  fn file_type_follows_mode() {
    assert_eq!(Inode::new(1, S_IFDIR | 0o755, 9).file_type(), FileType::Directory);
    assert_eq!(Inode::new(1, S_IFREG | 0o600, 9).file_type(), FileType::Regular);
    assert_eq!(Inode::new(1, 0o600, 9).file_type(), FileType::Unknown);
    assert_eq!(Inode::new(1, S_IFREG | 0o600, 9).permissions(), 0o600);
  }

  #[test]
  fn written_inodes_survive_a_reload() {
    let mut vol = test_volume(64, 80);
    let mut inode = vol.allocate_inode(S_IFREG | 0o644).unwrap();
    inode.size = 99;
    vol.write_inode(&inode).unwrap();

    assert!(vol.dirty_inodes().is_empty());
    assert_eq!(vol.read_inode(inode.ino).unwrap(), inode);
  }

  #[test]
  fn pending_inodes_are_read_from_memory() {
    let mut vol = test_volume(64, 80);
    let inode = vol.allocate_inode(S_IFDIR | 0o700).unwrap();

    assert_eq!(vol.dirty_inodes(), vec![inode.ino]);
    assert_eq!(vol.read_inode(inode.ino).unwrap(), inode);

    vol.evict(inode.ino).unwrap();
    assert!(vol.dirty_inodes().is_empty());
    assert_eq!(vol.read_inode(inode.ino).unwrap(), inode);
  }

  #[test]
  fn inode_ids_past_the_store_are_rejected() {
    let mut vol = test_volume(64, 80);
    match vol.read_inode(80) {
      Err(FsError::InvalidInode(80)) => (),
      _ => assert!(false, "Expected invalid inode."),
    }
  }

  #[test]
  fn failed_block_allocation_returns_the_inode_id() {
    let mut vol = test_volume(64, 80);
    while vol.block_map.allocate().is_ok() {}
    let free_inodes = vol.inode_map.free_count();

    match vol.allocate_inode(S_IFREG) {
      Err(FsError::Exhausted(crate::Resource::Block)) => (),
      _ => assert!(false, "Expected exhausted blocks."),
    }
    assert_eq!(vol.inode_map.free_count(), free_inodes);
  }

  #[test]
  fn root_is_never_released() {
    let mut vol = test_volume(64, 80);
    assert!(vol.release_inode(ROOT_INO).is_err());
  }
}
