//! Directory entry tables.
//!
//! A directory owns a single index block holding up to `MAX_DIR_ENTRIES` fixed size
//! entries. The inode's entry count says how many leading slots are in use: new
//! entries are appended after the last one and removing an entry shifts the
//! following ones down, so the table never has holes.
use crate::config::{BLOCK_SIZE, FILENAME_LEN, MAX_DIR_ENTRIES};
use crate::error::{FsError, Result};
use crate::fs::Volume;
use crate::io::BlockStorage;
use crate::node::{FileType, Inode};

use log::trace;
use byteorder::LittleEndian;
use zerocopy::byteorder::U32;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

#[repr(C)]
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
struct RawDirEntry {
    name: [u8; FILENAME_LEN],
    ino: U32<LittleEndian>,
}

impl RawDirEntry {
    /// The stored name ends at the first NUL, or at the end of the field.
    fn name(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILENAME_LEN);
        &self.name[..end]
    }

    fn set(&mut self, name: &[u8], ino: u32) {
        let len = name.len().min(FILENAME_LEN);
        self.name = [0; FILENAME_LEN];
        self.name[..len].copy_from_slice(&name[..len]);
        self.ino.set(ino);
    }
}

/// Rejects names that cannot be stored in an entry or that would be ambiguous for
/// path resolution.
pub(crate) fn validate_name(name: &str) -> Result<&[u8]> {
    let bytes = name.as_bytes();
    if bytes.is_empty()
        || bytes.len() > FILENAME_LEN
        || name == "."
        || name == ".."
        || bytes.iter().any(|&b| b == b'/' || b == 0)
    {
        return Err(FsError::InvalidName(name.to_string()));
    }
    Ok(bytes)
}

/// One directory's entry table, read into memory.
#[derive(Clone)]
pub(crate) struct DirBlock {
    buf: Vec<u8>,
    count: usize,
}

impl DirBlock {
    /// Wraps a raw index block whose first `count` slots are occupied.
    pub(crate) fn parse(buf: Vec<u8>, count: usize) -> Result<Self> {
        if buf.len() != BLOCK_SIZE {
            return Err(FsError::InvalidArgument(format!(
                "directory block is {} bytes, expected {}",
                buf.len(),
                BLOCK_SIZE
            )));
        }
        if count > MAX_DIR_ENTRIES {
            return Err(FsError::Corrupted("directory entry count exceeds capacity"));
        }
        Ok(Self { buf, count })
    }

    pub(crate) fn empty() -> Self {
        Self {
            buf: vec![0; BLOCK_SIZE],
            count: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn is_full(&self) -> bool {
        self.count == MAX_DIR_ENTRIES
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn slots(&self) -> &[RawDirEntry] {
        // The buffer length is checked on construction and is an exact multiple of
        // the entry size.
        LayoutVerified::<_, [RawDirEntry]>::new_slice_unaligned(&self.buf[..])
            .map(|slots| slots.into_slice())
            .unwrap_or(&[])
    }

    fn slots_mut(&mut self) -> &mut [RawDirEntry] {
        LayoutVerified::<_, [RawDirEntry]>::new_slice_unaligned(&mut self.buf[..])
            .map(|slots| slots.into_mut_slice())
            .unwrap_or(&mut [])
    }

    fn position(&self, name: &[u8]) -> Option<usize> {
        self.slots()[..self.count]
            .iter()
            .position(|entry| entry.name() == name)
    }

    /// Linear scan of the occupied slots for an entry named exactly `name`.
    pub(crate) fn lookup(&self, name: &[u8]) -> Option<u32> {
        self.position(name)
            .map(|slot| self.slots()[slot].ino.get())
    }

    /// Name and inode id of occupied slot `slot`.
    pub(crate) fn get(&self, slot: usize) -> Option<(&[u8], u32)> {
        if slot >= self.count {
            return None;
        }
        let entry = &self.slots()[slot];
        Some((entry.name(), entry.ino.get()))
    }

    /// Appends an entry after the last occupied slot. Names longer than the name
    /// field are truncated, shorter ones are NUL padded.
    pub(crate) fn insert(&mut self, name: &[u8], ino: u32) -> Result<()> {
        if self.is_full() {
            return Err(FsError::DirectoryFull);
        }
        let slot = self.count;
        self.slots_mut()[slot].set(name, ino);
        self.count += 1;
        Ok(())
    }

    /// Removes the entry named `name` and closes the gap by shifting every later
    /// entry down one slot. Returns the inode id the entry pointed at.
    pub(crate) fn remove(&mut self, name: &[u8]) -> Result<u32> {
        if self.count == 0 {
            return Err(FsError::EmptyDirectory);
        }
        let slot = self.position(name).ok_or(FsError::NotFound)?;
        let count = self.count;
        let slots = self.slots_mut();
        let ino = slots[slot].ino.get();

        slots.copy_within(slot + 1..count, slot);
        slots[count - 1].set(&[], 0);
        self.count -= 1;
        Ok(ino)
    }
}

/// A directory listing entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u32,
    pub file_type: FileType,
}

/// Lazily lists a directory: `.` and `..` first, then every entry in slot order.
/// The file type of each entry is only loaded when the entry is reached, so
/// stopping early skips the remaining inode reads.
///
/// The position counts yielded entries including the two dot entries and can be
/// used to resume a listing with `seek`.
pub struct ReadDir<'a, T: BlockStorage> {
    vol: &'a mut Volume<T>,
    dir: u32,
    parent: u32,
    block: DirBlock,
    pos: usize,
}

impl<'a, T: BlockStorage> ReadDir<'a, T> {
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Continues the listing from position `pos`.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Total entries this listing yields, dot entries included.
    pub fn total(&self) -> usize {
        self.block.len() + 2
    }
}

impl<'a, T: BlockStorage> Iterator for ReadDir<'a, T> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let pos = self.pos;
        let (name, ino) = match pos {
            0 => (".".to_string(), self.dir),
            1 => ("..".to_string(), self.parent),
            _ => {
                let (name, ino) = self.block.get(pos - 2)?;
                (String::from_utf8_lossy(name).into_owned(), ino)
            }
        };
        self.pos += 1;

        let file_type = if pos < 2 {
            FileType::Directory
        } else {
            match self.vol.read_inode(ino) {
                Ok(inode) => inode.file_type(),
                Err(e) => return Some(Err(e)),
            }
        };
        Some(Ok(DirEntry {
            name,
            ino,
            file_type,
        }))
    }
}

impl<T: BlockStorage> Volume<T> {
    /// Reads the entry table of directory `dir`.
    pub(crate) fn load_dir(&mut self, dir: &Inode) -> Result<DirBlock> {
        if !dir.is_dir() {
            return Err(FsError::NotADirectory(dir.ino));
        }
        let mut buf = vec![0; BLOCK_SIZE];
        self.read_block(dir.index_block, &mut buf)?;
        DirBlock::parse(buf, dir.entries as usize)
    }

    /// Writes an entry table back into the index block of `dir`.
    pub(crate) fn store_dir(&mut self, dir: &Inode, block: &DirBlock) -> Result<()> {
        trace!("directory {} now holds {} entries", dir.ino, block.len());
        self.write_block(dir.index_block, block.as_bytes())
    }

    /// Resolves `name` inside directory `dir` to an inode id.
    pub fn lookup(&mut self, dir: u32, name: &str) -> Result<u32> {
        if name.len() > FILENAME_LEN {
            return Err(FsError::InvalidName(name.to_string()));
        }
        let dir = self.read_inode(dir)?;
        let block = self.load_dir(&dir)?;
        block.lookup(name.as_bytes()).ok_or(FsError::NotFound)
    }

    /// Lists directory `dir`. Directories do not record their parent, so the caller
    /// provides the id reported for `..`.
    pub fn read_dir(&mut self, dir: u32, parent: u32) -> Result<ReadDir<'_, T>> {
        let inode = self.read_inode(dir)?;
        let block = self.load_dir(&inode)?;
        Ok(ReadDir {
            vol: self,
            dir,
            parent,
            block,
            pos: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DIR_ENTRY_SIZE;
    use std::mem;

    fn names(block: &DirBlock) -> Vec<String> {
        (0..block.len())
            .map(|slot| String::from_utf8_lossy(block.get(slot).unwrap().0).into_owned())
            .collect()
    }

    #[test]
    fn entries_are_32_bytes() {
        assert_eq!(mem::size_of::<RawDirEntry>(), DIR_ENTRY_SIZE);
        assert_eq!(DIR_ENTRY_SIZE, 32);
    }

    #[test]
    fn insert_then_lookup_returns_inode() {
        let mut block = DirBlock::empty();
        block.insert(b"foo", 3).unwrap();
        block.insert(b"bar", 4).unwrap();

        assert_eq!(block.lookup(b"foo"), Some(3));
        assert_eq!(block.lookup(b"bar"), Some(4));
        assert_eq!(block.lookup(b"baz"), None);
        assert_eq!(block.len(), 2);
    }

    #[test]
    fn lookup_compares_full_names() {
        let mut block = DirBlock::empty();
        block.insert(b"foobar", 3).unwrap();

        // A prefix of a stored name is a different name.
        assert_eq!(block.lookup(b"foo"), None);
        assert_eq!(block.lookup(b"foobarbaz"), None);
        assert_eq!(block.lookup(b"foobar"), Some(3));
    }

    #[test]
    fn names_filling_the_field_have_no_terminator() {
        let long = [b'x'; FILENAME_LEN];
        let mut block = DirBlock::empty();
        block.insert(&long, 9).unwrap();
        block.insert(b"next", 10).unwrap();

        assert_eq!(block.lookup(&long), Some(9));
        assert_eq!(block.get(0).unwrap().0, &long[..]);
        assert_eq!(&block.as_bytes()[28..32], &[9, 0, 0, 0]);
    }

    #[test]
    fn overlong_names_are_truncated_to_the_field() {
        let mut block = DirBlock::empty();
        block.insert(&[b'y'; FILENAME_LEN + 5], 2).unwrap();
        assert_eq!(block.get(0).unwrap().0.len(), FILENAME_LEN);
    }

    #[test]
    fn remove_compacts_following_entries() {
        let mut block = DirBlock::empty();
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            block.insert(name.as_bytes(), i as u32 + 1).unwrap();
        }

        assert_eq!(block.remove(b"b").unwrap(), 2);
        assert_eq!(names(&block), vec!["a", "c", "d"]);
        assert_eq!(block.lookup(b"d"), Some(4));
        // The vacated slot is cleared.
        assert!(block.as_bytes()[96..128].iter().all(|&b| b == 0));
    }

    #[test]
    fn remove_last_entry_needs_no_shift() {
        let mut block = DirBlock::empty();
        block.insert(b"a", 1).unwrap();
        block.insert(b"b", 2).unwrap();

        assert_eq!(block.remove(b"b").unwrap(), 2);
        assert_eq!(names(&block), vec!["a"]);
        assert_eq!(block.lookup(b"b"), None);
    }

    #[test]
    fn remove_every_entry_empties_the_table() {
        let mut block = DirBlock::empty();
        let all = ["one", "two", "three", "four", "five"];
        for (i, name) in all.iter().enumerate() {
            block.insert(name.as_bytes(), i as u32 + 1).unwrap();
        }
        for name in all.iter().rev().step_by(2).chain(all.iter().skip(1).step_by(2)) {
            block.remove(name.as_bytes()).unwrap();
        }

        assert_eq!(block.len(), 0);
        for name in all.iter() {
            assert_eq!(block.lookup(name.as_bytes()), None);
        }
        match block.remove(b"one") {
            Err(FsError::EmptyDirectory) => (),
            _ => assert!(false, "Expected empty directory."),
        }
    }

    #[test]
    fn remove_missing_name_is_not_found() {
        let mut block = DirBlock::empty();
        block.insert(b"a", 1).unwrap();
        match block.remove(b"b") {
            Err(FsError::NotFound) => (),
            _ => assert!(false, "Expected not found."),
        }
        assert_eq!(block.len(), 1);
    }

    #[test]
    fn full_table_rejects_inserts_until_a_remove() {
        let mut block = DirBlock::empty();
        for i in 0..MAX_DIR_ENTRIES {
            block.insert(format!("f{}", i).as_bytes(), i as u32).unwrap();
        }
        assert!(block.is_full());

        match block.insert(b"extra", 500) {
            Err(FsError::DirectoryFull) => (),
            _ => assert!(false, "Expected a full directory."),
        }
        assert_eq!(block.len(), MAX_DIR_ENTRIES);

        block.remove(b"f0").unwrap();
        block.insert(b"extra", 500).unwrap();
        assert_eq!(block.get(MAX_DIR_ENTRIES - 1), Some((&b"extra"[..], 500)));
    }

    #[test]
    fn parse_rejects_counts_past_capacity() {
        assert!(DirBlock::parse(vec![0; BLOCK_SIZE], MAX_DIR_ENTRIES + 1).is_err());
        assert!(DirBlock::parse(vec![0; 512], 0).is_err());
    }

    #[test]
    fn parse_keeps_existing_entries() {
        let mut block = DirBlock::empty();
        block.insert(b"kept", 12).unwrap();

        let reparsed = DirBlock::parse(block.as_bytes().to_vec(), 1).unwrap();
        assert_eq!(reparsed.lookup(b"kept"), Some(12));
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("ok.txt").is_ok());
        assert!(validate_name(&"n".repeat(FILENAME_LEN)).is_ok());
        for bad in ["", ".", "..", "a/b", "nul\0"].iter() {
            match validate_name(bad) {
                Err(FsError::InvalidName(_)) => (),
                _ => assert!(false, "Expected {:?} to be rejected.", bad),
            }
        }
        assert!(validate_name(&"n".repeat(FILENAME_LEN + 1)).is_err());
    }
}
