use super::block::{BlockNumber, BlockStorage};
use crate::config::BLOCK_SIZE;
use log::trace;
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;

/// Emulates block disk/flash storage in userspace using a file as block storage.
/// This is only meant to be used for file system development and testing.
#[derive(Debug)]
pub struct FileBlockEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of a block.
    fd: File,
    /// The total number of blocks available in the file store.
    block_count: usize,
}

impl FileBlockEmulator {
    /// Opens an existing disk image at the specified path. This method does not
    /// validate the storage blocks, it is up for clients to ensure disks are
    /// appropriately initialized.
    pub fn open_disk<P: AsRef<Path>>(dest: P, nblocks: usize) -> std::io::Result<Self> {
        // Return error if the file does not exist rather than create one.
        let fd = OpenOptions::new().read(true).write(true).open(dest)?;
        Ok(FileBlockEmulator {
            fd,
            block_count: nblocks,
        })
    }

    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    fn check_range(&self, blocknr: BlockNumber) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block out of range",
            ));
        }
        Ok(())
    }
}

impl BlockStorage for FileBlockEmulator {
    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;
        if buf.len() < BLOCK_SIZE {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }
        trace!("read block {}", blocknr);
        self.fd
            .seek(SeekFrom::Start((blocknr * BLOCK_SIZE) as u64))?;
        // Limit the read to just the block specified.
        self.fd.read_exact(&mut buf[..BLOCK_SIZE])
    }

    /// This method truncates writes that exceed the total block size.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;
        trace!("write block {}", blocknr);
        self.fd
            .seek(SeekFrom::Start((blocknr * BLOCK_SIZE) as u64))?;

        let max = buf.len().min(BLOCK_SIZE);
        self.fd.write_all(&buf[..max])
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()
    }

    fn block_count(&self) -> usize {
        self.block_count
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    block_count: usize,
    clear: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            // A better default here might be the size of the file rounded down
            // to the nearest block.
            block_count: 0,
            clear: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the number of desired blocks in the block store device.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Controls whether the medium is zeroed when the emulator is built. Reopening a
    /// formatted image must not clear it.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// This builder assumed ownership of the file descriptor used and does
    /// destructive things to prepare the file for use. Additionally, ownership
    /// of the file is transfered to the emulator meaning this builder can only
    /// be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        if self.block_count == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block count must be greater than zero",
            ));
        }
        if self.clear {
            self.zero_blocks()?;
        }
        Ok(FileBlockEmulator {
            fd: self.fd,
            block_count: self.block_count,
        })
    }

    fn zero_blocks(&mut self) -> std::io::Result<()> {
        self.fd.seek(SeekFrom::Start(0))?;
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the "disk" block, buffering each write to prevent excessive reads.
        let zero = [0x00; BLOCK_SIZE];
        for _ in 0..self.block_count {
            bfd.write_all(&zero)?;
        }
        bfd.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emulator(blocks: usize) -> FileBlockEmulator {
        let fs_block = tempfile::tempfile().unwrap();
        FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(blocks)
            .build()
            .expect("failed to allocate file block")
    }

    #[test]
    fn file_emulator_allocates_correct_num_bytes() {
        let mut disk_emu = emulator(4);
        disk_emu.sync_disk().unwrap();
        assert_eq!(disk_emu.into_file().metadata().unwrap().len(), 4 * 4096);
    }

    #[test]
    fn can_read_and_write_blocks() {
        let mut disk_emu = emulator(4);

        // Allocate a block with a non-zero character.
        let block = vec![0x55; 4096];
        disk_emu.write_block(2, &block).unwrap();
        disk_emu.sync_disk().unwrap();

        let mut read_block = vec![0x00; 4096];
        // Read a different block.
        disk_emu.read_block(3, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x00; 4096]);

        // Read the block with data.
        let mut filled_block = vec![0x00; 4096];
        disk_emu.read_block(2, &mut filled_block).unwrap();
        assert_eq!(filled_block, vec![0x55; 4096]);
    }

    #[test]
    fn can_read_and_write_start_and_end_blocks() {
        let mut disk_emu = emulator(2);

        disk_emu.write_block(0, &[0x55; 4096]).unwrap();
        disk_emu.write_block(1, &[0xAA; 4096]).unwrap();

        let mut read_block = vec![0x00; 4096];
        disk_emu.read_block(0, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x55; 4096]);

        disk_emu.read_block(1, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0xAA; 4096]);
    }

    #[test]
    fn block_beyond_range_is_an_error() {
        let mut disk_emu = emulator(1);

        let wresult = disk_emu.write_block(1, &[0x55; 4096]);
        assert_eq!(wresult.unwrap_err().kind(), ErrorKind::InvalidInput);

        let mut buf = vec![0; 4096];
        let rresult = disk_emu.read_block(1, &mut buf);
        assert_eq!(rresult.unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn reading_into_short_buffer_is_an_error() {
        let mut disk_emu = emulator(1);
        let mut buf = vec![0; 512];
        assert!(disk_emu.read_block(0, &mut buf).is_err());
    }

    #[test]
    fn writing_to_block_with_block_size_lt_max_succeeds() {
        let mut disk_emu = emulator(1);

        // Fill half the block with meaningful data.
        disk_emu
            .write_block(0, &[0x55; 2048])
            .expect("failed to write block");

        let mut buf = vec![0; 4096];
        disk_emu.read_block(0, &mut buf).unwrap();
        assert_eq!(&buf[..2048], &[0x55; 2048][..]);
        assert_eq!(&buf[2048..], &[0x00; 2048][..]);
    }

    #[test]
    fn reopening_without_clearing_keeps_contents() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let mut first = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(2)
            .build()
            .unwrap();
        first.write_block(1, &[0x11; 4096]).unwrap();
        first.sync_disk().unwrap();

        let mut second = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(2)
            .clear_medium(false)
            .build()
            .unwrap();
        let mut buf = vec![0; 4096];
        second.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, vec![0x11; 4096]);

        let mut third = FileBlockEmulator::open_disk(disk.path(), 2).unwrap();
        third.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, vec![0x11; 4096]);
    }

    #[test]
    fn zero_block_count_is_rejected() {
        let fs_block = tempfile::tempfile().unwrap();
        assert!(FileBlockEmulatorBuilder::from(fs_block).build().is_err());
    }
}
