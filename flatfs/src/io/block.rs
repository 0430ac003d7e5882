/// The block number to access ranging from 0 (the first block) to n - 1 (the last
/// block) where n is number of blocks available.
pub type BlockNumber = usize;

/// A device of fixed size 4K blocks. Reads and writes are synchronous and are
/// assumed to either complete or report an error, the engine never retries.
///
/// Block 0 always holds the superblock.
pub trait BlockStorage {
    /// Reads disk block number into provided buffer.
    ///
    /// # Errors
    ///
    /// Attempting to read a block out of range will return an error.
    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()>;
    /// Writes provided buffer into the specified block number.
    ///
    /// # Errors
    ///
    /// Attempting to write a block out of range will return an error.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()>;
    /// Flush any buffered disk IO from memory. This is useful if it must guaranteed
    /// the disk writes actually occurred, for instance, if being re-read from
    /// disk.
    fn sync_disk(&mut self) -> std::io::Result<()>;
    /// The total number of blocks on the device.
    fn block_count(&self) -> usize;
}
