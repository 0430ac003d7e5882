//! Free space tracking for inode ids and block ids.
use crate::config::BLOCK_SIZE;
use crate::error::{FsError, Resource, Result};
use log::{trace, warn};
use byteorder::LittleEndian;
use zerocopy::byteorder::U64;
use zerocopy::LayoutVerified;

const WORD_BITS: u32 = 64;
/// A 4K bitmap block holds 512 little endian u64 words.
pub const WORDS_PER_BLOCK: usize = BLOCK_SIZE / 8;

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// An in-memory copy of one on-disk free bitmap. A set bit marks a free id, id `n`
/// lives in bit `n % 64` of word `n / 64`.
///
/// The bitmap spans whole blocks, but only the first `len` ids are real. Bits past
/// `len` are kept clear so they are never handed out.
///
/// The free counter is maintained alongside every mutation and always equals the
/// number of set bits.
#[derive(Debug, Clone)]
pub struct Bitmap {
    kind: Resource,
    words: Vec<u64>,
    len: u32,
    free: u32,
}

impl Bitmap {
    /// Creates a bitmap spanning `blocks` disk blocks tracking `len` ids, all of
    /// them in use.
    pub fn new(kind: Resource, blocks: u32, len: u32) -> Self {
        Self {
            kind,
            words: vec![0; blocks as usize * WORDS_PER_BLOCK],
            len,
            free: 0,
        }
    }

    /// The number of disk blocks this bitmap is stored in.
    pub fn blocks(&self) -> usize {
        self.words.len() / WORDS_PER_BLOCK
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn free_count(&self) -> u32 {
        self.free
    }

    pub fn get(&self, id: u32) -> State {
        if id >= self.len {
            return State::Used;
        }
        let (word, mask) = Self::position(id);
        if self.words[word] & mask != 0 {
            State::Free
        } else {
            State::Used
        }
    }

    /// Hands out the numerically lowest free id. Whole words with no free bit are
    /// skipped, then the least significant set bit of the first non-zero word wins.
    ///
    /// # Errors
    ///
    /// Fails with `Exhausted` when the free counter is zero, leaving the bitmap
    /// untouched.
    pub fn allocate(&mut self) -> Result<u32> {
        if self.free == 0 {
            return Err(FsError::Exhausted(self.kind));
        }
        let (index, word) = self
            .words
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != 0)
            .ok_or(FsError::Corrupted("free counter disagrees with bitmap"))?;

        let bit = word.trailing_zeros();
        *word &= !(1u64 << bit);
        self.free -= 1;

        let id = index as u32 * WORD_BITS + bit;
        trace!("allocated {} id {}, {} left", self.kind, id, self.free);
        Ok(id)
    }

    /// Marks `id` free again and gives it back to the free counter.
    ///
    /// # Errors
    ///
    /// Releasing an id that is already free means some on-disk reference is stale.
    /// It fails with `Corrupted` and leaves the bitmap and counter untouched.
    pub fn release(&mut self, id: u32) -> Result<()> {
        self.check(id)?;
        let (word, mask) = Self::position(id);
        if self.words[word] & mask != 0 {
            warn!("{} id {} released twice", self.kind, id);
            return Err(FsError::Corrupted("released an id that is already free"));
        }
        self.words[word] |= mask;
        self.free += 1;
        trace!("released {} id {}, {} free", self.kind, id, self.free);
        Ok(())
    }

    /// Marks a specific id as used. Mount uses it to pin the root inode, the rest
    /// of the engine goes through `allocate`.
    pub fn set_reserved(&mut self, id: u32) -> Result<()> {
        self.check(id)?;
        let (word, mask) = Self::position(id);
        if self.words[word] & mask != 0 {
            self.words[word] &= !mask;
            self.free -= 1;
        }
        Ok(())
    }

    /// Decodes one on-disk block into word range `index`. Call `finish_load` once
    /// every block has been read.
    pub fn load_block(&mut self, index: usize, buf: &[u8]) -> Result<()> {
        let words = LayoutVerified::<_, [U64<LittleEndian>]>::new_slice_unaligned(
            &buf[..BLOCK_SIZE],
        )
        .ok_or(FsError::Corrupted("bitmap block"))?;
        let start = index * WORDS_PER_BLOCK;
        let dest = self
            .words
            .get_mut(start..start + WORDS_PER_BLOCK)
            .ok_or(FsError::Corrupted("bitmap block index"))?;
        for (word, raw) in dest.iter_mut().zip(words.iter()) {
            *word = raw.get();
        }
        Ok(())
    }

    /// Clears bits past the tracked range and recomputes the free counter from the
    /// loaded words.
    pub fn finish_load(&mut self) -> u32 {
        let full_words = (self.len / WORD_BITS) as usize;
        let tail_bits = self.len % WORD_BITS;
        let mut masked = false;
        for (i, word) in self.words.iter_mut().enumerate().skip(full_words) {
            let keep = if i == full_words && tail_bits != 0 {
                (1u64 << tail_bits) - 1
            } else {
                0
            };
            if *word & !keep != 0 {
                masked = true;
                *word &= keep;
            }
        }
        if masked {
            warn!("{} bitmap had free bits past id {}", self.kind, self.len);
        }
        self.free = self.words.iter().map(|w| w.count_ones()).sum();
        self.free
    }

    /// Encodes word range `index` into a block sized buffer.
    pub fn store_block(&self, index: usize, buf: &mut [u8]) -> Result<()> {
        let mut words = LayoutVerified::<_, [U64<LittleEndian>]>::new_slice_unaligned(
            &mut buf[..BLOCK_SIZE],
        )
        .ok_or(FsError::Corrupted("bitmap block"))?;
        let start = index * WORDS_PER_BLOCK;
        let src = self
            .words
            .get(start..start + WORDS_PER_BLOCK)
            .ok_or(FsError::Corrupted("bitmap block index"))?;
        for (raw, word) in words.iter_mut().zip(src) {
            raw.set(*word);
        }
        Ok(())
    }

    fn check(&self, id: u32) -> Result<()> {
        if id >= self.len {
            return Err(match self.kind {
                Resource::Inode => FsError::InvalidInode(id),
                Resource::Block => FsError::InvalidBlock(id),
            });
        }
        Ok(())
    }

    fn position(id: u32) -> (usize, u64) {
        ((id / WORD_BITS) as usize, 1u64 << (id % WORD_BITS))
    }
}
