//! A small block-device filesystem engine.
//!
//! Every volume is laid out as a flat sequence of 4K blocks:
//!
//! ==============================================================================
//! | SuperBlock | Inode store | Bitmap (inodes) | Bitmap (blocks) | Data Region |
//! ==============================================================================
//!
//! Each inode points at exactly one index block. For a directory that block is a
//! fixed table of name/inode pairs, for a regular file it is a flat list of data
//! block pointers. There are no indirect blocks.
//!
//! The engine does no internal locking. A [`Volume`] is owned by the caller and
//! every operation takes `&mut self`, so serializing access to one mounted volume
//! is the host's job (wrap it in a `Mutex` if it is shared between threads).
pub mod alloc;
pub mod config;
mod dir;
mod error;
mod extent;
mod fs;
pub mod io;
mod node;
mod sb;

pub use crate::config::FormatOptions;
pub use crate::dir::{DirEntry, ReadDir};
pub use crate::error::{FsError, Resource, Result};
pub use crate::fs::{StatFs, Volume};
pub use crate::node::{FileType, Inode};
pub use crate::sb::SuperBlock;
