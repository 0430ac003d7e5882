use std::fmt;

use thiserror::Error;

/// The two id spaces handed out by the bitmap allocators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resource {
    Inode,
    Block,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Inode => write!(f, "inodes"),
            Resource::Block => write!(f, "blocks"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("unable to read block {block}")]
    BlockRead {
        block: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to write block {block}")]
    BlockWrite {
        block: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("no free {0} left")]
    Exhausted(Resource),
    #[error("directory has no free entry slot")]
    DirectoryFull,
    #[error("directory has no entries")]
    EmptyDirectory,
    #[error("found no entry with that name")]
    NotFound,
    #[error("an entry with that name already exists")]
    AlreadyExists,
    #[error("inode {0} is not a directory")]
    NotADirectory(u32),
    #[error("directory inode {0} is not empty")]
    DirectoryNotEmpty(u32),
    #[error("inode {0} is not a regular file")]
    NotRegularFile(u32),
    #[error("file would exceed the extent block capacity")]
    FileTooLarge,
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("inode {0} is outside the inode store")]
    InvalidInode(u32),
    #[error("block {0} is outside the volume")]
    InvalidBlock(u32),
    #[error("superblock magic {0:#x} is not a flatfs volume")]
    InvalidMagic(u32),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("volume is corrupted: {0}")]
    Corrupted(&'static str),
}

pub type Result<T> = std::result::Result<T, FsError>;
