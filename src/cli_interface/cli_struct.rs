use clap::Parser;

use crate::{fs::DEFAULT_FIRST_INODE, mkfs::MkfsOptions};

#[derive(Parser, Debug, PartialEq)]
#[command(author, version, about, long_about)]
pub enum GroupFsCli {
    /// create a new file system
    Mkfs(MkfsArgs),
    /// print the geometry and free inode count of a file system
    Stat(StatArgs),
    /// compare stored free inode counts against the bitmaps
    Check(CheckArgs),
    /// allocate an inode near a parent directory
    Alloc(AllocArgs),
    /// free an inode
    Free(FreeArgs),
}

///make a new fs subcommand
#[derive(clap::Args, Debug, PartialEq)]
#[command(author, version, about = "make a new file system")]
pub struct MkfsArgs {
    /// the path of the file system image file
    #[clap(short = 'p', long)]
    pub image_file_path: String,
    /// the number of block groups
    #[clap(short, long)]
    pub groups: u32,
    /// the inode count of every block group, a multiple of 8
    #[clap(short, long)]
    pub inodes_per_group: u32,
    /// the block size of the file system
    #[clap(short, long)]
    pub block_size: u32,
    /// the first inode number that is not reserved
    #[clap(short, long, default_value_t = DEFAULT_FIRST_INODE)]
    pub first_inode: u32,
    /// initial free block count of every group, defaults to one block bitmap worth
    #[clap(long)]
    pub blocks_per_group: Option<u32>,
}

impl MkfsArgs {
    pub fn options(&self) -> MkfsOptions {
        MkfsOptions {
            groups: self.groups,
            inodes_per_group: self.inodes_per_group,
            block_size: self.block_size,
            first_valid_inode: self.first_inode,
            blocks_per_group: self
                .blocks_per_group
                .unwrap_or_else(|| self.block_size.saturating_mul(8)),
            ..MkfsOptions::default()
        }
    }
}

#[derive(clap::Args, Debug, PartialEq)]
#[command(author, version, about = "show a file system")]
pub struct StatArgs {
    /// the path of the file system image file
    #[clap(short = 'p', long)]
    pub image_file_path: String,
    /// recount the free inodes from the group descriptors and bitmaps
    #[clap(long)]
    pub cross_check: bool,
}

#[derive(clap::Args, Debug, PartialEq)]
#[command(author, version, about = "check free inode counts")]
pub struct CheckArgs {
    /// the path of the file system image file
    #[clap(short = 'p', long)]
    pub image_file_path: String,
}

#[derive(clap::Args, Debug, PartialEq)]
#[command(author, version, about = "allocate an inode")]
pub struct AllocArgs {
    /// the path of the file system image file
    #[clap(short = 'p', long)]
    pub image_file_path: String,
    /// inode number of the parent directory
    #[clap(long)]
    pub parent: u64,
    /// allocate a directory instead of a regular file
    #[clap(long)]
    pub dir: bool,
}

#[derive(clap::Args, Debug, PartialEq)]
#[command(author, version, about = "free an inode")]
pub struct FreeArgs {
    /// the path of the file system image file
    #[clap(short = 'p', long)]
    pub image_file_path: String,
    /// inode number to free
    #[clap(long)]
    pub inode: u64,
    /// the inode was a directory
    #[clap(long)]
    pub dir: bool,
}
