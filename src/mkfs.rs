//! create our filesystem
use crate::{
    device::{BlockDevice, MmapDevice},
    fs::{
        error::{FsError, Result},
        FsLayout, InodeAllocator, DEFAULT_FIRST_INODE,
    },
    utils::fs_size_calculator,
};
use anyhow::anyhow;
use byte_unit::Byte;
use log::{debug, info};
use std::{fs::OpenOptions, path::Path};

/// everything needed to format an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MkfsOptions {
    pub groups: u32,
    pub inodes_per_group: u32,
    pub block_size: u32,
    pub first_valid_inode: u32,
    pub blocks_per_group: u32,
    /// owner recorded in the superblock
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            groups: 8,
            inodes_per_group: 1024,
            block_size: 4096,
            first_valid_inode: DEFAULT_FIRST_INODE,
            blocks_per_group: 4096 * 8,
            // use `users` crate to get the uid and gid of this program
            uid: users::get_effective_uid(),
            gid: users::get_effective_gid(),
        }
    }
}

impl MkfsOptions {
    pub fn layout(&self) -> FsLayout {
        FsLayout {
            block_size: self.block_size,
            groups: self.groups,
            inodes_per_group: self.inodes_per_group,
            first_valid_inode: self.first_valid_inode,
            blocks_per_group: self.blocks_per_group,
        }
    }
}

/// write a fresh filesystem onto `dev`:
/// superblock, descriptors, bitmaps with the reserved inodes taken
/// and zeroed inode tables
pub fn format<D>(dev: &mut D, options: &MkfsOptions) -> Result<FsLayout>
where
    D: BlockDevice + ?Sized,
{
    let layout = options.layout();
    layout.validate()?;
    if dev.block_size() != layout.block_size || dev.block_count() < layout.total_blocks() {
        return Err(FsError::Format(format!(
            "{} blocks of {} bytes needed, device has {} blocks of {} bytes",
            layout.total_blocks(),
            layout.block_size,
            dev.block_count(),
            dev.block_size()
        )));
    }

    let zeros = vec![0u8; layout.block_size as usize];
    for group in 0..layout.groups {
        let start = layout.inode_table_block(group);
        for block in start..start + layout.inode_table_blocks() {
            dev.write_block(block, &zeros)?;
        }
    }

    let allocator = InodeAllocator::fresh(&layout, options.uid, options.gid)?;
    allocator.enqueue_all()?;
    let written = allocator.write_back().flush(dev)?;
    debug!("format wrote {written} metadata blocks");
    Ok(layout)
}

/// create a new image file at `image_file_path` and format it
/// # Return
/// an [anyhow::Result] type to indicate whether the operation is successful
pub fn mkfs<P>(image_file_path: P, options: &MkfsOptions) -> anyhow::Result<FsLayout>
where
    P: AsRef<Path>,
{
    let layout = options.layout();
    layout
        .validate()
        .map_err(|e| anyhow!("can't create filesystem: {e}"))?;
    let file_len = fs_size_calculator::image_size(
        layout.groups,
        layout.inodes_per_group,
        layout.block_size,
    );

    // refuse to overwrite an existing image
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(image_file_path.as_ref())?;
    // all other region are set to zero using `set_len` method
    file.set_len(file_len)?;
    drop(file);

    let mut dev = MmapDevice::open(image_file_path.as_ref(), layout.block_size)?;
    format(&mut dev, options)?;
    info!(
        "created {} filesystem: {} groups of {} inodes, {} byte blocks",
        Byte::from_bytes(file_len as _).get_appropriate_unit(true),
        layout.groups,
        layout.inodes_per_group,
        layout.block_size
    );
    Ok(layout)
}
